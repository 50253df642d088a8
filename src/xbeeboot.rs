//! Component E: the XBeeBoot stop-and-wait reliable channel (spec §4.E).
//!
//! Carries the STK500v1 byte stream inside XBee payloads: chunked to the
//! encrypted-MTU-derived budget, wrapped in an inner
//! `[packetType, sequence, (appType)?, data...]` tuple, and delivered with
//! exactly one unacknowledged chunk outstanding per direction at a time.

use std::time::Instant;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::frame::{send_frame, RxOptions, TxOptions, API_RX_PACKET, API_TX_REQUEST};
use crate::serial::{SerialPort, RECV_TIMEOUT};
use crate::session::Session;
use crate::stats::Group;

const PACKET_ACK: u8 = 0;
const PACKET_REQUEST: u8 = 1;

const APP_FIRMWARE_DELIVER: u8 = 23;
const APP_FRAME_REPLY: u8 = 24;

/// ZigBee's 84-byte encrypted MTU minus 18 bytes of network-layer encryption
/// and 9 bytes of APS encryption, minus 3 bytes of XBeeBoot headroom (spec
/// §4.E).
pub const MAX_CHUNK: usize = 54;

/// 16 attempts of ~1 s each tolerates the 8 s watchdog at each end (spec
/// §4.E).
pub const XBEE_MAX_RETRIES: usize = 16;

impl<S: SerialPort> Session<S> {
    /// Client-facing `send(bytes)` (spec §6): chunk, sequence, and
    /// stop-and-wait each chunk to completion before sending the next.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let mut offset = 0;
        while offset < data.len() {
            let budget = self.chunk_budget();
            let end = (offset + budget).min(data.len());
            self.send_chunk(&data[offset..end])?;
            offset = end;
        }
        Ok(())
    }

    /// Client-facing `recv(bytes)` (spec §6): fill `buf` completely,
    /// draining the input ring first and then waiting on inbound frames.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_usable()?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.input_ring.pop() {
                Some(b) => {
                    buf[filled] = b;
                    filled += 1;
                }
                None => break,
            }
        }
        if filled == buf.len() {
            return Ok(());
        }

        for _attempt in 0..XBEE_MAX_RETRIES {
            match self.poll_and_dispatch(RECV_TIMEOUT)? {
                Some(_) => {
                    while filled < buf.len() {
                        match self.input_ring.pop() {
                            Some(b) => {
                                buf[filled] = b;
                                filled += 1;
                            }
                            None => break,
                        }
                    }
                    if filled == buf.len() {
                        return Ok(());
                    }
                }
                None => {
                    self.maybe_resend_last_ack()?;
                }
            }
        }

        Err(self.fail(Error::GenericIo(format!(
            "recv timed out with {} of {} bytes delivered",
            filled,
            buf.len()
        ))))
    }

    /// Chunk budget after source-route overhead (spec §4.E): reduced by
    /// `2h + 2` when `h` hops are active and that overhead is smaller than
    /// the base 54-byte budget. In direct mode `hop_count()` never leaves
    /// `-1` (no `0xA1` frames are ever received), so this reduction is
    /// inert there by construction (spec §9's second Open Question).
    fn chunk_budget(&self) -> usize {
        let hops = self.source_route.hop_count();
        if hops > 0 {
            let overhead = 2 * hops as usize + 2;
            if overhead < MAX_CHUNK {
                return MAX_CHUNK - overhead;
            }
        }
        MAX_CHUNK
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let seq = self.out_sequence.advance();
        self.stats.record_send(Group::Tx, seq, Instant::now());
        self.send_xbeeboot_frame(PACKET_REQUEST, seq, Some(APP_FIRMWARE_DELIVER), chunk)?;

        for attempt in 0..XBEE_MAX_RETRIES {
            if self.wait_for_ack(seq)? {
                self.stats.record_receive(Group::Tx, seq, Instant::now());
                return Ok(());
            }
            debug!("chunk seq {seq} retry {}/{XBEE_MAX_RETRIES}", attempt + 1);
            self.send_xbeeboot_frame(PACKET_REQUEST, seq, Some(APP_FIRMWARE_DELIVER), chunk)?;
            self.maybe_resend_last_ack()?;
        }

        Err(self.fail(Error::GenericIo(format!(
            "chunk seq {seq} exhausted retry budget"
        ))))
    }

    /// One `RECV_TIMEOUT`-bounded poll, returning whether it produced the
    /// ACK for `seq`. Any other frame observed during the poll (an inbound
    /// REQUEST, a route record, an unrelated ACK) is still fully dispatched
    /// by `poll_and_dispatch` — this just checks the outcome.
    fn wait_for_ack(&mut self, seq: u8) -> Result<bool> {
        self.poll_and_dispatch(RECV_TIMEOUT)?;
        match self.last_observed_ack.take() {
            Some(observed) if observed == seq => Ok(true),
            Some(_other) => Ok(false),
            None => Ok(false),
        }
    }

    /// Resend the most recently sent inbound ACK, in case the peer is stuck
    /// retransmitting a REQUEST we already accepted (spec §4.E step 4: "if
    /// any inbound sequence has been seen (inSequence != 0), resend the
    /// most recent ACK as well").
    pub(crate) fn maybe_resend_last_ack(&mut self) -> Result<()> {
        if self.in_sequence.current() != 0 {
            if let Some(seq) = self.last_ack_sent {
                self.send_xbeeboot_frame(PACKET_ACK, seq, None, &[])?;
            }
        }
        Ok(())
    }

    /// Handle one `0x90` Receive Packet already matched to the configured
    /// target (or, in direct mode, the synthetic inbound link): parse the
    /// inner `[packetType, sequence, (appType)?, data...]` tuple.
    pub(crate) fn handle_inbound_xbeeboot(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 2 {
            return Err(Error::GenericIo("xbeeboot payload too short".to_string()));
        }
        let packet_type = data[0];
        let sequence = data[1];

        match packet_type {
            PACKET_ACK => {
                self.last_observed_ack = Some(sequence);
                Ok(())
            }
            PACKET_REQUEST => {
                if data.len() < 3 {
                    return Err(Error::GenericIo(
                        "xbeeboot request payload too short".to_string(),
                    ));
                }
                let app_type = data[2];
                if app_type != APP_FRAME_REPLY {
                    trace!("ignoring xbeeboot request with unexpected app type {app_type}");
                    return Ok(());
                }
                let payload = &data[3..];
                let expected = self.in_sequence.peek_next();
                if sequence == expected {
                    self.in_sequence.advance();
                    // The receive group has no send/response round trip of
                    // its own to time (unlike LocalAt/RemoteAt/Tx), so its
                    // histogram instead measures inter-arrival time between
                    // accepted inbound chunks: the "send" timestamp is when
                    // the previous chunk arrived, the "receive" timestamp is
                    // now. The first accepted chunk of a session has no
                    // previous arrival to measure against and contributes no
                    // sample (see DESIGN.md).
                    let now = Instant::now();
                    if let Some(prev) = self.last_rx_at {
                        self.stats.record_send(Group::Rx, sequence, prev);
                        self.stats.record_receive(Group::Rx, sequence, now);
                    }
                    self.last_rx_at = Some(now);
                    self.input_ring
                        .push_slice(payload)
                        .map_err(|e| self.fail(e))?;
                    self.send_xbeeboot_frame(PACKET_ACK, sequence, None, &[])?;
                    self.last_ack_sent = Some(sequence);
                } else {
                    trace!(
                        "duplicate/out-of-order inbound seq {sequence} (expected {expected}); \
                         not redelivering, ack resend deferred to the outer retry path"
                    );
                }
                Ok(())
            }
            other => Err(Error::GenericIo(format!(
                "unknown xbeeboot packet type {other}"
            ))),
        }
    }

    /// Encode and send one XBeeBoot inner tuple, encapsulated per mode
    /// (spec §4.E): an inbound-shaped `0x90` in direct mode (no frame id, no
    /// addressing), or an addressed `0x10` Transmit Request in OTA mode
    /// (frame id = `txSequence`, preceded by a `0x21` if the route changed).
    fn send_xbeeboot_frame(
        &mut self,
        packet_type: u8,
        sequence: u8,
        app_type: Option<u8>,
        data: &[u8],
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(3 + data.len());
        payload.push(packet_type);
        payload.push(sequence);
        if let Some(at) = app_type {
            payload.push(at);
        }
        payload.extend_from_slice(data);

        if self.direct_mode {
            // No local XBee to address; the host directly emulates the
            // "data arrived from the network" event the target's firmware
            // expects (spec glossary: "Direct mode").
            let mut header = [0u8; 11];
            header[10] = RxOptions::empty().bits();
            send_frame(&mut self.serial, API_RX_PACKET, None, &header, &payload)
        } else {
            self.source_route
                .emit_if_changed(&mut self.serial, self.target, API_TX_REQUEST)?;
            let frame_id = self.tx_sequence.advance();
            let mut header = Vec::with_capacity(12);
            header.extend_from_slice(&self.target.addr64.to_be_bytes());
            header.extend_from_slice(&self.target.addr16.to_be_bytes());
            header.push(0); // broadcast radius
            header.push(TxOptions::empty().bits());
            send_frame(
                &mut self.serial,
                API_TX_REQUEST,
                Some(frame_id),
                &header,
                &payload,
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Address;
    use crate::serial::FakeSerial;

    fn bare_direct_session() -> Session<FakeSerial> {
        Session::new_bare(FakeSerial::new(), true, Address::direct_mode())
    }

    fn drain_sent(session: &mut Session<FakeSerial>) -> Vec<u8> {
        session.serial.take_sent()
    }

    fn frame_ack(seq: u8) -> Vec<u8> {
        let mut b = crate::frame::FrameBuilder::new();
        b.push(API_RX_PACKET);
        b.push_slice(&[0u8; 10]); // source addr64 + addr16 filler
        b.push(0); // options
        b.push(PACKET_ACK);
        b.push(seq);
        b.finish()
    }

    fn frame_request(seq: u8, data: &[u8]) -> Vec<u8> {
        let mut b = crate::frame::FrameBuilder::new();
        b.push(API_RX_PACKET);
        b.push_slice(&[0u8; 10]);
        b.push(0);
        b.push(PACKET_REQUEST);
        b.push(seq);
        b.push(APP_FRAME_REPLY);
        b.push_slice(data);
        b.finish()
    }

    #[test]
    fn chunk_budget_is_54_with_no_route() {
        let session = bare_direct_session();
        assert_eq!(session.chunk_budget(), MAX_CHUNK);
    }

    #[test]
    fn send_waits_for_ack_before_returning() {
        let mut session = bare_direct_session();

        session.serial.push_inbound(&frame_ack(1));
        session.send(b"hello").unwrap();

        let sent = drain_sent(&mut session);
        // exactly one 0x90-shaped frame carrying our REQUEST
        assert_eq!(sent[0], crate::frame::START);
    }

    #[test]
    fn recv_delivers_bytes_from_a_request_and_acks_it() {
        let mut session = bare_direct_session();

        session.serial.push_inbound(&frame_request(1, b"OK"));
        let mut buf = [0u8; 2];
        session.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"OK");

        let sent = drain_sent(&mut session);
        assert!(!sent.is_empty(), "an ACK should have been sent");
    }

    #[test]
    fn duplicate_request_is_not_redelivered() {
        let mut session = bare_direct_session();

        session.serial.push_inbound(&frame_request(1, b"AB"));
        let mut buf = [0u8; 2];
        session.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"AB");

        // a stale retransmission of seq 1 must not be delivered again
        session.serial.push_inbound(&frame_request(1, b"ZZ"));
        session.serial.push_inbound(&frame_request(2, b"CD"));
        let mut buf2 = [0u8; 2];
        session.recv(&mut buf2).unwrap();
        assert_eq!(&buf2, b"CD");
    }

    fn decode_sent(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut dec = crate::frame::FrameDecoder::new();
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(payload) = dec.feed(b) {
                out.push(payload);
            }
        }
        out
    }

    #[test]
    fn direct_mode_frame_carries_empty_rx_options() {
        let mut session = bare_direct_session();
        session.serial.push_inbound(&frame_ack(1));
        session.send(b"hi").unwrap();

        let frames = decode_sent(&drain_sent(&mut session));
        // [0x90, addr64(8), addr16(2), options, packetType, seq, appType, data...]
        assert_eq!(frames[0][11], RxOptions::empty().bits());
    }

    #[test]
    fn ota_frame_carries_empty_tx_options() {
        let target = Address::new(0x0013_A200_1234_5678);
        let mut session = Session::new_bare(FakeSerial::new(), false, target);
        session.serial.push_inbound(&{
            let mut b = crate::frame::FrameBuilder::new();
            b.push(API_RX_PACKET)
                .push_u64(target.addr64)
                .push_u16(target.addr16)
                .push(0)
                .push(PACKET_ACK)
                .push(1);
            b.finish()
        });
        session.send(b"hi").unwrap();

        let frames = decode_sent(&drain_sent(&mut session));
        // [0x10, frame_id, addr64(8), addr16(2), radius, options, packetType, ...]
        assert_eq!(frames[0][13], TxOptions::empty().bits());
    }

    /// The `Rx` group's first accepted chunk has no previous arrival to
    /// measure against and contributes no sample; the second chunk's
    /// latency is the interval since the first.
    #[test]
    fn rx_stats_time_inter_arrival_not_zero_round_trip() {
        let mut session = bare_direct_session();

        session.serial.push_inbound(&frame_request(1, b"A"));
        let mut buf = [0u8; 1];
        session.recv(&mut buf).unwrap();
        assert!(session.stats.summary(Group::Rx).is_none());

        session.serial.push_inbound(&frame_request(2, b"B"));
        session.recv(&mut buf).unwrap();
        assert!(session.stats.summary(Group::Rx).is_some());
    }
}
