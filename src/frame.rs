//! The XBee API mode 2 frame codec: delimiter, length, escaped payload,
//! checksum, plus parsing into the set of frame types this transport
//! actually exchanges (API mode 2, as the session controller always
//! configures via local AT `AP=2`).

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::error::Error;

pub const START: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
const ESCAPE_XOR: u8 = 0x20;

/// Maximum bytes of unescaped payload this codec will hold for one frame
/// A frame whose declared length exceeds this buffer is discarded.
pub const MAX_PAYLOAD: usize = 256;

pub const API_LOCAL_AT: u8 = 0x08;
pub const API_LOCAL_AT_RESPONSE: u8 = 0x88;
pub const API_TX_REQUEST: u8 = 0x10;
pub const API_REMOTE_AT: u8 = 0x17;
pub const API_CREATE_SOURCE_ROUTE: u8 = 0x21;
pub const API_TX_STATUS: u8 = 0x8B;
pub const API_RX_PACKET: u8 = 0x90;
pub const API_REMOTE_AT_RESPONSE: u8 = 0x97;
pub const API_ROUTE_RECORD_INDICATOR: u8 = 0xA1;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, START | ESCAPE | XON | XOFF)
}

/// Accumulates one frame's payload while maintaining a running checksum,
/// then emits the escaped, delimited, checksummed wire bytes in one shot.
pub struct FrameBuilder {
    payload: ArrayVec<[u8; MAX_PAYLOAD]>,
    checksum: u8,
}

impl FrameBuilder {
    pub fn new() -> FrameBuilder {
        FrameBuilder {
            payload: ArrayVec::new(),
            checksum: 0,
        }
    }

    pub fn push(&mut self, byte: u8) -> &mut Self {
        self.payload.push(byte);
        self.checksum = self.checksum.wrapping_add(byte);
        self
    }

    pub fn push_slice(&mut self, bytes: &[u8]) -> &mut Self {
        for &b in bytes {
            self.push(b);
        }
        self
    }

    pub fn push_u16(&mut self, val: u16) -> &mut Self {
        self.push((val >> 8) as u8).push(val as u8)
    }

    pub fn push_u64(&mut self, val: u64) -> &mut Self {
        for shift in (0..8).rev() {
            self.push((val >> (shift * 8)) as u8);
        }
        self
    }

    /// Escape, length-prefix and checksum the accumulated payload into a
    /// single frame ready to hand to `SerialPort::send`.
    pub fn finish(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let checksum = 0xFFu8.wrapping_sub(self.checksum);

        let mut out = Vec::with_capacity(4 + self.payload.len() * 2);
        out.push(START);
        push_escaped(&mut out, (len >> 8) as u8);
        push_escaped(&mut out, len as u8);
        for &b in self.payload.iter() {
            push_escaped(&mut out, b);
        }
        push_escaped(&mut out, checksum);
        out
    }
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if needs_escape(byte) {
        out.push(ESCAPE);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

/// Build and send one XBee API frame in a single `send` call to the serial
/// device. `header` is the addressing/options/command-specific prefix;
/// `data` is the frame's trailing payload (STK500 bytes, AT parameter,
/// route address list).
pub fn send_frame(
    serial: &mut dyn crate::serial::SerialPort,
    api_type: u8,
    frame_id: Option<u8>,
    header: &[u8],
    data: &[u8],
) -> Result<(), Error> {
    let mut b = FrameBuilder::new();
    b.push(api_type);
    if let Some(id) = frame_id {
        b.push(id);
    }
    b.push_slice(header);
    b.push_slice(data);
    serial
        .send(&b.finish())
        .map_err(|e| Error::GenericIo(format!("frame send failed: {e}")))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DecodeState {
    SeekDelim,
    LenHi,
    LenLo,
    Payload,
    Checksum,
}

/// The receive-side state machine: `{SeekDelim, ReadLen, ReadPayload,
/// ReadChecksum}`, restarting on any fresh (unescaped) `0x7E`.
pub struct FrameDecoder {
    state: DecodeState,
    escape_pending: bool,
    len: usize,
    buf: [u8; MAX_PAYLOAD],
    buf_len: usize,
    running_checksum: u8,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            state: DecodeState::SeekDelim,
            escape_pending: false,
            len: 0,
            buf: [0u8; MAX_PAYLOAD],
            buf_len: 0,
            running_checksum: 0,
        }
    }

    /// Feed one raw (possibly escaped) wire byte. Returns `Some(payload)`
    /// when a complete, checksum-valid frame's payload is ready; `None`
    /// otherwise (more bytes needed, or the in-progress frame was silently
    /// discarded for a bad checksum or over-length declaration).
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        // Checked before `escape_pending`: a legitimate encoder never emits
        // ESCAPE followed by a raw START, so any 0x7E always means "begin a
        // fresh frame here", even with an escape byte dangling from a
        // corrupted or truncated previous frame (spec §4.A: "A fresh 0x7E at
        // any point restarts the current frame").
        if byte == START {
            self.state = DecodeState::LenHi;
            self.escape_pending = false;
            return None;
        }
        if !self.escape_pending && byte == ESCAPE {
            self.escape_pending = true;
            return None;
        }
        let unescaped = if self.escape_pending {
            self.escape_pending = false;
            byte ^ ESCAPE_XOR
        } else {
            byte
        };
        self.consume(unescaped)
    }

    fn consume(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            DecodeState::SeekDelim => None,
            DecodeState::LenHi => {
                self.len = (byte as usize) << 8;
                self.state = DecodeState::LenLo;
                None
            }
            DecodeState::LenLo => {
                self.len |= byte as usize;
                self.buf_len = 0;
                self.running_checksum = 0;
                if self.len > self.buf.len() {
                    self.state = DecodeState::SeekDelim;
                    None
                } else if self.len == 0 {
                    self.state = DecodeState::Checksum;
                    None
                } else {
                    self.state = DecodeState::Payload;
                    None
                }
            }
            DecodeState::Payload => {
                self.buf[self.buf_len] = byte;
                self.buf_len += 1;
                self.running_checksum = self.running_checksum.wrapping_add(byte);
                if self.buf_len == self.len {
                    self.state = DecodeState::Checksum;
                }
                None
            }
            DecodeState::Checksum => {
                self.state = DecodeState::SeekDelim;
                if self.running_checksum.wrapping_add(byte) == 0xFF {
                    Some(self.buf[..self.buf_len].to_vec())
                } else {
                    None
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

fn read_u16(iter: &mut std::slice::Iter<u8>) -> Option<u16> {
    let hi = *iter.next()?;
    let lo = *iter.next()?;
    Some((hi as u16) << 8 | lo as u16)
}

fn read_u64(iter: &mut std::slice::Iter<u8>) -> Option<u64> {
    let mut val = 0u64;
    for _ in 0..8 {
        val = (val << 8) | (*iter.next()? as u64);
    }
    Some(val)
}

/// A decoded API frame, restricted to the subset this transport exchanges
/// (the subset of the XBee API frame table this crate cares about).
#[derive(Debug, Clone, PartialEq)]
pub enum ApiFrame {
    LocalAtResponse {
        frame_id: u8,
        at_cmd: [u8; 2],
        status: u8,
        data: Vec<u8>,
    },
    RemoteAtResponse {
        frame_id: u8,
        source_addr64: u64,
        source_addr16: u16,
        at_cmd: [u8; 2],
        status: u8,
        data: Vec<u8>,
    },
    TxStatus {
        frame_id: u8,
        delivery_status: u8,
    },
    RxPacket {
        source_addr64: u64,
        source_addr16: u16,
        options: u8,
        data: Vec<u8>,
    },
    RouteRecordIndicator {
        source_addr64: u64,
        source_addr16: u16,
        options: u8,
        hops: Vec<u16>,
    },
}

impl ApiFrame {
    /// Parse one already-deframed, already-checksum-verified payload.
    /// Unrecognized or malformed frames return `None` and are silently
    /// discarded, never surfaced as an error.
    pub fn parse(payload: &[u8]) -> Option<ApiFrame> {
        let mut iter = payload.iter();
        let api_type = *iter.next()?;
        match api_type {
            API_LOCAL_AT_RESPONSE if payload.len() >= 5 => {
                let frame_id = *iter.next()?;
                let at_cmd = [*iter.next()?, *iter.next()?];
                let status = *iter.next()?;
                Some(ApiFrame::LocalAtResponse {
                    frame_id,
                    at_cmd,
                    status,
                    data: iter.as_slice().to_vec(),
                })
            }
            API_REMOTE_AT_RESPONSE if payload.len() >= 15 => {
                let frame_id = *iter.next()?;
                let source_addr64 = read_u64(&mut iter)?;
                let source_addr16 = read_u16(&mut iter)?;
                let at_cmd = [*iter.next()?, *iter.next()?];
                let status = *iter.next()?;
                Some(ApiFrame::RemoteAtResponse {
                    frame_id,
                    source_addr64,
                    source_addr16,
                    at_cmd,
                    status,
                    data: iter.as_slice().to_vec(),
                })
            }
            API_TX_STATUS if payload.len() >= 3 => {
                let frame_id = *iter.next()?;
                let delivery_status = *iter.next()?;
                Some(ApiFrame::TxStatus {
                    frame_id,
                    delivery_status,
                })
            }
            API_RX_PACKET if payload.len() >= 12 => {
                let source_addr64 = read_u64(&mut iter)?;
                let source_addr16 = read_u16(&mut iter)?;
                let options = *iter.next()?;
                Some(ApiFrame::RxPacket {
                    source_addr64,
                    source_addr16,
                    options,
                    data: iter.as_slice().to_vec(),
                })
            }
            API_ROUTE_RECORD_INDICATOR if payload.len() >= 12 => {
                let source_addr64 = read_u64(&mut iter)?;
                let source_addr16 = read_u16(&mut iter)?;
                let options = *iter.next()?;
                let hop_count = *iter.next()? as usize;
                let rest = iter.as_slice();
                if rest.len() < hop_count * 2 {
                    return None;
                }
                let mut hops = Vec::with_capacity(hop_count);
                for i in 0..hop_count {
                    let hi = rest[i * 2];
                    let lo = rest[i * 2 + 1];
                    hops.push((hi as u16) << 8 | lo as u16);
                }
                Some(ApiFrame::RouteRecordIndicator {
                    source_addr64,
                    source_addr16,
                    options,
                    hops,
                })
            }
            _ => None,
        }
    }
}

bitflags! {
    /// Options byte on an outbound `0x10` Transmit Request.
    pub struct TxOptions: u8 {
        const DISABLE_ACK = 0x01;
        const PAN_BROADCAST = 0x04;
    }
}

bitflags! {
    /// Options byte on an inbound `0x90` Receive Packet.
    pub struct RxOptions: u8 {
        const ADDR_BROADCAST = 0x02;
        const PAN_BROADCAST = 0x04;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(payload) = dec.feed(b) {
                out.push(payload);
            }
        }
        out
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut b = FrameBuilder::new();
        b.push(0x08).push(0x01).push_slice(b"NH");
        let wire = b.finish();

        assert_eq!(wire[0], START);
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0x08, 0x01, b'N', b'H']);
    }

    #[test]
    fn escaped_bytes_round_trip() {
        let mut b = FrameBuilder::new();
        b.push(0x08).push(START).push(ESCAPE).push(XON).push(XOFF);
        let wire = b.finish();
        // exactly one literal 0x7E: the leading delimiter
        assert_eq!(wire.iter().filter(|&&x| x == START).count(), 1);

        let frames = decode_all(&wire);
        assert_eq!(frames[0], vec![0x08, START, ESCAPE, XON, XOFF]);
    }

    #[test]
    fn bad_checksum_is_silently_discarded() {
        let mut b = FrameBuilder::new();
        b.push(0x08).push(0x01);
        let mut wire = b.finish();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF; // corrupt checksum byte
        assert!(decode_all(&wire).is_empty());
    }

    #[test]
    fn fresh_delimiter_restarts_frame() {
        let mut good = FrameBuilder::new();
        good.push(0x08).push(0x02);
        let good_wire = good.finish();

        let mut wire = vec![START, 0x00, 0x05, 0x08, 0x01]; // truncated, no checksum
        wire.extend_from_slice(&good_wire);
        let frames = decode_all(&wire);
        assert_eq!(frames, vec![vec![0x08, 0x02]]);
    }

    #[test]
    fn dangling_escape_does_not_swallow_the_next_delimiter() {
        let mut good = FrameBuilder::new();
        good.push(0x08).push(0x04);
        let good_wire = good.finish();

        // a stray 0x7D immediately before a real 0x7E must not be XOR'd into
        // it; the 0x7E must still be seen as a fresh frame start
        let mut wire = vec![ESCAPE];
        wire.extend_from_slice(&good_wire);
        assert_eq!(decode_all(&wire), vec![vec![0x08, 0x04]]);
    }

    #[test]
    fn oversize_length_is_discarded_and_resets() {
        let mut wire = vec![START, 0xFF, 0xFF]; // len = 65535, way over MAX_PAYLOAD
        let mut good = FrameBuilder::new();
        good.push(0x08).push(0x03);
        wire.extend_from_slice(&good.finish());
        assert_eq!(decode_all(&wire), vec![vec![0x08, 0x03]]);
    }

    #[test]
    fn parse_local_at_response() {
        let payload = [API_LOCAL_AT_RESPONSE, 0x01, b'A', b'P', 0x00];
        let frame = ApiFrame::parse(&payload).unwrap();
        assert_eq!(
            frame,
            ApiFrame::LocalAtResponse {
                frame_id: 0x01,
                at_cmd: [b'A', b'P'],
                status: 0,
                data: vec![],
            }
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// §8 property 1: escape round-trip, and exactly one literal
            /// 0x7E (the leading delimiter) on the wire.
            #[test]
            fn escape_round_trips_arbitrary_payloads(bytes in proptest::collection::vec(any::<u8>(), 0..253)) {
                let mut b = FrameBuilder::new();
                b.push_slice(&bytes);
                let wire = b.finish();

                prop_assert_eq!(wire.iter().filter(|&&x| x == START).count(), 1);
                let frames = decode_all(&wire);
                prop_assert_eq!(frames, vec![bytes]);
            }

            /// §8 property 2: any single-byte corruption of a finished frame
            /// is detected (the frame is silently discarded, never parsed).
            #[test]
            fn single_byte_corruption_is_detected(
                bytes in proptest::collection::vec(any::<u8>(), 1..64),
                corrupt_at in 0usize..64,
                flip in 1u8..=255,
            ) {
                let mut b = FrameBuilder::new();
                b.push_slice(&bytes);
                let mut wire = b.finish();
                let idx = corrupt_at % wire.len();
                wire[idx] ^= flip;

                let frames = decode_all(&wire);
                // Corrupting the leading delimiter just prevents the decoder
                // from ever seeing a frame start; corrupting anything else
                // should fail the checksum. Either way, the original
                // payload must never come back out corrupted-but-accepted.
                prop_assert!(frames.is_empty() || frames[0] != bytes);
            }
        }
    }

    #[test]
    fn parse_route_record_indicator() {
        #[rustfmt::skip]
        let payload = [
            API_ROUTE_RECORD_INDICATOR,
            0x00, 0x13, 0xA2, 0x00, 0x41, 0x5D, 0x1D, 0xBB,
            0xAB, 0xCD,
            0x00,
            0x02,
            0xAB, 0xCD,
            0x12, 0x34,
        ];
        let frame = ApiFrame::parse(&payload).unwrap();
        assert_eq!(
            frame,
            ApiFrame::RouteRecordIndicator {
                source_addr64: 0x0013_A200_415D_1DBB,
                source_addr16: 0xABCD,
                options: 0,
                hops: vec![0xABCD, 0x1234],
            }
        );
    }
}
