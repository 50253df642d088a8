//! Component C: remote AT commands against the far-end XBee. In direct mode
//! there is no far-end radio, so every call here is a no-op — callers (reset
//! line handling, `close()`'s factory-reset) are themselves mode-aware and
//! only reach this in OTA mode, but it degrades gracefully either way.

use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::frame::{send_frame, ApiFrame, API_REMOTE_AT};
use crate::serial::{SerialPort, RECV_TIMEOUT};
use crate::session::Session;
use crate::stats::Group;

/// Remote AT responses cross the mesh and back, so the poll budget is wider
/// than the local AT driver's.
const MAX_POLLS: usize = 30;

/// Option byte requesting the remote XBee apply changes immediately rather
/// than batching them for a later `AC`.
const APPLY_CHANGES: u8 = 0x02;

impl<S: SerialPort> Session<S> {
    pub fn remote_at_command(&mut self, cmd: [u8; 2], param: &[u8]) -> Result<()> {
        self.check_usable()?;
        if self.direct_mode {
            debug!(
                "remote AT {}{} skipped: no local XBee in direct mode",
                cmd[0] as char, cmd[1] as char
            );
            return Ok(());
        }

        self.source_route
            .emit_if_changed(&mut self.serial, self.target, API_REMOTE_AT)
            .map_err(|e| self.fail(e))?;

        let frame_id = self.tx_sequence.advance();
        let mut header = Vec::with_capacity(14 + param.len());
        header.extend_from_slice(&self.target.addr64.to_be_bytes());
        header.extend_from_slice(&self.target.addr16.to_be_bytes());
        header.push(0); // broadcast radius
        header.push(APPLY_CHANGES);
        header.extend_from_slice(&cmd);

        self.stats
            .record_send(Group::RemoteAt, frame_id, Instant::now());
        send_frame(
            &mut self.serial,
            API_REMOTE_AT,
            Some(frame_id),
            &header,
            param,
        )
        .map_err(|e| self.fail(e))?;

        for _ in 0..MAX_POLLS {
            match self.poll_and_dispatch(RECV_TIMEOUT)? {
                Some(ApiFrame::RemoteAtResponse {
                    frame_id: id,
                    status,
                    ..
                }) if id == frame_id => {
                    self.stats
                        .record_receive(Group::RemoteAt, frame_id, Instant::now());
                    return if status == 0 {
                        Ok(())
                    } else {
                        let err = match crate::error::RemoteAtStatus::from_byte(status) {
                            Some(s) => Error::RemoteAt(s),
                            None => Error::GenericIo(format!(
                                "remote AT {}{} failed with unrecognized status {status:#04x}",
                                cmd[0] as char, cmd[1] as char
                            )),
                        };
                        Err(self.fail(err))
                    };
                }
                Some(_) => continue,
                None => {
                    debug!(
                        "remote AT {}{} frame {frame_id}: no response within {:?}, retrying poll",
                        cmd[0] as char, cmd[1] as char, RECV_TIMEOUT
                    );
                }
            }
        }

        Err(self.fail(Error::GenericIo(format!(
            "remote AT {}{} timed out waiting for frame {frame_id}",
            cmd[0] as char, cmd[1] as char
        ))))
    }
}
