//! Component B: local AT commands against the host's own attached XBee
//! (only issued in OTA mode; direct mode has no local radio to configure).

use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::frame::{send_frame, ApiFrame, API_LOCAL_AT};
use crate::serial::{SerialPort, RECV_TIMEOUT};
use crate::session::Session;
use crate::stats::Group;

/// Bounds the number of polls a local AT call will wait through for its
/// matching response before giving up.
const MAX_POLLS: usize = 5;

impl<S: SerialPort> Session<S> {
    /// Issue `ATcmd[param]`, correlate the response by frame id, and map a
    /// non-zero status byte to an error. `param` is omitted entirely for a
    /// query (e.g. reading back `AP`); present for a set.
    pub fn local_at_command(&mut self, cmd: [u8; 2], param: Option<u8>) -> Result<()> {
        self.check_usable()?;
        let frame_id = self.tx_sequence.advance();

        let mut header = Vec::with_capacity(3);
        header.extend_from_slice(&cmd);
        if let Some(p) = param {
            header.push(p);
        }

        self.stats
            .record_send(Group::LocalAt, frame_id, Instant::now());
        send_frame(&mut self.serial, API_LOCAL_AT, Some(frame_id), &header, &[])
            .map_err(|e| self.fail(e))?;

        for _ in 0..MAX_POLLS {
            match self.poll_and_dispatch(RECV_TIMEOUT)? {
                Some(ApiFrame::LocalAtResponse {
                    frame_id: id,
                    status,
                    ..
                }) if id == frame_id => {
                    self.stats
                        .record_receive(Group::LocalAt, frame_id, Instant::now());
                    return if status == 0 {
                        Ok(())
                    } else {
                        Err(self.fail(Error::GenericIo(format!(
                            "local AT {}{} failed with status {status:#04x}",
                            cmd[0] as char, cmd[1] as char
                        ))))
                    };
                }
                Some(_) => continue,
                None => {
                    debug!(
                        "local AT {}{} frame {frame_id}: no response within {:?}, retrying poll",
                        cmd[0] as char, cmd[1] as char, RECV_TIMEOUT
                    );
                }
            }
        }

        Err(self.fail(Error::GenericIo(format!(
            "local AT {}{} timed out waiting for frame {frame_id}",
            cmd[0] as char, cmd[1] as char
        ))))
    }
}
