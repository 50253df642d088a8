//! A reliable byte-stream pipe over the XBee Series 2 (ZigBee) API carrying
//! STK500v1 bootloader traffic to a remote AVR, either through a local XBee
//! radio and a multi-hop mesh (OTA mode) or directly over a bench wire to an
//! XBee-emulating bootloader (direct mode).
//!
//! ```no_run
//! use xbeeboot_transport::{FakeSerial, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::open(FakeSerial::new(), "0013A20041234567@/dev/ttyUSB0", None, None)?;
//! session.send(&[0x30, 0x20])?; // STK_GET_SYNC
//! let mut reply = [0u8; 2];
//! session.recv(&mut reply)?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

mod addr;
mod error;
mod frame;
mod local_at;
mod remote_at;
mod ring;
mod route;
mod seq;
mod serial;
mod session;
mod stats;
mod xbeeboot;

pub use addr::{Address, ADDR16_UNKNOWN};
pub use error::{Error, RemoteAtStatus, Result};
pub use serial::{SerialPort, FakeSerial, RECV_TIMEOUT};
pub use session::{Session, DEFAULT_BAUD_DIRECT, DEFAULT_BAUD_OTA};
pub use stats::{Group, StatSummary};
pub use xbeeboot::{MAX_CHUNK, XBEE_MAX_RETRIES};

#[cfg(feature = "std-serial")]
pub use serial::HostSerial;
