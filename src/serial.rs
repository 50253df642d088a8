//! The host serial port collaborator: a simple byte I/O device with
//! open/close/send/recv/drain/set_dtr_rts. The physical device driver is
//! out of this crate's scope — it is an external collaborator named only by
//! the interface it exposes. This module is that interface, plus an
//! in-memory fake used by this crate's own tests and property tests, plus
//! (behind `std-serial`) a thin real backend.

use std::time::Duration;

use crate::error::{Error, Result};

/// A blocking byte-stream serial device. One instance is owned exclusively
/// by one `Session`: exactly one serial descriptor per session.
pub trait SerialPort {
    /// Open the device at `path` and configure the given baud rate.
    fn open(&mut self, path: &str, baud: u32) -> Result<()>;

    /// Close the device. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Write `data` in full.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, blocking for at most `timeout`. Returns
    /// the number of bytes read; `0` means the timeout elapsed with nothing
    /// available (not an error — every caller treats this as "try again" or
    /// "give up after N attempts").
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Discard any buffered input.
    fn drain(&mut self) -> Result<()>;

    /// Assert or deassert DTR and RTS on the local serial device.
    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<()>;
}

/// The ambient serial receive timeout: every blocking read carries this
/// 1000 ms budget.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// An in-memory `SerialPort` double that speaks the XBee API on the other
/// side, for use by this crate's own tests and by external integration
/// tests. Bytes written via `send` are appended to `to_device`; bytes queued
/// via `push_inbound` are handed back from `recv`.
#[derive(Default)]
pub struct FakeSerial {
    pub to_device: Vec<u8>,
    inbound: std::collections::VecDeque<u8>,
    pub dtr: bool,
    pub rts: bool,
    pub opened: Option<(String, u32)>,
}

impl FakeSerial {
    pub fn new() -> FakeSerial {
        FakeSerial::default()
    }

    /// Queue bytes to be returned by subsequent `recv` calls, as if they had
    /// arrived from the wire (e.g. a peer's frame already encoded).
    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    pub fn take_sent(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.to_device)
    }
}

impl SerialPort for FakeSerial {
    fn open(&mut self, path: &str, baud: u32) -> Result<()> {
        self.opened = Some((path.to_string(), baud));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = None;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.to_device.extend_from_slice(data);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let n = buf.len().min(self.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbound.pop_front().unwrap();
        }
        Ok(n)
    }

    fn drain(&mut self) -> Result<()> {
        self.inbound.clear();
        Ok(())
    }

    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.dtr = dtr;
        self.rts = rts;
        Ok(())
    }
}

/// Real serial backend over the `serialport` crate, mirroring
/// `other_examples/jgoerzen-xbnet`'s use of the same crate to reach a local
/// XBee. Feature-gated: the transport itself is generic over `SerialPort`
/// and does not require this backend.
#[cfg(feature = "std-serial")]
pub struct HostSerial {
    inner: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "std-serial")]
impl HostSerial {
    pub fn new() -> HostSerial {
        HostSerial { inner: None }
    }
}

#[cfg(feature = "std-serial")]
impl Default for HostSerial {
    fn default() -> Self {
        HostSerial::new()
    }
}

#[cfg(feature = "std-serial")]
impl SerialPort for HostSerial {
    fn open(&mut self, path: &str, baud: u32) -> Result<()> {
        let port = serialport::new(path, baud)
            .timeout(RECV_TIMEOUT)
            .open()
            .map_err(|e| Error::GenericIo(e.to_string()))?;
        self.inner = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.inner.as_mut().ok_or_else(|| {
            Error::GenericIo("send on a closed serial port".to_string())
        })?;
        port.write_all(data)
            .map_err(|e| Error::GenericIo(e.to_string()))
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.inner.as_mut().ok_or_else(|| {
            Error::GenericIo("recv on a closed serial port".to_string())
        })?;
        port.set_timeout(timeout)
            .map_err(|e| Error::GenericIo(e.to_string()))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::GenericIo(e.to_string())),
        }
    }

    fn drain(&mut self) -> Result<()> {
        let port = self.inner.as_mut().ok_or_else(|| {
            Error::GenericIo("drain on a closed serial port".to_string())
        })?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| Error::GenericIo(e.to_string()))
    }

    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let port = self.inner.as_mut().ok_or_else(|| {
            Error::GenericIo("set_dtr_rts on a closed serial port".to_string())
        })?;
        port.write_data_terminal_ready(dtr)
            .map_err(|e| Error::GenericIo(e.to_string()))?;
        port.write_request_to_send(rts)
            .map_err(|e| Error::GenericIo(e.to_string()))
    }
}
