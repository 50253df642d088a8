//! Error taxonomy for the transport.

use std::fmt;

/// Status byte reported by a remote AT command response (`0x97`). Numeric
/// values match the wire encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoteAtStatus {
    DeliveryError = 1,
    InvalidCommand = 2,
    InvalidParameter = 3,
    TransmissionFailure = 4,
}

impl RemoteAtStatus {
    pub(crate) fn from_byte(byte: u8) -> Option<RemoteAtStatus> {
        match byte {
            1 => Some(RemoteAtStatus::DeliveryError),
            2 => Some(RemoteAtStatus::InvalidCommand),
            3 => Some(RemoteAtStatus::InvalidParameter),
            4 => Some(RemoteAtStatus::TransmissionFailure),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteAtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RemoteAtStatus::DeliveryError => "delivery error",
            RemoteAtStatus::InvalidCommand => "invalid command",
            RemoteAtStatus::InvalidParameter => "invalid parameter",
            RemoteAtStatus::TransmissionFailure => "transmission failure",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed `[<hex>]@<path>` port spec.
    #[error("bad XBee address: {0}")]
    BadAddress(String),

    /// Malformed extended parameter, e.g. `xbeeresetpin` out of `1..=7` or
    /// equal to the forbidden CTS pin 7.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Serial I/O failure, retry budget exhausted, or checksum/length
    /// overrun that escalated past the frame layer. Recoverable at the
    /// retry layer; terminal once `transport_unusable` latches.
    #[error("transport I/O error: {0}")]
    GenericIo(String),

    /// A remote AT command came back with a non-zero status. The transport
    /// itself remains usable; this is a command-level failure.
    #[error("remote AT command failed: {0}")]
    RemoteAt(RemoteAtStatus),

    /// The 256-byte input ring filled while the client was not draining it.
    /// Should be unreachable under the stop-and-wait invariant; if observed,
    /// latches `transport_unusable`.
    #[error("input ring buffer overrun")]
    BufferOverrun,

    /// This session has previously returned a terminal error and will not
    /// touch the serial device again.
    #[error("transport is unusable after a prior fatal error")]
    TransportUnusable,
}

impl Error {
    /// Whether this error, if returned from a session operation, latches
    /// `transport_unusable` for the remainder of the session's life.
    pub(crate) fn is_terminal(&self) -> bool {
        match self {
            Error::GenericIo(_) => true,
            Error::BufferOverrun => true,
            Error::TransportUnusable => true,
            Error::BadAddress(_) | Error::BadConfig(_) => false,
            Error::RemoteAt(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
