//! The 10-byte XBee address and the `[<hex>]@<path>` port-spec parser.
//! Factored out of `session` because `remote_at` and `route` both need to
//! name "the target address" too.

use crate::error::Error;

/// The canonical 64-bit IEEE address (big-endian) followed by the 16-bit
/// network address, which starts out `0xFFFE` ("unknown") and is
/// overwritten by any inbound frame from the target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Address {
    pub addr64: u64,
    pub addr16: u16,
}

/// "Unknown" placeholder for the 16-bit network address.
pub const ADDR16_UNKNOWN: u16 = 0xFFFE;

impl Address {
    pub fn direct_mode() -> Address {
        Address {
            addr64: 0,
            addr16: ADDR16_UNKNOWN,
        }
    }

    pub fn new(addr64: u64) -> Address {
        Address {
            addr64,
            addr16: ADDR16_UNKNOWN,
        }
    }

    /// Called whenever a frame arrives from the target: the 16-bit part is
    /// always refreshed from the wire.
    pub fn remember_addr16(&mut self, addr16: u16) {
        self.addr16 = addr16;
    }
}

/// Result of parsing a port spec: either a direct-mode session (no local
/// XBee; host emulates one) or an OTA session addressed at a specific
/// 64-bit target.
#[derive(Debug)]
pub struct PortSpec {
    pub direct_mode: bool,
    pub address: Address,
    pub serial_path: String,
}

/// Parse `[<16 hex digits>]@<serial-device>`. An empty address part means
/// direct mode. A non-empty part must be exactly 16 hex digits,
/// case-insensitive.
pub fn parse_port_spec(spec: &str) -> Result<PortSpec, Error> {
    let at_pos = spec.find('@').ok_or_else(|| {
        Error::BadAddress(format!("missing '@' in port spec {spec:?}"))
    })?;
    let (addr_part, rest) = spec.split_at(at_pos);
    let serial_path = rest[1..].to_string();
    if serial_path.is_empty() {
        return Err(Error::BadAddress(format!(
            "missing serial device path in port spec {spec:?}"
        )));
    }

    if addr_part.is_empty() {
        return Ok(PortSpec {
            direct_mode: true,
            address: Address::direct_mode(),
            serial_path,
        });
    }

    if addr_part.len() != 16 || !addr_part.bytes().all(|b| (b as char).is_ascii_hexdigit()) {
        return Err(Error::BadAddress(format!(
            "address {addr_part:?} is not exactly 16 hex digits"
        )));
    }
    let addr64 = u64::from_str_radix(addr_part, 16)
        .map_err(|e| Error::BadAddress(format!("malformed address {addr_part:?}: {e}")))?;

    Ok(PortSpec {
        direct_mode: false,
        address: Address::new(addr64),
        serial_path,
    })
}

/// The only configurable reset pin is `1..=7`, excluding `7` (the sole
/// CTS-capable pin) and documenting `6` as the sole RTS-capable pin.
pub fn parse_reset_pin(value: &str) -> Result<u8, Error> {
    let pin: u8 = value
        .parse()
        .map_err(|_| Error::BadConfig(format!("xbeeresetpin value {value:?} is not a number")))?;
    if !(1..=7).contains(&pin) {
        return Err(Error::BadConfig(format!(
            "xbeeresetpin must be in 1..=7, got {pin}"
        )));
    }
    if pin == 7 {
        return Err(Error::BadConfig(
            "xbeeresetpin=7 is forbidden: pin 7 is the only CTS-capable pin".to_string(),
        ));
    }
    Ok(pin)
}

/// Default reset pin when `xbeeresetpin` is not given.
pub const DEFAULT_RESET_PIN: u8 = 3;
