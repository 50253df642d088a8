//! The source-route cache: tracks the mesh path to the target XBee learned
//! from route record indicators, and emits a Create Source Route frame
//! ahead of addressed traffic whenever that path changes.

use arrayvec::ArrayVec;

use crate::addr::Address;
use crate::error::Error;
use crate::frame::{self, send_frame, API_CREATE_SOURCE_ROUTE, API_LOCAL_AT};
use crate::serial::SerialPort;

/// Source routing supports at most 40 hops, each a 2-byte network address.
pub const MAX_HOPS: usize = 40;

/// Ordered, nearest-to-target-first list of intermediate 16-bit addresses,
/// plus the "does the next outbound frame need a 0x21 ahead of it" flag.
pub struct SourceRoute {
    hops: ArrayVec<[u16; MAX_HOPS]>,
    changed: bool,
}

impl SourceRoute {
    pub fn new() -> SourceRoute {
        SourceRoute {
            hops: ArrayVec::new(),
            changed: false,
        }
    }

    /// Hop count, or `-1` if unset. In direct mode this never leaves its
    /// initial `-1` because no `0xA1` frame is ever received.
    pub fn hop_count(&self) -> i32 {
        if self.hops.is_empty() {
            -1
        } else {
            self.hops.len() as i32
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn hops(&self) -> &[u16] {
        &self.hops
    }

    /// Ingest a `0xA1` Route Record Indicator already matched to the
    /// configured target. Replaces the cached route and sets `changed` only
    /// if the route actually differs.
    pub fn observe(&mut self, new_hops: &[u16]) {
        if new_hops.len() > MAX_HOPS {
            log::warn!(
                "route record indicator with {} hops exceeds the {} hop cap; ignoring",
                new_hops.len(),
                MAX_HOPS
            );
            return;
        }
        if self.hops.as_slice() == new_hops {
            return;
        }
        self.hops.clear();
        self.hops.extend(new_hops.iter().copied());
        self.changed = true;
    }

    /// Emit a `0x21` Create Source Route frame if the route has changed
    /// since the last addressed API call, clearing the flag on success.
    /// Fire-and-forget: frame id 0, no response expected.
    ///
    /// `api_type` is the type of the frame about to follow; per
    /// `needs_source_route_precedence`, a `0x21` never precedes a local AT
    /// (`0x08`) or another `0x21` itself, since neither is addressed
    /// traffic along the mesh path. Call this immediately before every
    /// other outbound frame so the Create Source Route frame always
    /// precedes the data frame whose route it modifies.
    pub fn emit_if_changed(
        &mut self,
        serial: &mut dyn SerialPort,
        target: Address,
        api_type: u8,
    ) -> Result<(), Error> {
        if !needs_source_route_precedence(api_type) || !self.changed {
            return Ok(());
        }
        let mut header = Vec::with_capacity(12 + self.hops.len() * 2);
        header.extend_from_slice(&target.addr64.to_be_bytes());
        header.extend_from_slice(&target.addr16.to_be_bytes());
        header.push(0); // route options: reserved, always 0
        header.push(self.hops.len() as u8);
        let mut data = Vec::with_capacity(self.hops.len() * 2);
        for &hop in self.hops.iter() {
            data.extend_from_slice(&hop.to_be_bytes());
        }
        send_frame(
            serial,
            API_CREATE_SOURCE_ROUTE,
            Some(0),
            &header,
            &data,
        )?;
        self.changed = false;
        Ok(())
    }
}

impl Default for SourceRoute {
    fn default() -> Self {
        SourceRoute::new()
    }
}

/// Whether `api_type` requires a preceding `0x21` when the route has
/// changed: any `apiType` other than `0x08` local AT and other than `0x21`
/// itself.
pub fn needs_source_route_precedence(api_type: u8) -> bool {
    !matches!(api_type, API_LOCAL_AT | API_CREATE_SOURCE_ROUTE)
}
