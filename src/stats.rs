//! Per-group send→receive latency histograms, emitted as a summary when a
//! session closes.

use std::time::{Duration, Instant};

use log::info;

const SEQ_SLOTS: usize = 256;

/// The four statistics groups, initialized identically.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Group {
    LocalAt,
    RemoteAt,
    Tx,
    Rx,
}

const GROUPS: [Group; 4] = [Group::LocalAt, Group::RemoteAt, Group::Tx, Group::Rx];

impl Group {
    fn index(self) -> usize {
        match self {
            Group::LocalAt => 0,
            Group::RemoteAt => 1,
            Group::Tx => 2,
            Group::Rx => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Group::LocalAt => "local-AT",
            Group::RemoteAt => "remote-AT",
            Group::Tx => "transmit",
            Group::Rx => "receive",
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct GroupStats {
    min: Option<Duration>,
    max: Option<Duration>,
    sum: Duration,
    count: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatSummary {
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub count: u64,
}

/// Flat `(group, sequence) -> send timestamp` table, plus the running
/// min/max/sum/count per group.
pub struct Stats {
    send_times: [[Option<Instant>; SEQ_SLOTS]; 4],
    groups: [GroupStats; 4],
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            send_times: [[None; SEQ_SLOTS]; 4],
            groups: [GroupStats::default(); 4],
        }
    }

    pub fn record_send(&mut self, group: Group, sequence: u8, at: Instant) {
        self.send_times[group.index()][sequence as usize] = Some(at);
    }

    /// Match a receive against the send timestamp recorded for the same
    /// `(group, sequence)`, update the group's histogram, and clear the slot
    /// so a later reuse of the same sequence number can't match against a
    /// stale timestamp.
    pub fn record_receive(&mut self, group: Group, sequence: u8, at: Instant) {
        let slot = &mut self.send_times[group.index()][sequence as usize];
        let Some(sent) = slot.take() else {
            return;
        };
        let delay = at.saturating_duration_since(sent);
        let g = &mut self.groups[group.index()];
        g.min = Some(g.min.map_or(delay, |m| m.min(delay)));
        g.max = Some(g.max.map_or(delay, |m| m.max(delay)));
        g.sum += delay;
        g.count += 1;
    }

    pub fn summary(&self, group: Group) -> Option<StatSummary> {
        let g = &self.groups[group.index()];
        if g.count == 0 {
            return None;
        }
        Some(StatSummary {
            min: g.min.unwrap_or_default(),
            max: g.max.unwrap_or_default(),
            mean: g.sum / (g.count as u32),
            count: g.count,
        })
    }

    /// Emit all four groups' summaries, called once as part of `close()`.
    pub fn emit_all(&self) {
        for &group in &GROUPS {
            match self.summary(group) {
                Some(s) => info!(
                    "{} stats: n={} min={:?} max={:?} mean={:?}",
                    group.label(),
                    s.count,
                    s.min,
                    s.max,
                    s.mean
                ),
                None => info!("{} stats: no samples", group.label()),
            }
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}
