//! Per-packet admission: deterministic sampling, then content dedup.
//!
//! Both checks run on the read loop before a packet is queued for decoding,
//! so they never block and never allocate per packet.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::capture::fnv1a64;
use crate::config::{PipelineConfig, SampleRatio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDecision {
    Accept,
    /// Rejected by the sampling ratio
    SkipRatio,
    /// Same bytes were seen within the current dedup window
    Duplicate,
}

/// Hashes of recently seen packets. The whole set is dropped on each cleanup
/// interval, and early if it grows past `max_entries`.
pub struct DedupTable {
    seen: HashSet<u64>,
    max_entries: usize,
    cleanup_interval: Duration,
    last_cleanup: Instant,
}

impl DedupTable {
    pub fn new(cleanup_interval: Duration, max_entries: usize, now: Instant) -> DedupTable {
        DedupTable {
            seen: HashSet::new(),
            max_entries,
            cleanup_interval,
            last_cleanup: now,
        }
    }

    /// Returns true if `data` was already seen in this window.
    pub fn check_and_insert(&mut self, data: &[u8], now: Instant) -> bool {
        if now.saturating_duration_since(self.last_cleanup) >= self.cleanup_interval {
            log::debug!("dedup window expired, dropping {} hashes", self.seen.len());
            self.seen.clear();
            self.last_cleanup = now;
        }

        let hash = fnv1a64(data);
        if self.seen.contains(&hash) {
            return true;
        }

        if self.seen.len() >= self.max_entries {
            log::debug!("dedup table full at {} hashes, resetting", self.seen.len());
            self.seen.clear();
        }
        self.seen.insert(hash);

        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

pub struct IngressFilter {
    ratio: SampleRatio,
    counter: u64,
    dedup: Option<DedupTable>,
}

impl IngressFilter {
    pub fn new(ratio: SampleRatio, dedup: Option<DedupTable>) -> IngressFilter {
        IngressFilter {
            ratio,
            counter: 0,
            dedup,
        }
    }

    pub fn from_config(config: &PipelineConfig, now: Instant) -> IngressFilter {
        let dedup = if config.dedup {
            Some(DedupTable::new(
                config.dedup_cleanup_interval(),
                config.dedup_max_entries,
                now,
            ))
        } else {
            None
        };

        IngressFilter::new(config.sample_ratio, dedup)
    }

    /// Accept when `counter mod B < A`. Wrapping the counter modulo B keeps it
    /// bounded without shifting which positions in the cycle are accepted.
    fn sample(&mut self) -> bool {
        if self.ratio.is_passthrough() {
            return true;
        }

        let a = self.ratio.accept as u64;
        let b = self.ratio.of as u64;

        self.counter += 1;
        let accept = self.counter % b < a;

        if self.counter > a * b {
            self.counter %= b;
        }

        accept
    }

    pub fn check(&mut self, data: &[u8], now: Instant) -> IngressDecision {
        if !self.sample() {
            return IngressDecision::SkipRatio;
        }

        if let Some(dedup) = self.dedup.as_mut() {
            if dedup.check_and_insert(data, now) {
                return IngressDecision::Duplicate;
            }
        }

        IngressDecision::Accept
    }
}
