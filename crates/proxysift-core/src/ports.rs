//! Static local port partitioning.
//!
//! Allocation is a pure function of batch index and batch size, so
//! concurrent workers need no shared allocator state. Each batch owns the
//! contiguous range `[start, start + batch_size)` plus a trailing
//! [`PORT_GAP`]-port strip used by its singleton fallbacks. Once the span is
//! exhausted the allocator wraps around; a wraparound collision shows up as
//! a listener that never becomes ready and is absorbed by the readiness
//! timeout.

use serde::Deserialize;

/// Ports left free between consecutive batch ranges; singleton fallbacks of
/// the owning batch bind inside this strip.
pub const PORT_GAP: u16 = 20;

/// Bounded local port range available to the engine.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    /// First usable local port.
    #[serde(default = "default_base")]
    pub base: u16,

    /// Number of ports after `base` the allocator may use.
    #[serde(default = "default_span")]
    pub span: u16,
}

const fn default_base() -> u16 {
    10_000
}

const fn default_span() -> u16 {
    50_000
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            base: default_base(),
            span: default_span(),
        }
    }
}

impl PortRange {
    /// Check that the range fits in the TCP port space.
    ///
    /// # Errors
    ///
    /// Returns a message describing the violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.span == 0 {
            return Err("port span must be at least 1".to_string());
        }
        if u32::from(self.base) + u32::from(self.span) > u32::from(u16::MAX) {
            return Err(format!(
                "port range [{}, {}) exceeds the TCP port space",
                self.base,
                u32::from(self.base) + u32::from(self.span)
            ));
        }
        Ok(())
    }

    /// Starting port for a batch.
    ///
    /// Ranges of concurrently running batches never overlap until the span
    /// wraps around; with the default span and batch size that takes several
    /// hundred simultaneous batches.
    #[must_use]
    pub fn batch_start(&self, batch_index: usize, batch_size: usize) -> u16 {
        let stride = batch_size + PORT_GAP as usize;
        let slots = (self.span as usize / stride).max(1);
        let offset = (batch_index % slots) * stride;
        self.base + u16::try_from(offset).unwrap_or(0)
    }

    /// Port used by singleton fallback attempt `attempt` of the batch that
    /// starts at `batch_start` and holds `batch_size` descriptors.
    ///
    /// Cycles through the batch's own gap strip, so sequential fallbacks
    /// never collide with a neighbouring batch.
    #[must_use]
    pub fn singleton_port(batch_start: u16, batch_size: usize, attempt: usize) -> u16 {
        let strip = (attempt % PORT_GAP as usize) as u16;
        batch_start + u16::try_from(batch_size).unwrap_or(0) + strip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_batches_do_not_overlap() {
        let range = PortRange::default();
        let size = 50;
        let a = range.batch_start(0, size);
        let b = range.batch_start(1, size);
        assert!(u32::from(a) + size as u32 + u32::from(PORT_GAP) <= u32::from(b));
    }

    #[test]
    fn all_slots_stay_inside_the_range() {
        let range = PortRange { base: 20_000, span: 1_000 };
        let size = 30;
        let stride = size + PORT_GAP as usize;
        let slots = range.span as usize / stride;
        for index in 0..slots * 3 {
            let start = range.batch_start(index, size);
            assert!(start >= range.base);
            assert!(u32::from(start) + size as u32 <= u32::from(range.base) + u32::from(range.span));
        }
    }

    #[test]
    fn allocation_wraps_around_when_exhausted() {
        let range = PortRange { base: 20_000, span: 1_000 };
        let size = 30;
        let stride = size + PORT_GAP as usize;
        let slots = range.span as usize / stride;
        assert_eq!(range.batch_start(0, size), range.batch_start(slots, size));
    }

    #[test]
    fn singleton_ports_stay_in_the_gap_strip() {
        let start = 10_000;
        let size = 50;
        for attempt in 0..100 {
            let port = PortRange::singleton_port(start, size, attempt);
            assert!(port >= start + size as u16);
            assert!(port < start + size as u16 + PORT_GAP);
        }
    }

    #[test]
    fn rejects_range_past_port_space() {
        let range = PortRange { base: 60_000, span: 10_000 };
        assert!(range.validate().is_err());
    }
}
