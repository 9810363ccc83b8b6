//! Network time and the FLOPSYNC-corrected virtual clock.
//!
//! Network time is the master's absolute time since boot: dynamic nodes
//! recover it from the timesync packet counter multiplied by the clock sync
//! period. The virtual clock maps uncorrected local time to corrected time
//! using the latest FLOPSYNC-2 correction, with symmetric forward and
//! inverse conversions so that a round trip is exact even after long
//! desynchronized periods.

/// Offset-based conversion between local time and network time.
///
/// Owned by the MAC context; the offset is (re)established whenever a
/// timesync packet is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkTimeBase {
    /// `network = local + offset`.
    offset_ns: i64,
    valid: bool,
}

impl NetworkTimeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish the offset so that `local_ns` corresponds to `network_ns`.
    pub fn set(&mut self, local_ns: i64, network_ns: i64) {
        self.offset_ns = network_ns - local_ns;
        self.valid = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn to_network(&self, local_ns: i64) -> i64 {
        local_ns + self.offset_ns
    }

    pub fn to_local(&self, network_ns: i64) -> i64 {
        network_ns - self.offset_ns
    }
}

/// Virtual clock applying the FLOPSYNC-2 clock correction.
///
/// After each sync period the controller output `u` stretches or shrinks the
/// nominal period: the conversion slope is `(period + u) / period` anchored
/// at the latest (theoretical, computed) frame start pair. On desync the
/// correction is reset to zero, making both conversion directions the
/// identity; the round trip then stays exact for unbounded desync times.
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    sync_period_ns: i64,
    /// Uncorrected anchor: theoretical frame start.
    base_theoretical: i64,
    /// Corrected anchor: computed frame start.
    base_computed: i64,
    correction: i64,
}

impl VirtualClock {
    pub fn new(sync_period_ns: i64) -> Self {
        assert!(sync_period_ns > 0);
        Self {
            sync_period_ns,
            base_theoretical: 0,
            base_computed: 0,
            correction: 0,
        }
    }

    /// Update the anchors and correction after a controller step.
    pub fn update(&mut self, theoretical_ns: i64, computed_ns: i64, correction_ns: i64) {
        self.base_theoretical = theoretical_ns;
        self.base_computed = computed_ns;
        self.correction = correction_ns;
    }

    /// Reset to the identity conversion.
    pub fn reset(&mut self) {
        self.base_theoretical = 0;
        self.base_computed = 0;
        self.correction = 0;
    }

    pub fn corrected(&self, uncorrected_ns: i64) -> i64 {
        let delta = (uncorrected_ns - self.base_theoretical) as i128;
        let num = (self.sync_period_ns + self.correction) as i128;
        let den = self.sync_period_ns as i128;
        self.base_computed + (delta * num / den) as i64
    }

    pub fn uncorrected(&self, corrected_ns: i64) -> i64 {
        let delta = (corrected_ns - self.base_computed) as i128;
        let num = self.sync_period_ns as i128;
        let den = (self.sync_period_ns + self.correction) as i128;
        self.base_theoretical + (delta * num / den) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_time_roundtrip() {
        let mut nt = NetworkTimeBase::new();
        assert!(!nt.is_valid());
        nt.set(1_000, 5_000);
        assert!(nt.is_valid());
        assert_eq!(nt.to_network(1_000), 5_000);
        assert_eq!(nt.to_local(5_000), 1_000);
        assert_eq!(nt.to_local(nt.to_network(123_456)), 123_456);
    }

    #[test]
    fn identity_when_uncorrected() {
        let vc = VirtualClock::new(10_000_000_000);
        assert_eq!(vc.corrected(42), 42);
        assert_eq!(vc.uncorrected(42), 42);
    }

    #[test]
    fn correction_stretches_period() {
        let period = 10_000_000_000;
        let mut vc = VirtualClock::new(period);
        // One period measured 1ms long.
        vc.update(period, period, 1_000_000);
        let next = vc.corrected(2 * period);
        assert_eq!(next, 2 * period + 1_000_000);
    }

    #[test]
    fn roundtrip_after_reset_is_exact() {
        let mut vc = VirtualClock::new(10_000_000_000);
        vc.update(10_000_000_000, 10_000_123_456, -987_654);
        vc.reset();
        for t in [0i64, 1, 999_999_999_999] {
            assert_eq!(vc.uncorrected(vc.corrected(t)), t);
        }
    }
}
