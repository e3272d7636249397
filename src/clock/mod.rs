use anyhow::{bail, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Converts raw performance-counter ticks from event headers to nanoseconds.
///
/// The counter frequency is sampled once when the session starts. The
/// conversion multiplies by a cached whole-nanosecond period, so no division
/// happens per event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClockConverter {
    frequency_hz: u64,
    period_ns: u64,
}

impl std::fmt::Debug for ClockConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockConverter")
            .field("frequency_hz", &self.frequency_hz)
            .field("period_ns", &self.period_ns)
            .finish()
    }
}

impl ClockConverter {
    /// Create a converter for a counter ticking at `frequency_hz`.
    pub fn new(frequency_hz: u64) -> Result<Self> {
        if frequency_hz == 0 {
            bail!("performance counter frequency must be > 0");
        }

        Ok(Self {
            frequency_hz,
            // Zero for counters faster than 1 GHz; those take the wide path.
            period_ns: NANOS_PER_SEC / frequency_hz,
        })
    }

    /// A converter whose ticks already are nanoseconds.
    pub const fn nanoseconds() -> Self {
        Self {
            frequency_hz: NANOS_PER_SEC,
            period_ns: 1,
        }
    }

    /// Return the counter frequency this converter was built from.
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    /// Return the cached tick period in whole nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Convert a raw tick count to nanoseconds.
    #[inline]
    pub fn to_nanoseconds(&self, raw_ticks: u64) -> u64 {
        if self.period_ns > 0 {
            return raw_ticks.saturating_mul(self.period_ns);
        }

        let wide = u128::from(raw_ticks) * u128::from(NANOS_PER_SEC) / u128::from(self.frequency_hz);
        u64::try_from(wide).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_megahertz_counter() {
        // The usual QPC frequency on modern Windows.
        let clock = ClockConverter::new(10_000_000).expect("valid frequency");
        assert_eq!(clock.period_ns(), 100);
        assert_eq!(clock.to_nanoseconds(0), 0);
        assert_eq!(clock.to_nanoseconds(1), 100);
        assert_eq!(clock.to_nanoseconds(12_345), 1_234_500);
    }

    #[test]
    fn test_period_is_floored() {
        // 3 MHz => 333.33 ns, floored to 333.
        let clock = ClockConverter::new(3_000_000).expect("valid frequency");
        assert_eq!(clock.period_ns(), 333);
        assert_eq!(clock.to_nanoseconds(3), 999);
    }

    #[test]
    fn test_differences_preserved_at_period_granularity() {
        let clock = ClockConverter::new(10_000_000).expect("valid frequency");
        let a = clock.to_nanoseconds(1_000_000);
        let b = clock.to_nanoseconds(1_000_007);
        assert_eq!(b - a, 700);
    }

    #[test]
    fn test_nanosecond_passthrough() {
        let clock = ClockConverter::nanoseconds();
        assert_eq!(clock.to_nanoseconds(42), 42);
        assert_eq!(clock.frequency_hz(), 1_000_000_000);
    }

    #[test]
    fn test_faster_than_gigahertz_uses_wide_math() {
        let clock = ClockConverter::new(2_000_000_000).expect("valid frequency");
        assert_eq!(clock.period_ns(), 0);
        assert_eq!(clock.to_nanoseconds(10), 5);
        assert_eq!(clock.to_nanoseconds(u64::MAX), u64::MAX / 2);
    }

    #[test]
    fn test_saturates_instead_of_wrapping() {
        let clock = ClockConverter::new(1_000).expect("valid frequency");
        assert_eq!(clock.to_nanoseconds(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_new_rejects_zero_frequency() {
        let result = ClockConverter::new(0);
        assert!(result.is_err());
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("frequency"));
    }
}
