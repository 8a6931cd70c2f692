//! TTL jitter

use std::time::Duration;

use rand::Rng;

/// Default symmetric deviation applied to every written TTL
pub const DEFAULT_DEVIATION: f64 = 0.05;

/// Generator of values scattered around a base
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unstable {
    deviation: f64,
}

impl Default for Unstable {
    fn default() -> Self {
        Self::new(DEFAULT_DEVIATION)
    }
}

impl Unstable {
    /// `deviation` is clamped to `0.0..=1.0`
    pub fn new(deviation: f64) -> Self {
        let deviation = if deviation.is_nan() {
            0.0
        } else {
            deviation.clamp(0.0, 1.0)
        };
        Self { deviation }
    }

    pub fn deviation(&self) -> f64 {
        self.deviation
    }

    /// Uniform random duration in `[base * (1 - d), base * (1 + d)]`
    ///
    /// Falls back to `base` when the scaled value is not representable.
    pub fn around_duration(&self, base: Duration) -> Duration {
        if self.deviation == 0.0 {
            return base;
        }
        let factor = 1.0 + self.deviation - 2.0 * self.deviation * rand::rng().random::<f64>();
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}
