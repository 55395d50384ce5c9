use std::time::Duration;

use loom_settings::ClientSettings;
use rand::Rng;

/// Exponential reconnect delay with bounded jitter. The first attempt after a
/// successful link waits `base`; each further failure doubles it up to `max`.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            jitter_ratio: jitter_ratio.max(0.0),
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
            settings.jitter_ratio,
        )
    }

    /// Delay for a given 1-based attempt. `jitter_unit` in `[0, 1]` selects how
    /// much of the jitter window is added on top of the exponential delay. The
    /// result never exceeds `max`.
    pub fn delay_for(&self, attempt: u32, jitter_unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(16);
        let scaled = self.base_ms.saturating_mul(1_u64 << exponent).min(self.max_ms);
        let jitter_max = (scaled as f64 * self.jitter_ratio) as u64;
        let jitter = (jitter_max as f64 * jitter_unit.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(scaled.saturating_add(jitter).min(self.max_ms))
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let unit: f64 = rand::thread_rng().gen();
        self.delay_for(self.attempt, unit)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectBackoff {
        ReconnectBackoff::new(Duration::from_millis(250), Duration::from_millis(8_000), 0.5)
    }

    #[test]
    fn doubles_until_capped() {
        let b = policy();
        assert_eq!(b.delay_for(0, 0.0), Duration::ZERO);
        assert_eq!(b.delay_for(1, 0.0), Duration::from_millis(250));
        assert_eq!(b.delay_for(2, 0.0), Duration::from_millis(500));
        assert_eq!(b.delay_for(3, 0.0), Duration::from_millis(1_000));
        assert_eq!(b.delay_for(40, 0.0), Duration::from_millis(8_000));
    }

    #[test]
    fn jitter_is_bounded_by_ratio() {
        let b = policy();
        assert_eq!(b.delay_for(4, 1.0), Duration::from_millis(3_000));
        assert_eq!(b.delay_for(4, 7.0), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_never_pushes_past_max() {
        let b = policy();
        assert_eq!(b.delay_for(6, 1.0), Duration::from_millis(8_000));
        assert_eq!(b.delay_for(40, 1.0), Duration::from_millis(8_000));
        let mut b = policy();
        for _ in 0..50 {
            assert!(b.next_delay() <= Duration::from_millis(8_000));
        }
    }

    #[test]
    fn next_delay_advances_and_resets() {
        let mut b = policy();
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(250) && first <= Duration::from_millis(375));
        let second = b.next_delay();
        assert!(second >= Duration::from_millis(500) && second <= Duration::from_millis(750));
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }
}
