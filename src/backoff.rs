use std::time::Duration;

use rand::Rng;

/// Exponential retry delay: `min(max, base * 2^attempts)`, jittered by up to
/// `±jitter` before the cap is applied, so capped retries stay at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(30 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay<R: Rng>(&self, attempts: u32, rng: &mut R) -> Duration {
        // 2^31 already saturates any sane max.
        let factor = 2f64.powi(attempts.min(31) as i32);
        let raw = self.base.as_secs_f64() * factor;
        let scale = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let secs = (raw * scale).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}
