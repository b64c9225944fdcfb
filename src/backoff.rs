use crate::config::types::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and proportional random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            multiplier: config.multiplier,
            cap: config.cap,
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.cap.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            capped * rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };

        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
