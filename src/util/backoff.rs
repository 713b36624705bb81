use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Jittered exponential backoff.
///
/// The first delay after a reset is zero so a single failure retries
/// immediately; each later delay grows the base by the multiplier up to the
/// maximum and applies +/-50% jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: f64,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            settings,
            current_base_millis: 0.0,
            rng,
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Makes the next delay the maximum, used when the backend reports it is
    /// overloaded.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.settings.max_delay.as_millis() as f64;
    }

    /// Returns the delay to wait before the next attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_delay_with_rng(self.current_base_millis, &mut self.rng);
        if delay > 0 {
            log::debug!(
                "Backing off for {delay} ms (base delay: {} ms)",
                self.current_base_millis
            );
        }

        let initial = self.settings.initial_delay.as_millis() as f64;
        let max = self.settings.max_delay.as_millis() as f64;
        self.current_base_millis = (self.current_base_millis * self.settings.multiplier)
            .max(initial)
            .min(max);
        Duration::from_millis(delay)
    }
}

fn jittered_delay_with_rng<R: Rng + ?Sized>(base_millis: f64, rng: &mut R) -> u64 {
    if base_millis <= 0.0 {
        return 0;
    }
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    (base_millis + jitter).round().max(0.0) as u64
}
