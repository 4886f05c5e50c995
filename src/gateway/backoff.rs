use std::time::Duration;

use rand::Rng;

use crate::configs::BackoffConfig;

/// Pure backoff step: returns the delay to wait now and the next falloff.
///
/// `new_falloff = min(falloff * multiplier, cap)`. Once the cap is reached
/// the delay is `cap + uniform(0, jitter)`, otherwise it is `falloff`.
pub fn next_delay<R: Rng>(
    falloff: f64,
    config: &BackoffConfig,
    rng: &mut R,
) -> (Duration, f64) {
    let new_falloff = (falloff * config.multiplier).min(config.cap_secs);
    let delay = if falloff >= config.cap_secs {
        let jitter = if config.jitter_secs > 0.0 {
            rng.gen_range(0.0..=config.jitter_secs)
        } else {
            0.0
        };
        config.cap_secs + jitter
    } else {
        falloff
    };
    (Duration::from_secs_f64(delay.max(0.0)), new_falloff)
}

/// Falloff state for unplanned disconnects.
///
/// Only unplanned drops consult it; server-requested reconnects and
/// session invalidations bypass it.
pub(crate) struct Backoff {
    config: BackoffConfig,
    falloff: f64,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            falloff: config.initial_secs,
            config,
            attempts: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let (delay, falloff) = next_delay(self.falloff, &self.config, &mut rand::thread_rng());
        self.falloff = falloff;
        self.attempts += 1;
        delay
    }

    /// Counts a reconnect that skipped the delay.
    pub(crate) fn record_immediate(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn is_exhausted(&self, max_attempts: Option<u32>) -> bool {
        max_attempts.is_some_and(|max| self.attempts >= max)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Clears the attempt counter once a session is active again.
    pub(crate) fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Applies the optional stable-connection reset to the falloff.
    pub(crate) fn on_stable(&mut self, active_for: Duration) {
        if let Some(stable) = self.config.reset_after_stable_secs {
            if active_for.as_secs_f64() >= stable {
                self.falloff = self.config.initial_secs;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn falloff(&self) -> f64 {
        self.falloff
    }
}
