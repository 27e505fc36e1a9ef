//! Reconnect backoff

use std::time::Duration;
use tracing::debug;

use crate::config::ReconnectConfig;

/// Exponential backoff over a bounded number of attempts.
///
/// The first attempt is immediate; each later one waits for the current
/// backoff, which grows by `multiplier` up to `max_backoff`.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        if self.attempt == 1 {
            return Some(Duration::ZERO);
        }

        let delay = self.current_backoff;
        // Out-of-range products saturate at the cap
        self.current_backoff = Duration::try_from_secs_f64(delay.as_secs_f64() * self.config.multiplier)
            .map(|next| next.min(self.config.max_backoff))
            .unwrap_or(self.config.max_backoff);

        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
        Some(delay)
    }

    /// Number of attempts handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(config(5));

        assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        // Capped at max_backoff
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(30)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(30)));
        assert_eq!(backoff.attempt(), 5);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_huge_multiplier_saturates_at_cap() {
        for multiplier in [1e20, f64::INFINITY, f64::NAN] {
            let mut backoff = Backoff::new(ReconnectConfig {
                multiplier,
                ..config(6)
            });

            assert_eq!(backoff.next_delay(), Some(Duration::ZERO));
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(30)));
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(30)));
        }
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::new(config(1));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 1);
    }
}
