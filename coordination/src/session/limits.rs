//! Session lifetime limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::EndReason;

/// Hard caps on a session's lifetime. A value of 0 disables that cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Completed speeches before the session ends.
    pub max_rounds: u32,
    /// Floor claims (including failed generations) before the session ends.
    pub max_total_speeches: u32,
    /// Wall-clock session age in seconds.
    pub max_duration_secs: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            max_total_speeches: 50,
            max_duration_secs: 30 * 60,
        }
    }
}

impl SessionLimits {
    /// Limits that never end a session.
    pub fn unlimited() -> Self {
        Self {
            max_rounds: 0,
            max_total_speeches: 0,
            max_duration_secs: 0,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    /// First limit reached, checked in round, speech, duration order.
    pub fn check(&self, rounds: u32, total_speeches: u32, elapsed: Duration) -> Option<EndReason> {
        if self.max_rounds > 0 && rounds >= self.max_rounds {
            return Some(EndReason::MaxRounds { rounds });
        }
        if self.max_total_speeches > 0 && total_speeches >= self.max_total_speeches {
            return Some(EndReason::MaxSpeeches {
                speeches: total_speeches,
            });
        }
        if let Some(max) = self.max_duration() {
            if elapsed >= max {
                return Some(EndReason::MaxDuration {
                    elapsed_secs: elapsed.as_secs(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limits() {
        let limits = SessionLimits::default();
        assert_eq!(limits.check(19, 49, Duration::from_secs(1799)), None);
    }

    #[test]
    fn test_rounds_checked_first() {
        let limits = SessionLimits {
            max_rounds: 3,
            max_total_speeches: 3,
            max_duration_secs: 10,
        };
        assert_eq!(
            limits.check(3, 5, Duration::from_secs(60)),
            Some(EndReason::MaxRounds { rounds: 3 })
        );
        assert_eq!(
            limits.check(2, 3, Duration::from_secs(60)),
            Some(EndReason::MaxSpeeches { speeches: 3 })
        );
        assert_eq!(
            limits.check(2, 2, Duration::from_secs(10)),
            Some(EndReason::MaxDuration { elapsed_secs: 10 })
        );
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limits = SessionLimits::unlimited();
        assert_eq!(limits.check(10_000, 10_000, Duration::from_secs(86_400)), None);
        assert_eq!(limits.max_duration(), None);
    }
}
