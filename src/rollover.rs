//! Chunk rollover policies
//!
//! Called on every indexed record, so evaluation is O(1) and touches nothing
//! but its arguments.

use std::time::Duration;

/// Ephemeral per-chunk statistics read by the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloverStats {
    pub bytes_written: u64,
    pub message_count: u64,
}

impl RolloverStats {
    pub fn record(&mut self, bytes: u64) {
        self.bytes_written = self.bytes_written.saturating_add(bytes);
        self.message_count = self.message_count.saturating_add(1);
    }
}

/// Decides when a mutable chunk must be sealed.
///
/// Any limit that is zero or negative never fires through its dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverPolicy {
    /// Seal once either the byte or the message limit is reached
    DiskOrMessageCount { max_bytes: i64, max_messages: i64 },
    /// As above, or once the chunk has been open for `max_age`
    DiskMessageCountOrAge {
        max_bytes: i64,
        max_messages: i64,
        max_age: Duration,
    },
}

impl RolloverPolicy {
    pub fn disk_or_message_count(max_bytes: i64, max_messages: i64) -> Self {
        RolloverPolicy::DiskOrMessageCount {
            max_bytes,
            max_messages,
        }
    }

    pub fn should_rollover(&self, bytes_written: u64, message_count: u64, chunk_age: Duration) -> bool {
        match *self {
            RolloverPolicy::DiskOrMessageCount {
                max_bytes,
                max_messages,
            } => reached(bytes_written, max_bytes) || reached(message_count, max_messages),
            RolloverPolicy::DiskMessageCountOrAge {
                max_bytes,
                max_messages,
                max_age,
            } => {
                reached(bytes_written, max_bytes)
                    || reached(message_count, max_messages)
                    || (!max_age.is_zero() && chunk_age >= max_age)
            }
        }
    }

    pub fn should_rollover_stats(&self, stats: &RolloverStats, chunk_age: Duration) -> bool {
        self.should_rollover(stats.bytes_written, stats.message_count, chunk_age)
    }

    /// Whether this policy can fire on age alone.
    pub fn max_age(&self) -> Option<Duration> {
        match *self {
            RolloverPolicy::DiskMessageCountOrAge { max_age, .. } if !max_age.is_zero() => Some(max_age),
            _ => None,
        }
    }
}

fn reached(value: u64, limit: i64) -> bool {
    limit > 0 && value >= limit as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_or_message_count_thresholds() {
        let policy = RolloverPolicy::disk_or_message_count(100, 10);
        let age = Duration::from_secs(3600);
        assert!(!policy.should_rollover(99, 5, age));
        assert!(policy.should_rollover(100, 5, age));
        assert!(policy.should_rollover(50, 10, age));
        assert!(!policy.should_rollover(0, 0, Duration::ZERO));
    }

    #[test]
    fn test_non_positive_limits_never_trigger() {
        let bytes_only = RolloverPolicy::disk_or_message_count(100, 0);
        assert!(!bytes_only.should_rollover(0, u64::MAX, Duration::ZERO));
        assert!(bytes_only.should_rollover(100, 0, Duration::ZERO));

        let disabled = RolloverPolicy::disk_or_message_count(-1, -1);
        assert!(!disabled.should_rollover(u64::MAX, u64::MAX, Duration::MAX));
    }

    #[test]
    fn test_age_policy_fires_on_age() {
        let policy = RolloverPolicy::DiskMessageCountOrAge {
            max_bytes: 100,
            max_messages: 10,
            max_age: Duration::from_secs(60),
        };
        assert!(!policy.should_rollover(1, 1, Duration::from_secs(59)));
        assert!(policy.should_rollover(1, 1, Duration::from_secs(60)));
        assert!(policy.should_rollover(100, 1, Duration::ZERO));
        assert_eq!(policy.max_age(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_age_disables_age_dimension() {
        let policy = RolloverPolicy::DiskMessageCountOrAge {
            max_bytes: 0,
            max_messages: 0,
            max_age: Duration::ZERO,
        };
        assert!(!policy.should_rollover(1, 1, Duration::MAX));
        assert_eq!(policy.max_age(), None);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = RolloverStats::default();
        stats.record(40);
        stats.record(60);
        assert_eq!(stats.bytes_written, 100);
        assert_eq!(stats.message_count, 2);
        let policy = RolloverPolicy::disk_or_message_count(100, 10);
        assert!(policy.should_rollover_stats(&stats, Duration::ZERO));
    }
}
