//! Node configuration.
//!
//! The defaults mirror the small-network parameters Whanau was first deployed
//! with. In a real deployment the widths should track `sqrt(k·m)` and the
//! layer count `log(k·m)`, where `k` is keys per node and `m` honest edges.

use std::time::Duration;

use thiserror::Error;

/// Index depth.
pub const DEFAULT_LAYER_COUNT: usize = 3;

/// Fingers per layer.
pub const DEFAULT_FINGER_WIDTH: usize = 5;

/// Successor records per layer.
pub const DEFAULT_SUCCESSOR_WIDTH: usize = 5;

/// Walk length used for fingers. Must exceed the honest region's mixing time.
pub const DEFAULT_MIXING_STEPS: usize = 2;

/// Walk length used when sampling successors.
pub const DEFAULT_SUCCESSOR_WALK_STEPS: usize = 2;

/// Records requested from each peer reached while sampling successors.
pub const DEFAULT_SUCCESSORS_PER_WALK: usize = 2;

/// Records drawn into the db sample on every setup pass.
pub const DEFAULT_DB_SAMPLE_SIZE: usize = 5;

/// Attempts allowed per table entry before setup gives up.
pub const DEFAULT_RETRY_BUDGET: usize = 5;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound for the exponential backoff between attempts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_SETUP_CONCURRENCY: usize = 4;

const DEFAULT_WALK_CACHE_REFILL_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_FINGER_PROBE_FANOUT: usize = 1;

/// Longest forwarding chain a lookup may take, origin included.
pub const DEFAULT_MAX_LOOKUP_HOPS: usize = 6;

/// Longest walk an honest node agrees to relay.
pub const MAX_WALK_STEPS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} ({steps}) exceeds the walk limit of {max}")]
    WalkTooLong {
        field: &'static str,
        steps: usize,
        max: usize,
    },

    #[error("successors_per_walk ({per_walk}) exceeds db_sample_size ({sample}); no peer could answer")]
    SuccessorsExceedSample { per_walk: usize, sample: usize },
}

/// Tunable parameters for one node.
#[derive(Clone, Debug)]
pub struct WhanauConfig {
    pub layer_count: usize,
    pub finger_width: usize,
    pub successor_width: usize,
    pub mixing_steps: usize,
    pub successor_walk_steps: usize,
    pub successors_per_walk: usize,
    pub db_sample_size: usize,

    /// Attempts per finger or successor sample (walk + remote query each).
    pub retry_budget: usize,
    /// Delay before the second attempt; doubles per attempt up to [`MAX_RETRY_BACKOFF`].
    pub retry_backoff: Duration,
    /// Deadline for a single remote call.
    pub rpc_timeout: Duration,
    /// Table entries built concurrently within one layer.
    pub setup_concurrency: usize,

    /// Precomputed walk endpoints kept ready. Zero disables the cache.
    pub walk_cache_capacity: usize,
    pub walk_cache_refill_interval: Duration,

    /// Fingers queried when a lookup escalates past local state.
    pub finger_probe_fanout: usize,
    /// Nodes a lookup may visit, origin included. Each hop further along
    /// gets one `rpc_timeout` less to answer.
    pub max_lookup_hops: usize,
}

impl Default for WhanauConfig {
    fn default() -> Self {
        Self {
            layer_count: DEFAULT_LAYER_COUNT,
            finger_width: DEFAULT_FINGER_WIDTH,
            successor_width: DEFAULT_SUCCESSOR_WIDTH,
            mixing_steps: DEFAULT_MIXING_STEPS,
            successor_walk_steps: DEFAULT_SUCCESSOR_WALK_STEPS,
            successors_per_walk: DEFAULT_SUCCESSORS_PER_WALK,
            db_sample_size: DEFAULT_DB_SAMPLE_SIZE,

            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            setup_concurrency: DEFAULT_SETUP_CONCURRENCY,

            walk_cache_capacity: 0,
            walk_cache_refill_interval: DEFAULT_WALK_CACHE_REFILL_INTERVAL,

            finger_probe_fanout: DEFAULT_FINGER_PROBE_FANOUT,
            max_lookup_hops: DEFAULT_MAX_LOOKUP_HOPS,
        }
    }
}

impl WhanauConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("layer_count", self.layer_count),
            ("finger_width", self.finger_width),
            ("successor_width", self.successor_width),
            ("mixing_steps", self.mixing_steps),
            ("successor_walk_steps", self.successor_walk_steps),
            ("successors_per_walk", self.successors_per_walk),
            ("db_sample_size", self.db_sample_size),
            ("retry_budget", self.retry_budget),
            ("setup_concurrency", self.setup_concurrency),
            ("max_lookup_hops", self.max_lookup_hops),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        for (field, steps) in [
            ("mixing_steps", self.mixing_steps),
            ("successor_walk_steps", self.successor_walk_steps),
        ] {
            if steps > MAX_WALK_STEPS {
                return Err(ConfigError::WalkTooLong {
                    field,
                    steps,
                    max: MAX_WALK_STEPS,
                });
            }
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "rpc_timeout" });
        }
        if self.walk_cache_capacity > 0 && self.walk_cache_refill_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "walk_cache_refill_interval",
            });
        }
        if self.successors_per_walk > self.db_sample_size {
            return Err(ConfigError::SuccessorsExceedSample {
                per_walk: self.successors_per_walk,
                sample: self.db_sample_size,
            });
        }
        Ok(())
    }

    /// Backoff before attempt number `attempt` (0-based; attempt 0 runs immediately).
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(16) as u32;
        self.retry_backoff
            .saturating_mul(1u32 << shift)
            .min(MAX_RETRY_BACKOFF)
    }

    /// Deadline for forwarding a lookup whose path already holds `path_len`
    /// nodes, or `None` once the hop limit is reached. Strictly shrinks along
    /// the path so every node answers before its caller gives up.
    pub fn lookup_deadline(&self, path_len: usize) -> Option<Duration> {
        let remaining = self.max_lookup_hops.saturating_sub(path_len);
        if remaining == 0 {
            return None;
        }
        Some(self.rpc_timeout.saturating_mul(hops(remaining)))
    }

    /// Longest deadline any single outbound call made by this node carries.
    pub fn call_ceiling(&self) -> Duration {
        let hops_needed = self
            .max_lookup_hops
            .max(self.mixing_steps)
            .max(self.successor_walk_steps);
        self.rpc_timeout.saturating_mul(hops(hops_needed))
    }
}

fn hops(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(WhanauConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_fields_rejected() {
        let config = WhanauConfig {
            mixing_steps: 0,
            ..WhanauConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "mixing_steps" })
        );
    }

    #[test]
    fn zero_refill_interval_only_matters_with_a_cache() {
        let disabled = WhanauConfig {
            walk_cache_refill_interval: Duration::ZERO,
            ..WhanauConfig::default()
        };
        assert_eq!(disabled.validate(), Ok(()));

        let enabled = WhanauConfig {
            walk_cache_capacity: 4,
            ..disabled
        };
        assert_eq!(
            enabled.validate(),
            Err(ConfigError::Zero {
                field: "walk_cache_refill_interval"
            })
        );
    }

    #[test]
    fn per_walk_sample_larger_than_db_rejected() {
        let config = WhanauConfig {
            successors_per_walk: 6,
            db_sample_size: 5,
            ..WhanauConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SuccessorsExceedSample { per_walk: 6, sample: 5 })
        ));
    }

    #[test]
    fn overlong_walks_rejected() {
        let config = WhanauConfig {
            successor_walk_steps: MAX_WALK_STEPS + 1,
            ..WhanauConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::WalkTooLong {
                field: "successor_walk_steps",
                steps: MAX_WALK_STEPS + 1,
                max: MAX_WALK_STEPS,
            })
        );
    }

    #[test]
    fn lookup_deadline_shrinks_along_the_path() {
        let config = WhanauConfig {
            rpc_timeout: Duration::from_secs(1),
            max_lookup_hops: 4,
            ..WhanauConfig::default()
        };
        assert_eq!(config.lookup_deadline(1), Some(Duration::from_secs(3)));
        assert_eq!(config.lookup_deadline(2), Some(Duration::from_secs(2)));
        assert_eq!(config.lookup_deadline(3), Some(Duration::from_secs(1)));
        assert_eq!(config.lookup_deadline(4), None);
        assert_eq!(config.lookup_deadline(9), None);
        assert_eq!(config.call_ceiling(), Duration::from_secs(4));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = WhanauConfig {
            retry_backoff: Duration::from_millis(100),
            ..WhanauConfig::default()
        };
        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(30), MAX_RETRY_BACKOFF);
    }
}
