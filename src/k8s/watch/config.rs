/**
 * Configuration constants and settings for watch sessions
 */
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Seconds between liveness checks
pub const DEFAULT_RESYNC_DELAY_SECONDS: u64 = 5;

/// Seconds between full relists of the collection (10 minutes)
pub const DEFAULT_RELIST_INTERVAL_SECONDS: u64 = 600;

/// Seconds without a stream event before a reconnect is forced (10 minutes)
pub const DEFAULT_LAST_SEEN_LIMIT_SECONDS: u64 = 600;

/// Longest timer period accepted (30 days). Larger values are clamped.
pub const MAX_TIMER_SECONDS: u64 = 30 * 24 * 60 * 60;

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Upper bound of the random jitter added to both timers
pub const MAX_TIMER_JITTER_MILLIS: u64 = 1000;

/// Buffered signals per subscriber before the slowest one starts lagging
pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

pub const ENV_RESYNC_FAILURE_MAX: &str = "NAVIWATCH_RESYNC_FAILURE_MAX";
pub const ENV_RESYNC_DELAY_SECONDS: &str = "NAVIWATCH_RESYNC_DELAY_SECONDS";
pub const ENV_LAST_SEEN_LIMIT_SECONDS: &str = "NAVIWATCH_LAST_SEEN_LIMIT_SECONDS";
pub const ENV_RELIST_INTERVAL_SECONDS: &str = "NAVIWATCH_RELIST_INTERVAL_SECONDS";

/// Timing and retry behaviour of a watch session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Interval of the liveness check
    pub resync_delay: Duration,
    /// Interval of the proactive full relist
    pub relist_interval: Duration,
    /// Max silence on the stream before a reconnect is forced
    pub last_seen_limit: Duration,
    /// Reconnect budget, reset on every successful connect. `None` is unbounded.
    pub resync_failure_max: Option<u32>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_delay: Duration::from_secs(DEFAULT_RESYNC_DELAY_SECONDS),
            relist_interval: Duration::from_secs(DEFAULT_RELIST_INTERVAL_SECONDS),
            last_seen_limit: Duration::from_secs(DEFAULT_LAST_SEEN_LIMIT_SECONDS),
            resync_failure_max: None,
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub const fn with_resync_failure_max(mut self, max: u32) -> Self {
        self.resync_failure_max = Some(max);
        self
    }

    #[must_use]
    pub const fn with_resync_delay(mut self, delay: Duration) -> Self {
        self.resync_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_relist_interval(mut self, interval: Duration) -> Self {
        self.relist_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_last_seen_limit(mut self, limit: Duration) -> Self {
        self.last_seen_limit = limit;
        self
    }

    /// Read overrides from `NAVIWATCH_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparsable values are
    /// logged and the default is kept. Durations above [`MAX_TIMER_SECONDS`]
    /// are clamped.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let seconds = |key: &str, default: Duration| {
            parse_u64(&lookup, key).map_or(default, |secs| {
                if secs > MAX_TIMER_SECONDS {
                    warn!("Clamping {}={} to {} seconds", key, secs, MAX_TIMER_SECONDS);
                }
                Duration::from_secs(secs.min(MAX_TIMER_SECONDS))
            })
        };

        Self {
            resync_delay: seconds(ENV_RESYNC_DELAY_SECONDS, defaults.resync_delay),
            relist_interval: seconds(ENV_RELIST_INTERVAL_SECONDS, defaults.relist_interval),
            last_seen_limit: seconds(ENV_LAST_SEEN_LIMIT_SECONDS, defaults.last_seen_limit),
            resync_failure_max: parse_u64(&lookup, ENV_RESYNC_FAILURE_MAX)
                .map(|max| u32::try_from(max).unwrap_or(u32::MAX)),
        }
    }

    /// `true` while another reconnect attempt is allowed
    #[must_use]
    pub fn within_budget(&self, failures: u32) -> bool {
        self.resync_failure_max.is_none_or(|max| max > failures)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

/// Period usable by a tokio interval: non-zero and far enough from
/// `Instant` overflow
#[must_use]
pub fn timer_period(period: Duration) -> Duration {
    period.clamp(MIN_TIMER_PERIOD, Duration::from_secs(MAX_TIMER_SECONDS))
}

/// Random 0-1000ms offset so many sessions do not retry in lockstep
#[must_use]
pub fn timer_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..MAX_TIMER_JITTER_MILLIS))
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_RESYNC_DELAY_SECONDS > 0, "DEFAULT_RESYNC_DELAY_SECONDS must be greater than 0");
    assert!(DEFAULT_RELIST_INTERVAL_SECONDS > 0, "DEFAULT_RELIST_INTERVAL_SECONDS must be greater than 0");
    assert!(DEFAULT_LAST_SEEN_LIMIT_SECONDS > 0, "DEFAULT_LAST_SEEN_LIMIT_SECONDS must be greater than 0");
    assert!(DEFAULT_RELIST_INTERVAL_SECONDS <= MAX_TIMER_SECONDS, "DEFAULT_RELIST_INTERVAL_SECONDS must not exceed MAX_TIMER_SECONDS");
    assert!(MAX_TIMER_JITTER_MILLIS > 0, "MAX_TIMER_JITTER_MILLIS must be greater than 0");
    assert!(SIGNAL_CHANNEL_CAPACITY > 0, "SIGNAL_CHANNEL_CAPACITY must be greater than 0");
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.resync_delay, Duration::from_secs(5));
        assert_eq!(config.relist_interval, Duration::from_secs(600));
        assert_eq!(config.last_seen_limit, Duration::from_secs(600));
        assert_eq!(config.resync_failure_max, None);
    }

    #[test]
    fn test_from_lookup_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_RESYNC_FAILURE_MAX, "5"),
            (ENV_RESYNC_DELAY_SECONDS, "2"),
            (ENV_LAST_SEEN_LIMIT_SECONDS, "three hundred"),
        ]);
        let config = WatchConfig::from_lookup(|key| env.get(key).map(ToString::to_string));
        assert_eq!(config.resync_failure_max, Some(5));
        assert_eq!(config.resync_delay, Duration::from_secs(2));
        assert_eq!(config.last_seen_limit, Duration::from_secs(600));
        assert_eq!(config.relist_interval, Duration::from_secs(600));
    }

    #[test]
    fn test_huge_durations_are_clamped() {
        let env: HashMap<&str, String> = HashMap::from([
            (ENV_RELIST_INTERVAL_SECONDS, u64::MAX.to_string()),
            (ENV_RESYNC_DELAY_SECONDS, "0".to_string()),
        ]);
        let config = WatchConfig::from_lookup(|key| env.get(key).cloned());
        assert_eq!(config.relist_interval, Duration::from_secs(MAX_TIMER_SECONDS));
        assert_eq!(config.resync_delay, Duration::ZERO);

        assert_eq!(timer_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(timer_period(Duration::MAX), Duration::from_secs(MAX_TIMER_SECONDS));
        assert_eq!(timer_period(Duration::from_secs(5)), Duration::from_secs(5));

        // The furthest first tick still fits in an Instant
        let now = std::time::Instant::now();
        let first = now + timer_period(config.relist_interval) + timer_jitter();
        assert!(first > now);
    }

    #[test]
    fn test_budget() {
        let unbounded = WatchConfig::default();
        assert!(unbounded.within_budget(u32::MAX - 1));

        let bounded = WatchConfig::default().with_resync_failure_max(1);
        assert!(bounded.within_budget(0));
        assert!(!bounded.within_budget(1));
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..100 {
            assert!(timer_jitter() < Duration::from_millis(MAX_TIMER_JITTER_MILLIS));
        }
    }
}
