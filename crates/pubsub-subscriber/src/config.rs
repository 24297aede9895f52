//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(310);
const DEFAULT_REQUEST_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CURSOR_STALENESS: Duration = Duration::from_secs(60);
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_JITTER: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_FAILURES: u32 = 6;
const DISPATCH_CAPACITY: usize = 64;
const DEDUPE_CACHE_SIZE: usize = 100;

/// Timeouts, retry policy and queue sizes of the subscribe loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Window the backend may hold one long-poll open.
    #[serde(rename = "long_poll_timeout_ms", with = "duration_ms")]
    pub long_poll_timeout: Duration,
    /// Extra time on top of `long_poll_timeout` before the loop itself gives
    /// up on a request.
    #[serde(rename = "request_margin_ms", with = "duration_ms")]
    pub request_margin: Duration,
    #[serde(rename = "leave_timeout_ms", with = "duration_ms")]
    pub leave_timeout: Duration,
    /// Idle period after which a new subscribe starts from "now" instead of
    /// the last cursor.
    #[serde(rename = "cursor_staleness_ms", with = "duration_ms")]
    pub cursor_staleness: Duration,
    #[serde(rename = "retry_initial_ms", with = "duration_ms")]
    pub retry_initial: Duration,
    #[serde(rename = "retry_max_ms", with = "duration_ms")]
    pub retry_max: Duration,
    #[serde(rename = "retry_jitter_ms", with = "duration_ms")]
    pub retry_jitter: Duration,
    /// Consecutive transient failures tolerated before reporting
    /// `Disconnected` and pausing.
    pub max_consecutive_failures: u32,
    /// Envelopes buffered between the poll loop and the dispatcher.
    pub dispatch_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            request_margin: DEFAULT_REQUEST_MARGIN,
            leave_timeout: DEFAULT_LEAVE_TIMEOUT,
            cursor_staleness: DEFAULT_CURSOR_STALENESS,
            retry_initial: INITIAL_RETRY_INTERVAL,
            retry_max: MAX_RETRY_INTERVAL,
            retry_jitter: RETRY_JITTER,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            dispatch_capacity: DISPATCH_CAPACITY,
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Start the poll loop on the first `subscribe` unless `stop` was called.
    pub auto_start: bool,
    /// Recently delivered events remembered to suppress duplicates. `0`
    /// disables de-duplication.
    pub dedupe_cache_size: usize,
    pub timing: TimingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            dedupe_cache_size: DEDUPE_CACHE_SIZE,
            timing: TimingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, crate::Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.timing.dispatch_capacity == 0 {
            return Err(crate::Error::Config(
                "dispatch_capacity must be at least 1".to_string(),
            ));
        }
        if self.timing.retry_initial > self.timing.retry_max {
            return Err(crate::Error::Config(format!(
                "retry_initial ({:?}) exceeds retry_max ({:?})",
                self.timing.retry_initial, self.timing.retry_max
            )));
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert!(config.auto_start);
        assert_eq!(config.dedupe_cache_size, 100);
        assert_eq!(config.timing.long_poll_timeout, Duration::from_secs(310));
        assert_eq!(config.timing.max_consecutive_failures, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ClientConfig::from_json(
            r#"{"auto_start": false, "timing": {"retry_initial_ms": 250, "max_consecutive_failures": 2}}"#,
        )
        .unwrap();
        assert!(!config.auto_start);
        assert_eq!(config.timing.retry_initial, Duration::from_millis(250));
        assert_eq!(config.timing.max_consecutive_failures, 2);
        assert_eq!(config.timing.retry_max, Duration::from_secs(15));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(TimingConfig::default()).unwrap();
        assert_eq!(json["long_poll_timeout_ms"], 310_000);
        assert_eq!(json["retry_jitter_ms"], 1_000);
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = ClientConfig::from_json(r#"{"timing": {"dispatch_capacity": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("dispatch_capacity"));
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let err = ClientConfig::from_json(
            r#"{"timing": {"retry_initial_ms": 20000, "retry_max_ms": 1000}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
