//! Configuration for the stream hub.

use crate::error::{HubError, HubResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Collections the hub watches when no explicit set is configured.
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "messages",
    "subscriptions",
    "rooms",
    "users",
    "users_sessions",
    "settings",
    "roles",
    "permissions",
    "livechat_inquiry",
    "livechat_department_agents",
    "login_service_configuration",
    "instance_status",
    "integration_history",
    "integrations",
    "email_inbox",
    "pbx_events",
];

/// Configuration for a hub instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Size of the connection pool requested from the change source.
    pub max_connections: u32,
    /// Reconnect behavior.
    pub reconnect: ReconnectConfig,
    /// Logical collections to open change streams on.
    pub watched_collections: BTreeSet<String>,
    /// Buffered raw changes per collection stream.
    pub stream_buffer: usize,
    /// Capacity of the notice channel.
    pub notice_capacity: usize,
    /// Prefix for broadcast topics (`<prefix>.<collection>`).
    pub topic_prefix: String,
}

impl HubConfig {
    /// Creates a configuration watching the given collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            watched_collections: collections.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> HubResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> HubResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the reconnect configuration.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the per-collection stream buffer.
    #[must_use]
    pub fn with_stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }

    /// Sets the broadcast topic prefix.
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Checks the configuration for values the hub cannot run with.
    pub fn validate(&self) -> HubResult<()> {
        if self.max_connections == 0 {
            return Err(HubError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.watched_collections.is_empty() {
            return Err(HubError::InvalidConfig(
                "watched_collections must not be empty".into(),
            ));
        }
        if self.watched_collections.iter().any(|c| c.is_empty()) {
            return Err(HubError::InvalidConfig(
                "collection names must not be empty".into(),
            ));
        }
        if self.stream_buffer == 0 || self.notice_capacity == 0 {
            return Err(HubError::InvalidConfig(
                "stream_buffer and notice_capacity must be non-zero".into(),
            ));
        }
        self.reconnect.validate()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            reconnect: ReconnectConfig::default(),
            watched_collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            stream_buffer: 1024,
            notice_capacity: 256,
            topic_prefix: "watch".into(),
        }
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles on every further attempt.
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// Upper bound on a single delay.
    #[serde(rename = "backoff_cap_ms", with = "millis")]
    pub backoff_cap: Duration,
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl ReconnectConfig {
    /// Creates a reconnect configuration with the given attempt ceiling.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_backoff_base(mut self, delay: Duration) -> Self {
        self.backoff_base = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_backoff_cap(mut self, delay: Duration) -> Self {
        self.backoff_cap = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (1-indexed).
    ///
    /// The un-jittered delay is `base * 2^(attempt-1)` capped at `cap`.
    /// Jitter scales it by a factor in `[0.75, 1.0]`, so the cap is
    /// never exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_secs =
            (self.backoff_base.as_secs_f64() * 2f64.powi(exponent)).min(self.backoff_cap.as_secs_f64());

        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.0);
            Duration::from_secs_f64(delay_secs * factor)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    fn validate(&self) -> HubResult<()> {
        if self.max_attempts == 0 {
            return Err(HubError::InvalidConfig(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(HubError::InvalidConfig(
                "reconnect.backoff_base must not exceed backoff_cap".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 10,
            jitter: true,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = HubConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_connections, 1);
        assert!(config.watched_collections.contains("messages"));
        assert!(config.watched_collections.contains("pbx_events"));
        assert_eq!(config.watched_collections.len(), DEFAULT_COLLECTIONS.len());
    }

    #[test]
    fn config_builder() {
        let config = HubConfig::new(["rooms", "messages"])
            .with_max_connections(2)
            .with_stream_buffer(16)
            .with_topic_prefix("stream");

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.stream_buffer, 16);
        assert!(config.watched_collections.contains("rooms"));
        assert!(!config.watched_collections.contains("users"));
        assert_eq!(config.topic_prefix, "stream");
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(HubConfig::default().with_max_connections(0).validate().is_err());
        assert!(HubConfig::new(Vec::<String>::new()).validate().is_err());
        assert!(HubConfig::default().with_stream_buffer(0).validate().is_err());

        let inverted = ReconnectConfig::default()
            .with_backoff_base(Duration::from_secs(10))
            .with_backoff_cap(Duration::from_secs(1));
        assert!(HubConfig::default().with_reconnect(inverted).validate().is_err());
        assert!(HubConfig::default()
            .with_reconnect(ReconnectConfig::new(0))
            .validate()
            .is_err());
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let json = r#"{
            "max_connections": 1,
            "reconnect": { "backoff_base_ms": 50, "backoff_cap_ms": 2000, "max_attempts": 4, "jitter": false },
            "watched_collections": ["rooms"]
        }"#;
        let config = HubConfig::from_json_str(json).unwrap();
        assert_eq!(config.reconnect.backoff_base, Duration::from_millis(50));
        assert_eq!(config.reconnect.backoff_cap, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.stream_buffer, 1024);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["reconnect"]["backoff_cap_ms"], 2000);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"watched_collections": ["messages", "users"]}}"#).unwrap();

        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.watched_collections.len(), 2);
        assert!(config.watched_collections.contains("users"));
    }

    #[test]
    fn invalid_json_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"watched_collections": []}}"#).unwrap();
        assert!(matches!(
            HubConfig::from_file(file.path()),
            Err(HubError::InvalidConfig(_))
        ));
    }

    #[test]
    fn delay_calculation_without_jitter() {
        let config = ReconnectConfig::new(5)
            .with_backoff_base(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_respects_cap_with_jitter() {
        let config = ReconnectConfig::new(10)
            .with_backoff_base(Duration::from_secs(1))
            .with_backoff_cap(Duration::from_secs(5));

        for attempt in 1..=40 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(5));
        }
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(750));
    }
}
