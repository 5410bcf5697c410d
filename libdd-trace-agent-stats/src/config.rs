// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration of the stats aggregators.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_ENV: &str = "none";
const DEFAULT_BUCKET_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BUFFER_LEN: usize = 2;

/// Peer tags always used for aggregation when peer tags aggregation is enabled.
pub const BASE_PEER_TAGS: &[&str] = &[
    "_dd.base_service",
    "amqp.destination",
    "amqp.exchange",
    "amqp.queue",
    "aws.queue.name",
    "bucketname",
    "cassandra.cluster",
    "db.cassandra.contact.points",
    "db.couchbase.seed.nodes",
    "db.hostname",
    "db.instance",
    "db.name",
    "db.system",
    "hazelcast.instance",
    "messaging.kafka.bootstrap.servers",
    "mongodb.db",
    "msmq.queue.path",
    "net.peer.name",
    "network.destination.name",
    "peer.hostname",
    "peer.service",
    "queuename",
    "rpc.service",
    "rpc.system",
    "server.address",
    "streamname",
    "tablename",
    "topicname",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Timing of the client stats aggregator.
///
/// Incoming buckets are re-aligned on `bucket_duration` and accepted if their start is within
/// `oldest_bucket_start` of the aggregator clock. Merged buckets are reported with a duration of
/// `client_bucket_duration`.
///
/// Aggregator bucket starts are shifted by `timestamp_offset` from the `bucket_duration`
/// boundaries, so they never fall on the same second as the concentrator buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatsConfig {
    pub bucket_duration: Duration,
    pub client_bucket_duration: Duration,
    pub oldest_bucket_start: Duration,
    pub timestamp_offset: Duration,
    /// Period of the flush loop
    pub flush_interval: Duration,
}

impl Default for ClientStatsConfig {
    fn default() -> Self {
        ClientStatsConfig {
            bucket_duration: Duration::from_secs(2),
            client_bucket_duration: Duration::from_secs(10),
            oldest_bucket_start: Duration::from_secs(20),
            timestamp_offset: Duration::from_secs(1),
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl ClientStatsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_duration.is_zero() {
            return Err(ConfigError::Invalid("bucket duration must not be zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush interval must not be zero"));
        }
        if self.timestamp_offset >= self.bucket_duration {
            return Err(ConfigError::Invalid(
                "timestamp offset must be smaller than the bucket duration",
            ));
        }
        if self.oldest_bucket_start <= self.bucket_duration {
            return Err(ConfigError::Invalid(
                "oldest bucket start must be greater than the bucket duration",
            ));
        }
        Ok(())
    }
}

/// Configuration shared by the concentrator and the client stats aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsConfig {
    /// Size of the concentrator time buckets
    pub bucket_interval: Duration,
    pub agent_env: String,
    pub agent_hostname: String,
    pub agent_version: String,
    /// Compute stats for spans with an eligible span.kind even if not top-level or measured
    pub compute_stats_by_span_kind: bool,
    pub peer_tags_aggregation: bool,
    /// Peer tags used in addition to [`BASE_PEER_TAGS`]
    pub peer_tags: Vec<String>,
    /// Number of most recent buckets kept open by the concentrator
    pub buffer_len: usize,
    pub client_stats: ClientStatsConfig,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            bucket_interval: DEFAULT_BUCKET_INTERVAL,
            agent_env: DEFAULT_ENV.to_string(),
            agent_hostname: String::new(),
            agent_version: String::new(),
            compute_stats_by_span_kind: true,
            peer_tags_aggregation: true,
            peer_tags: Vec::new(),
            buffer_len: DEFAULT_BUFFER_LEN,
            client_stats: ClientStatsConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl StatsConfig {
    /// Build a configuration from the `DD_*` environment variables, using defaults for unset
    /// variables.
    ///
    /// # Errors
    /// Fails if a variable is set to a value which can't be parsed or if the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = StatsConfig::default();
        if let Some(env) = non_empty_env("DD_ENV") {
            config.agent_env = env;
        }
        if let Some(hostname) = non_empty_env("DD_HOSTNAME") {
            config.agent_hostname = hostname;
        }
        if let Some(version) = non_empty_env("DD_VERSION") {
            config.agent_version = version;
        }
        if let Some(enabled) = parse_env::<bool>("DD_APM_COMPUTE_STATS_BY_SPAN_KIND")? {
            config.compute_stats_by_span_kind = enabled;
        }
        if let Some(enabled) = parse_env::<bool>("DD_APM_PEER_TAGS_AGGREGATION")? {
            config.peer_tags_aggregation = enabled;
        }
        if let Some(tags) = non_empty_env("DD_APM_PEER_TAGS") {
            // Both comma and space separated lists are accepted
            config.peer_tags = tags
                .replace(',', " ")
                .split_whitespace()
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = parse_env::<u64>("DD_APM_BUCKET_INTERVAL_SECS")? {
            config.bucket_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_agent_env(mut self, env: impl Into<String>) -> Self {
        self.agent_env = env.into();
        self
    }

    pub fn with_agent_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.agent_hostname = hostname.into();
        self
    }

    pub fn with_agent_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = version.into();
        self
    }

    pub fn with_bucket_interval(mut self, bucket_interval: Duration) -> Self {
        self.bucket_interval = bucket_interval;
        self
    }

    pub fn with_peer_tags(mut self, peer_tags: Vec<String>) -> Self {
        self.peer_tags = peer_tags;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_interval.is_zero() {
            return Err(ConfigError::Invalid("bucket interval must not be zero"));
        }
        if self.buffer_len == 0 {
            return Err(ConfigError::Invalid("buffer length must not be zero"));
        }
        self.client_stats.validate()
    }

    /// Return the peer tag keys used for aggregation.
    ///
    /// Empty if peer tags aggregation is disabled, otherwise the base peer tags merged with the
    /// configured ones, sorted and deduplicated.
    pub fn configured_peer_tags(&self) -> Vec<String> {
        if !self.peer_tags_aggregation {
            return Vec::new();
        }
        let mut tags: Vec<String> = BASE_PEER_TAGS
            .iter()
            .map(|t| t.to_string())
            .chain(self.peer_tags.iter().cloned())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DD_ENV",
        "DD_HOSTNAME",
        "DD_VERSION",
        "DD_APM_COMPUTE_STATS_BY_SPAN_KIND",
        "DD_APM_PEER_TAGS_AGGREGATION",
        "DD_APM_PEER_TAGS",
        "DD_APM_BUCKET_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = StatsConfig::from_env().unwrap();
        assert_eq!(config, StatsConfig::default());
        assert_eq!(config.agent_env, "none");
        assert_eq!(config.bucket_interval, Duration::from_secs(10));
        assert_eq!(config.buffer_len, 2);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("DD_ENV", "prod");
        env::set_var("DD_HOSTNAME", "agent-host");
        env::set_var("DD_VERSION", "7.60.0");
        env::set_var("DD_APM_COMPUTE_STATS_BY_SPAN_KIND", "false");
        env::set_var("DD_APM_PEER_TAGS", "zz.custom, aa.custom");
        env::set_var("DD_APM_BUCKET_INTERVAL_SECS", "5");
        let config = StatsConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.agent_env, "prod");
        assert_eq!(config.agent_hostname, "agent-host");
        assert_eq!(config.agent_version, "7.60.0");
        assert!(!config.compute_stats_by_span_kind);
        assert_eq!(config.peer_tags, vec!["zz.custom", "aa.custom"]);
        assert_eq!(config.bucket_interval, Duration::from_secs(5));

        let peer_tags = config.configured_peer_tags();
        assert_eq!(peer_tags.first().map(String::as_str), Some("_dd.base_service"));
        assert!(peer_tags.contains(&"aa.custom".to_string()));
        assert_eq!(peer_tags.last().map(String::as_str), Some("zz.custom"));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_values() {
        clear_env();
        env::set_var("DD_APM_PEER_TAGS_AGGREGATION", "maybe");
        assert_eq!(
            StatsConfig::from_env(),
            Err(ConfigError::InvalidValue {
                name: "DD_APM_PEER_TAGS_AGGREGATION",
                value: "maybe".to_string()
            })
        );
        clear_env();
        env::set_var("DD_APM_BUCKET_INTERVAL_SECS", "0");
        assert!(matches!(
            StatsConfig::from_env(),
            Err(ConfigError::Invalid(_))
        ));
        clear_env();
    }

    #[test]
    fn test_configured_peer_tags() {
        let config = StatsConfig {
            peer_tags: vec!["peer.service".to_string(), "custom.tag".to_string()],
            ..Default::default()
        };
        let tags = config.configured_peer_tags();
        assert_eq!(tags.len(), BASE_PEER_TAGS.len() + 1);
        assert!(tags.windows(2).all(|w| w[0] < w[1]));

        let disabled = StatsConfig {
            peer_tags_aggregation: false,
            ..config
        };
        assert!(disabled.configured_peer_tags().is_empty());
    }

    #[test]
    fn test_client_stats_config_validation() {
        assert!(ClientStatsConfig::default().validate().is_ok());
        let config = ClientStatsConfig {
            oldest_bucket_start: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ClientStatsConfig {
            bucket_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ClientStatsConfig {
            timestamp_offset: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
