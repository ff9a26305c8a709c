//! Configuration file support
//!
//! ```toml
//! [consumer]
//! group_id = "orders"
//! delivery = "at_least_once"
//! assignment_strategy = "cooperative_sticky"
//!
//! [consumer.commit_policy]
//! mode = "batched"
//! max_records = 50
//! interval_ms = 1000
//!
//! [producer]
//! transactional_id = "tx-producer-orders"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ConsumerConfig, ProducerConfig};
use crate::error::{ConfigError, Result};

/// Root configuration structure for TOML files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfigFile {
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
}

impl ClientConfigFile {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Message(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::parse(&contents).map_err(|e| {
            ConfigError::Message(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        tracing::info!(path = ?path, group_id = %config.consumer.group_id, "Loaded client configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Message(e.to_string()))?;
        config.producer.validate()?;
        if !config.consumer.group_id.is_empty() || config.consumer.manual_assignment.is_some() {
            config.consumer.validate()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssignmentStrategy, CommitPolicy, DeliverySemantics};
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ClientConfigFile::parse("").unwrap();
        assert_eq!(config, ClientConfigFile::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[consumer]
group_id = "orders"
delivery = "at_most_once"
assignment_strategy = "cooperative_sticky"
session_timeout_ms = 20000

[consumer.commit_policy]
mode = "batched"
max_records = 50
interval_ms = 1000

[consumer.batch]
max_records = 25
failure_strategy = "per_record_fallback"

[producer]
transactional_id = "tx-producer-orders"
"#
        )
        .unwrap();

        let config = ClientConfigFile::load(&path).unwrap();
        assert_eq!(config.consumer.group_id, "orders");
        assert_eq!(config.consumer.delivery, DeliverySemantics::AtMostOnce);
        assert_eq!(
            config.consumer.assignment_strategy,
            AssignmentStrategy::CooperativeSticky
        );
        assert_eq!(
            config.consumer.commit_policy,
            CommitPolicy::Batched {
                max_records: 50,
                interval_ms: 1000
            }
        );
        assert_eq!(config.consumer.batch.map(|b| b.max_records), Some(25));
        assert_eq!(config.consumer.session_timeout_ms, 20000);
        assert_eq!(config.consumer.heartbeat_interval_ms, 3000);
        assert_eq!(
            config.producer.transactional_id.as_deref(),
            Some("tx-producer-orders")
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ClientConfigFile::parse(
            r#"
[consumer]
group_id = "orders"
heartbeat_interval_ms = 60000
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_ms"));
    }

    #[test]
    fn test_missing_file() {
        assert!(ClientConfigFile::load("/nonexistent/client.toml").is_err());
    }
}
