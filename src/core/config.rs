//! Configuration management for PostgreSQL logical replication
//!
//! Configuration is loaded from environment variables and can be overridden
//! by command line flags. All validation happens in one place before any
//! connection is opened.

use super::{ReplicationError, ReplicationResult};
use crate::replication::lifecycle::validate_slot_name;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Which transport drives the change feed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// COPY-both streaming over a replication connection
    Streaming,
    /// Polling `pg_logical_slot_peek_binary_changes` and advancing explicitly
    Peek,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Streaming => write!(f, "streaming"),
            TransportMode::Peek => write!(f, "peek"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "streaming" | "stream" => Ok(TransportMode::Streaming),
            "peek" => Ok(TransportMode::Peek),
            other => Err(ReplicationError::config(format!(
                "TRANSPORT must be one of: 'streaming' or 'peek', got '{}'",
                other
            ))),
        }
    }
}

/// Validated replication settings
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub connection_string: String,
    pub publication_name: String,
    pub slot_name: String,
    /// Tables to publish and snapshot, `schema.table` recommended
    pub tables: Vec<String>,
    pub feedback_interval: Duration,
    /// Sleep between reads when the stream has no data yet
    pub poll_interval: Duration,
    /// Maximum changes fetched per peek call
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub user_managed_slot: bool,
    pub user_snapshot: Option<String>,
    pub transport: TransportMode,
    /// Zero applies changes inline, otherwise through a bounded queue
    pub sink_queue_capacity: usize,
    pub fatal_sync_errors: bool,
    pub skip_initial_sync: bool,
    /// Derive slot and publication names from the database and this name
    pub replication_name: Option<String>,
    pub sink_type: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            publication_name: "wal2sink_pub".to_string(),
            slot_name: "wal2sink_slot".to_string(),
            tables: Vec::new(),
            feedback_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            batch_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            user_managed_slot: false,
            user_snapshot: None,
            transport: TransportMode::Streaming,
            sink_queue_capacity: 0,
            fatal_sync_errors: false,
            skip_initial_sync: false,
            replication_name: None,
            sink_type: "stdout".to_string(),
        }
    }
}

impl ReplicationConfig {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// Required:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `TABLES`: comma separated list of tables to replicate
    ///
    /// Optional (with defaults):
    /// - `SLOT_NAME` (`wal2sink_slot`), `PUB_NAME` (`wal2sink_pub`)
    /// - `FEEDBACK_INTERVAL_SECS` (5), `POLL_INTERVAL_MS` (10)
    /// - `BATCH_SIZE` (100), `MAX_RETRIES` (3), `RETRY_DELAY_MS` (1000)
    /// - `USER_MANAGED_SLOT` (false), `USER_SNAPSHOT`
    /// - `TRANSPORT` (`streaming` or `peek`)
    /// - `SINK_QUEUE_CAPACITY` (0, inline apply)
    /// - `FATAL_SYNC_ERRORS` (false), `SKIP_INITIAL_SYNC` (false)
    /// - `REPLICATION_NAME`, `SINK` (`stdout`)
    pub fn from_env() -> ReplicationResult<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ReplicationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let connection_string = lookup("DATABASE_URL").ok_or_else(|| {
            ReplicationError::config("Missing required DATABASE_URL environment variable")
        })?;

        let tables = lookup("TABLES")
            .map(|raw| parse_table_list(&raw))
            .unwrap_or_default();

        let config = Self {
            connection_string,
            publication_name: lookup("PUB_NAME").unwrap_or(defaults.publication_name),
            slot_name: lookup("SLOT_NAME").unwrap_or(defaults.slot_name),
            tables,
            feedback_interval: Duration::from_secs(parse_number(
                &lookup,
                "FEEDBACK_INTERVAL_SECS",
                defaults.feedback_interval.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_number(
                &lookup,
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            batch_size: parse_number(&lookup, "BATCH_SIZE", defaults.batch_size as u64)? as usize,
            max_retries: parse_number(&lookup, "MAX_RETRIES", defaults.max_retries as u64)? as u32,
            retry_delay: Duration::from_millis(parse_number(
                &lookup,
                "RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )?),
            user_managed_slot: parse_flag(&lookup, "USER_MANAGED_SLOT")?,
            user_snapshot: lookup("USER_SNAPSHOT").filter(|s| !s.trim().is_empty()),
            transport: match lookup("TRANSPORT") {
                Some(raw) => raw.parse()?,
                None => defaults.transport,
            },
            sink_queue_capacity: parse_number(&lookup, "SINK_QUEUE_CAPACITY", 0)? as usize,
            fatal_sync_errors: parse_flag(&lookup, "FATAL_SYNC_ERRORS")?,
            skip_initial_sync: parse_flag(&lookup, "SKIP_INITIAL_SYNC")?,
            replication_name: lookup("REPLICATION_NAME").filter(|s| !s.trim().is_empty()),
            sink_type: lookup("SINK").unwrap_or(defaults.sink_type),
        };

        Ok(config)
    }

    /// Validate the configuration before use
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.connection_string.trim().is_empty() {
            return Err(ReplicationError::config("DATABASE_URL cannot be empty"));
        }

        if self.publication_name.trim().is_empty() {
            return Err(ReplicationError::config("Publication name cannot be empty"));
        }

        if self.tables.is_empty() {
            return Err(ReplicationError::invalid_argument(
                "At least one table must be configured for replication",
            ));
        }

        validate_slot_name(&self.slot_name)?;

        if self.feedback_interval.is_zero() {
            return Err(ReplicationError::config("Feedback interval must be positive"));
        }

        if self.poll_interval.is_zero() {
            return Err(ReplicationError::config("Poll interval must be positive"));
        }

        if self.batch_size == 0 {
            return Err(ReplicationError::config("Batch size must be positive"));
        }

        if self.user_managed_slot && self.user_snapshot.is_none() {
            return Err(ReplicationError::invalid_argument(
                "A user managed slot requires a snapshot name",
            ));
        }

        Ok(())
    }
}

/// Split a comma separated table list, dropping empty entries
pub fn parse_table_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<F>(lookup: &F, key: &str, default: u64) -> ReplicationResult<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ReplicationError::config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> ReplicationResult<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ReplicationError::config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_missing_database_url() {
        let result = ReplicationConfig::from_lookup(lookup_from(&[]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_config_defaults() {
        let config = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("TABLES", "public.students, public.courses,"),
        ]))
        .unwrap();

        assert_eq!(config.slot_name, "wal2sink_slot");
        assert_eq!(config.publication_name, "wal2sink_pub");
        assert_eq!(config.tables, vec!["public.students", "public.courses"]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.transport, TransportMode::Streaming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_numbers_and_transport() {
        let result = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("BATCH_SIZE", "many"),
        ]));
        assert!(result.unwrap_err().to_string().contains("BATCH_SIZE"));

        let result = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("TRANSPORT", "carrier-pigeon"),
        ]));
        assert!(result.unwrap_err().to_string().contains("TRANSPORT"));
    }

    #[test]
    fn test_validate_requires_tables_and_valid_slot() {
        let mut config = ReplicationConfig {
            connection_string: "host=localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::InvalidArgument { .. })
        ));

        config.tables = vec!["public.students".to_string()];
        config.slot_name = "Public-Students".to_string();
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::InvalidArgument { .. })
        ));

        config.slot_name = "public_students".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_user_managed_slot_requires_snapshot() {
        let config = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("TABLES", "public.students"),
            ("USER_MANAGED_SLOT", "true"),
        ]))
        .unwrap();
        assert!(config.user_managed_slot);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_name_and_sink() {
        let config = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("TABLES", "public.students"),
            ("REPLICATION_NAME", "Students-Feed"),
            ("SINK", "stdout"),
            ("POLL_INTERVAL_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.replication_name.as_deref(), Some("Students-Feed"));
        assert_eq!(config.sink_type, "stdout");
        assert!(config.validate().unwrap_err().to_string().contains("Poll interval"));

        let config = ReplicationConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgresql://test@localhost/test"),
            ("REPLICATION_NAME", "  "),
        ]))
        .unwrap();
        assert!(config.replication_name.is_none());
    }
}
