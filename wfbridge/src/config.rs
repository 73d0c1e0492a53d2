//! Bridge configuration.
//!
//! All durations serialize as integer milliseconds. Every field has a
//! default so partial documents deserialize.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::bridge::codec::WireFormat;

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{pool} pool command is empty")]
    EmptyCommand { pool: &'static str },
    #[error("{pool} pool must have at least one worker")]
    NoWorkers { pool: &'static str },
}

/// How to run one pool of worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Program and arguments of the worker process.
    pub command: Vec<String>,
    pub num_workers: usize,
    #[serde(with = "duration_ms")]
    pub allocate_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub destroy_timeout: Duration,
    /// Extra environment for every worker, on top of mode and codec.
    pub env: HashMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            num_workers: 4,
            allocate_timeout: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(60),
            env: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_allocate_timeout(mut self, timeout: Duration) -> Self {
        self.allocate_timeout = timeout;
        self
    }

    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub activities: PoolConfig,
    /// Workflow worker command; the activity command when unset.
    pub workflow_command: Option<Vec<String>>,
    pub wire_format: WireFormat,
    /// Stop timeout handed to every engine-side worker.
    #[serde(with = "duration_ms")]
    pub graceful_timeout: Duration,
    /// Advertised to workers in the catalogue discovery call.
    pub version: String,
    pub reset_backoff: BackoffConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            activities: PoolConfig::default(),
            workflow_command: None,
            wire_format: WireFormat::Json,
            graceful_timeout: Duration::from_secs(30),
            version: crate::VERSION.to_string(),
            reset_backoff: BackoffConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new(activities: PoolConfig) -> Self {
        Self {
            activities,
            ..Self::default()
        }
    }

    pub fn with_workflow_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workflow_command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    pub fn with_reset_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reset_backoff = backoff;
        self
    }

    /// The workflow pool: one worker, no allocation deadline worth speaking of.
    ///
    /// Replay determinism and the sticky cache require a single execution slot.
    pub fn workflow_pool(&self) -> PoolConfig {
        PoolConfig {
            command: self
                .workflow_command
                .clone()
                .unwrap_or_else(|| self.activities.command.clone()),
            num_workers: 1,
            allocate_timeout: Duration::from_secs(240 * 3600),
            destroy_timeout: Duration::from_secs(30),
            env: self.activities.env.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activities.command.is_empty() {
            return Err(ConfigError::EmptyCommand { pool: "activity" });
        }
        if self.activities.num_workers == 0 {
            return Err(ConfigError::NoWorkers { pool: "activity" });
        }
        if self.workflow_pool().command.is_empty() {
            return Err(ConfigError::EmptyCommand { pool: "workflow" });
        }
        Ok(())
    }
}
