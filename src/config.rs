//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid configuration. Durations are
//! written in milliseconds:
//!
//! ```toml
//! dispatcher = "sharded"
//! framer = "lv"
//! coder = "json"
//! hook_mode = "dispatched"
//! linger_ms = 5000
//!
//! [sharded]
//! workers = 8
//! queue_size = 256
//!
//! [client]
//! sessions = 4
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the `on_connected` and `on_close` hooks of a connection run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    /// Hooks are awaited by the task driving the lifecycle transition.
    Inline,
    /// Hooks are handed to the dispatcher keyed by the connection id, so they are ordered with the
    /// connection's messages under the single-loop and sharded policies.
    #[default]
    Dispatched,
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the dispatcher policy in the plugin registry.
    pub dispatcher: String,
    /// Name of the coder in the plugin registry.
    pub coder: String,
    /// Name of the framer in the plugin registry.
    pub framer: String,
    /// Where lifecycle hooks run.
    pub hook_mode: HookMode,
    /// How long the read side of a connection keeps draining after its write side was shut down.
    pub linger_ms: u64,
    /// Initial capacity of each outbound buffer.
    pub outbound_capacity: usize,
    /// Whether a timer wheel is created for the engine.
    pub timers: bool,
    /// Single-loop dispatcher settings.
    pub single_loop: SingleLoopConfig,
    /// Sharded dispatcher settings.
    pub sharded: ShardedConfig,
    /// Elastic dispatcher settings.
    pub elastic: ElasticConfig,
    /// Dialer settings.
    pub client: ClientConfig,
    /// Listener settings.
    pub accept: AcceptConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dispatcher: "sharded".to_string(),
            coder: "json".to_string(),
            framer: "lv".to_string(),
            hook_mode: HookMode::default(),
            linger_ms: 5_000,
            outbound_capacity: 128,
            timers: true,
            single_loop: SingleLoopConfig::default(),
            sharded: ShardedConfig::default(),
            elastic: ElasticConfig::default(),
            client: ClientConfig::default(),
            accept: AcceptConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from a TOML string and validates it.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
            Ok(())
        }

        non_zero("single_loop.queue_size", self.single_loop.queue_size as u64)?;
        non_zero("sharded.workers", self.sharded.workers as u64)?;
        non_zero("sharded.queue_size", self.sharded.queue_size as u64)?;
        non_zero("elastic.max_workers", self.elastic.max_workers as u64)?;
        non_zero("elastic.idle_timeout_ms", self.elastic.idle_timeout_ms)?;
        non_zero("client.sessions", self.client.sessions as u64)?;
        non_zero("client.retry_base_ms", self.client.retry_base_ms)?;
        non_zero("accept.backoff_base_ms", self.accept.backoff_base_ms)?;
        if self.client.retry_max_ms < self.client.retry_base_ms {
            return Err(ConfigError::Invalid {
                field: "client.retry_max_ms",
                reason: "must not be smaller than client.retry_base_ms",
            });
        }
        if self.accept.backoff_max_ms < self.accept.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "accept.backoff_max_ms",
                reason: "must not be smaller than accept.backoff_base_ms",
            });
        }

        Ok(())
    }

    /// The post half-close read deadline.
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Settings for the [`SingleLoop`](crate::dispatch::SingleLoop) dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleLoopConfig {
    /// Bounded queue capacity.
    pub queue_size: usize,
}

impl Default for SingleLoopConfig {
    fn default() -> Self {
        SingleLoopConfig { queue_size: 1024 }
    }
}

/// Settings for the [`Sharded`](crate::dispatch::Sharded) dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardedConfig {
    /// Number of shards.
    pub workers: usize,
    /// Bounded queue capacity of each shard.
    pub queue_size: usize,
}

impl Default for ShardedConfig {
    fn default() -> Self {
        ShardedConfig {
            workers: 20,
            queue_size: 256,
        }
    }
}

/// Settings for the [`Elastic`](crate::dispatch::Elastic) dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// Upper bound on live workers. Further tasks run inline in the caller.
    pub max_workers: usize,
    /// Idle workers older than this are retired by the periodic sweep.
    pub idle_timeout_ms: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        ElasticConfig {
            max_workers: 256 * 1024,
            idle_timeout_ms: 10_000,
        }
    }
}

impl ElasticConfig {
    /// The idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Settings for the [`Client`](crate::client::Client) dialer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of sessions kept open to the remote address.
    pub sessions: usize,
    /// First retry delay after a failed dial.
    pub retry_base_ms: u64,
    /// Upper bound of the retry delay.
    pub retry_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            sessions: 1,
            retry_base_ms: 500,
            retry_max_ms: 3_000,
        }
    }
}

/// Settings for the [`Server`](crate::server::Server) accept loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptConfig {
    /// First delay after a transient accept error.
    pub backoff_base_ms: u64,
    /// Upper bound of the accept backoff.
    pub backoff_max_ms: u64,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        AcceptConfig {
            backoff_base_ms: 5,
            backoff_max_ms: 1_000,
        }
    }
}
