/// Configuration for the relayflow engine
///
/// Every value has a default and can be overridden through a `RELAYFLOW_*`
/// environment variable, which suits container deployments.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

/// Limits applied to sandboxed evaluation and node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time bound for a single expression evaluation
    pub expression_timeout_ms: u64,
    /// Time bound for a script node
    pub script_timeout_ms: u64,
    /// Bytes a single sandbox may allocate
    pub sandbox_memory_limit: usize,
    /// Timeout for outbound HTTP requests issued by http/webhook nodes
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the daemon registers timer-triggered workflows on startup
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `relayflow.db`
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "relayflow=debug"
    pub filter: String,
}

impl EngineConfig {
    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("relayflow.db")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expression_timeout_ms: env_or("RELAYFLOW_EXPRESSION_TIMEOUT_MS", 1_000),
            script_timeout_ms: env_or("RELAYFLOW_SCRIPT_TIMEOUT_MS", 2_000),
            sandbox_memory_limit: env_or("RELAYFLOW_SANDBOX_MEMORY_LIMIT", 32 * 1024 * 1024),
            http_timeout_secs: env_or("RELAYFLOW_HTTP_TIMEOUT_SECS", 30),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig {
                enabled: env_or("RELAYFLOW_SCHEDULER_ENABLED", true),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("RELAYFLOW_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            log: LogConfig {
                filter: std::env::var("RELAYFLOW_LOG").unwrap_or_else(|_| "info".to_string()),
            },
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
