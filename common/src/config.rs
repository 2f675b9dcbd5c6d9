// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub cluster: ClusterSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How often the dispatch loop polls for due triggers.
    pub poll_interval_seconds: u64,
    /// Random jitter added to each poll so clustered instances spread out.
    pub poll_jitter_ms: u64,
    /// Maximum triggers claimed per poll cycle.
    pub max_triggers_per_poll: usize,
    /// A fire later than this past its scheduled time is a misfire.
    pub misfire_threshold_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Maximum concurrent job executions per instance.
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub heartbeat_interval_seconds: u64,
    /// Claims held by instances silent for longer than this are recovered.
    pub stale_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
}

impl Settings {
    /// Load configuration with layered precedence: defaults -> file -> env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_triggers_per_poll == 0 {
            return Err("Scheduler max_triggers_per_poll must be greater than 0".to_string());
        }

        if self.executor.max_concurrent == 0 {
            return Err("Executor max_concurrent must be greater than 0".to_string());
        }

        if self.cluster.heartbeat_interval_seconds == 0 {
            return Err("Cluster heartbeat_interval_seconds must be greater than 0".to_string());
        }
        if self.cluster.stale_after_seconds <= self.cluster.heartbeat_interval_seconds {
            return Err(
                "Cluster stale_after_seconds must exceed heartbeat_interval_seconds".to_string(),
            );
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerSettings {
                poll_interval_seconds: 5,
                poll_jitter_ms: 500,
                max_triggers_per_poll: 20,
                misfire_threshold_seconds: 60,
            },
            executor: ExecutorSettings { max_concurrent: 10 },
            cluster: ClusterSettings {
                heartbeat_interval_seconds: 10,
                stale_after_seconds: 60,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
            },
        }
    }
}
