// Configuration management for the Control Plane

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, host:port
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: "127.0.0.1:8474".to_string(),
        }
    }
}

/// Which policy store backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Ephemeral in-process map
    Memory,
    /// Replicated key-value store (etcd)
    Kv,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// etcd endpoints, required for the kv backend
    #[serde(default)]
    pub kv_endpoints: Vec<String>,
    /// Key namespace for the kv backend
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            kv_endpoints: Vec::new(),
            key_prefix: "faultline/".to_string(),
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string fed to the tracing filter
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Request and capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
    /// Cap on stored policies; 0 means unlimited
    pub max_policies: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            request_timeout_secs: 30,
            max_policies: 0,
        }
    }
}

/// Config distribution tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Depth of each subscriber's outbound buffer
    pub subscriber_buffer: usize,
    /// Consecutive dropped updates before a slow subscriber is evicted
    pub max_consecutive_misses: u32,
    /// Upper bound on one broadcast fan-out, in seconds
    pub send_deadline_secs: u64,
    /// SSE keep-alive interval, in seconds
    pub keep_alive_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            subscriber_buffer: 16,
            max_consecutive_misses: 8,
            send_deadline_secs: 5,
            keep_alive_secs: 30,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub distributor: DistributionConfig,
}

impl AppConfig {
    /// Load configuration from file, with FAULTLINE__* environment
    /// variables layered on top
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FAULTLINE").separator("__"))
            .build()?;

        let loaded: AppConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load defaults plus environment overrides (no file)
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("FAULTLINE").separator("__"))
            .build()?;

        let mut app_config = AppConfig::default();

        if let Ok(listen_address) = settings.get_string("server.listen_address") {
            app_config.server.listen_address = listen_address;
        }
        if let Ok(backend) = settings.get_string("storage.backend") {
            app_config.storage.backend = match backend.as_str() {
                "memory" => StorageBackend::Memory,
                "kv" => StorageBackend::Kv,
                other => {
                    return Err(config::ConfigError::Message(format!(
                        "unknown storage backend '{other}'"
                    )))
                }
            };
        }
        if let Ok(endpoints) = settings.get_string("storage.kv_endpoints") {
            app_config.storage.kv_endpoints =
                endpoints.split(',').map(|s| s.trim().to_string()).collect();
        }

        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.storage.backend == StorageBackend::Kv && self.storage.kv_endpoints.is_empty() {
            return Err(config::ConfigError::Message(
                "storage.kv_endpoints is required for the kv backend".to_string(),
            ));
        }
        if self.distributor.subscriber_buffer == 0 {
            return Err(config::ConfigError::Message(
                "distributor.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if self.distributor.max_consecutive_misses == 0 {
            return Err(config::ConfigError::Message(
                "distributor.max_consecutive_misses must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.distributor.keep_alive_secs)
    }

    /// Cap on stored policies, if one is configured
    pub fn max_policies(&self) -> Option<usize> {
        (self.limits.max_policies > 0).then_some(self.limits.max_policies)
    }

    /// Distribution tunables in the distributor crate's shape
    pub fn distribution(&self) -> faultline_distributor::DistributorConfig {
        faultline_distributor::DistributorConfig {
            subscriber_buffer: self.distributor.subscriber_buffer,
            max_consecutive_misses: self.distributor.max_consecutive_misses,
            send_deadline: Duration::from_secs(self.distributor.send_deadline_secs),
        }
    }
}
