use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::workflow::rules::RoleOverride;

/// Main configuration structure for the work order engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkOrderEngineConfig {
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Audit trail query settings
    pub audit: AuditConfig,
    /// Post-transition notification settings
    pub notifications: NotificationConfig,
    /// State machine settings
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite connection string
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive
    pub log_level: String,
    /// Emit JSON log lines
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Entries returned when the caller gives no limit
    pub default_limit: usize,
    /// Upper bound applied to caller limits
    pub max_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Dispatch notifications after committed transitions
    pub enabled: bool,
    /// Upper bound for a single notify call
    pub dispatch_timeout_ms: u64,
    /// How long recipient lists stay cached; 0 disables caching
    pub recipient_cache_ttl_seconds: u64,
}

impl NotificationConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn recipient_cache_ttl(&self) -> Option<Duration> {
        (self.recipient_cache_ttl_seconds > 0)
            .then(|| Duration::from_secs(self.recipient_cache_ttl_seconds))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Re-read attempts after losing a compare-and-set race
    pub max_conflict_retries: u32,
    /// Replacement role lists for existing edges
    #[serde(default)]
    pub role_overrides: Vec<RoleOverride>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dispatch_timeout_ms: 5_000,
            recipient_cache_ttl_seconds: 60,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            role_overrides: Vec::new(),
        }
    }
}

impl Default for WorkOrderEngineConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseConfig {
                url: "sqlite://work-orders.db".to_string(),
                max_connections: 5,
                auto_migrate: true,
            }),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
            audit: AuditConfig::default(),
            notifications: NotificationConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl WorkOrderEngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (work-order-engine.toml, or `path` when given)
    /// 3. Environment variables (prefixed with WORK_ORDER_ENGINE__)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("work-order-engine.toml").exists() {
                    builder = builder.add_source(File::with_name("work-order-engine"));
                }
            }
        }

        // Double underscore keeps field names like `max_limit` intact
        builder = builder.add_source(
            Environment::with_prefix("WORK_ORDER_ENGINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<WorkOrderEngineConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = WorkOrderEngineConfig::load_env_file();
        WorkOrderEngineConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static WorkOrderEngineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
