use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::backend::{BackendSettings, PricingInfo};
use crate::consensus::ConsensusConfig;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;

/// On-disk configuration. Everything has a default so a missing or partial
/// file still yields a runnable setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backends: HashMap<String, BackendEntry>,
    pub pool: PoolSettings,
    pub breaker: BreakerSettings,
    pub rate_limit: RateLimitSettings,
    pub consensus: ConsensusConfig,
    pub cache: CacheSettings,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendEntry {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub concurrency_limit: usize,
    pub specializations: Vec<String>,
    pub trust_weight: f64,
    /// Per-1k-token prices; responses report an estimated cost when set.
    pub pricing: Option<PricingInfo>,
    pub enabled: bool,
    /// Preconstruct handles for this backend at startup.
    pub warm: bool,
}

impl Default for BackendEntry {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            api_key: None,
            timeout_seconds: 60,
            max_retries: 2,
            concurrency_limit: 4,
            specializations: Vec::new(),
            trust_weight: 1.0,
            pricing: None,
            enabled: true,
            warm: false,
        }
    }
}

impl BackendEntry {
    pub fn to_settings(&self) -> BackendSettings {
        BackendSettings {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            request_timeout: Duration::from_secs(self.timeout_seconds),
            max_retries: self.max_retries,
            concurrency_limit: self.concurrency_limit,
            specializations: self.specializations.clone(),
            trust_weight: self.trust_weight,
            pricing: self.pricing.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_wait_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub min_idle: usize,
    pub health_check_interval_seconds: u64,
    pub health_check_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub unhealthy_ratio: f64,
    pub max_consecutive_failures: u32,
    pub max_creation_retries: u32,
    pub creation_backoff_base_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_wait_seconds: 10,
            idle_timeout_seconds: 300,
            min_idle: 1,
            health_check_interval_seconds: 30,
            health_check_timeout_seconds: 5,
            cleanup_interval_seconds: 60,
            unhealthy_ratio: 0.5,
            max_consecutive_failures: 3,
            max_creation_retries: 3,
            creation_backoff_base_ms: 50,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_wait: Duration::from_secs(self.max_wait_seconds),
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            min_idle: self.min_idle,
            health_check_interval: Duration::from_secs(self.health_check_interval_seconds),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_seconds),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            unhealthy_ratio: self.unhealthy_ratio,
            max_consecutive_failures: self.max_consecutive_failures,
            max_creation_retries: self.max_creation_retries,
            creation_backoff_base: Duration::from_millis(self.creation_backoff_base_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 30,
        }
    }
}

impl BreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_window: usize,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: 30,
            window_seconds: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 300,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_query_chars: usize,
    /// Floor accepted results must clear unless the caller asks for more.
    pub min_confidence: f64,
    /// Optional wall-clock ceiling for a whole dispatch; zero disables it.
    pub global_deadline_seconds: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_query_chars: 8192,
            min_confidence: 0.0,
            global_deadline_seconds: 0,
        }
    }
}

impl DispatchSettings {
    pub fn global_deadline(&self) -> Option<Duration> {
        if self.global_deadline_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.global_deadline_seconds))
        }
    }
}

impl AppConfig {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(path).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", path);

        let config_content = fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, path: &PathBuf) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.backends {
            if !entry.enabled {
                continue;
            }
            if entry.endpoint.as_deref().map_or(true, str::is_empty) {
                return Err(Error::validation(format!(
                    "Backend {} is enabled but has no endpoint",
                    name
                )));
            }
            if entry.model.as_deref().map_or(true, str::is_empty) {
                return Err(Error::validation(format!(
                    "Backend {} is enabled but has no model",
                    name
                )));
            }
            if entry.concurrency_limit == 0 {
                return Err(Error::validation(format!(
                    "Backend {} has concurrency_limit 0",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&entry.trust_weight) {
                return Err(Error::validation(format!(
                    "Backend {} trust_weight must be between 0 and 1",
                    name
                )));
            }
        }

        if self.rate_limit.requests_per_window == 0 {
            return Err(Error::validation("rate_limit.requests_per_window must be positive"));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(Error::validation("rate_limit.window_seconds must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::validation("breaker.failure_threshold must be positive"));
        }
        if !(0.0..=1.0).contains(&self.pool.unhealthy_ratio) {
            return Err(Error::validation("pool.unhealthy_ratio must be between 0 and 1"));
        }
        if self.pool.max_creation_retries == 0 {
            return Err(Error::validation("pool.max_creation_retries must be positive"));
        }

        let c = &self.consensus;
        for (field, value) in [
            ("min_similarity", c.min_similarity),
            ("medium_confidence", c.medium_confidence),
            ("high_confidence", c.high_confidence),
            ("single_source_confidence", c.single_source_confidence),
            ("dedup_threshold", c.dedup_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::validation(format!(
                    "consensus.{} must be between 0 and 1",
                    field
                )));
            }
        }
        if c.medium_confidence > c.high_confidence {
            return Err(Error::validation(
                "consensus.medium_confidence must not exceed high_confidence",
            ));
        }

        if !(0.0..=1.0).contains(&self.dispatch.min_confidence) {
            return Err(Error::validation("dispatch.min_confidence must be between 0 and 1"));
        }
        if self.dispatch.max_query_chars == 0 {
            return Err(Error::validation("dispatch.max_query_chars must be positive"));
        }

        Ok(())
    }

    /// Names of backends that should serve traffic, in sorted order so
    /// registration is deterministic across runs.
    pub fn enabled_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .backends
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Backends flagged for warm-up at startup.
    pub fn warm_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .iter()
            .filter(|(_, e)| e.enabled && e.warm)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }
}

/// Platform-appropriate default config location.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "concilio").ok_or_else(|| {
        Error::Config(config::ConfigError::Message(
            "could not determine a home directory for configuration".to_string(),
        ))
    })?;
    Ok(dirs.config_dir().join("config.toml"))
}
