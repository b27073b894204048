//! Service configuration.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_core::{MerchantId, ShopDomain, StaticMerchantDirectory, Topic};
use hookline_delivery::{EngineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";
const ENV_PREFIX: &str = "HOOKLINE_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `HOOKLINE_` (highest priority)
/// 2. Configuration file (`hookline.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use hookline::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("retries: {}", config.max_retries);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Dispatch
    /// Upper bound on a single handler call in milliseconds.
    ///
    /// Environment variable: `HOOKLINE_HANDLER_TIMEOUT_MS`
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    // Retry
    /// Retries allowed after the first attempt.
    ///
    /// Environment variable: `HOOKLINE_MAX_RETRIES`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    ///
    /// Environment variable: `HOOKLINE_RETRY_INITIAL_DELAY_MS`
    #[serde(default = "default_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Factor applied to the delay for each further retry.
    ///
    /// Environment variable: `HOOKLINE_RETRY_BACKOFF_MULTIPLIER`
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// Upper bound on any retry delay in milliseconds.
    ///
    /// Environment variable: `HOOKLINE_RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter fraction applied to retry delays (0.0 to 1.0).
    ///
    /// Environment variable: `HOOKLINE_RETRY_JITTER_FACTOR`
    #[serde(default)]
    pub retry_jitter_factor: f64,

    // Monitoring
    /// Attempts slower than this many milliseconds are logged at warn level.
    ///
    /// Environment variable: `HOOKLINE_SLOW_THRESHOLD_MS`
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Days delivery records are kept.
    ///
    /// Environment variable: `HOOKLINE_RETENTION_DAYS`
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Seconds between retention sweeps.
    ///
    /// Environment variable: `HOOKLINE_RETENTION_SWEEP_INTERVAL_SECS`
    #[serde(default = "default_retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
    /// Seconds between sweeps that re-arm failed deliveries.
    ///
    /// Environment variable: `HOOKLINE_FAILED_SWEEP_INTERVAL_SECS`
    #[serde(default = "default_failed_sweep_interval_secs")]
    pub failed_sweep_interval_secs: u64,
    /// Base stagger between re-armed failed deliveries in milliseconds.
    ///
    /// Environment variable: `HOOKLINE_RECOVERY_STAGGER_MS`
    #[serde(default = "default_recovery_stagger_ms")]
    pub recovery_stagger_ms: u64,
    /// Seconds to wait for background tasks on shutdown.
    ///
    /// Environment variable: `HOOKLINE_SHUTDOWN_TIMEOUT_SECS`
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    // Service
    /// Tracing filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `HOOKLINE_LOG_FILTER`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Topics acknowledged by the built-in audit handler.
    ///
    /// Environment variable: `HOOKLINE_AUDIT_TOPICS`, e.g. `[orders/create]`
    #[serde(default = "default_audit_topics")]
    pub audit_topics: Vec<String>,
    /// Shop domain to merchant id mapping.
    #[serde(default)]
    pub merchants: BTreeMap<String, String>,
}

impl Config {
    /// Loads configuration from defaults, `hookline.toml`, and environment
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Loads configuration using `path` as the configuration file.
    ///
    /// A missing file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the engine's configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            retry_policy: self.to_retry_policy(),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
            retention: Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60)),
            retention_sweep_interval: Duration::from_secs(self.retention_sweep_interval_secs),
            failed_sweep_interval: Duration::from_secs(self.failed_sweep_interval_secs),
            recovery_stagger: Duration::from_millis(self.recovery_stagger_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Converts to the default retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Parses the configured audit topics.
    pub fn audit_topics(&self) -> Result<Vec<Topic>> {
        self.audit_topics
            .iter()
            .map(|topic| topic.parse::<Topic>().with_context(|| format!("invalid audit topic {topic:?}")))
            .collect()
    }

    /// Builds the merchant directory from the configured mapping.
    pub fn merchant_directory(&self) -> Result<StaticMerchantDirectory> {
        self.merchants
            .iter()
            .map(|(shop, merchant)| {
                let shop = ShopDomain::parse(shop.as_str())
                    .with_context(|| format!("invalid merchant shop {shop:?}"))?;
                Ok::<_, anyhow::Error>((shop, MerchantId(merchant.clone())))
            })
            .collect()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.handler_timeout_ms == 0 {
            anyhow::bail!("handler_timeout_ms must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be greater than 0");
        }

        if self.retry_initial_delay_ms == 0 {
            anyhow::bail!("retry_initial_delay_ms must be greater than 0");
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            anyhow::bail!("retry_backoff_multiplier must be at least 1.0");
        }

        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            anyhow::bail!("retry_max_delay_ms cannot be below retry_initial_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.retention_days == 0 {
            anyhow::bail!("retention_days must be greater than 0");
        }

        if self.retention_sweep_interval_secs == 0 || self.failed_sweep_interval_secs == 0 {
            anyhow::bail!("sweep intervals must be greater than 0");
        }

        if self.shutdown_timeout_secs == 0 {
            anyhow::bail!("shutdown_timeout_secs must be greater than 0");
        }

        if self.recovery_stagger_ms == 0 {
            anyhow::bail!("recovery_stagger_ms must be greater than 0");
        }

        self.audit_topics()?;
        self.merchant_directory()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_initial_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: 0.0,
            slow_threshold_ms: default_slow_threshold_ms(),
            retention_days: default_retention_days(),
            retention_sweep_interval_secs: default_retention_sweep_interval_secs(),
            failed_sweep_interval_secs: default_failed_sweep_interval_secs(),
            recovery_stagger_ms: default_recovery_stagger_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            log_filter: default_log_filter(),
            audit_topics: default_audit_topics(),
            merchants: BTreeMap::new(),
        }
    }
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_slow_threshold_ms() -> u64 {
    1000
}

fn default_retention_days() -> u64 {
    30
}

fn default_retention_sweep_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_failed_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_recovery_stagger_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_log_filter() -> String {
    "info,hookline=debug".to_string()
}

fn default_audit_topics() -> Vec<String> {
    Topic::ALL.iter().map(|topic| topic.as_str().to_string()).collect()
}
