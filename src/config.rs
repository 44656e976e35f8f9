use crate::jobs::RunnerSettings;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MAX_STEP_TIMEOUT_SECS: u64 = 60 * 60;
const MAX_JOB_DEADLINE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum AutomationBackend {
    Simulated {
        #[serde(default = "default_success_rate")]
        success_rate: f64,
        #[serde(default = "default_latency_ms")]
        latency_ms: u64,
    },
    Remote {
        base_url: String,
    },
}

fn default_success_rate() -> f64 {
    0.9
}

fn default_latency_ms() -> u64 {
    250
}

impl Default for AutomationBackend {
    fn default() -> Self {
        AutomationBackend::Simulated {
            success_rate: default_success_rate(),
            latency_ms: default_latency_ms(),
        }
    }
}

/// Service settings. A YAML file named by `FLEET_CONFIG` supplies the base,
/// missing keys take the defaults below, and environment variables win.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub port: u16,
    pub session_pool_size: usize,
    pub step_timeout_secs: u64,
    pub job_deadline_secs: u64,
    pub item_delay_min_ms: u64,
    pub item_delay_max_ms: u64,
    pub default_daily_limit: u32,
    pub scheduler_tick_secs: u64,
    pub max_retry_attempts: u32,
    pub automation: AutomationBackend,
    pub redis_url: Option<String>,
    pub idempotency_ttl_secs: u64,
    pub request_max_bytes: usize,
    pub seed_path: Option<PathBuf>,
    pub api_keys: Option<String>,
    pub metrics_key: Option<String>,
    pub rate_limit_per_sec: f64,
    pub rate_limit_capacity: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            session_pool_size: 2,
            step_timeout_secs: 30,
            job_deadline_secs: 3600,
            item_delay_min_ms: 1000,
            item_delay_max_ms: 3000,
            default_daily_limit: 20,
            scheduler_tick_secs: 30,
            max_retry_attempts: 3,
            automation: AutomationBackend::default(),
            redis_url: None,
            idempotency_ttl_secs: 3600,
            request_max_bytes: 1024 * 1024,
            seed_path: None,
            api_keys: None,
            metrics_key: None,
            rate_limit_per_sec: 5.0,
            rate_limit_capacity: 10.0,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> eyre::Result<Self> {
        dotenvy::dotenv().ok();
        let base = match env::var("FLEET_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::load_yaml(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        let config = base.with_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> eyre::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn load_yaml(path: &Path) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| eyre::eyre!("reading config {}: {err}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Applies environment-style overrides. `lookup` returns the raw value
    /// for a variable name, if set.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        set_parsed(&mut self.port, &get, "PORT")?;
        set_parsed(&mut self.session_pool_size, &get, "SESSION_POOL_SIZE")?;
        set_parsed(&mut self.step_timeout_secs, &get, "STEP_TIMEOUT_SECS")?;
        set_parsed(&mut self.job_deadline_secs, &get, "JOB_DEADLINE_SECS")?;
        set_parsed(&mut self.item_delay_min_ms, &get, "ITEM_DELAY_MIN_MS")?;
        set_parsed(&mut self.item_delay_max_ms, &get, "ITEM_DELAY_MAX_MS")?;
        set_parsed(&mut self.default_daily_limit, &get, "DEFAULT_DAILY_LIMIT")?;
        set_parsed(&mut self.scheduler_tick_secs, &get, "SCHEDULER_TICK_SECS")?;
        set_parsed(&mut self.max_retry_attempts, &get, "MAX_RETRY_ATTEMPTS")?;
        set_parsed(&mut self.idempotency_ttl_secs, &get, "IDEMPOTENCY_TTL_SECS")?;
        set_parsed(&mut self.request_max_bytes, &get, "REQUEST_MAX_BYTES")?;
        set_parsed(&mut self.rate_limit_per_sec, &get, "RATE_LIMIT_PER_SEC")?;
        set_parsed(&mut self.rate_limit_capacity, &get, "RATE_LIMIT_CAPACITY")?;

        if let Some(url) = get("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(path) = get("FLEET_SEED") {
            self.seed_path = Some(PathBuf::from(path));
        }
        if let Some(keys) = get("FLEET_API_KEYS") {
            self.api_keys = Some(keys);
        }
        if let Some(key) = get("METRICS_KEY") {
            self.metrics_key = Some(key);
        }

        if let Some(base_url) = get("AUTOMATION_URL") {
            self.automation = AutomationBackend::Remote { base_url };
        } else if let AutomationBackend::Simulated {
            success_rate,
            latency_ms,
        } = &mut self.automation
        {
            set_parsed(success_rate, &get, "SIMULATED_SUCCESS_RATE")?;
            set_parsed(latency_ms, &get, "SIMULATED_LATENCY_MS")?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_pool_size == 0 {
            return Err(ConfigError::Constraint(
                "session_pool_size must be at least 1".into(),
            ));
        }
        if self.step_timeout_secs == 0 || self.job_deadline_secs == 0 {
            return Err(ConfigError::Constraint(
                "step and job timeouts must be positive".into(),
            ));
        }
        if self.step_timeout_secs > MAX_STEP_TIMEOUT_SECS {
            return Err(ConfigError::Constraint(format!(
                "step_timeout_secs must be at most {MAX_STEP_TIMEOUT_SECS}"
            )));
        }
        if self.job_deadline_secs > MAX_JOB_DEADLINE_SECS {
            return Err(ConfigError::Constraint(format!(
                "job_deadline_secs must be at most {MAX_JOB_DEADLINE_SECS}"
            )));
        }
        if self.item_delay_min_ms > self.item_delay_max_ms {
            return Err(ConfigError::Constraint(format!(
                "item delay range is inverted ({} > {})",
                self.item_delay_min_ms, self.item_delay_max_ms
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Constraint(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        if self.request_max_bytes == 0 {
            return Err(ConfigError::Constraint(
                "request_max_bytes must be positive".into(),
            ));
        }
        match &self.automation {
            AutomationBackend::Simulated { success_rate, .. }
                if !(0.0..=1.0).contains(success_rate) =>
            {
                Err(ConfigError::Constraint(format!(
                    "simulated success rate {success_rate} is outside 0..=1"
                )))
            }
            AutomationBackend::Remote { base_url }
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) =>
            {
                Err(ConfigError::Invalid {
                    key: "AUTOMATION_URL",
                    value: base_url.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            item_delay_min: Duration::from_millis(self.item_delay_min_ms),
            item_delay_max: Duration::from_millis(self.item_delay_max_ms),
            job_deadline: Duration::from_secs(self.job_deadline_secs),
            max_retry_attempts: self.max_retry_attempts,
        }
    }
}

fn set_parsed<T: FromStr>(
    slot: &mut T,
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<(), ConfigError> {
    if let Some(raw) = get(key) {
        *slot = raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw })?;
    }
    Ok(())
}
