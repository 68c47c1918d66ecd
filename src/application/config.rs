use crate::error::{ConversionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for [`ConversionExecutor`](super::executor::ConversionExecutor).
///
/// Durations are written as integer milliseconds in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionExecutorConfig {
    pub max_retries: u32,
    #[serde(rename = "base_retry_delay_ms", with = "duration_ms")]
    pub base_retry_delay: Duration,
    pub treasury_address: String,
    pub default_denom: String,
    pub require_payment_verification: bool,
    /// Prefix every destination address must carry before the treasury is asked.
    pub address_prefix: String,
    /// Upper bound on each store, treasury and verifier call.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    /// How long an entry may sit in `Executing` before the sweep hands it to reconciliation.
    #[serde(rename = "stale_execution_timeout_ms", with = "duration_ms")]
    pub stale_execution_timeout: Duration,
}

impl Default for ConversionExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay: Duration::from_secs(5),
            treasury_address: String::new(),
            default_denom: "uve".to_string(),
            require_payment_verification: true,
            address_prefix: "virtengine1".to_string(),
            call_timeout: Duration::from_secs(30),
            stale_execution_timeout: Duration::from_secs(600),
        }
    }
}

impl ConversionExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_denom.trim().is_empty() {
            return Err(ConversionError::Config(
                "default_denom must not be empty".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConversionError::Config(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level layout of the YAML config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub executor: ConversionExecutorConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| ConversionError::Config(format!("Invalid config: {}", e)))?;
        config.executor.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
