//! Per-function configuration read once from the environment at startup.
//!
//! Every loader takes a lookup function so tests can supply values without
//! touching the process environment.

use bucket_watch_core::alarm::AlarmConfig;
use bucket_watch_core::cleanup::CleanupPolicy;
use bucket_watch_core::contract::{DEFAULT_INDEX_NAME, SIZE_RECORD_TYPE};
use bucket_watch_core::storage_keys::{DEFAULT_ALARM_STATE_KEY, DEFAULT_REPORT_PREFIX};

pub const DEFAULT_REPORT_LOOKBACK_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub variable: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.variable, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn required(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError {
            variable: name.to_string(),
            message: "must be configured".to_string(),
        }),
    }
}

fn optional(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(lookup, name) {
        Some(value) => value.parse().map_err(|error: T::Err| ConfigError {
            variable: name.to_string(),
            message: format!("invalid value '{value}': {error}"),
        }),
        None => Ok(default),
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeTrackingConfig {
    pub table_name: String,
}

impl SizeTrackingConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            table_name: required(lookup, "TABLE_NAME")?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub log_group_name: String,
}

impl LoggingConfig {
    /// `LOG_GROUP_NAME` overrides the group Lambda assigns to the function.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let log_group_name = match optional(lookup, "LOG_GROUP_NAME") {
            Some(value) => value,
            None => required(lookup, "AWS_LAMBDA_LOG_GROUP_NAME")?,
        };
        Ok(Self { log_group_name })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    pub bucket: String,
    pub policy: CleanupPolicy,
}

impl CleanerConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = CleanupPolicy::default();
        Ok(Self {
            bucket: required(lookup, "BUCKET_NAME")?,
            policy: CleanupPolicy {
                key_prefix: optional(lookup, "CLEANUP_KEY_PREFIX").unwrap_or(defaults.key_prefix),
                key_suffix: optional(lookup, "CLEANUP_KEY_SUFFIX").unwrap_or(defaults.key_suffix),
                size_budget: parsed(lookup, "CLEANUP_SIZE_BUDGET", defaults.size_budget)?,
            },
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportingConfig {
    pub bucket: String,
    pub table_name: String,
    pub index_name: String,
    pub record_type: String,
    pub prefix: String,
    pub lookback_secs: i64,
}

impl ReportingConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookback_secs = parsed(lookup, "REPORT_LOOKBACK_SECS", DEFAULT_REPORT_LOOKBACK_SECS)?;
        if lookback_secs < 0 {
            return Err(ConfigError {
                variable: "REPORT_LOOKBACK_SECS".to_string(),
                message: "must not be negative".to_string(),
            });
        }
        Ok(Self {
            bucket: required(lookup, "BUCKET_NAME")?,
            table_name: required(lookup, "TABLE_NAME")?,
            index_name: optional(lookup, "INDEX_NAME")
                .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            record_type: SIZE_RECORD_TYPE.to_string(),
            prefix: optional(lookup, "REPORT_PREFIX")
                .unwrap_or_else(|| DEFAULT_REPORT_PREFIX.to_string()),
            lookback_secs,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

/// The state bucket must not be the watched bucket: every state write would
/// otherwise show up as a size change and feed the alarm it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvaluatorConfig {
    pub state_bucket: String,
    pub log_group_name: String,
    pub cleaner_function_name: String,
    pub state_key: String,
    pub alarm: AlarmConfig,
}

impl AlarmEvaluatorConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = AlarmConfig::default();
        let alarm = AlarmConfig {
            name: optional(lookup, "ALARM_NAME").unwrap_or(defaults.name),
            threshold: parsed(lookup, "ALARM_THRESHOLD", defaults.threshold)?,
            period_secs: parsed(lookup, "ALARM_PERIOD_SECS", defaults.period_secs)?,
            evaluation_periods: parsed(
                lookup,
                "ALARM_EVALUATION_PERIODS",
                defaults.evaluation_periods,
            )?,
            ..defaults
        };
        alarm.validate().map_err(|error| ConfigError {
            variable: "ALARM_*".to_string(),
            message: error.to_string(),
        })?;

        let state_bucket = required(lookup, "ALARM_STATE_BUCKET")?;
        if optional(lookup, "BUCKET_NAME").as_deref() == Some(state_bucket.as_str()) {
            return Err(ConfigError {
                variable: "ALARM_STATE_BUCKET".to_string(),
                message: "must differ from BUCKET_NAME".to_string(),
            });
        }

        Ok(Self {
            state_bucket,
            log_group_name: required(lookup, "LOG_GROUP_NAME")?,
            cleaner_function_name: required(lookup, "CLEANER_FUNCTION_NAME")?,
            state_key: optional(lookup, "ALARM_STATE_KEY")
                .unwrap_or_else(|| DEFAULT_ALARM_STATE_KEY.to_string()),
            alarm,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub bucket: String,
    pub plotting_api_url: String,
}

impl DriverConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: required(lookup, "BUCKET_NAME")?,
            plotting_api_url: required(lookup, "PLOTTING_API_URL")?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}
