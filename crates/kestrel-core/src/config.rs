use std::{collections::HashMap, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;

/// Per-component configuration as parsed from the daemon's INI file.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, falling back to a default
    /// when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Tuning knobs of the correlation engine.
///
/// The retry budget is `max_attempts` sweeps or `max_age` since
/// submission, whichever runs out first; `max_pending` bounds the
/// deferred set so unresolvable traffic cannot grow memory without
/// limit.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub sweep_interval: Duration,
    pub max_attempts: u32,
    pub max_age: Duration,
    pub max_pending: usize,
    /// Per-listener channel capacity.
    pub listener_buffer: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            max_attempts: 15,
            max_age: Duration::from_secs(30),
            max_pending: 8192,
            listener_buffer: 1000,
        }
    }
}

impl TryFrom<&ModuleConfig> for CorrelationConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let defaults = CorrelationConfig::default();
        Ok(Self {
            sweep_interval: Duration::from_millis(
                config.with_default("sweep_interval_ms", 1000)?,
            ),
            max_attempts: config.with_default("max_attempts", defaults.max_attempts)?,
            max_age: Duration::from_secs(config.with_default("max_age_secs", 30)?),
            max_pending: config.with_default("max_pending", defaults.max_pending)?,
            listener_buffer: config.with_default("listener_buffer", defaults.listener_buffer)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_config() {
        let config = CorrelationConfig::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 15);
        assert_eq!(config.max_pending, 8192);
    }

    #[test]
    fn values_override_defaults() {
        let mut raw = ModuleConfig::default();
        raw.insert("sweep_interval_ms".to_string(), "250".to_string());
        raw.insert("max_attempts".to_string(), "3".to_string());
        let config = CorrelationConfig::try_from(&raw).unwrap();
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_pending, 8192);
    }

    #[test]
    fn invalid_value_is_reported_with_field() {
        let mut raw = ModuleConfig::default();
        raw.insert("max_pending".to_string(), "lots".to_string());
        let err = CorrelationConfig::try_from(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "max_pending"));
    }
}
