//! Layered configuration.
//!
//! The configuration tree is loaded from YAML files and environment variables
//! and flattened into dotted keys (`analyzer.sender.type`). Everything above
//! this module (transport resolution, worker tuning) reads those flat keys.

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::debug;

use crate::endpoint::ENDPOINTS;
use crate::transport::Direction;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SCANBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SCANBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SCANBUS_LOG";
/// Suffix of the per-endpoint transport type overrides
/// (`<ENDPOINT>_<DIRECTION>_TRANSPORT_TYPE`).
pub const TRANSPORT_TYPE_ENV_SUFFIX: &str = "TRANSPORT_TYPE";

/// Errors raised while loading or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing configuration key '{key}'")]
    Missing { key: String },

    #[error("Invalid value '{value}' for configuration key '{key}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Flattened view of the layered configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    values: BTreeMap<String, String>,
}

impl ConfigManager {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `SCANBUS_CONFIG` environment variable (if set)
    /// 4. Environment variables with `SCANBUS` prefix and `__` separator
    /// 5. `<ENDPOINT>_<DIRECTION>_TRANSPORT_TYPE` overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat, Source};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut values = BTreeMap::new();
        for (key, value) in config.collect()? {
            flatten_into(&mut values, key, value);
        }
        debug!(keys = values.len(), "Configuration loaded");

        Ok(Self { values }.with_env_overrides(std::env::vars()))
    }

    /// Build a manager from an explicit set of flat keys.
    pub fn from_map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Apply transport type overrides found in an environment snapshot.
    ///
    /// Only variables named `<ENDPOINT>_<DIRECTION>_TRANSPORT_TYPE` for a known
    /// endpoint are considered; they replace `<endpoint>.<direction>.type`.
    pub fn with_env_overrides<K, V>(mut self, env: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut targets = BTreeMap::new();
        for endpoint in ENDPOINTS {
            for direction in Direction::ALL {
                targets.insert(
                    transport_type_env_var(endpoint.env_prefix().as_str(), direction),
                    format!("{}.{}.type", endpoint.config_prefix(), direction),
                );
            }
        }

        for (name, value) in env {
            if let Some(key) = targets.get(name.as_ref()) {
                let value = value.into();
                debug!(
                    variable = name.as_ref(),
                    key = %key,
                    value = %value,
                    "Transport type overridden from environment"
                );
                self.values.insert(key.clone(), value);
            }
        }
        self
    }

    /// Look up a flat key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a flat key, failing if it is absent.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    /// Parse a flat key, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, raw),
            None => Ok(default),
        }
    }

    /// All keys below `prefix`, with the prefix stripped.
    pub fn subsection(&self, prefix: &str) -> BTreeMap<String, String> {
        extract_by_prefix(&self.values, prefix)
    }

    /// Every flattened key and value.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

/// Name of the environment variable overriding a transport type.
pub fn transport_type_env_var(endpoint_env_prefix: &str, direction: Direction) -> String {
    format!(
        "{}_{}_{}",
        endpoint_env_prefix,
        direction.as_str().to_uppercase(),
        TRANSPORT_TYPE_ENV_SUFFIX
    )
}

/// Extract all entries whose key lies below `prefix`, stripping the prefix.
///
/// `"foo"` and `"foo."` select the same entries. Only whole dotted segments
/// match, so `"foo"` never selects `"foobar.x"`. An empty prefix selects
/// everything.
pub fn extract_by_prefix(
    map: &BTreeMap<String, String>,
    prefix: &str,
) -> BTreeMap<String, String> {
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        return map.clone();
    }

    map.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect()
}

pub(crate) fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn flatten_into(out: &mut BTreeMap<String, String>, key: String, value: ::config::Value) {
    use ::config::ValueKind;

    match value.kind {
        ValueKind::Table(table) => {
            for (child, value) in table {
                flatten_into(out, format!("{}.{}", key, child), value);
            }
        }
        ValueKind::Array(items) => {
            let joined = items
                .into_iter()
                .filter_map(|item| scalar_to_string(item.kind))
                .collect::<Vec<_>>()
                .join(",");
            out.insert(key, joined);
        }
        kind => {
            if let Some(scalar) = scalar_to_string(kind) {
                out.insert(key, scalar);
            }
        }
    }
}

fn scalar_to_string(kind: ::config::ValueKind) -> Option<String> {
    use ::config::ValueKind;

    match kind {
        ValueKind::Nil | ValueKind::Table(_) | ValueKind::Array(_) => None,
        ValueKind::Boolean(b) => Some(b.to_string()),
        ValueKind::I64(n) => Some(n.to_string()),
        ValueKind::I128(n) => Some(n.to_string()),
        ValueKind::U64(n) => Some(n.to_string()),
        ValueKind::U128(n) => Some(n.to_string()),
        ValueKind::Float(n) => Some(n.to_string()),
        ValueKind::String(s) => Some(s),
    }
}
