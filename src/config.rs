use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::DashboardOptions;
use crate::model::{Ms, MS_PER_HOUR};

/// Which defaults apply when a variable is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Dev,
    Prod,
}

/// Server settings, read from `RESALLOC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub profile: Profile,
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub utilization_window_days: u32,
    pub recent_limit: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    UnknownProfile(String),
    /// Production never falls back to a local data directory.
    MissingDataDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::UnknownProfile(p) => write!(f, "unknown RESALLOC_ENV {p:?} (expected dev or prod)"),
            ConfigError::MissingDataDir => write!(f, "RESALLOC_DATA_DIR must be set when RESALLOC_ENV=prod"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let profile = match lookup("RESALLOC_ENV").as_deref().map(str::trim) {
            None | Some("") | Some("dev") | Some("development") => Profile::Dev,
            Some("prod") | Some("production") => Profile::Prod,
            Some(other) => return Err(ConfigError::UnknownProfile(other.to_string())),
        };

        let data_dir = match (lookup("RESALLOC_DATA_DIR"), profile) {
            (Some(dir), _) if !dir.trim().is_empty() => PathBuf::from(dir),
            (_, Profile::Prod) => return Err(ConfigError::MissingDataDir),
            (_, Profile::Dev) => PathBuf::from("./data"),
        };

        let metrics_port = match lookup("RESALLOC_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "RESALLOC_METRICS_PORT",
                value,
            })?),
        };

        let config = Self {
            profile,
            bind: lookup("RESALLOC_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&lookup, "RESALLOC_PORT", 5433)?,
            data_dir,
            max_connections: parse_var(&lookup, "RESALLOC_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_var(&lookup, "RESALLOC_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            utilization_window_days: parse_var(&lookup, "RESALLOC_UTILIZATION_WINDOW_DAYS", 30)?,
            recent_limit: parse_var(&lookup, "RESALLOC_RECENT_LIMIT", 5)?,
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "RESALLOC_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }
        if config.recent_limit > crate::limits::MAX_RECENT_ALLOCATIONS {
            return Err(ConfigError::Invalid {
                var: "RESALLOC_RECENT_LIMIT",
                value: config.recent_limit.to_string(),
            });
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("resalloc.wal")
    }

    pub fn dashboard_options(&self) -> DashboardOptions {
        DashboardOptions {
            window_ms: self.utilization_window_days as Ms * 24 * MS_PER_HOUR,
            recent_limit: self.recent_limit,
        }
    }
}
