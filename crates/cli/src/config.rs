//! TOML configuration for `stategraph serve`.
//!
//! Every field has a default, so the file itself is optional. Lookup order
//! for the file: `--config`, then `STATEGRAPH_CONFIG`, then none.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stategraph_core::LabelPolicy;
use stategraph_store_sqlite::SqliteStoreConfig;

pub const CONFIG_ENV: &str = "STATEGRAPH_CONFIG";

/// Database path that selects a private in-memory store.
pub const IN_MEMORY_DB: &str = ":memory:";

const UPDATE_METHODS: &[&str] = &["POST", "PUT", "PATCH"];
const LOCK_METHODS: &[&str] = &["LOCK", "PUT", "POST"];
const UNLOCK_METHODS: &[&str] = &["UNLOCK", "PUT", "DELETE", "POST"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub tfstate: TfstateConfig,
    pub edges: EdgesConfig,
    pub labels: LabelPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Public URL rendered into backend addresses. Derived from `port`
    /// when unset.
    pub base_url: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            base_url: None,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stategraph.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_DB
    }

    pub fn store_config(&self) -> SqliteStoreConfig {
        SqliteStoreConfig {
            path: self.path.clone(),
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }
}

/// HTTP verbs accepted for each Terraform backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TfstateConfig {
    pub update_methods: Vec<String>,
    pub lock_methods: Vec<String>,
    pub unlock_methods: Vec<String>,
}

impl Default for TfstateConfig {
    fn default() -> Self {
        Self {
            update_methods: vec!["POST".to_string()],
            lock_methods: vec!["LOCK".to_string()],
            unlock_methods: vec!["UNLOCK".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EdgesConfig {
    pub update_timeout_secs: u64,
}

impl Default for EdgesConfig {
    fn default() -> Self {
        Self {
            update_timeout_secs: 30,
        }
    }
}

impl EdgesConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

impl Config {
    /// Load from `path`, falling back to `STATEGRAPH_CONFIG`, then to
    /// defaults. The result is normalized and validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Uppercase and trim method names, dropping repeats but keeping the
    /// first-seen order.
    pub fn normalize(&mut self) {
        for list in [
            &mut self.tfstate.update_methods,
            &mut self.tfstate.lock_methods,
            &mut self.tfstate.unlock_methods,
        ] {
            for m in list.iter_mut() {
                *m = m.trim().to_ascii_uppercase();
            }
            let mut seen = BTreeSet::new();
            list.retain(|m| seen.insert(m.clone()));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_methods("update_methods", &self.tfstate.update_methods, UPDATE_METHODS)?;
        check_methods("lock_methods", &self.tfstate.lock_methods, LOCK_METHODS)?;
        check_methods("unlock_methods", &self.tfstate.unlock_methods, UNLOCK_METHODS)?;

        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind must not be empty".into()));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body_bytes must be greater than zero".into(),
            ));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        if self.edges.update_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "edges.update_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn check_methods(field: &str, methods: &[String], allowed: &[&str]) -> Result<(), ConfigError> {
    if methods.is_empty() {
        return Err(ConfigError::Invalid(format!("tfstate.{field} must not be empty")));
    }
    for m in methods {
        if !allowed.contains(&m.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "tfstate.{field}: {m} is not one of {}",
                allowed.join(", ")
            )));
        }
    }
    Ok(())
}
