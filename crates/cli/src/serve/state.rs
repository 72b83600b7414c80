//! Application state shared across request handlers.

use axum::http::Method;
use stategraph_core::Engine;
use stategraph_store_sqlite::SqliteStore;

use crate::config::{ConfigError, TfstateConfig};

/// Verbs accepted on the three Terraform backend endpoints.
#[derive(Debug, Clone)]
pub(crate) struct TfstateMethods {
    pub(crate) update: Vec<Method>,
    pub(crate) lock: Vec<Method>,
    pub(crate) unlock: Vec<Method>,
}

fn parse_methods(names: &[String]) -> Result<Vec<Method>, ConfigError> {
    names
        .iter()
        .map(|n| {
            Method::from_bytes(n.as_bytes())
                .map_err(|_| ConfigError::Invalid(format!("invalid HTTP method '{n}'")))
        })
        .collect()
}

impl TfstateMethods {
    pub(crate) fn from_config(config: &TfstateConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            update: parse_methods(&config.update_methods)?,
            lock: parse_methods(&config.lock_methods)?,
            unlock: parse_methods(&config.unlock_methods)?,
        })
    }
}

pub(crate) struct AppState {
    pub(crate) engine: Engine<SqliteStore>,
    pub(crate) methods: TfstateMethods,
}
