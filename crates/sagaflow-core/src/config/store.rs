use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Run store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// One JSON document per run in a directory.
    File,
    /// A PostgreSQL table (requires the `postgres` feature of the runtime).
    Postgres,
}

/// Run store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Connection URL for the postgres backend.
    #[serde(default)]
    pub url: Option<String>,

    /// Connection pool size for the postgres backend.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            url: None,
            pool_size: default_pool_size(),
        }
    }
}

fn default_pool_size() -> u32 {
    5
}
