//! CDC controller definitions loaded from TOML.
//!
//! One file per controller:
//!
//! ```toml
//! [controller]
//! id = "5f0c6f1e-3c55-4a7e-9a55-2f3b8f0f6d11"
//! source_query = "SELECT id::text AS object_id, md5(row(name, email)::text) AS hash FROM customers"
//! period_secs = 30
//! task_prefix = "customer"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use super::DEFAULT_BATCH_SIZE;
use crate::error::{Error, Result};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ControllerFile {
    controller: ControllerConfig,
}

/// One controller: what to watch, how often, and where its tasks go.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub id: Uuid,
    /// Query returning `object_id` and `hash` columns.
    pub source_query: String,
    pub period_secs: u64,
    /// Prefix for the task names produced by this controller.
    pub task_prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl ControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Loaded controllers, indexed by id.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<Uuid, ControllerConfig>,
}

impl ControllerRegistry {
    /// Load every `.toml` file in a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut controllers = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read controller dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "toml") {
                continue;
            }

            let content = std::fs::read_to_string(&path)?;
            let file: ControllerFile = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("bad controller config {}: {e}", path.display()))
            })?;
            let config = file.controller;

            if config.period_secs == 0 {
                return Err(Error::Config(format!(
                    "controller {} in {} has a zero period",
                    config.id,
                    path.display()
                )));
            }
            if controllers.insert(config.id, config.clone()).is_some() {
                return Err(Error::Config(format!(
                    "duplicate controller id {} in {}",
                    config.id,
                    path.display()
                )));
            }
        }

        Ok(Self { controllers })
    }

    pub fn get(&self, id: &Uuid) -> Option<&ControllerConfig> {
        self.controllers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControllerConfig> {
        self.controllers.values()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}
