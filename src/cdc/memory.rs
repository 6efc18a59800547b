//! In-process hash store. The source set is supplied directly instead of by
//! a query.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use uuid::Uuid;

use super::HashStore;
use crate::error::Result;
use crate::model::cdc::{Change, ChangeKind};

#[derive(Default)]
pub struct MemoryHashStore {
    source: Mutex<BTreeMap<String, String>>,
    recorded: Mutex<HashMap<Uuid, BTreeMap<String, String>>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired state with `(object_id, hash)` pairs.
    pub fn set_source<I, K, V>(&self, rows: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        *self.source.lock() = rows
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
    }

    /// Record a hash as if a previous run had applied it.
    pub fn seed(&self, controller_id: Uuid, object_id: &str, hash: &str) {
        self.recorded
            .lock()
            .entry(controller_id)
            .or_default()
            .insert(object_id.to_string(), hash.to_string());
    }

    /// Hashes recorded for a controller.
    pub fn recorded(&self, controller_id: Uuid) -> BTreeMap<String, String> {
        self.recorded
            .lock()
            .get(&controller_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn diff(&self, controller_id: Uuid, limit: usize) -> Result<Vec<Change>> {
        let source = self.source.lock().clone();
        let recorded = self.recorded(controller_id);

        let change = |object_id: &str, hash: &str, kind| Change {
            controller_id,
            object_id: object_id.to_string(),
            hash: hash.to_string(),
            kind,
        };

        let mut changes: Vec<Change> = source
            .iter()
            .filter_map(|(id, hash)| match recorded.get(id) {
                None => Some(change(id, hash, ChangeKind::Create)),
                Some(old) if old != hash => Some(change(id, hash, ChangeKind::Update)),
                Some(_) => None,
            })
            .chain(
                recorded
                    .iter()
                    .filter(|(id, _)| !source.contains_key(*id))
                    .map(|(id, hash)| change(id, hash, ChangeKind::Delete)),
            )
            .collect();

        // Random pick so a capped batch cannot starve any one object.
        changes.shuffle(&mut rand::rng());
        changes.truncate(limit);
        Ok(changes)
    }

    async fn upsert(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()> {
        self.seed(controller_id, object_id, hash);
        Ok(())
    }

    async fn remove(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()> {
        let mut recorded = self.recorded.lock();
        if let Some(objects) = recorded.get_mut(&controller_id) {
            if objects.get(object_id).is_some_and(|h| h == hash) {
                objects.remove(object_id);
            }
        }
        Ok(())
    }
}
