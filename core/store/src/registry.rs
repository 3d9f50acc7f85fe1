//! Registry of the models taking part in sync.

use std::collections::HashMap;
use std::sync::Arc;

use edgesync_common::{Error, Result};

use crate::model::{ModelSpec, RecordTable, SyncModel};

/// Static set of syncable models, enumerated at startup.
///
/// Iteration always follows dependency order, with the table name as a tie
/// breaker, so parents are written before children.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<dyn SyncModel>>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of [`RecordTable`]s from model specs.
    ///
    /// # Errors
    /// - A spec is invalid
    /// - Two specs share a table name
    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(Arc::new(RecordTable::new(spec)?))?;
        }
        Ok(registry)
    }

    /// Register a model.
    ///
    /// # Preconditions
    /// - The model's table name must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&mut self, model: Arc<dyn SyncModel>) -> Result<()> {
        let name = model.table_name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "Model '{}' is already registered",
                name
            )));
        }
        self.models.push(model);
        self.models.sort_by(|a, b| {
            a.dependency_order()
                .cmp(&b.dependency_order())
                .then_with(|| a.table_name().cmp(b.table_name()))
        });
        self.by_name = self
            .models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.table_name().to_string(), i))
            .collect();
        Ok(())
    }

    /// Look up a model by table name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn SyncModel>> {
        self.by_name.get(name).map(|&i| &self.models[i])
    }

    /// Check if a model is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All models, in dependency order.
    pub fn ordered(&self) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models.iter()
    }

    /// Models a facility pushes, in dependency order.
    pub fn models_for_push(&self) -> Vec<Arc<dyn SyncModel>> {
        self.models
            .iter()
            .filter(|m| m.direction().pushes())
            .cloned()
            .collect()
    }

    /// Models a facility pulls, in dependency order.
    pub fn models_for_pull(&self) -> Vec<Arc<dyn SyncModel>> {
        self.models
            .iter()
            .filter(|m| m.direction().pulls())
            .cloned()
            .collect()
    }

    /// Table names, in dependency order.
    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.table_name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
