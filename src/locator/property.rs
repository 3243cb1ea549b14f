//! Location/metadata property stores.

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Named string properties grouped by scope.
pub trait PropertyStore: Send + Sync {
    fn put_property(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    fn get_property(&self, scope: &str, key: &str) -> Result<Option<String>>;
}

/// Process-local property store.
#[derive(Default)]
pub struct MemoryPropertyStore {
    properties: RwLock<HashMap<(String, String), String>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.properties.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.read().is_empty()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn put_property(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.properties
            .write()
            .insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn get_property(&self, scope: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .properties
            .read()
            .get(&(scope.to_string(), key.to_string()))
            .cloned())
    }
}
