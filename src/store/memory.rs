use super::StoreBackend;
use crate::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory backend for tests and ephemeral devices.
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        self.lock()?.clear();
        Ok(())
    }
}
