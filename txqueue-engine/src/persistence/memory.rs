use super::strategy::QueuePersistenceStrategy;
use super::types::{Holder, PersistenceError, Result};
use crate::core::types::{IdGenerator, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Map-backed strategy with no durability. `restore` always returns nothing.
pub struct MemoryPersistenceStrategy {
    ids: Arc<dyn IdGenerator>,
    objects: Mutex<HashMap<ObjectId, Holder>>,
}

impl MemoryPersistenceStrategy {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl QueuePersistenceStrategy for MemoryPersistenceStrategy {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn store(&self, holder: &Holder) -> Result<ObjectId> {
        let id = self.ids.next_id();
        self.objects.lock().insert(id, holder.clone());
        debug!("memory store {} -> {}", holder.queue, id);
        Ok(id)
    }

    fn load(&self, id: ObjectId) -> Result<Holder> {
        self.objects
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::NotFound(id))
    }

    fn remove(&self, id: ObjectId) -> Result<()> {
        self.objects
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(PersistenceError::NotFound(id))
    }

    fn restore(&self) -> Result<Vec<ObjectId>> {
        Ok(Vec::new())
    }

    fn close(&self) -> Result<()> {
        self.objects.lock().clear();
        Ok(())
    }
}
