use super::file::FilePersistenceStrategy;
use super::journal::{JournalConfig, JournalPersistenceStrategy};
use super::log::{LogConfig, LogPersistenceStrategy};
use super::memory::MemoryPersistenceStrategy;
use super::types::{Backend, Holder, PersistenceConfig, Result};
use crate::core::types::{IdGenerator, ObjectId};
use std::sync::Arc;
use std::time::Duration;

/// Durable `ObjectId -> Holder` store behind a transactional queue manager.
///
/// Implementations use interior mutability and are shared across threads.
pub trait QueuePersistenceStrategy: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Acquire files and start background work. Called before `restore`.
    fn open(&self) -> Result<()>;

    /// Durably persist a holder under a fresh identifier
    fn store(&self, holder: &Holder) -> Result<ObjectId>;

    fn load(&self, id: ObjectId) -> Result<Holder>;

    /// Durably delete. Removing an unknown identifier is an error.
    fn remove(&self, id: ObjectId) -> Result<()>;

    /// Every identifier whose store is durable and whose remove is not,
    /// in original store order. Rebuilds the in-memory index from scratch,
    /// so repeated calls against an unchanged store agree.
    fn restore(&self) -> Result<Vec<ObjectId>>;

    /// Flush and release resources. The strategy may be reopened.
    fn close(&self) -> Result<()>;
}

impl PersistenceConfig {
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            dir: self.path.clone(),
            fsync_mode: self.fsync_mode,
            fsync_interval: Duration::from_millis(self.fsync_interval_ms),
            buffer_size: self.buffer_size_kb * 1024,
            compaction_interval: Duration::from_millis(self.compaction_interval_ms),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            dir: self.path.clone(),
            fsync_mode: self.fsync_mode,
            fsync_interval: Duration::from_millis(self.fsync_interval_ms),
            buffer_size: self.buffer_size_kb * 1024,
            segment_size: self.segment_size_kb * 1024,
            compaction_interval: Duration::from_millis(self.compaction_interval_ms),
        }
    }

    /// Construct the configured backend. Nothing is opened yet.
    pub fn build_strategy(&self, ids: Arc<dyn IdGenerator>) -> Arc<dyn QueuePersistenceStrategy> {
        match self.backend {
            Backend::Memory => Arc::new(MemoryPersistenceStrategy::new(ids)),
            Backend::File => Arc::new(FilePersistenceStrategy::new(
                &self.path,
                &self.file_extension,
                self.fsync_mode == super::types::FsyncMode::Always,
                ids,
            )),
            Backend::Journal => Arc::new(JournalPersistenceStrategy::new(self.journal_config(), ids)),
            Backend::Log => Arc::new(LogPersistenceStrategy::new(self.log_config(), ids)),
        }
    }
}
