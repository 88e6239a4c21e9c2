/// Persistence strategies for queued payloads
///
/// Every strategy stores holders under fresh identifiers and can restore
/// the surviving identifiers in store order after a restart:
/// - Memory: nothing survives a restart
/// - File: one file per record
/// - Journal: single append-only journal, compacted in the background
/// - Log: segmented write-ahead log with a persisted low-water mark

pub mod codec;
pub mod file;
mod frame_file;
pub mod journal;
pub mod log;
pub mod marks;
pub mod memory;
pub mod strategy;
pub mod types;

pub use types::{Backend, FsyncMode, Holder, PersistenceConfig, PersistenceError, Result};
pub use codec::{Lsn, Record, RecordType};
pub use file::FilePersistenceStrategy;
pub use journal::{JournalConfig, JournalPersistenceStrategy};
pub use log::{LogConfig, LogPersistenceStrategy};
pub use memory::MemoryPersistenceStrategy;
pub use strategy::QueuePersistenceStrategy;

#[cfg(test)]
mod tests;
