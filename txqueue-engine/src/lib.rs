pub mod config;
pub mod core;
pub mod persistence;

// Re-export commonly used types
pub use config::{EngineConfig, LoggingConfig};
pub use core::{
    BasicQueue, IdGenerator, ObjectId, Payload, Queue, QueueConfig, QueueError, QueueSession,
    ResourceManager, SequentialIdGenerator, TransactionContext, TransactionError, TransactionId,
    TransactionState, TransactionalQueueManager, UuidGenerator, Vote,
};
pub use persistence::{
    Backend, FilePersistenceStrategy, FsyncMode, Holder, JournalPersistenceStrategy,
    LogPersistenceStrategy, MemoryPersistenceStrategy, PersistenceConfig, PersistenceError,
    QueuePersistenceStrategy,
};
