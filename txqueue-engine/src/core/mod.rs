pub mod basic_queue;
pub mod error;
pub mod manager;
pub mod resource;
pub mod session;
pub mod transaction;
pub mod types;

pub use basic_queue::BasicQueue;
pub use error::{QueueError, Result, TransactionError};
pub use manager::{QueueConfig, TransactionalQueueManager};
pub use resource::ResourceManager;
pub use session::{Queue, QueueSession};
pub use transaction::{TransactionContext, TransactionId, TransactionState, Vote};
pub use types::{IdGenerator, ObjectId, Payload, SequentialIdGenerator, UuidGenerator};
