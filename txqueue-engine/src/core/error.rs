use super::transaction::{TransactionId, TransactionState};
use crate::persistence::PersistenceError;
use thiserror::Error;

/// Main error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid (nil) object identifier")]
    InvalidId,

    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("Queue manager is not started")]
    NotStarted,

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),
}

/// Transaction lifecycle errors
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No transaction in progress")]
    NoTransaction,

    #[error("A transaction is already in progress")]
    AlreadyActive,

    #[error("Invalid transaction state: expected {expected}, found {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: TransactionState,
    },

    #[error("Transaction {0} was opened before the queue manager restarted")]
    Expired(TransactionId),

    #[error("Commit failed: {0}")]
    CommitFailed(#[source] Box<QueueError>),
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
