//! Per-caller handle over a [`TransactionalQueueManager`].

use super::error::{Result, TransactionError};
use super::manager::TransactionalQueueManager;
use super::resource::ResourceManager;
use super::transaction::{TransactionContext, TransactionId, TransactionState, Vote};
use super::types::Payload;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Holds at most one transaction context at a time. Queues obtained from the
/// session run inside that transaction while it is open.
pub struct QueueSession {
    manager: Arc<TransactionalQueueManager>,
    context: Mutex<Option<TransactionContext>>,
}

impl QueueSession {
    pub fn new(manager: Arc<TransactionalQueueManager>) -> Self {
        Self {
            manager,
            context: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<TransactionalQueueManager> {
        &self.manager
    }

    pub fn begin(&self) -> Result<TransactionId> {
        let mut slot = self.context.lock();
        if slot.is_some() {
            return Err(TransactionError::AlreadyActive.into());
        }

        let mut ctx = self.manager.create_transaction_context();
        self.manager.begin_transaction(&mut ctx)?;
        let id = ctx.id();
        *slot = Some(ctx);
        Ok(id)
    }

    pub fn prepare(&self) -> Result<Vote> {
        let mut slot = self.context.lock();
        let ctx = slot.as_mut().ok_or(TransactionError::NoTransaction)?;
        self.manager.prepare_transaction(ctx)
    }

    /// Commit the open transaction.
    ///
    /// On failure the context stays with the session in `Committing`,
    /// holding only the work that was not applied; `rollback` releases it.
    pub fn commit(&self) -> Result<()> {
        let mut slot = self.context.lock();
        let mut ctx = slot.take().ok_or(TransactionError::NoTransaction)?;
        match self.manager.commit_transaction(&mut ctx) {
            Ok(()) => {
                debug!("{} committed", ctx.id());
                Ok(())
            }
            Err(e) => {
                *slot = Some(ctx);
                Err(e)
            }
        }
    }

    pub fn rollback(&self) -> Result<()> {
        let mut slot = self.context.lock();
        let mut ctx = slot.take().ok_or(TransactionError::NoTransaction)?;
        match self.manager.rollback_transaction(&mut ctx) {
            Ok(()) => {
                debug!("{} rolled back", ctx.id());
                Ok(())
            }
            Err(e) => {
                *slot = Some(ctx);
                Err(e)
            }
        }
    }

    pub fn is_transacted(&self) -> bool {
        self.context.lock().is_some()
    }

    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.context.lock().as_ref().map(TransactionContext::state)
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue<'_> {
        Queue {
            session: self,
            name: name.into(),
        }
    }
}

/// Named queue seen through a session
pub struct Queue<'a> {
    session: &'a QueueSession,
    name: String,
}

impl Queue<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, payload: impl Into<Payload>) -> Result<()> {
        let mut ctx = self.session.context.lock();
        self.session
            .manager
            .put(&self.name, payload.into(), ctx.as_mut())
    }

    /// Returns false if a bounded queue stayed full for `timeout`
    pub fn offer(&self, payload: impl Into<Payload>, timeout: Duration) -> Result<bool> {
        let mut ctx = self.session.context.lock();
        self.session
            .manager
            .offer(&self.name, payload.into(), timeout, ctx.as_mut())
    }

    pub fn take(&self) -> Result<Option<Payload>> {
        let mut ctx = self.session.context.lock();
        self.session.manager.take(&self.name, ctx.as_mut())
    }

    pub fn poll(&self, timeout: Duration) -> Result<Option<Payload>> {
        let mut ctx = self.session.context.lock();
        self.session.manager.poll(&self.name, timeout, ctx.as_mut())
    }

    pub fn peek(&self) -> Result<Option<Payload>> {
        let ctx = self.session.context.lock();
        self.session.manager.peek(&self.name, ctx.as_ref())
    }

    /// Hand a payload back to the head of the queue
    pub fn untake(&self, payload: impl Into<Payload>) -> Result<()> {
        let mut ctx = self.session.context.lock();
        self.session
            .manager
            .untake(&self.name, payload.into(), ctx.as_mut())
    }

    pub fn size(&self) -> Result<usize> {
        let ctx = self.session.context.lock();
        self.session.manager.size(&self.name, ctx.as_ref())
    }
}
