//! Resource-manager contract.
//!
//! Implementors supply the `do_*` hooks; the provided methods drive the
//! transaction state machine around them:
//!
//! ```text
//! Created -> Active -> Preparing -> Prepared -> Committing -> Committed
//!               |                      |
//!               +-------------+--------+--> RollingBack -> RolledBack
//! ```
//!
//! Commit is also accepted straight from `Active` (one-phase). A commit that
//! fails leaves the context in `Committing`; rolling it back is allowed and
//! undoes whatever was not yet applied. Prepare and commit first ask
//! `check_context`, so a context the manager no longer honours never leaves
//! its current state.

use super::error::{Result, TransactionError};
use super::transaction::{TransactionContext, TransactionState, Vote};

pub trait ResourceManager {
    fn create_transaction_context(&self) -> TransactionContext;

    fn do_begin(&self, context: &mut TransactionContext) -> Result<()>;

    fn do_prepare(&self, context: &mut TransactionContext) -> Result<Vote>;

    fn do_commit(&self, context: &mut TransactionContext) -> Result<()>;

    fn do_rollback(&self, context: &mut TransactionContext) -> Result<()>;

    /// Rebuild in-memory state from durable storage; called once per start
    fn recover(&self) -> Result<()>;

    /// Reject a context this manager can no longer act on
    fn check_context(&self, _context: &TransactionContext) -> Result<()> {
        Ok(())
    }

    fn begin_transaction(&self, context: &mut TransactionContext) -> Result<()> {
        expect_state(context, "Created", &[TransactionState::Created])?;
        self.do_begin(context)?;
        context.set_state(TransactionState::Active);
        Ok(())
    }

    fn prepare_transaction(&self, context: &mut TransactionContext) -> Result<Vote> {
        expect_state(context, "Active", &[TransactionState::Active])?;
        self.check_context(context)?;
        context.set_state(TransactionState::Preparing);
        match self.do_prepare(context) {
            Ok(vote) => {
                context.set_state(TransactionState::Prepared);
                Ok(vote)
            }
            Err(e) => {
                context.set_state(TransactionState::Active);
                Err(e)
            }
        }
    }

    fn commit_transaction(&self, context: &mut TransactionContext) -> Result<()> {
        expect_state(
            context,
            "Active or Prepared",
            &[TransactionState::Active, TransactionState::Prepared],
        )?;
        self.check_context(context)?;
        context.set_state(TransactionState::Committing);
        if context.is_read_only() {
            context.set_state(TransactionState::Committed);
            return Ok(());
        }
        self.do_commit(context)
            .map_err(|e| TransactionError::CommitFailed(Box::new(e)))?;
        context.set_state(TransactionState::Committed);
        Ok(())
    }

    fn rollback_transaction(&self, context: &mut TransactionContext) -> Result<()> {
        expect_state(
            context,
            "Active, Prepared or Committing",
            &[
                TransactionState::Active,
                TransactionState::Prepared,
                TransactionState::Committing,
            ],
        )?;
        context.set_state(TransactionState::RollingBack);
        self.do_rollback(context)?;
        context.set_state(TransactionState::RolledBack);
        Ok(())
    }
}

fn expect_state(
    context: &TransactionContext,
    expected: &'static str,
    allowed: &[TransactionState],
) -> Result<()> {
    if allowed.contains(&context.state()) {
        Ok(())
    } else {
        Err(TransactionError::InvalidState {
            expected,
            actual: context.state(),
        }
        .into())
    }
}
