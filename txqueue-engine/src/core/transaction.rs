//! Per-transaction staging of added and reserved identifiers.
//!
//! A context stages payloads put inside a transaction (`added`), identifiers
//! taken off the shared queues (`removed`), and payloads handed back to the
//! head of a queue (`untaken`). Commit drains each map as it is applied, so a
//! context that failed mid-commit only holds the work that never reached
//! the persistence strategy.

use super::types::{ObjectId, Payload};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Transaction identifier, unique within one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Outcome of the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Nothing was staged; commit is a no-op
    ReadOnly,
    /// Staged work is ready to be applied
    Commit,
}

#[derive(Debug)]
pub struct TransactionContext {
    id: TransactionId,
    state: TransactionState,
    /// Manager generation the transaction began in
    generation: u64,
    read_only: bool,
    added: HashMap<String, VecDeque<Payload>>,
    untaken: HashMap<String, VecDeque<Payload>>,
    removed: HashMap<String, VecDeque<ObjectId>>,
    started_at: Instant,
}

impl TransactionContext {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Created,
            generation: 0,
            read_only: true,
            added: HashMap::new(),
            untaken: HashMap::new(),
            removed: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        debug!("{}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// True until the first mutating put/take/untake
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub(crate) fn stage_put(&mut self, queue: &str, payload: Payload) {
        self.read_only = false;
        self.added
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
    }

    pub(crate) fn stage_untake(&mut self, queue: &str, payload: Payload) {
        self.read_only = false;
        self.untaken
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Pop the next payload this transaction staged for `queue`.
    ///
    /// Untaken payloads sit ahead of the shared queue, the latest first, so
    /// they are served before anything else. Staged puts follow in FIFO order.
    pub(crate) fn take_local(&mut self, queue: &str) -> Option<Payload> {
        let payload = self
            .untaken
            .get_mut(queue)
            .and_then(VecDeque::pop_back)
            .or_else(|| self.added.get_mut(queue)?.pop_front());
        if payload.is_some() {
            self.read_only = false;
        }
        payload
    }

    pub(crate) fn peek_local(&self, queue: &str) -> Option<&Payload> {
        self.untaken
            .get(queue)
            .and_then(VecDeque::back)
            .or_else(|| self.added.get(queue)?.front())
    }

    pub(crate) fn record_removal(&mut self, queue: &str, id: ObjectId) {
        self.read_only = false;
        self.removed
            .entry(queue.to_string())
            .or_default()
            .push_back(id);
    }

    /// Payloads staged for `queue` that a size query counts
    pub fn local_count(&self, queue: &str) -> usize {
        let added = self.added.get(queue).map_or(0, VecDeque::len);
        let untaken = self.untaken.get(queue).map_or(0, VecDeque::len);
        added + untaken
    }

    pub fn reserved(&self, queue: &str) -> Vec<ObjectId> {
        self.removed
            .get(queue)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn added_mut(&mut self) -> &mut HashMap<String, VecDeque<Payload>> {
        &mut self.added
    }

    pub(crate) fn untaken_mut(&mut self) -> &mut HashMap<String, VecDeque<Payload>> {
        &mut self.untaken
    }

    pub(crate) fn removed_mut(&mut self) -> &mut HashMap<String, VecDeque<ObjectId>> {
        &mut self.removed
    }

    /// True when nothing is left to apply or undo
    pub fn is_drained(&self) -> bool {
        self.added.values().all(VecDeque::is_empty)
            && self.untaken.values().all(VecDeque::is_empty)
            && self.removed.values().all(VecDeque::is_empty)
    }

    pub(crate) fn clear(&mut self) {
        self.added.clear();
        self.untaken.clear();
        self.removed.clear();
    }
}
