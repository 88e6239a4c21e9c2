use super::basic_queue::BasicQueue;
use super::error::{QueueError, Result, TransactionError};
use super::resource::ResourceManager;
use super::session::QueueSession;
use super::transaction::{TransactionContext, TransactionId, TransactionState, Vote};
use super::types::{ObjectId, Payload};
use crate::persistence::{Holder, PersistenceError, QueuePersistenceStrategy};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settings applied to every lazily created queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum identifiers per queue (None = unbounded)
    pub capacity: Option<usize>,
}

/// Binds named queues, one persistence strategy and transaction contexts.
///
/// Outside a transaction every operation is its own unit of work. Inside
/// one, puts are staged in the context and takes reserve identifiers off the
/// shared queue; commit makes both durable, rollback hands reservations back.
///
/// Every `stop` starts a new generation. Contexts begun in an earlier one
/// are expired: their reservations were recovered by the restart, so they
/// can only be rolled back, which discards them.
pub struct TransactionalQueueManager {
    persistence: Arc<dyn QueuePersistenceStrategy>,
    config: QueueConfig,
    queues: RwLock<HashMap<String, Arc<BasicQueue>>>,
    started: AtomicBool,
    /// Serializes start/stop
    lifecycle: Mutex<()>,
    next_transaction: AtomicU64,
    generation: AtomicU64,
}

impl TransactionalQueueManager {
    pub fn new(persistence: Arc<dyn QueuePersistenceStrategy>, config: QueueConfig) -> Self {
        info!(
            "Initializing transactional queue manager ({} persistence)",
            persistence.name()
        );
        Self {
            persistence,
            config,
            queues: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            next_transaction: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    /// Open persistence and rebuild every queue from it.
    ///
    /// A recovery failure is fatal: persistence is closed again and the
    /// manager stays stopped.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.persistence.open()?;
        if let Err(e) = self.recover() {
            error!("Queue recovery failed: {}", e);
            if let Err(close_err) = self.persistence.close() {
                warn!("Failed to close persistence after recovery failure: {}", close_err);
            }
            self.queues.write().clear();
            return Err(QueueError::RecoveryFailed(e.to_string()));
        }

        self.started.store(true, Ordering::SeqCst);
        info!("Queue manager started");
        Ok(())
    }

    /// Close persistence and drop in-memory queues.
    ///
    /// A close failure is logged and shutdown carries on.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.persistence.close() {
            warn!("Failed to close {} persistence: {}", self.persistence.name(), e);
        }
        self.queues.write().clear();
        info!("Queue manager stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// New caller handle bound to this manager
    pub fn session(self: &Arc<Self>) -> QueueSession {
        QueueSession::new(Arc::clone(self))
    }

    pub fn persistence(&self) -> &Arc<dyn QueuePersistenceStrategy> {
        &self.persistence
    }

    /// Names of every queue created or recovered so far, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(QueueError::NotStarted)
        }
    }

    /// Look up a queue, creating it on first use
    fn queue(&self, name: &str) -> Result<Arc<BasicQueue>> {
        if name.is_empty() {
            return Err(QueueError::InvalidQueueName(name.to_string()));
        }
        if let Some(queue) = self.queues.read().get(name) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.queues.write();
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating queue: {}", name);
            Arc::new(BasicQueue::new(name, self.config.capacity))
        });
        Ok(Arc::clone(queue))
    }

    fn is_expired(&self, context: &TransactionContext) -> bool {
        context.generation() != self.generation.load(Ordering::SeqCst)
    }

    fn current(&self, context: &TransactionContext) -> Result<()> {
        if self.is_expired(context) {
            Err(TransactionError::Expired(context.id()).into())
        } else {
            Ok(())
        }
    }

    fn active<'a>(
        &self,
        context: Option<&'a mut TransactionContext>,
    ) -> Result<Option<&'a mut TransactionContext>> {
        match context {
            Some(ctx) if ctx.state() != TransactionState::Active => {
                Err(TransactionError::InvalidState {
                    expected: "Active",
                    actual: ctx.state(),
                }
                .into())
            }
            Some(ctx) => {
                self.current(ctx)?;
                Ok(Some(ctx))
            }
            None => Ok(None),
        }
    }

    /// Shared length plus what `context` staged for `queue_name`.
    ///
    /// Identifiers the context reserved are not subtracted.
    pub fn size(&self, queue_name: &str, context: Option<&TransactionContext>) -> Result<usize> {
        self.ensure_started()?;
        if let Some(ctx) = context {
            self.current(ctx)?;
        }
        let shared = self.queue(queue_name)?.size();
        let local = context.map_or(0, |ctx| ctx.local_count(queue_name));
        Ok(shared + local)
    }

    pub fn put(
        &self,
        queue_name: &str,
        payload: Payload,
        context: Option<&mut TransactionContext>,
    ) -> Result<()> {
        self.ensure_started()?;
        let queue = self.queue(queue_name)?;

        if let Some(ctx) = self.active(context)? {
            debug!("{}: staging put on {}", ctx.id(), queue_name);
            ctx.stage_put(queue_name, payload);
            return Ok(());
        }

        let id = self.persistence.store(&Holder::new(queue_name, payload))?;
        queue.put(id)?;
        debug!("put {} on {}", id, queue_name);
        Ok(())
    }

    /// Like `put`, giving up after `timeout` while a bounded queue is full.
    ///
    /// Staged puts always succeed; capacity applies when they are committed.
    pub fn offer(
        &self,
        queue_name: &str,
        payload: Payload,
        timeout: Duration,
        context: Option<&mut TransactionContext>,
    ) -> Result<bool> {
        self.ensure_started()?;
        let queue = self.queue(queue_name)?;

        if let Some(ctx) = self.active(context)? {
            ctx.stage_put(queue_name, payload);
            return Ok(true);
        }

        let id = self.persistence.store(&Holder::new(queue_name, payload))?;
        if queue.offer(id, timeout)? {
            return Ok(true);
        }
        debug!("offer on full queue {} timed out, removing {}", queue_name, id);
        self.persistence.remove(id)?;
        Ok(false)
    }

    pub fn take(
        &self,
        queue_name: &str,
        context: Option<&mut TransactionContext>,
    ) -> Result<Option<Payload>> {
        self.take_with(queue_name, context, BasicQueue::take)
    }

    /// Take, waiting up to `timeout` for an identifier to arrive
    pub fn poll(
        &self,
        queue_name: &str,
        timeout: Duration,
        context: Option<&mut TransactionContext>,
    ) -> Result<Option<Payload>> {
        self.take_with(queue_name, context, |queue| queue.poll(timeout))
    }

    fn take_with<F>(
        &self,
        queue_name: &str,
        context: Option<&mut TransactionContext>,
        dequeue: F,
    ) -> Result<Option<Payload>>
    where
        F: FnOnce(&BasicQueue) -> Option<ObjectId>,
    {
        self.ensure_started()?;
        let queue = self.queue(queue_name)?;
        let context = self.active(context)?;

        if let Some(ctx) = context {
            if let Some(payload) = ctx.take_local(queue_name) {
                debug!("{}: took staged payload from {}", ctx.id(), queue_name);
                return Ok(Some(payload));
            }
            let Some((id, holder)) = self.claim(&queue, dequeue)? else {
                return Ok(None);
            };
            ctx.record_removal(queue_name, id);
            debug!("{}: reserved {} from {}", ctx.id(), id, queue_name);
            return Ok(Some(holder.payload));
        }

        let Some((id, holder)) = self.claim(&queue, dequeue)? else {
            return Ok(None);
        };
        if let Err(e) = self.persistence.remove(id) {
            queue.put_front(id)?;
            return Err(e.into());
        }
        debug!("took {} from {}", id, queue_name);
        Ok(Some(holder.payload))
    }

    /// Dequeue and load the next identifier.
    ///
    /// An identifier with no stored record is dropped and the next one is
    /// tried without waiting. On any other load failure the identifier goes
    /// back to the head.
    fn claim<F>(&self, queue: &BasicQueue, dequeue: F) -> Result<Option<(ObjectId, Holder)>>
    where
        F: FnOnce(&BasicQueue) -> Option<ObjectId>,
    {
        let mut next = dequeue(queue);
        while let Some(id) = next {
            match self.persistence.load(id) {
                Ok(holder) => return Ok(Some((id, holder))),
                Err(PersistenceError::NotFound(_)) => {
                    warn!("Dropping {} from {}: no stored record", id, queue.name());
                    next = queue.take();
                }
                Err(e) => {
                    warn!("Failed to load {} from {}: {}", id, queue.name(), e);
                    queue.put_front(id)?;
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    /// Payload at the head without removing it; staged puts come first
    pub fn peek(
        &self,
        queue_name: &str,
        context: Option<&TransactionContext>,
    ) -> Result<Option<Payload>> {
        self.ensure_started()?;
        let queue = self.queue(queue_name)?;
        if let Some(ctx) = context {
            self.current(ctx)?;
        }

        if let Some(payload) = context.and_then(|ctx| ctx.peek_local(queue_name)) {
            return Ok(Some(payload.clone()));
        }
        match queue.peek() {
            Some(id) => Ok(Some(self.persistence.load(id)?.payload)),
            None => Ok(None),
        }
    }

    /// Put a payload back at the head of a queue
    pub fn untake(
        &self,
        queue_name: &str,
        payload: Payload,
        context: Option<&mut TransactionContext>,
    ) -> Result<()> {
        self.ensure_started()?;
        let queue = self.queue(queue_name)?;

        if let Some(ctx) = self.active(context)? {
            ctx.stage_untake(queue_name, payload);
            return Ok(());
        }

        let id = self.persistence.store(&Holder::new(queue_name, payload))?;
        queue.put_front(id)?;
        debug!("untake {} onto {}", id, queue_name);
        Ok(())
    }

    /// Store staged payloads in order, draining each as it lands
    fn apply_staged(
        &self,
        staged: &mut HashMap<String, VecDeque<Payload>>,
        at_head: bool,
    ) -> Result<usize> {
        let mut names: Vec<String> = staged.keys().cloned().collect();
        names.sort();

        let mut applied = 0;
        for name in names {
            let queue = self.queue(&name)?;
            let Some(pending) = staged.get_mut(&name) else {
                continue;
            };
            while let Some(payload) = pending.pop_front() {
                let holder = Holder::new(name.as_str(), payload);
                let id = match self.persistence.store(&holder) {
                    Ok(id) => id,
                    Err(e) => {
                        pending.push_front(holder.payload);
                        return Err(e.into());
                    }
                };
                if at_head {
                    queue.put_front(id)?;
                } else {
                    queue.put(id)?;
                }
                applied += 1;
            }
        }
        Ok(applied)
    }
}

impl ResourceManager for TransactionalQueueManager {
    fn create_transaction_context(&self) -> TransactionContext {
        let id = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        TransactionContext::new(TransactionId(id))
    }

    fn do_begin(&self, context: &mut TransactionContext) -> Result<()> {
        self.ensure_started()?;
        context.set_generation(self.generation.load(Ordering::SeqCst));
        debug!("{}: begin", context.id());
        Ok(())
    }

    fn check_context(&self, context: &TransactionContext) -> Result<()> {
        self.current(context)
    }

    fn do_prepare(&self, context: &mut TransactionContext) -> Result<Vote> {
        self.ensure_started()?;
        let vote = if context.is_read_only() {
            Vote::ReadOnly
        } else {
            Vote::Commit
        };
        debug!("{}: prepared, vote {:?}", context.id(), vote);
        Ok(vote)
    }

    fn do_commit(&self, context: &mut TransactionContext) -> Result<()> {
        self.ensure_started()?;
        let id = context.id();

        let added = self.apply_staged(context.added_mut(), false)?;
        let untaken = self.apply_staged(context.untaken_mut(), true)?;

        let mut removed = 0;
        for (queue_name, ids) in context.removed_mut().iter_mut() {
            while let Some(object_id) = ids.front().copied() {
                if let Err(e) = self.persistence.remove(object_id) {
                    warn!("{}: failed to remove {} from {}: {}", id, object_id, queue_name, e);
                    return Err(e.into());
                }
                ids.pop_front();
                removed += 1;
            }
        }

        context.clear();
        debug!(
            "{}: committed {} puts, {} untakes, {} removals",
            id, added, untaken, removed
        );
        Ok(())
    }

    fn do_rollback(&self, context: &mut TransactionContext) -> Result<()> {
        let id = context.id();
        if self.is_expired(context) {
            // the restart already recovered every reservation
            context.clear();
            info!("{}: expired by a restart, staged work discarded", id);
            return Ok(());
        }

        let mut returned = 0;

        for (queue_name, ids) in context.removed_mut().iter_mut() {
            let queue = self.queue(queue_name)?;
            // reverse so the oldest reservation ends up at the head
            while let Some(object_id) = ids.pop_back() {
                queue.put_front(object_id)?;
                returned += 1;
            }
        }

        context.clear();
        debug!("{}: rolled back, {} identifiers returned", id, returned);
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        self.queues.write().clear();

        let ids = self.persistence.restore()?;
        let mut per_queue: HashMap<String, usize> = HashMap::new();
        for id in &ids {
            let holder = self.persistence.load(*id)?;
            self.queue(&holder.queue)?.restore(*id)?;
            *per_queue.entry(holder.queue).or_default() += 1;
        }

        for (name, count) in &per_queue {
            debug!("Recovered {} items into queue {}", count, name);
        }
        info!(
            "Recovered {} items across {} queues",
            ids.len(),
            per_queue.len()
        );
        Ok(())
    }
}

impl Drop for TransactionalQueueManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop queue manager on drop: {}", e);
        }
    }
}
