//! Position bookkeeping for the log-structured backends.
//!
//! Every STORE frame is a *pending* mark until the matching DELETE is
//! appended; both frames then become *unused*. The low-water mark is the
//! smallest pending lsn, or the next lsn to be written when nothing is
//! pending. Every frame below it is unreachable for replay and may be
//! discarded.
//!
//! The background [`Compactor`] ticks on a crossbeam channel and asks its
//! [`Retention`] target to advance to the current low-water mark.

use super::codec::{Lsn, Record};
use super::types::{Holder, PersistenceError, Result};
use crate::core::types::ObjectId;
use crossbeam::channel::{self, Sender};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct MarkTracker {
    pending: HashMap<ObjectId, Lsn>,
    pending_order: BTreeSet<Lsn>,
    unused: BTreeSet<Lsn>,
    next_lsn: Lsn,
}

impl MarkTracker {
    pub fn new(next_lsn: Lsn) -> Self {
        Self {
            next_lsn,
            ..Self::default()
        }
    }

    fn observe(&mut self, lsn: Lsn) {
        self.next_lsn = self.next_lsn.max(lsn + 1);
    }

    pub fn record_store(&mut self, id: ObjectId, lsn: Lsn) {
        self.observe(lsn);
        if let Some(previous) = self.pending.insert(id, lsn) {
            self.pending_order.remove(&previous);
            self.unused.insert(previous);
        }
        self.pending_order.insert(lsn);
    }

    /// Record a DELETE frame. Returns false when `id` had no pending store.
    pub fn record_delete(&mut self, id: ObjectId, lsn: Lsn) -> bool {
        self.observe(lsn);
        self.unused.insert(lsn);
        match self.pending.remove(&id) {
            Some(store_lsn) => {
                self.pending_order.remove(&store_lsn);
                self.unused.insert(store_lsn);
                true
            }
            None => false,
        }
    }

    /// Frame that carries nothing replay needs (e.g. a skipped frame)
    pub fn record_unused(&mut self, lsn: Lsn) {
        self.observe(lsn);
        self.unused.insert(lsn);
    }

    pub fn low_water_mark(&self) -> Lsn {
        self.pending_order
            .first()
            .copied()
            .unwrap_or(self.next_lsn)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Unused frames below `mark`, i.e. what a compaction to `mark` reclaims
    pub fn reclaimable(&self, mark: Lsn) -> usize {
        self.unused.range(..mark).count()
    }

    /// Forget unused marks below `mark` once the log no longer holds them
    pub fn release_until(&mut self, mark: Lsn) -> usize {
        let kept = self.unused.split_off(&mark);
        let released = self.unused.len();
        self.unused = kept;
        released
    }
}

/// Accumulates replayed frames into the final index.
///
/// Frames must be applied in lsn order. Applying the same frame sequence
/// always yields the same result.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    live: HashMap<ObjectId, (Lsn, Holder)>,
    marks: MarkTracker,
    stores: usize,
    deletes: usize,
}

impl Replay {
    pub fn new(next_lsn: Lsn) -> Self {
        Self {
            marks: MarkTracker::new(next_lsn),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, lsn: Lsn, record: Record) {
        match record {
            Record::Store { id, holder } => {
                self.stores += 1;
                self.live.insert(id, (lsn, holder));
                self.marks.record_store(id, lsn);
            }
            Record::Delete { id } => {
                self.deletes += 1;
                if self.live.remove(&id).is_none() {
                    debug!("replay: delete for unknown {id} at lsn {lsn}");
                }
                self.marks.record_delete(id, lsn);
            }
        }
    }

    pub fn skip(&mut self, lsn: Lsn) {
        self.marks.record_unused(lsn);
    }

    /// Live index, mark state and surviving ids in store order
    pub fn finish(self) -> (HashMap<ObjectId, Holder>, MarkTracker, Vec<ObjectId>) {
        debug!(
            "replay applied {} stores, {} deletes, {} live",
            self.stores,
            self.deletes,
            self.live.len()
        );
        let mut ordered: Vec<(Lsn, ObjectId)> =
            self.live.iter().map(|(id, (lsn, _))| (*lsn, *id)).collect();
        ordered.sort_unstable();
        let ids = ordered.into_iter().map(|(_, id)| id).collect();
        let index = self
            .live
            .into_iter()
            .map(|(id, (_, holder))| (id, holder))
            .collect();
        (index, self.marks, ids)
    }
}

/// Something whose retained history can be advanced to the low-water mark
pub trait Retention: Send + Sync {
    /// Drop whatever lies below the current low-water mark; returns frames reclaimed
    fn compact(&self) -> Result<usize>;
}

/// Background thread that periodically compacts a [`Retention`] target
pub struct Compactor {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub fn spawn(name: &str, interval: Duration, target: Arc<dyn Retention>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval.max(Duration::from_millis(1)));
        let thread_name = format!("{name}-compactor");

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!("{} started, interval {:?}", thread_name, interval);
                loop {
                    channel::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => match target.compact() {
                            Ok(0) => {}
                            Ok(reclaimed) => debug!("{}: reclaimed {} frames", thread_name, reclaimed),
                            Err(e) => warn!("{}: compaction failed, will retry: {}", thread_name, e),
                        },
                    }
                }
                info!("{} stopped", thread_name);
            })
            .map_err(|e| PersistenceError::Background(e.to_string()))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to finish its current pass
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("compactor thread panicked");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    #[test]
    fn test_low_water_mark_follows_oldest_pending() {
        let mut marks = MarkTracker::new(0);
        marks.record_store(id(1), 0);
        marks.record_store(id(2), 1);
        assert_eq!(marks.low_water_mark(), 0);

        assert!(marks.record_delete(id(1), 2));
        assert_eq!(marks.low_water_mark(), 1);
        assert_eq!(marks.reclaimable(1), 1);

        assert!(marks.record_delete(id(2), 3));
        // nothing pending: everything written so far is reclaimable
        assert_eq!(marks.low_water_mark(), 4);
        assert_eq!(marks.reclaimable(4), 4);
        assert_eq!(marks.pending_count(), 0);
    }

    #[test]
    fn test_later_pending_store_blocks_nothing_before_it() {
        let mut marks = MarkTracker::new(0);
        marks.record_store(id(1), 0);
        marks.record_store(id(2), 1);
        marks.record_delete(id(2), 2);
        // id(1) is still pending at lsn 0, so nothing is reclaimable yet
        assert_eq!(marks.low_water_mark(), 0);
        assert_eq!(marks.reclaimable(marks.low_water_mark()), 0);
    }

    #[test]
    fn test_delete_of_unknown_id() {
        let mut marks = MarkTracker::new(0);
        assert!(!marks.record_delete(id(5), 0));
        assert_eq!(marks.next_lsn(), 1);
    }

    #[test]
    fn test_release_until() {
        let mut marks = MarkTracker::new(0);
        marks.record_store(id(1), 0);
        marks.record_delete(id(1), 1);
        marks.record_store(id(2), 2);
        assert_eq!(marks.release_until(2), 2);
        assert_eq!(marks.reclaimable(10), 0);
    }

    #[test]
    fn test_replay_applies_deletes_and_keeps_order() {
        let mut replay = Replay::new(0);
        replay.apply(
            0,
            Record::Store {
                id: id(10),
                holder: Holder::new("orders", "item1"),
            },
        );
        replay.apply(
            1,
            Record::Store {
                id: id(5),
                holder: Holder::new("orders", "item2"),
            },
        );
        replay.apply(2, Record::Delete { id: id(10) });
        replay.apply(3, Record::Delete { id: id(99) });

        let (index, marks, ids) = replay.finish();
        assert_eq!(ids, vec![id(5)]);
        assert_eq!(index.get(&id(5)).unwrap().payload.as_text(), Some("item2"));
        assert_eq!(marks.low_water_mark(), 1);
        assert_eq!(marks.next_lsn(), 4);
    }

    struct Counting(AtomicUsize);

    impl Retention for Counting {
        fn compact(&self) -> Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Background("simulated".to_string()))
        }
    }

    #[test]
    fn test_compactor_survives_failures_and_stops() {
        let target = Arc::new(Counting(AtomicUsize::new(0)));
        let mut compactor =
            Compactor::spawn("test", Duration::from_millis(5), target.clone()).unwrap();
        thread::sleep(Duration::from_millis(60));
        compactor.stop();
        let runs = target.0.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated attempts, got {runs}");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.0.load(Ordering::SeqCst), runs);
    }
}
