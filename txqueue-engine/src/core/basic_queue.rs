//! Synchronized in-memory FIFO of object identifiers.
//!
//! A single mutex per queue guards every operation; it decides which of
//! several concurrent takers wins a given identifier. Once an identifier has
//! been taken it is gone from the structure, whatever happens to the taking
//! transaction afterwards.

use super::error::{QueueError, Result};
use super::types::ObjectId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BasicQueue {
    name: String,
    capacity: Option<usize>,
    items: Mutex<VecDeque<ObjectId>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BasicQueue {
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.filter(|c| *c > 0),
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append to the tail, blocking while a bounded queue is full
    pub fn put(&self, id: ObjectId) -> Result<()> {
        if id.is_nil() {
            return Err(QueueError::InvalidId);
        }

        let mut items = self.items.lock();
        while self.is_full(&items) {
            self.not_full.wait(&mut items);
        }
        items.push_back(id);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append to the tail, giving up after `timeout` if the queue stays full
    pub fn offer(&self, id: ObjectId, timeout: Duration) -> Result<bool> {
        if id.is_nil() {
            return Err(QueueError::InvalidId);
        }

        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while self.is_full(&items) {
            if self.not_full.wait_until(&mut items, deadline).timed_out() && self.is_full(&items)
            {
                return Ok(false);
            }
        }
        items.push_back(id);
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Insert at the head, ignoring capacity (rollback and untake)
    pub fn put_front(&self, id: ObjectId) -> Result<()> {
        if id.is_nil() {
            return Err(QueueError::InvalidId);
        }

        let mut items = self.items.lock();
        items.push_front(id);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append to the tail, ignoring capacity (recovery)
    pub(crate) fn restore(&self, id: ObjectId) -> Result<()> {
        if id.is_nil() {
            return Err(QueueError::InvalidId);
        }

        let mut items = self.items.lock();
        items.push_back(id);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the head, `None` when empty
    pub fn take(&self) -> Option<ObjectId> {
        let mut items = self.items.lock();
        let id = items.pop_front();
        if id.is_some() {
            self.not_full.notify_one();
        }
        id
    }

    /// Like `take`, but waits up to `timeout` for an item to arrive
    pub fn poll(&self, timeout: Duration) -> Option<ObjectId> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(id) = items.pop_front() {
                self.not_full.notify_one();
                return Some(id);
            }
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                let id = items.pop_front();
                if id.is_some() {
                    self.not_full.notify_one();
                }
                return id;
            }
        }
    }

    pub fn peek(&self) -> Option<ObjectId> {
        self.items.lock().front().copied()
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Drop every identifier, returning how many were held
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let count = items.len();
        items.clear();
        self.not_full.notify_all();
        count
    }

    fn is_full(&self, items: &VecDeque<ObjectId>) -> bool {
        self.capacity.is_some_and(|cap| items.len() >= cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    #[test]
    fn test_fifo_order() {
        let queue = BasicQueue::new("q", None);
        for n in 1..=5 {
            queue.put(id(n)).unwrap();
        }
        assert_eq!(queue.size(), 5);
        for n in 1..=5 {
            assert_eq!(queue.take(), Some(id(n)));
        }
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_nil_rejected_without_side_effect() {
        let queue = BasicQueue::new("q", None);
        assert!(matches!(queue.put(ObjectId::NIL), Err(QueueError::InvalidId)));
        assert!(matches!(
            queue.put_front(ObjectId::NIL),
            Err(QueueError::InvalidId)
        ));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_put_front_goes_to_head() {
        let queue = BasicQueue::new("q", None);
        queue.put(id(2)).unwrap();
        queue.put_front(id(1)).unwrap();
        assert_eq!(queue.peek(), Some(id(1)));
        assert_eq!(queue.take(), Some(id(1)));
        assert_eq!(queue.take(), Some(id(2)));
    }

    #[test]
    fn test_poll_times_out_when_empty() {
        let queue = BasicQueue::new("q", None);
        let start = Instant::now();
        assert_eq!(queue.poll(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_poll_wakes_on_put() {
        let queue = Arc::new(BasicQueue::new("q", None));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.put(id(7)).unwrap();
            })
        };
        assert_eq!(queue.poll(Duration::from_secs(5)), Some(id(7)));
        producer.join().unwrap();
    }

    #[test]
    fn test_offer_respects_capacity() {
        let queue = BasicQueue::new("q", Some(1));
        assert!(queue.offer(id(1), Duration::ZERO).unwrap());
        assert!(!queue.offer(id(2), Duration::from_millis(20)).unwrap());
        assert_eq!(queue.size(), 1);
        queue.take();
        assert!(queue.offer(id(2), Duration::ZERO).unwrap());
    }

    #[test]
    fn test_put_blocks_until_space() {
        let queue = Arc::new(BasicQueue::new("q", Some(1)));
        queue.put(id(1)).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.take()
            })
        };

        let start = Instant::now();
        queue.put(id(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(consumer.join().unwrap(), Some(id(1)));
        assert_eq!(queue.take(), Some(id(2)));
    }

    #[test]
    fn test_exclusive_take_under_contention() {
        let queue = Arc::new(BasicQueue::new("q", None));
        queue.put(id(1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.take())
            })
            .collect();

        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_clear() {
        let queue = BasicQueue::new("q", None);
        queue.put(id(1)).unwrap();
        queue.put(id(2)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.size(), 0);
    }
}
