//! Bounded hand-off queues between pipeline stages.
//!
//! Both queues are FIFO with a fixed capacity. What differs is what happens
//! when a push meets a full queue:
//! - `RejectNew`: the incoming item is handed back (frame queue; the capture
//!   worker drops it and moves on).
//! - `EvictOldest`: the front item is evicted and the incoming one accepted
//!   (result queue; the newest result is never rejected).
//!
//! Consumers block in `pop_timeout` on a condition variable instead of
//! polling, but never longer than the given timeout. `close` releases every
//! blocked consumer at once; a closed queue stays closed until `reopen`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_RESULT_QUEUE_CAPACITY: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    RejectNew,
    EvictOldest,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Accepted,
    /// Queue was full under `RejectNew`; the item is returned to the caller.
    Rejected(T),
    /// Queue was full under `EvictOldest`; the evicted front item is returned.
    Evicted(T),
}

impl<T> PushOutcome<T> {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, PushOutcome::Rejected(_))
    }
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    closed: AtomicBool,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            capacity,
            policy,
        }
    }

    // Critical sections never panic, so a poisoned lock still guards a
    // consistent deque.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        let outcome = {
            let mut items = self.lock();
            if items.len() < self.capacity {
                items.push_back(item);
                PushOutcome::Accepted
            } else {
                match self.policy {
                    OverflowPolicy::RejectNew => return PushOutcome::Rejected(item),
                    OverflowPolicy::EvictOldest => {
                        let evicted = items.pop_front();
                        items.push_back(item);
                        match evicted {
                            Some(old) => PushOutcome::Evicted(old),
                            None => PushOutcome::Accepted,
                        }
                    }
                }
            }
        };
        self.ready.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop the front item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns immediately once the queue is closed, with whatever is still
    /// at the front.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |items| {
                items.is_empty() && !self.closed.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.pop_front()
    }

    /// Release every consumer blocked in `pop_timeout` and keep later waits
    /// from blocking.
    pub fn close(&self) {
        // Set under the lock so a consumer between its check and its wait
        // cannot miss the notification.
        let _guard = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Clone of the most recently pushed item still queued.
    pub fn peek_latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn reject_new_keeps_oldest_items() {
        let queue = BoundedQueue::new(3, OverflowPolicy::RejectNew);
        for i in 0..3 {
            assert_eq!(queue.push(i), PushOutcome::Accepted);
        }
        assert_eq!(queue.push(3), PushOutcome::Rejected(3));
        assert_eq!(queue.push(4), PushOutcome::Rejected(4));
        assert_eq!(queue.len(), 3);

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
    }

    #[test]
    fn evict_oldest_always_accepts_newest() {
        let queue = BoundedQueue::new(3, OverflowPolicy::EvictOldest);
        for i in 0..3 {
            queue.push(i);
        }
        assert_eq!(queue.push(3), PushOutcome::Evicted(0));
        assert_eq!(queue.push(4), PushOutcome::Evicted(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_latest(), Some(4));

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        for policy in [OverflowPolicy::RejectNew, OverflowPolicy::EvictOldest] {
            let queue = BoundedQueue::new(10, policy);
            for i in 0..250 {
                queue.push(i);
                assert!(queue.len() <= 10);
            }
        }
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::new(0, OverflowPolicy::RejectNew);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push("a").is_accepted());
        assert!(!queue.push("b").is_accepted());
    }

    #[test]
    fn peek_latest_does_not_consume() {
        let queue = BoundedQueue::new(5, OverflowPolicy::EvictOldest);
        assert_eq!(queue.peek_latest(), None::<u32>);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.peek_latest(), Some(2));
        assert_eq!(queue.peek_latest(), Some(2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(2, OverflowPolicy::RejectNew);
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(2, OverflowPolicy::RejectNew));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.push(42u32);
            })
        };
        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn close_releases_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> =
            Arc::new(BoundedQueue::new(2, OverflowPolicy::RejectNew));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let item = queue.pop_timeout(Duration::from_secs(30));
                (item, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        let (item, waited) = consumer.join().unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    }

    #[test]
    fn closed_queue_does_not_block_until_reopened() {
        let queue = BoundedQueue::new(2, OverflowPolicy::RejectNew);
        queue.close();
        assert!(queue.is_closed());
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_secs(30)), None::<u8>);
        assert!(started.elapsed() < Duration::from_secs(1));

        queue.push(7);
        assert_eq!(queue.pop_timeout(Duration::from_secs(1)), Some(7));

        queue.reopen();
        assert!(!queue.is_closed());
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
