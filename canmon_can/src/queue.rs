//! Bounded frame queues for the transport workers.
//!
//! The TX queue is producer-bounded: `push_back`/`push_front` block while
//! the queue is at capacity. The TX worker re-inserts a retried frame with
//! `requeue_front`, which reclaims the slot the frame was popped from and
//! therefore never blocks. The RX buffer drops its oldest entry instead,
//! so a stalled consumer cannot wedge the RX worker.

use crate::frame::CanFrame;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner {
    frames: VecDeque<CanFrame>,
    closed: bool,
}

/// Bounded, priority-aware TX queue.
pub struct TxQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl TxQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append a frame, blocking while the queue is full.
    ///
    /// Returns `false` when the queue has been closed.
    pub fn push_back(&self, frame: CanFrame) -> bool {
        self.push(frame, false)
    }

    /// Prepend a high-priority frame, blocking while the queue is full.
    ///
    /// Returns `false` when the queue has been closed.
    pub fn push_front(&self, frame: CanFrame) -> bool {
        self.push(frame, true)
    }

    fn push(&self, frame: CanFrame, front: bool) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while inner.frames.len() >= self.capacity && !inner.closed {
            inner = match self.not_full.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if inner.closed {
            return false;
        }
        if front {
            inner.frames.push_front(frame);
        } else {
            inner.frames.push_back(frame);
        }
        self.not_empty.notify_one();
        true
    }

    /// Re-insert a retried frame at the front without blocking.
    ///
    /// Only the TX worker calls this, immediately after popping the frame;
    /// the transient over-capacity window is at most one frame.
    pub fn requeue_front(&self, frame: CanFrame) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.closed {
            return;
        }
        inner.frames.push_front(frame);
        self.not_empty.notify_one();
    }

    /// Pop the next frame, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<CanFrame> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _timeout_result) = match self.not_empty.wait_timeout(inner, remaining) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner = guard;
        }
    }

    /// Remove every queued frame (used when the driver is reinstalled).
    pub fn drain(&self) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let dropped = inner.frames.len();
        inner.frames.clear();
        self.not_full.notify_all();
        dropped
    }

    /// Close the queue, waking all blocked producers and consumers.
    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Current number of queued frames.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.frames.len(),
            Err(poisoned) => poisoned.into_inner().frames.len(),
        }
    }

    /// True when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Drop-oldest RX buffer between the RX worker and synchronous readers.
pub struct RxQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
}

impl RxQueue {
    /// Create a buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Insert a frame, discarding the oldest entry when full.
    ///
    /// Returns the number of frames discarded (0 or 1).
    pub fn push(&self, frame: CanFrame) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.closed {
            return 0;
        }
        let mut dropped = 0;
        if inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            dropped = 1;
        }
        inner.frames.push_back(frame);
        self.not_empty.notify_one();
        dropped
    }

    /// Pop the next frame, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<CanFrame> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _timeout_result) = match self.not_empty.wait_timeout(inner, remaining) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner = guard;
        }
    }

    /// Close the buffer, waking all blocked readers.
    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.closed = true;
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, &[]).unwrap()
    }

    #[test]
    fn fifo_order_for_push_back() {
        let queue = TxQueue::new(4);
        assert!(queue.push_back(frame(1)));
        assert!(queue.push_back(frame(2)));
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 1);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 2);
    }

    #[test]
    fn push_front_preempts() {
        let queue = TxQueue::new(4);
        queue.push_back(frame(1));
        queue.push_front(frame(2));
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 2);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 1);
    }

    #[test]
    fn requeue_front_is_next_out() {
        let queue = TxQueue::new(2);
        queue.push_back(frame(1));
        queue.push_back(frame(2));
        let popped = queue.pop(Duration::ZERO).unwrap();
        queue.requeue_front(popped);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 1);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = TxQueue::new(2);
        assert!(queue.pop(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn close_unblocks_producer() {
        let queue = Arc::new(TxQueue::new(1));
        queue.push_back(frame(1));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push_back(frame(2)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn drain_empties_queue() {
        let queue = TxQueue::new(4);
        queue.push_back(frame(1));
        queue.push_back(frame(2));
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn rx_queue_drops_oldest() {
        let queue = RxQueue::new(2);
        assert_eq!(queue.push(frame(1)), 0);
        assert_eq!(queue.push(frame(2)), 0);
        assert_eq!(queue.push(frame(3)), 1);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 2);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().id, 3);
    }
}
