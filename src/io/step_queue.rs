use crate::message::Message;
use crate::step::Step;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

struct Entry {
    seq: u64,
    msg: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: invert so the earliest step (then the oldest
    // insertion) surfaces first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .msg
            .cmp_step(&self.msg)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Thread-safe priority queue of messages ordered by step, FIFO within a step.
///
/// One router thread and one component thread touch a given queue.
#[derive(Default)]
pub struct StepQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: Message) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { seq, msg });
        drop(inner);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().heap.pop().map(|e| e.msg)
    }

    /// Pops the head only if its step is at or before `limit`.
    pub fn pop_until(&self, limit: &Step) -> Option<Message> {
        let mut inner = self.inner.lock();
        let due = match inner.heap.peek() {
            Some(e) => e.msg.step.as_ref().is_none_or(|s| s <= limit),
            None => false,
        };
        if due { inner.heap.pop().map(|e| e.msg) } else { None }
    }

    /// Waits up to `timeout` for a message.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(e) = inner.heap.pop() {
                return Some(e.msg);
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return inner.heap.pop().map(|e| e.msg);
            }
        }
    }

    /// Everything queued, in step order.
    pub fn drain(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.heap.len());
        while let Some(e) = inner.heap.pop() {
            out.push(e.msg);
        }
        out
    }

    /// Everything at or before `limit`, in step order; later messages stay.
    pub fn drain_until(&self, limit: &Step) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = self.pop_until(limit) {
            out.push(msg);
        }
        out
    }

    pub fn peek_step(&self) -> Option<Option<Step>> {
        self.inner.lock().heap.peek().map(|e| e.msg.step.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}
