//! Injection queues.
//!
//! Each relay direction owns one queue; the relay loop drains at most
//! one entry per iteration, ahead of its socket read. Unbounded: the
//! consumer is single, backpressure is delegated to the producer.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Thread-safe FIFO of raw datagrams with a non-blocking pop.
#[derive(Debug, Default)]
pub struct InjectQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
}

impl InjectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: Vec<u8>) {
        self.items.lock().unwrap().push_back(data);
    }

    /// `None` when empty; never blocks.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
