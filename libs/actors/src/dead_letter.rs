//! Dead-Letter Queue
//!
//! Bounded ring of failed deliveries. When full, the oldest entry is evicted
//! to make room for the newest.

use crate::error::BusError;
use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A delivery that failed in a handler
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub message: Arc<dyn Message>,
    pub error: BusError,
    /// When the failure was recorded (nanoseconds since Unix epoch)
    pub timestamp_ns: u64,
}

impl DeadLetterEntry {
    pub fn new(message: Arc<dyn Message>, error: BusError) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            message,
            error,
            timestamp_ns,
        }
    }
}

/// Fixed-capacity ring buffer of dead letters
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
    total_recorded: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Record a failure, evicting the oldest entry when full
    pub fn push(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Failures ever recorded, including evicted ones
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }

    /// Copy of the retained entries, oldest first
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return the retained entries, oldest first
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().drain(..).collect()
    }
}
