use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::telemetry::Measurement;

/// Bounded, arrival-ordered buffer of the most recent measurements.
///
/// One ingestion loop pushes while any number of consumers take snapshots from
/// other threads. Snapshots are copies, so a consumer never observes a push in
/// progress.
#[derive(Debug)]
pub struct LiveWindow {
    capacity: usize,
    entries: Mutex<VecDeque<Measurement>>,
}

impl LiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends one measurement, evicting the oldest entries beyond capacity.
    pub fn push(&self, measurement: Measurement) {
        let mut entries = self.entries();
        entries.push_back(measurement);
        evict(&mut entries, self.capacity);
    }

    /// Bulk append used for cold replay; only the newest `capacity` survive.
    pub fn extend<I>(&self, measurements: I)
    where
        I: IntoIterator<Item = Measurement>,
    {
        let mut entries = self.entries();
        entries.extend(measurements);
        evict(&mut entries, self.capacity);
    }

    pub fn snapshot(&self) -> Vec<Measurement> {
        self.entries().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Measurement> {
        self.entries().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Measurement>> {
        // A panicking consumer cannot leave the deque half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict(entries: &mut VecDeque<Measurement>, capacity: usize) {
    while entries.len() > capacity {
        entries.pop_front();
    }
}
