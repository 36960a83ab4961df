//! In-memory queue with the Redis queue's semantics
//!
//! Backs the unit and scenario tests; the visibility bookkeeping matches
//! the sorted-set implementation member for member.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::queue::{Delivery, Queue};
use crate::Result;

/// One stream held in process memory
pub struct MemoryQueue {
    name: String,
    // member -> visible-at, milliseconds since epoch
    entries: Mutex<BTreeMap<String, i64>>,
}

impl MemoryQueue {
    /// Create an empty stream
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entries: Mutex::new(BTreeMap::new()) }
    }

    /// Visible-at timestamps (ms), sorted; test hook for asserting delays
    pub fn visible_at_millis(&self) -> Vec<i64> {
        let mut scores: Vec<i64> = self.entries.lock().unwrap().values().copied().collect();
        scores.sort();
        scores
    }

    /// Earliest visible-at (ms), if any
    pub fn next_visible_at(&self) -> Option<i64> {
        self.visible_at_millis().into_iter().next()
    }

    /// Messages currently due
    pub fn due_len(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        self.entries.lock().unwrap().values().filter(|&&at| at <= now).count()
    }

    /// Drop every message; test hook standing in for a crash that loses
    /// the queue state
    pub fn purge(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Collapse all delays; test hook standing in for the passage of time
    pub fn make_all_visible(&self) {
        let now = Utc::now().timestamp_millis();
        for at in self.entries.lock().unwrap().values_mut() {
            *at = now;
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, payload: &str, delay: Duration) -> Result<()> {
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.entries.lock().unwrap().insert(payload.to_string(), visible_at);
        Ok(())
    }

    async fn pop(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let mut entries = self.entries.lock().unwrap();

        let due = entries
            .iter()
            .filter(|(_, &at)| at <= now)
            .min_by_key(|(_, &at)| at)
            .map(|(member, _)| member.clone());

        match due {
            Some(member) => {
                entries.insert(member.clone(), now + visibility.as_millis() as i64);
                Ok(Some(Delivery { receipt: member }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.entries.lock().unwrap().remove(&delivery.receipt);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&delivery.receipt) {
            entries.insert(delivery.receipt.clone(), now);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().unwrap().len())
    }
}
