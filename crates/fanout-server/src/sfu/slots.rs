//! Track slot pool
//!
//! Hands out a fixed number of local track slots per endpoint. Indices are
//! 1-based and double as the local track and stream ids.

use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};

#[derive(Default)]
struct SlotTable {
    /// `occupants[i]` holds the session in slot `i + 1`
    occupants: Vec<Option<String>>,
    assigned: HashMap<String, usize>,
}

impl SlotTable {
    fn claim(&mut self, session_id: &str) -> Result<usize> {
        if let Some(index) = self.assigned.get(session_id) {
            return Ok(*index);
        }

        let position = self
            .occupants
            .iter()
            .position(Option::is_none)
            .ok_or(RelayError::PoolExhausted {
                capacity: self.occupants.len(),
            })?;

        self.occupants[position] = Some(session_id.to_string());
        let index = position + 1;
        self.assigned.insert(session_id.to_string(), index);
        Ok(index)
    }
}

/// Bounded allocator of local track slots
pub struct TrackSlotPool {
    table: Mutex<SlotTable>,
    capacity: usize,
}

impl TrackSlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(SlotTable {
                occupants: vec![None; capacity],
                assigned: HashMap::new(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the lowest free slot for `session_id`.
    ///
    /// A session that already holds a slot gets the same index back.
    pub async fn acquire(&self, session_id: &str) -> Result<usize> {
        let index = self.table.lock().await.claim(session_id)?;
        tracing::debug!(session_id, index, "Track slot acquired");
        Ok(index)
    }

    /// Return the session's slot, allocating and recording one if needed
    pub async fn lookup(&self, session_id: &str) -> Result<usize> {
        let mut table = self.table.lock().await;
        if let Some(index) = table.assigned.get(session_id) {
            return Ok(*index);
        }
        let index = table.claim(session_id)?;
        tracing::debug!(session_id, index, "Track slot assigned on lookup");
        Ok(index)
    }

    /// Slot currently held by `session_id`, without allocating
    pub async fn get(&self, session_id: &str) -> Option<usize> {
        self.table.lock().await.assigned.get(session_id).copied()
    }

    pub async fn release(&self, session_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(index) = table.assigned.remove(session_id) {
            table.occupants[index - 1] = None;
            tracing::debug!(session_id, index, "Track slot released");
        }
    }

    pub async fn occupied(&self) -> usize {
        self.table.lock().await.assigned.len()
    }
}
