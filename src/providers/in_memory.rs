//! In-memory history store for tests and examples.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{now_ms, EventKind, HistoryEvent};

use super::{check_appendable, HistoryStore, StoreError};

/// `Mutex<HashMap>`-backed store. The single lock serializes appends across
/// all instances, which is more than the contract requires but plenty for
/// test workloads.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<HistoryEvent>>>,
}

impl InMemoryHistoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<HistoryEvent>>> {
        // Lock poisoning only happens if a holder panicked; the map itself
        // is still consistent because every mutation is append-only.
        match self.histories.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        self.lock().get(instance).cloned().unwrap_or_default()
    }

    async fn append(
        &self,
        instance: &str,
        events: Vec<EventKind>,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let mut map = self.lock();
        let history = map
            .get_mut(instance)
            .ok_or_else(|| StoreError::permanent("append", format!("unknown instance '{instance}'")))?;
        check_appendable(history, &events)?;

        let mut next_seq = history.last().map(|e| e.seq + 1).unwrap_or(1);
        let ts_ms = now_ms();
        let mut appended = Vec::with_capacity(events.len());
        for kind in events {
            let e = HistoryEvent {
                seq: next_seq,
                ts_ms,
                kind,
            };
            next_seq += 1;
            history.push(e.clone());
            appended.push(e);
        }
        Ok(appended)
    }

    async fn create_instance(&self, instance: &str) -> Result<bool, StoreError> {
        let mut map = self.lock();
        if map.contains_key(instance) {
            return Ok(false);
        }
        map.insert(instance.to_string(), Vec::new());
        Ok(true)
    }

    async fn list_instances(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    async fn reset(&self) {
        self.lock().clear();
    }
}
