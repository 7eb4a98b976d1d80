//! External event correlation.
//!
//! Events are addressed by (instance, event name). A raise with no waiter is
//! buffered; a wait with no buffered payload parks on a oneshot. Each payload
//! is consumed exactly once, in raise order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

#[derive(Default)]
struct Slot {
    pending: VecDeque<String>,
    waiters: VecDeque<oneshot::Sender<String>>,
}

/// Receives the event payload once it is raised.
pub struct EventWaiter(oneshot::Receiver<String>);

impl EventWaiter {
    pub async fn recv(self) -> Result<String, oneshot::error::RecvError> {
        self.0.await
    }
}

#[derive(Default)]
pub struct EventHub {
    // Outer lock only guards the map; per-slot locks serialize delivery.
    slots: Mutex<HashMap<(String, String), Arc<Mutex<Slot>>>>,
}

impl EventHub {
    async fn slot(&self, instance: &str, name: &str) -> Arc<Mutex<Slot>> {
        let mut map = self.slots.lock().await;
        map.entry((instance.to_string(), name.to_string()))
            .or_default()
            .clone()
    }

    /// Deliver a payload: hand it to the oldest live waiter, or buffer it.
    pub async fn raise(&self, instance: &str, name: &str, payload: impl Into<String>) {
        let slot = self.slot(instance, name).await;
        let mut slot = slot.lock().await;
        let mut payload = payload.into();
        while let Some(waiter) = slot.waiters.pop_front() {
            match waiter.send(payload) {
                Ok(()) => {
                    debug!(instance, event = name, "event delivered to waiter");
                    return;
                }
                // Waiter dropped (caller gave up); try the next one.
                Err(returned) => payload = returned,
            }
        }
        debug!(instance, event = name, "event buffered");
        slot.pending.push_back(payload);
    }

    /// Consume the next payload for (instance, name): an already-buffered
    /// one if present, otherwise a waiter for a future raise.
    pub async fn await_next(&self, instance: &str, name: &str) -> EventWaiter {
        let slot = self.slot(instance, name).await;
        let mut slot = slot.lock().await;
        let (tx, rx) = oneshot::channel();
        if let Some(payload) = slot.pending.pop_front() {
            // Only fails if we dropped rx, which we hold.
            let _ = tx.send(payload);
        } else {
            slot.waiters.push_back(tx);
        }
        EventWaiter(rx)
    }

    /// Drop buffered payloads and waiters for a terminated instance.
    pub async fn purge_instance(&self, instance: &str) {
        let mut map = self.slots.lock().await;
        map.retain(|(inst, _), _| inst != instance);
    }
}
