//! In-process timer service.
//!
//! Maintains a min-ordered queue of scheduled deadlines and resolves each
//! timer's oneshot when its deadline passes. Durability is not this module's
//! job: the executor records `TimerCreated` before scheduling and recomputes
//! already-due timers from history on replay.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::sync::{mpsc, oneshot};

use crate::now_ms;

struct Schedule {
    fire_at_ms: u64,
    done: oneshot::Sender<u64>,
}

/// Receives the fire-at timestamp when the timer elapses. Errs only if the
/// service shut down first.
pub struct TimerHandle(oneshot::Receiver<u64>);

impl TimerHandle {
    pub async fn fired(self) -> Result<u64, oneshot::error::RecvError> {
        self.0.await
    }
}

pub struct TimerService {
    tx: mpsc::UnboundedSender<Schedule>,
}

impl TimerService {
    /// Spawn the worker task and return the service front end. The worker
    /// exits when every `TimerService` clone of the sender is dropped.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Schedule>();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Schedule a timer at an absolute wall-clock deadline. Past-due
    /// deadlines fire on the worker's next pass.
    pub fn schedule(&self, fire_at_ms: u64) -> TimerHandle {
        let (done, rx) = oneshot::channel();
        // Send fails only after the worker is gone; the handle then
        // reports RecvError, which is the right signal for shutdown.
        let _ = self.tx.send(Schedule { fire_at_ms, done });
        TimerHandle(rx)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Schedule>) {
    let mut heap: BinaryHeap<Reverse<(u64, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, oneshot::Sender<u64>> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        // Fire everything due.
        let now = now_ms();
        while let Some(&Reverse((fire_at, id))) = heap.peek() {
            if fire_at > now {
                break;
            }
            heap.pop();
            if let Some(done) = pending.remove(&id) {
                // Receiver may have been dropped; nothing to do then.
                let _ = done.send(fire_at);
            }
        }

        // Sleep until the next deadline or the next schedule message.
        if let Some(&Reverse((next_ts, _))) = heap.peek() {
            let dur = next_ts.saturating_sub(now_ms()).max(1);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(dur)) => {}
                maybe = rx.recv() => {
                    match maybe {
                        Some(s) => {
                            pending.insert(next_id, s.done);
                            heap.push(Reverse((s.fire_at_ms, next_id)));
                            next_id += 1;
                        }
                        None => break,
                    }
                }
            }
        } else {
            match rx.recv().await {
                Some(s) => {
                    pending.insert(next_id, s.done);
                    heap.push(Reverse((s.fire_at_ms, next_id)));
                    next_id += 1;
                }
                None => break,
            }
        }
    }
}
