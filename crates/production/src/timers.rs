//! Timer management for the production runner.
//!
//! Timers are spawned as tokio tasks and can be cancelled. A fired timer is
//! delivered to the runner as the matching event.

use pbft_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::ViewChange => Event::ViewChangeTimer,
    }
}

/// Manages timers for the production runner.
///
/// Each timer is a tokio task that sleeps for the requested duration and then
/// sends the timer event to the runner's timer channel.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    /// Create a new timer manager.
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Set a timer that fires after `duration`.
    ///
    /// A pending timer with the same id is cancelled first.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(timer = ?id, "Timer fired");
            // Receiver gone means the runner is shutting down.
            let _ = event_tx.send(timer_event(id)).await;
        });

        self.timers.insert(id, handle);
        debug!(timer = ?id, ?duration, "Timer set");
    }

    /// Cancel a timer. No-op if it does not exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(timer = ?id, "Timer cancelled");
        }
    }

    /// Cancel all timers. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(timer = ?id, "Timer cancelled (shutdown)");
        }
    }

    /// Number of timers set and not cancelled.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
