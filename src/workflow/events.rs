//! Synchronous fan-out of workflow events.
//!
//! Callback subscribers run inline, in subscription order, on the task that
//! emits the event. A panicking subscriber is logged and skipped. Channel
//! subscribers receive the same events through a `broadcast` channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, error};

use super::WorkflowEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub type EventCallback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriberId, EventCallback)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriberId, EventCallback)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.channel.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        debug!(event = %event, "Workflow event");

        // Snapshot so a callback may subscribe or unsubscribe without deadlocking.
        let subscribers: Vec<EventCallback> =
            self.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();

        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(event = event.name(), "Workflow event subscriber panicked");
            }
        }

        // No receivers is fine.
        let _ = self.channel.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
