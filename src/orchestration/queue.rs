//! Priority admission queue in front of the execution manager.
//!
//! Items are kept sorted by descending priority, FIFO among equals. An
//! admitted item holds one slot until its execution is terminal (or fails
//! to start), then the queue immediately tries to admit the next one.
//!
//! When the manager itself is full, an admitted item goes back to its place
//! in the queue and admission pauses until the manager reports a change.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::ExecutionManager;
use crate::core::{ExecutionCallbacks, ExecutionParams, ExecutionStatus};
use crate::error::{Error, Result};

/// Queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}

/// Advisory events for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added {
        item_id: Uuid,
        priority: i32,
        position: usize,
    },
    Started {
        item_id: Uuid,
        session_id: String,
    },
    Completed {
        item_id: Uuid,
        session_id: String,
    },
    Failed {
        item_id: Uuid,
        error: String,
    },
    Timeout {
        item_id: Uuid,
    },
}

struct QueueItem {
    id: Uuid,
    params: ExecutionParams,
    callbacks: ExecutionCallbacks,
    priority: i32,
    enqueued_at: Instant,
    timeout: Option<Duration>,
    reply: oneshot::Sender<Result<String>>,
    /// Stops the item's timeout timer once it no longer waits.
    timer: CancellationToken,
}

impl QueueItem {
    fn resolve(self, result: Result<String>) {
        self.timer.cancel();
        let _ = self.reply.send(result);
    }
}

struct QueueState {
    items: Vec<QueueItem>,
    processing: usize,
    max_concurrent: usize,
    /// Set while the manager is at capacity; cleared on its next change.
    blocked: bool,
}

impl QueueState {
    /// Insert behind items of equal or higher priority. Returns the position.
    fn insert(&mut self, item: QueueItem) -> usize {
        let position = self
            .items
            .iter()
            .position(|queued| queued.priority < item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
        position
    }

    /// Put an admitted item back ahead of its equals.
    fn requeue(&mut self, item: QueueItem) {
        let position = self
            .items
            .iter()
            .position(|queued| queued.priority <= item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
    }
}

struct Inner {
    manager: ExecutionManager,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Admit items while slots are free.
    fn drain(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        loop {
            let item = {
                let mut state = self.lock();
                if state.blocked
                    || state.processing >= state.max_concurrent
                    || state.items.is_empty()
                {
                    break;
                }
                state.processing += 1;
                state.items.remove(0)
            };
            debug!(
                item_id = %item.id,
                priority = item.priority,
                waited = ?item.enqueued_at.elapsed(),
                "Queue admitting item"
            );
            tokio::spawn(Arc::clone(self).run(item));
        }
    }

    async fn run(self: Arc<Self>, item: QueueItem) {
        let _slot = SlotGuard {
            inner: Arc::clone(&self),
        };
        let item_id = item.id;
        // Subscribed before starting so a slot freed mid-start is not missed.
        let changes = self.manager.subscribe();

        let started = self
            .manager
            .start(item.params.clone(), item.callbacks.clone())
            .await;
        let session_id = match started {
            Ok(session_id) => session_id,
            Err(Error::CapacityExceeded { .. })
                if item.timeout.is_some_and(|t| item.enqueued_at.elapsed() >= t) =>
            {
                let timeout = item.timeout.unwrap_or_default();
                warn!(item_id = %item_id, ?timeout, "Queued execution timed out");
                self.emit(QueueEvent::Timeout { item_id });
                item.resolve(Err(Error::QueueTimeout(timeout)));
                return;
            }
            Err(Error::CapacityExceeded { max }) => {
                debug!(item_id = %item_id, max, "Manager full, item requeued");
                {
                    let mut state = self.lock();
                    state.requeue(item);
                    state.blocked = true;
                }
                tokio::spawn(Arc::clone(&self).unblock_on_change(changes));
                return;
            }
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Queued execution failed to start");
                self.emit(QueueEvent::Failed {
                    item_id,
                    error: e.to_string(),
                });
                item.resolve(Err(e));
                return;
            }
        };

        self.emit(QueueEvent::Started {
            item_id,
            session_id: session_id.clone(),
        });
        item.resolve(Ok(session_id.clone()));

        match self.manager.wait_for_terminal(&session_id).await {
            Ok(execution) if execution.status == ExecutionStatus::Completed => {
                self.emit(QueueEvent::Completed {
                    item_id,
                    session_id,
                })
            }
            Ok(execution) => self.emit(QueueEvent::Failed {
                item_id,
                error: format!("execution {} {}", session_id, execution.status),
            }),
            // Cleaned up before we saw it finish; the slot is free either way.
            Err(e) => self.emit(QueueEvent::Failed {
                item_id,
                error: e.to_string(),
            }),
        }
    }
}

impl Inner {
    /// Resume admission once the manager's state moves.
    async fn unblock_on_change(self: Arc<Self>, mut changes: watch::Receiver<u64>) {
        // An error means the manager is gone; admitting will report that.
        let _ = changes.changed().await;
        self.lock().blocked = false;
        self.drain();
    }
}

/// Releases an admission slot when the item is done, however it ends.
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.processing = state.processing.saturating_sub(1);
        }
        self.inner.drain();
    }
}

/// A queued request. Resolves to the session id once admitted and started.
#[derive(Debug)]
pub struct QueueTicket {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<String>>,
}

impl QueueTicket {
    /// Wait for admission and start.
    ///
    /// # Errors
    ///
    /// `QueueTimeout`, `QueueCleared`, or whatever the execution manager
    /// returned from `start`.
    pub async fn wait(self) -> Result<String> {
        self.rx.await.unwrap_or(Err(Error::QueueCleared))
    }
}

/// Priority queue that defers starts until the manager has room.
///
/// # Example
///
/// ```ignore
/// let queue = ExecutionQueue::new(manager, QueueConfig { max_concurrent: 2 })?;
/// let session_id = queue
///     .enqueue(ExecutionParams::new("/repo", "triage"), ExecutionCallbacks::new(), 5, None)
///     .await?;
/// ```
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max_concurrent` is below 1.
    pub fn new(manager: ExecutionManager, config: QueueConfig) -> Result<Self> {
        if config.max_concurrent < 1 {
            return Err(Error::InvalidConfig(
                "queue max_concurrent must be at least 1".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                manager,
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    processing: 0,
                    max_concurrent: config.max_concurrent,
                    blocked: false,
                }),
                events,
            }),
        })
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.inner.manager
    }

    /// Queue an execution and wait until it is admitted and started.
    pub async fn enqueue(
        &self,
        params: ExecutionParams,
        callbacks: ExecutionCallbacks,
        priority: i32,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.submit(params, callbacks, priority, timeout).wait().await
    }

    /// Queue an execution without waiting.
    ///
    /// Admission runs on a later turn, so several submits made back to back
    /// are ordered by priority before any of them starts.
    pub fn submit(
        &self,
        params: ExecutionParams,
        callbacks: ExecutionCallbacks,
        priority: i32,
        timeout: Option<Duration>,
    ) -> QueueTicket {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let timer = CancellationToken::new();
        let item = QueueItem {
            id,
            params,
            callbacks,
            priority,
            enqueued_at: Instant::now(),
            timeout,
            reply,
            timer: timer.clone(),
        };

        let position = self.inner.lock().insert(item);
        debug!(item_id = %id, priority, position, "Execution queued");
        self.inner.emit(QueueEvent::Added {
            item_id: id,
            priority,
            position,
        });

        if let Some(timeout) = timeout {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                let expired = {
                    let mut state = inner.lock();
                    state
                        .items
                        .iter()
                        .position(|queued| queued.id == id)
                        .map(|index| state.items.remove(index))
                };
                if let Some(item) = expired {
                    warn!(item_id = %id, ?timeout, "Queued execution timed out");
                    inner.emit(QueueEvent::Timeout { item_id: id });
                    item.resolve(Err(Error::QueueTimeout(timeout)));
                }
            });
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drain() });

        QueueTicket { id, rx }
    }

    /// Change the admission cap; raising it admits waiting items right away.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max` is below 1.
    pub fn set_max_concurrent(&self, max: usize) -> Result<()> {
        if max < 1 {
            return Err(Error::InvalidConfig(
                "queue max_concurrent must be at least 1".to_string(),
            ));
        }
        self.inner.lock().max_concurrent = max;
        info!(max, "Queue concurrency changed");
        self.inner.drain();
        Ok(())
    }

    /// Reject every queued item with `QueueCleared`. Returns how many.
    pub fn clear(&self) -> usize {
        let items: Vec<QueueItem> = std::mem::take(&mut self.inner.lock().items);
        let count = items.len();
        for item in items {
            item.resolve(Err(Error::QueueCleared));
        }
        if count > 0 {
            info!(count, "Execution queue cleared");
        }
        count
    }

    /// Items waiting for admission.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admitted items whose execution has not finished yet.
    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }
}
