//! Single dispatch attempts
//!
//! A [`Dispatcher`] drains the [`EventQueue`] to the collector one
//! attempt at a time. What happens to the queued events depends on how
//! the attempt ends:
//!
//! | Result                          | Queue                         |
//! |---------------------------------|-------------------------------|
//! | queue empty / network down      | untouched, lock never taken   |
//! | another attempt in flight       | untouched                     |
//! | previous attempt interrupted    | cleared, stale lock removed   |
//! | delivered                       | sent events removed           |
//! | request never reached server    | retained for the next attempt |
//! | server rejected the batch       | sent events removed           |
//!
//! A rejected batch is dropped rather than retried: the collector would
//! refuse the same batch every time and block everything queued behind it.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lock::{LockError, LockManager};
use crate::queue::{Batch, Event, EventQueue};
use crate::reachability::ReachabilityProbe;
use crate::transport::{Ack, SendResult, Transport, TransportError};

const PROGRESS_CAPACITY: usize = 64;

/// Why an attempt did not send anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing queued
    EmptyQueue,
    /// The reachability probe reported no connection
    Unreachable,
    /// Another attempt holds the dispatch lock
    InProgress,
    /// The dispatch lock could not be persisted
    StorageUnavailable,
}

/// Why queued events were dropped without delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The collector answered with a non-success status
    Rejected(TransportError),
    /// A previous attempt was interrupted; its events were in an unknown state
    Recovered,
}

/// How a dispatch attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Delivered { events: usize, ack: Ack },
    Retained { events: usize, error: TransportError },
    Discarded { events: usize, reason: DiscardReason },
}

/// One completed attempt
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    /// Correlates log lines and progress notifications
    pub id: Uuid,
    /// Queue contents the attempt worked from
    pub snapshot: Batch,
    pub outcome: DispatchOutcome,
}

/// Notifications published while an attempt runs
#[derive(Debug, Clone)]
pub enum DispatchProgress {
    /// Checks passed; the attempt is about to take the lock
    Started { attempt_id: Uuid, events: usize },
    /// The lock is held and the batch is being sent
    Sending { attempt_id: Uuid, events: usize },
    /// The attempt ended
    Finished {
        attempt_id: Uuid,
        outcome: DispatchOutcome,
    },
}

/// Result of the locked part of an attempt
struct Sent {
    snapshot: Batch,
    ack: Option<Ack>,
}

struct Unsent {
    snapshot: Batch,
    error: TransportError,
}

/// Delivers the event queue of one application
pub struct Dispatcher<T, P> {
    queue: EventQueue,
    locks: Arc<LockManager>,
    transport: T,
    probe: P,
    lock_name: String,
    progress: broadcast::Sender<DispatchProgress>,
}

impl<T: Transport, P: ReachabilityProbe> Dispatcher<T, P> {
    pub fn new(
        queue: EventQueue,
        locks: Arc<LockManager>,
        transport: T,
        probe: P,
        app_id: &str,
    ) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            queue,
            locks,
            transport,
            probe,
            lock_name: lock_key(app_id),
            progress,
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Store key of the dispatch lock
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Receive progress notifications for subsequent attempts
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchProgress> {
        self.progress.subscribe()
    }

    fn notify(&self, progress: DispatchProgress) {
        // No subscribers is fine
        let _ = self.progress.send(progress);
    }

    /// Run one attempt to completion
    pub async fn dispatch_once(&self) -> DispatchAttempt {
        let id = Uuid::new_v4();
        let pending = self.queue.snapshot();

        if pending.is_empty() {
            tracing::trace!(attempt_id = %id, "Dispatch skipped: queue empty");
            return skipped(id, pending, SkipReason::EmptyQueue);
        }
        if !self.probe.is_reachable() {
            tracing::debug!(
                attempt_id = %id,
                events = pending.len(),
                "Dispatch skipped: network unreachable"
            );
            return skipped(id, pending, SkipReason::Unreachable);
        }

        self.notify(DispatchProgress::Started {
            attempt_id: id,
            events: pending.len(),
        });

        let result = self
            .locks
            .run_exclusive(&self.lock_name, || self.deliver(id))
            .await;

        let (snapshot, outcome) = match result {
            Ok(Sent { snapshot, ack }) => {
                let outcome = match ack {
                    Some(ack) => {
                        tracing::info!(attempt_id = %id, events = ack.events, "Dispatched events");
                        DispatchOutcome::Delivered {
                            events: ack.events,
                            ack,
                        }
                    }
                    None => DispatchOutcome::Skipped(SkipReason::EmptyQueue),
                };
                (snapshot, outcome)
            }
            Err(LockError::Operation(Unsent { snapshot, error })) => {
                let events = snapshot.len();
                let outcome = if error.is_unreached() {
                    tracing::warn!(
                        attempt_id = %id,
                        events,
                        error = %error,
                        "Failed to connect to collector; keeping events"
                    );
                    DispatchOutcome::Retained { events, error }
                } else {
                    tracing::warn!(
                        attempt_id = %id,
                        events,
                        status = error.status,
                        error = %error,
                        "Collector rejected events; discarding batch"
                    );
                    DispatchOutcome::Discarded {
                        events,
                        reason: DiscardReason::Rejected(error),
                    }
                };
                (snapshot, outcome)
            }
            Err(LockError::InProgress { .. }) => {
                tracing::debug!(attempt_id = %id, "Dispatch skipped: already in progress");
                (pending, DispatchOutcome::Skipped(SkipReason::InProgress))
            }
            Err(LockError::InterruptedPreviously { .. }) => {
                let outcome = self.recover(id);
                (pending, outcome)
            }
            Err(LockError::Storage { source, .. }) => {
                tracing::warn!(attempt_id = %id, error = %source, "Dispatch skipped: lock not persisted");
                (pending, DispatchOutcome::Skipped(SkipReason::StorageUnavailable))
            }
        };

        self.notify(DispatchProgress::Finished {
            attempt_id: id,
            outcome: outcome.clone(),
        });

        DispatchAttempt {
            id,
            snapshot,
            outcome,
        }
    }

    /// Locked part of an attempt: snapshot, send, drop what was handled
    async fn deliver(&self, id: Uuid) -> Result<Sent, Unsent> {
        // Re-read under the lock so a batch finished by a racing attempt is not resent
        let snapshot = self.queue.snapshot();
        if snapshot.is_empty() {
            return Ok(Sent {
                snapshot,
                ack: None,
            });
        }

        self.notify(DispatchProgress::Sending {
            attempt_id: id,
            events: snapshot.len(),
        });

        match self.transport.send(&snapshot).await {
            Ok(ack) => {
                self.forget(id, &snapshot);
                Ok(Sent {
                    snapshot,
                    ack: Some(ack),
                })
            }
            Err(error) => {
                if error.is_rejected() {
                    self.forget(id, &snapshot);
                }
                Err(Unsent { snapshot, error })
            }
        }
    }

    fn forget(&self, id: Uuid, snapshot: &Batch) {
        if let Err(e) = self.queue.remove_delivered(snapshot) {
            // The events stay queued and go out again next time
            tracing::warn!(attempt_id = %id, error = %e, "Failed to remove dispatched events");
        }
    }

    /// Recover from an interrupted attempt without sending anything
    ///
    /// Returns `None` when no stale dispatch lock is present.
    pub fn recover_stale(&self) -> Option<DispatchOutcome> {
        if !self.locks.is_stale(&self.lock_name) {
            return None;
        }
        Some(self.recover(Uuid::new_v4()))
    }

    /// Discard the queue and the stale lock after an interrupted attempt
    fn recover(&self, id: Uuid) -> DispatchOutcome {
        let events = self.queue.len();
        tracing::warn!(
            attempt_id = %id,
            events,
            lock = %self.lock_name,
            "Previous dispatch was interrupted; discarding queued events"
        );

        if let Err(e) = self.queue.clear() {
            tracing::warn!(attempt_id = %id, error = %e, "Failed to clear event queue");
        }
        if let Err(e) = self.locks.clear_stale(&self.lock_name) {
            tracing::warn!(attempt_id = %id, error = %e, "Failed to clear stale dispatch lock");
        }

        DispatchOutcome::Discarded {
            events,
            reason: DiscardReason::Recovered,
        }
    }

    /// Send one event immediately, bypassing the queue and the lock
    pub async fn send_direct(&self, collection: &str, event: Event) -> SendResult {
        let mut batch = Batch::new();
        batch.push(collection, event);
        let result = self.transport.send(&batch).await;
        if let Err(e) = &result {
            tracing::warn!(collection, error = %e, "Failed to send event");
        }
        result
    }
}

fn skipped(id: Uuid, snapshot: Batch, reason: SkipReason) -> DispatchAttempt {
    DispatchAttempt {
        id,
        snapshot,
        outcome: DispatchOutcome::Skipped(reason),
    }
}

/// Store key of the dispatch lock for an application
pub fn lock_key(app_id: &str) -> String {
    format!("dispatch_lock::{app_id}")
}
