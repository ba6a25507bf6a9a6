//! Event types for the callsync event system
//!
//! Provides shared event definitions and EventBus for all callsync modules.

mod batch_types;

pub use batch_types::{AlertKind, RunOutcome, RunTrigger};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingestion event types
///
/// Broadcast via EventBus. The alerting layer and tests subscribe to these;
/// every variant is also written to the structured log by its emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A batch run was created
    RunStarted {
        run_id: Uuid,
        trigger: RunTrigger,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// One call failed inside a run (the run continues)
    CallFailed {
        run_id: Uuid,
        external_call_id: String,
        reason: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A batch run was closed
    RunFinished {
        run_id: Uuid,
        trigger: RunTrigger,
        outcome: RunOutcome,
        processed_count: usize,
        failed_count: usize,
        deadline_exceeded: bool,
        timestamp: DateTime<Utc>,
    },

    /// Operator-facing alert
    Alert {
        kind: AlertKind,
        run_id: Option<Uuid>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Thin wrapper over `tokio::sync::broadcast`. Slow subscribers lose the
/// oldest events once `capacity` is exceeded.
///
/// # Examples
///
/// ```
/// use callsync_common::events::{EventBus, IngestEvent, AlertKind};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(IngestEvent::Alert {
///     kind: AlertKind::SchedulerSilence,
///     run_id: None,
///     message: "no daily run in 26h".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(IngestEvent::Alert { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
