//! Append-only job event log and subscriber fan-out (spec §3 "Event",
//! §4.3 "Event emission", §9 "Subscriber fan-out").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// The kinds of facts the manager emits. Ordering per job is strict;
/// global ordering across jobs is not guaranteed (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    Started,
    Progress,
    Paused,
    Resumed,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Completed | EventKind::Failed | EventKind::Cancelled
        )
    }
}

/// One append-only log entry (spec §3, §6 `job_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub job_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub data: Option<Value>,
}

impl Event {
    pub fn new(job_id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Event {
            job_id: job_id.into(),
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A subscriber's receive side (spec §6 `EventHandler`). Consumers
/// (TUI, web front-end) implement `Handle`; the bundled `mpsc`-backed
/// implementation below is what `JobManager::subscribe` hands back.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Event);
}

/// The capacity of a per-subscriber channel (spec §9: bounded,
/// drop-on-full). Chosen generously enough that a UI doing normal work
/// never drops a real event, while still bounding memory if a
/// subscriber stalls entirely.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// One registered subscriber. Delivery is at-most-once: if the channel
/// is full, the event is dropped for that subscriber and a warning is
/// logged; the producer (the manager) never blocks on a slow consumer
/// (spec §4.3, §7).
pub struct Subscription {
    pub(crate) id: u64,
    sender: mpsc::Sender<Event>,
}

impl Subscription {
    pub fn send(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    subscriber = self.id,
                    job_id = %event.job_id,
                    kind = ?event.kind,
                    "dropping event for slow subscriber"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Creates a new bounded subscriber channel, returning the sender-side
/// handle to register with the manager and the receiver a consumer
/// polls.
pub fn subscriber_channel(id: u64) -> (Subscription, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
    (Subscription { id, sender: tx }, rx)
}
