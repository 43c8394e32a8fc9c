#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Run event bus for the Convoy orchestrator.
//!
//! Every apply run emits an ordered sequence of stage events and a terminal
//! result. Consumers (the UI server) subscribe by run id and may reconnect;
//! the bus keeps a bounded replay ring so late subscribers receive the
//! backlog. Internally it uses `tokio::broadcast` with a bounded buffer;
//! overflow drops the oldest events.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;

/// Identifier assigned to each event emitted on the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Progress status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// The stage began executing.
    Started,
    /// The stage completed successfully.
    Ok,
    /// The stage failed.
    Failed,
}

impl StageStatus {
    /// Lowercase string representation used in logs and persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of progress within an apply run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Stage name, e.g. `validate` or `configure.sonarr`.
    pub stage: String,
    /// Status of this emission.
    pub status: StageStatus,
    /// Short human-readable detail.
    #[serde(default)]
    pub detail: Option<String>,
}

impl StageEvent {
    /// Construct a stage event with optional detail.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        status: StageStatus,
        detail: Option<impl Into<String>>,
    ) -> Self {
        Self {
            stage: stage.into(),
            status,
            detail: detail.map(Into::into),
        }
    }

    /// Shorthand for a `started` emission.
    #[must_use]
    pub fn started(stage: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Started, None::<String>)
    }

    /// Shorthand for an `ok` emission.
    #[must_use]
    pub fn ok(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Ok, Some(detail))
    }

    /// Shorthand for a `failed` emission.
    #[must_use]
    pub fn failed(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Failed, Some(detail))
    }
}

/// Events surfaced to run subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A stage event landed on a run.
    Stage {
        /// Run the event belongs to.
        run_id: String,
        /// The stage event itself.
        event: StageEvent,
    },
    /// A run reached its terminal state.
    RunFinished {
        /// Run that finished.
        run_id: String,
        /// Whether the run succeeded.
        ok: bool,
        /// Terminal summary naming the failed stage on failure.
        summary: Option<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for stream consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stage { .. } => "stage",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    /// Run id the event belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Stage { run_id, .. } | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Metadata wrapper tracking the event id and emission timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default replay buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream {
            backlog,
            receiver,
            run_filter: None,
        }
    }

    /// Subscribe to one run's events, replaying any buffered history for it.
    #[must_use]
    pub fn subscribe_run(&self, run_id: &str) -> EventStream {
        let backlog = {
            let buffer = self.lock_buffer();
            buffer
                .iter()
                .filter(|item| item.event.run_id() == run_id)
                .cloned()
                .collect()
        };
        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
            run_filter: Some(run_id.to_string()),
        }
    }

    /// Snapshot of buffered events newer than the supplied identifier.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper yielding events from the replay backlog first, then live.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    run_filter: Option<String>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            let envelope = match self.receiver.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            match &self.run_filter {
                Some(run_id) if envelope.event.run_id() != run_id => {}
                _ => return Some(envelope),
            }
        }
    }
}
