#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![allow(clippy::module_name_repetitions)]

//! Core event bus for the Fetcharr pipeline.
//!
//! The bus provides a typed event enum, sequential identifiers, and support
//! for replaying recent events when subscribers reconnect (e.g. SSE clients
//! that supply `Last-Event-ID`). Internally it uses `tokio::broadcast` with a
//! bounded buffer; when the channel overflows, the oldest events are dropped,
//! matching the desired backpressure behaviour.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;
use uuid::Uuid;

/// Identifier assigned to each event emitted by the pipeline.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Position of a processing item within the pipeline state machine.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Item is queued and waiting for the search worker.
    Pending,
    /// Search worker is querying indexers for releases.
    Searching,
    /// A release (or existing download) has been selected.
    Found,
    /// A release exists but the item is cooling down before re-search.
    Discovered,
    /// Torrent client is fetching the payload.
    Downloading,
    /// Payload is on disk and the source file has been resolved.
    Downloaded,
    /// Encoder pool is transcoding the source.
    Encoding,
    /// Encoded artifact exists at its deterministic path.
    Encoded,
    /// Delivery fan-out to target servers is in progress.
    Delivering,
    /// Every target server received the artifact.
    Completed,
    /// Item failed terminally; retryable only by operator action.
    Failed,
    /// Item was cancelled by the caller.
    Cancelled,
}

impl ItemStatus {
    /// Machine-friendly label used in persistence and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Searching => "searching",
            Self::Found => "found",
            Self::Discovered => "discovered",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Encoding => "encoding",
            Self::Encoded => "encoded",
            Self::Delivering => "delivering",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted label back into a status.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        Some(match label {
            "pending" => Self::Pending,
            "searching" => Self::Searching,
            "found" => Self::Found,
            "discovered" => Self::Discovered,
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "encoding" => Self::Encoding,
            "encoded" => Self::Encoded,
            "delivering" => Self::Delivering,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Whether the status is terminal; terminal items are never polled again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a dedicated worker monitors items holding this status.
    ///
    /// Processing statuses are preserved on retryable errors so the owning
    /// worker re-claims the item once its retry gate elapses.
    #[must_use]
    pub const fn is_processing(self) -> bool {
        matches!(self, Self::Downloading | Self::Encoding | Self::Delivering)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed domain events surfaced across the pipeline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A request was created with its initial set of items.
    RequestCreated {
        /// Identifier of the created request.
        request_id: Uuid,
        /// Number of items fanned out for the request.
        item_count: usize,
    },
    /// An item moved to a new status.
    StatusChanged {
        /// Identifier of the item whose status changed.
        item_id: Uuid,
        /// Owning request identifier.
        request_id: Uuid,
        /// Status the item held before the transition.
        from: ItemStatus,
        /// Status the item holds now.
        to: ItemStatus,
    },
    /// Stage progress for an item changed.
    StageProgress {
        /// Identifier of the item reporting progress.
        item_id: Uuid,
        /// Status the item currently holds.
        status: ItemStatus,
        /// Completion percentage (0-100).
        progress: u8,
    },
    /// A retry or skip gate was scheduled for an item.
    RetryScheduled {
        /// Identifier of the gated item.
        item_id: Uuid,
        /// Whether the gate is a skip-until (no attempt consumed).
        skip: bool,
        /// Instant at which the item becomes eligible again.
        eligible_at: DateTime<Utc>,
        /// Classified error kind that triggered the gate.
        kind: String,
    },
    /// An item failed terminally.
    ItemFailed {
        /// Identifier of the failed item.
        item_id: Uuid,
        /// Human-readable failure description.
        message: String,
    },
    /// An item completed delivery to every target server.
    ItemCompleted {
        /// Identifier of the completed item.
        item_id: Uuid,
    },
    /// A single server delivery finished for an item.
    DeliveryCompleted {
        /// Identifier of the delivered item.
        item_id: Uuid,
        /// Target server that received the artifact.
        server_id: Uuid,
    },
    /// A single server delivery failed; the checkpoint records it for retry.
    DeliveryFailed {
        /// Identifier of the item whose delivery failed.
        item_id: Uuid,
        /// Target server that rejected the transfer.
        server_id: Uuid,
        /// Human-readable error detail.
        message: String,
    },
    /// Worker health status changed (degraded or restored components).
    HealthChanged {
        /// Components currently considered degraded.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for SSE consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "request_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::StageProgress { .. } => "stage_progress",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::ItemFailed { .. } => "item_failed",
            Self::ItemCompleted { .. } => "item_completed",
            Self::DeliveryCompleted { .. } => "delivery_completed",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
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
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
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
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
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

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
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
        EventStream { backlog, receiver }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Returns the last assigned identifier, if any events have been published.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
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

/// Stream wrapper that yields events either from the replay backlog or from
/// the live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn status_labels_round_trip() {
        let all = [
            ItemStatus::Pending,
            ItemStatus::Searching,
            ItemStatus::Found,
            ItemStatus::Discovered,
            ItemStatus::Downloading,
            ItemStatus::Downloaded,
            ItemStatus::Encoding,
            ItemStatus::Encoded,
            ItemStatus::Delivering,
            ItemStatus::Completed,
            ItemStatus::Failed,
            ItemStatus::Cancelled,
        ];
        for status in all {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_and_processing_partitions() {
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Cancelled.is_terminal());
        assert!(!ItemStatus::Delivering.is_terminal());

        assert!(ItemStatus::Downloading.is_processing());
        assert!(ItemStatus::Encoding.is_processing());
        assert!(ItemStatus::Delivering.is_processing());
        assert!(!ItemStatus::Searching.is_processing());
        assert!(!ItemStatus::Pending.is_processing());
    }

    #[test]
    fn event_kinds_cover_all_variants() {
        let item_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let server_id = Uuid::new_v4();
        let events = [
            Event::RequestCreated {
                request_id,
                item_count: 3,
            },
            Event::StatusChanged {
                item_id,
                request_id,
                from: ItemStatus::Pending,
                to: ItemStatus::Searching,
            },
            Event::StageProgress {
                item_id,
                status: ItemStatus::Downloading,
                progress: 42,
            },
            Event::RetryScheduled {
                item_id,
                skip: true,
                eligible_at: Utc::now(),
                kind: "service_unavailable".to_string(),
            },
            Event::ItemFailed {
                item_id,
                message: "disk full".to_string(),
            },
            Event::ItemCompleted { item_id },
            Event::DeliveryCompleted { item_id, server_id },
            Event::DeliveryFailed {
                item_id,
                server_id,
                message: "timeout".to_string(),
            },
            Event::HealthChanged { degraded: vec![] },
        ];

        let kinds: Vec<_> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds.len(), 9);
        for window in kinds.windows(2) {
            assert_ne!(window[0], window[1]);
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_events() {
        let bus = EventBus::with_capacity(8);
        let mut stream = bus.subscribe(None);

        let item_id = Uuid::new_v4();
        bus.publish(Event::ItemCompleted { item_id });

        let envelope = timeout(PUBLISH_TIMEOUT, stream.next())
            .await
            .expect("event within timeout")
            .expect("stream open");
        assert_eq!(envelope.event, Event::ItemCompleted { item_id });
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_after_reconnect() {
        let bus = EventBus::with_capacity(8);
        let first = bus.publish(Event::HealthChanged { degraded: vec![] });
        bus.publish(Event::HealthChanged {
            degraded: vec!["indexer".to_string()],
        });

        let mut stream = bus.subscribe(Some(first));
        let replayed = timeout(PUBLISH_TIMEOUT, stream.next())
            .await
            .expect("replayed event within timeout")
            .expect("stream open");
        assert_eq!(
            replayed.event,
            Event::HealthChanged {
                degraded: vec!["indexer".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn replay_ring_drops_oldest_events() {
        let bus = EventBus::with_capacity(2);
        let first = bus.publish(Event::HealthChanged { degraded: vec![] });
        bus.publish(Event::HealthChanged {
            degraded: vec!["a".to_string()],
        });
        bus.publish(Event::HealthChanged {
            degraded: vec!["b".to_string()],
        });

        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 2);
        assert_eq!(bus.last_event_id(), Some(first + 2));
    }
}
