//! In-process publish/subscribe hub.
//!
//! Delivery is at-most-once with no replay: a subscriber only sees events
//! published after it subscribed. Each subscriber owns an unbounded queue that
//! `publish` fills synchronously, so events of one kind reach a subscriber in
//! the order they were published. Handlers run on their own Tokio task; an
//! error or panic in one handler is logged and does not affect other
//! subscribers or later events.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::types::{CycleStats, ProcessingProgress, Stage, StatusType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SetupProgress,
    SetupComplete,
    SourceChanged,
}

/// Progress of the running indexing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupProgress {
    pub stage: Stage,
    pub status_type: StatusType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CycleStats>,
}

/// Terminal outcome of an indexing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupComplete {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CycleStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SetupProgress(SetupProgress),
    SetupComplete(SetupComplete),
    /// The note source was modified and has been quiet for the debounce window.
    SourceChanged { observed_at: i64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SetupProgress(_) => EventKind::SetupProgress,
            Event::SetupComplete(_) => EventKind::SetupComplete,
            Event::SourceChanged { .. } => EventKind::SourceChanged,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Subscriber>>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheap to clone; all clones share the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by `subscribe`. Dropping it keeps the subscription alive.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Stop delivery. Events already queued for this subscriber are still handled.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some(list) = bus.subscribers().get_mut(&self.kind) {
                list.retain(|s| s.id != self.id);
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` for every event of `kind` published from now on.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        let (subscription, mut rx) = self.subscribe_channel(kind);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(?kind, "Event handler failed: {e:#}"),
                    Err(_) => error!(?kind, "Event handler panicked"),
                }
            }
        });
        subscription
    }

    /// Receive events of `kind` on a channel instead of through a handler.
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
    ) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, tx });
        let subscription = Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        };
        (subscription, rx)
    }

    /// Enqueue `event` for every current subscriber of its kind.
    /// Returns how many subscribers it was delivered to.
    pub fn publish(&self, event: Event) -> usize {
        let mut subscribers = self.inner.subscribers();
        let Some(list) = subscribers.get_mut(&event.kind()) else {
            return 0;
        };
        // Receivers that went away are pruned here.
        list.retain(|s| s.tx.send(event.clone()).is_ok());
        list.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.subscribers().get(&kind).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn changed(n: i64) -> Event {
        Event::SourceChanged { observed_at: n }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<i64>) -> i64 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn handler_sees_events_in_publish_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe(EventKind::SourceChanged, move |event| {
            if let Event::SourceChanged { observed_at } = event {
                tx.send(*observed_at)?;
            }
            Ok(())
        });

        for i in 0..100 {
            bus.publish(changed(i));
        }
        for i in 0..100 {
            assert_eq!(recv(&mut rx).await, i);
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others_or_later_events() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (bad_tx, mut bad_rx) = mpsc::unbounded_channel();

        let _bad = bus.subscribe(EventKind::SourceChanged, move |event| {
            let Event::SourceChanged { observed_at } = event else {
                return Ok(());
            };
            bad_tx.send(*observed_at)?;
            if *observed_at == 1 {
                panic!("handler blew up");
            }
            anyhow::bail!("handler always fails")
        });
        let _good = bus.subscribe(EventKind::SourceChanged, move |event| {
            if let Event::SourceChanged { observed_at } = event {
                tx.send(*observed_at)?;
            }
            Ok(())
        });

        bus.publish(changed(1));
        bus.publish(changed(2));

        assert_eq!(recv(&mut rx).await, 1);
        assert_eq!(recv(&mut rx).await, 2);
        assert_eq!(recv(&mut bad_rx).await, 1);
        assert_eq!(recv(&mut bad_rx).await, 2);
    }

    #[tokio::test]
    async fn events_are_routed_by_kind() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(EventKind::SetupComplete);

        assert_eq!(bus.publish(changed(1)), 0);
        let complete = Event::SetupComplete(SetupComplete {
            success: true,
            stats: None,
            error: None,
        });
        assert_eq!(bus.publish(complete.clone()), 1);

        assert_eq!(rx.recv().await, Some(complete));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        bus.publish(changed(1));

        let (_sub, mut rx) = bus.subscribe_channel(EventKind::SourceChanged);
        assert!(rx.try_recv().is_err());

        bus.publish(changed(2));
        assert_eq!(rx.recv().await, Some(changed(2)));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (sub, mut rx) = bus.subscribe_channel(EventKind::SourceChanged);
        assert_eq!(bus.subscriber_count(EventKind::SourceChanged), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(EventKind::SourceChanged), 0);
        assert_eq!(bus.publish(changed(1)), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe_channel(EventKind::SourceChanged);
        drop(rx);

        assert_eq!(bus.publish(changed(1)), 0);
        assert_eq!(bus.subscriber_count(EventKind::SourceChanged), 0);
    }

    #[test]
    fn progress_serializes_in_camel_case() {
        let progress = SetupProgress {
            stage: Stage::Processing,
            status_type: StatusType::ProcessingNotes,
            processing: Some(ProcessingProgress {
                current_note: Some("Groceries".to_string()),
                processed_notes: 2,
                total_notes: 5,
            }),
            stats: None,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["stage"], "processing");
        assert_eq!(json["statusType"], "processing_notes");
        assert_eq!(json["processing"]["processedNotes"], 2);
        assert_eq!(json["processing"]["currentNote"], "Groceries");
        assert!(json.get("stats").is_none());
    }
}
