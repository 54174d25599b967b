//! Session event fan-out.
//!
//! Data and status events published by backing processes are delivered to
//! every subscriber over its own unbounded channel. Each publisher sends
//! sequentially, so per-session order is preserved; no order is defined
//! across sessions. Closed subscribers are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use protocol::SessionEvent;
use tokio::sync::mpsc;

/// Identifier handed out to each subscriber.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Cloneable handle to the shared subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its receiving end.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, tx });
        tracing::debug!(subscriber_id = id, "Event subscriber added");
        (id, rx)
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Delivers an event to every live subscriber.
    pub fn publish(&self, event: SessionEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut stale = false;
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for subscriber in subscribers.iter() {
                if subscriber.tx.send(event.clone()).is_err() {
                    stale = true;
                }
            }
        }

        if stale {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| {
                let open = !s.tx.is_closed();
                if !open {
                    tracing::debug!(subscriber_id = s.id, "Event subscriber closed");
                }
                open
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Total number of events published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TerminalStatus;

    fn data(id: &str, bytes: &[u8]) -> SessionEvent {
        SessionEvent::Data {
            terminal_id: id.to_string(),
            data: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let bus = EventBus::new();
        let (_, mut rx1) = bus.subscribe();
        let (_, mut rx2) = bus.subscribe();

        bus.publish(data("t1", b"a"));
        bus.publish(data("t1", b"b"));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap(), data("t1", b"a"));
            assert_eq!(rx.recv().await.unwrap(), data("t1", b"b"));
        }
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let (_, rx1) = bus.subscribe();
        let (_, mut rx2) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        bus.publish(SessionEvent::Status {
            terminal_id: "t1".to_string(),
            status: TerminalStatus::Exited,
            exit_code: Some(0),
        });

        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(data("t1", b"x"));
        assert_eq!(bus.published_count(), 1);
    }
}
