//! Push fan-out hub
//!
//! Keeps a registry of subscribers, each with a bounded outbound queue.
//! Sends never block: when a subscriber's queue is full the event is dropped
//! for that subscriber, so a slow consumer can never stall the poller. The
//! transport (websocket, SSE, in-process) lives with the subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::alerts::Alert;
use crate::state::StateSnapshot;

/// Default per-subscriber queue depth
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// An event delivered to push subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Event {
    State(Box<StateSnapshot>),
    AlertRaised(Alert),
    AlertResolved(String),
    AlertEscalated { alert: Alert, level: usize },
}

/// One subscriber's receiving half
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Arc<Event>>,
}

/// Broadcast hub for state snapshots and alert events
pub struct Hub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<Event>>>>,
    next_id: AtomicU64,
    dropped: AtomicUsize,
    queue_depth: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl Hub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicUsize::new(0),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .insert(id, tx);
        info!(subscriber = id, "push subscriber connected");
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self
            .subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .remove(&id)
            .is_some()
        {
            info!(subscriber = id, "push subscriber disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .len()
    }

    /// Events dropped because a subscriber queue was full
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn broadcast_state(&self, snapshot: StateSnapshot) {
        self.broadcast(Event::State(Box::new(snapshot)));
    }

    pub fn broadcast_alert(&self, alert: Alert) {
        self.broadcast(Event::AlertRaised(alert));
    }

    pub fn broadcast_alert_resolved(&self, alert_id: String) {
        self.broadcast(Event::AlertResolved(alert_id));
    }

    pub fn broadcast_alert_escalated(&self, alert: Alert, level: usize) {
        self.broadcast(Event::AlertEscalated { alert, level });
    }

    fn broadcast(&self, event: Event) {
        let event = Arc::new(event);
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
            for (id, tx) in subscribers.iter() {
                match tx.try_send(Arc::clone(&event)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Drop-newest: the subscriber keeps its backlog and
                        // misses this event
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(subscriber = id, "subscriber queue full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.lock().expect("subscribers lock poisoned");
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber = id, "removed closed subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StateSnapshot {
        StateSnapshot::default()
    }

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let hub = Hub::default();
        let mut sub = hub.subscribe();

        hub.broadcast_alert_resolved("a-cpu".to_string());

        let event = sub.receiver.recv().await.unwrap();
        match &*event {
            Event::AlertResolved(id) => assert_eq!(id, "a-cpu"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_broadcast() {
        let hub = Hub::new(2);
        let _sub = hub.subscribe();

        // Queue depth is 2; further sends must drop rather than block
        for _ in 0..10 {
            hub.broadcast_state(snapshot());
        }

        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.dropped_count(), 8);
    }

    #[tokio::test]
    async fn disconnected_subscribers_are_pruned() {
        let hub = Hub::default();
        let sub = hub.subscribe();
        assert_eq!(hub.client_count(), 1);

        drop(sub.receiver);
        hub.broadcast_state(snapshot());

        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let hub = Hub::default();
        let sub = hub.subscribe();
        hub.unsubscribe(sub.id);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let hub = Hub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.broadcast_alert_resolved("x-memory".to_string());

        assert!(matches!(&*a.receiver.recv().await.unwrap(), Event::AlertResolved(_)));
        assert!(matches!(&*b.receiver.recv().await.unwrap(), Event::AlertResolved(_)));
    }
}
