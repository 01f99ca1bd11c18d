//! Process-local fan-out of job lifecycle and progress events.
//!
//! Subscribers get their own unbounded channel; publish is best-effort and
//! per-subscriber FIFO. A subscriber whose channel is closed (client gone) is
//! pruned on the next publish. Envelopes serialize as `{type, payload}` for
//! the push channel.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::distributor::FollowerSnapshot;
use crate::store::types::{Job, JobId, StatusCounts};

/// Event envelope delivered to subscribed clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "job:created")]
    JobCreated(Job),
    #[serde(rename = "job:updated")]
    JobUpdated(Job),
    #[serde(rename = "job:progress")]
    #[serde(rename_all = "camelCase")]
    JobProgress {
        job_id: JobId,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        frame: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
    },
    #[serde(rename = "status-counts")]
    StatusCounts(StatusCounts),
    #[serde(rename = "jobs:cleared")]
    JobsCleared {},
    #[serde(rename = "followers:status")]
    FollowersStatus { followers: Vec<FollowerSnapshot> },
}

/// A live subscription; events arrive on `rx` in publish order.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Event>,
}

/// Fan-out bus. Cheap to share behind an `Arc`; locking is per-operation and
/// never held across an await.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The greeting envelope is queued immediately.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Event::Connected {
            message: "subscribed to job events".to_string(),
        });
        self.subscribers.lock().unwrap().insert(id, tx);
        Subscription { id, rx }
    }

    /// Remove a subscriber explicitly (the publish path also prunes closed ones).
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Deliver an event to every live subscriber, dropping any whose channel
    /// has closed.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::StatusCounts;

    fn progress(job_id: JobId, progress: f64) -> Event {
        Event::JobProgress { job_id, progress, frame: None, fps: None }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(progress(1, 10.0));
        bus.publish(progress(1, 20.0));

        assert!(matches!(sub.rx.recv().await.unwrap(), Event::Connected { .. }));
        assert!(matches!(sub.rx.recv().await.unwrap(), Event::JobProgress { progress, .. } if progress == 10.0));
        assert!(matches!(sub.rx.recv().await.unwrap(), Event::JobProgress { progress, .. } if progress == 20.0));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let mut live = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        bus.publish(progress(1, 50.0));
        assert_eq!(bus.subscriber_count(), 1);

        assert!(matches!(live.rx.recv().await.unwrap(), Event::Connected { .. }));
        assert!(matches!(live.rx.recv().await.unwrap(), Event::JobProgress { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_removes_channel() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn envelopes_serialize_with_type_and_payload() {
        let json = serde_json::to_value(progress(7, 42.5)).unwrap();
        assert_eq!(json["type"], "job:progress");
        assert_eq!(json["payload"]["jobId"], 7);
        assert_eq!(json["payload"]["progress"], 42.5);

        let json = serde_json::to_value(Event::StatusCounts(StatusCounts {
            pending: 1,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(json["type"], "status-counts");
        assert_eq!(json["payload"]["pending"], 1);

        let json = serde_json::to_value(Event::JobsCleared {}).unwrap();
        assert_eq!(json["type"], "jobs:cleared");
    }
}
