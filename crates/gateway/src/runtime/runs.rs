//! Active-run registry and SSE fan-out.
//!
//! The producer task owns the agent event stream and pushes into a set of
//! bounded per-subscriber queues. A full queue drops its oldest entry and
//! retries once — the producer never blocks on a slow reader. Subscribers
//! that disconnect simply remove their queue; the producer runs to `done`
//! or `error` regardless, then closes every queue with a sentinel and
//! removes the run from the map.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use warren_domain::stream::AgentEvent;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 512;

/// One subscriber's bounded event queue. `None` is the close sentinel.
pub struct SubscriberQueue {
    queue: parking_lot::Mutex<VecDeque<Option<AgentEvent>>>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue, dropping the oldest entry on saturation.
    fn push(&self, item: Option<AgentEvent>) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_waiters();
    }

    /// Next event; `None` means the run finished and the queue is closed.
    pub async fn next(&self) -> Option<AgentEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.queue.lock().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// A run currently streaming for one `(agent_id, session_id)`.
pub struct ActiveRun {
    pub agent_id: String,
    pub session_id: String,
    pub message: String,
    subscribers: parking_lot::Mutex<Vec<Arc<SubscriberQueue>>>,
}

impl ActiveRun {
    pub fn subscribe(&self) -> Arc<SubscriberQueue> {
        let queue = Arc::new(SubscriberQueue::new(SUBSCRIBER_QUEUE_CAPACITY));
        self.subscribers.lock().push(queue.clone());
        queue
    }

    /// A subscriber leaving never cancels the producer.
    pub fn unsubscribe(&self, queue: &Arc<SubscriberQueue>) {
        self.subscribers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, queue));
    }

    fn fan_out(&self, event: &AgentEvent) {
        for queue in self.subscribers.lock().iter() {
            queue.push(Some(event.clone()));
        }
    }

    fn close_all(&self) {
        let mut subscribers = self.subscribers.lock();
        for queue in subscribers.iter() {
            queue.push(None);
        }
        subscribers.clear();
    }
}

/// Process-wide map of active runs keyed by `(agent_id, session_id)`.
#[derive(Default)]
pub struct RunMap {
    inner: tokio::sync::Mutex<HashMap<(String, String), Arc<ActiveRun>>>,
}

impl RunMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, agent_id: &str, session_id: &str) -> Option<Arc<ActiveRun>> {
        self.inner
            .lock()
            .await
            .get(&(agent_id.to_string(), session_id.to_string()))
            .cloned()
    }

    /// Register a run and spawn the forwarder that owns its event stream.
    /// The forwarder runs until the producer hangs up, then closes every
    /// subscriber and removes the run.
    pub async fn begin(
        self: Arc<Self>,
        agent_id: &str,
        session_id: &str,
        message: &str,
        mut events: mpsc::Receiver<AgentEvent>,
    ) -> Arc<ActiveRun> {
        let key = (agent_id.to_string(), session_id.to_string());
        let run = Arc::new(ActiveRun {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            message: message.to_string(),
            subscribers: parking_lot::Mutex::new(Vec::new()),
        });
        self.inner.lock().await.insert(key.clone(), run.clone());

        let map = self;
        let forwarded = run.clone();
        tokio::spawn(async move {
            // Drain until the producer closes its channel: trailing events
            // after `done` (e.g. `title`) still reach subscribers.
            while let Some(event) = events.recv().await {
                forwarded.fan_out(&event);
            }
            forwarded.close_all();
            map.inner.lock().await.remove(&key);
        });
        run
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
