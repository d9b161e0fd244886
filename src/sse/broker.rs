//! Broadcast core for the SSE broker: a single long-lived task drains a
//! publish channel and fans each event out to every subscriber's bounded
//! queue, evicting whichever subscriber couldn't keep up. Mirrors this
//! codebase's dedicated background-task-plus-shared-map idiom (the async
//! log sink's channel-fed writer task), generalized to a fan-out of many
//! receivers instead of one.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

const PUBLISH_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            id: None,
            retry: None,
        }
    }
}

pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Default)]
pub struct SubscribeOptions {
    pub buffer_size: Option<usize>,
    pub filter: Option<Filter>,
}

impl SubscribeOptions {
    pub fn with_buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = Some(n);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug)]
pub enum PublishOutcome {
    Ok,
    BufferFull,
}

struct Subscriber {
    tx: mpsc::Sender<Arc<Event>>,
    filter: Option<Filter>,
    closed: Arc<AtomicBool>,
    last_active: Arc<AtomicI64>,
}

/// A subscriber's receiving half plus a cleanup closure. Calling `cleanup`
/// after the broker has already removed this subscription (shutdown or
/// eviction) is a safe no-op.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Arc<Event>>,
    broker: Arc<BrokerInner>,
}

impl Subscription {
    pub fn cleanup(&self) {
        self.broker.subscribers.remove(&self.id);
    }
}

struct BrokerInner {
    subscribers: DashMap<Uuid, Subscriber>,
    publish_tx: mpsc::Sender<Event>,
    max_clients: usize,
    admission_lock: Mutex<()>,
}

/// Fan-out publish/subscribe broker. `start` spawns the broadcast loop;
/// `stop` cancels it and waits (bounded) for it to drain.
pub struct Broker {
    inner: Arc<BrokerInner>,
    publish_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    shutdown_timeout: Duration,
}

impl Broker {
    pub fn new(max_clients: usize, shutdown_timeout: Duration) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
        let inner = Arc::new(BrokerInner {
            subscribers: DashMap::new(),
            publish_tx,
            max_clients,
            admission_lock: Mutex::new(()),
        });
        Self {
            inner,
            publish_rx: Mutex::new(Some(publish_rx)),
            task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            shutdown_timeout,
        }
    }

    /// Begins the broadcast loop. Idempotent only before the broker has
    /// ever been started; calling it again after `stop` does not resume.
    pub async fn start(&self) {
        let mut rx_guard = self.publish_rx.lock().await;
        let Some(mut publish_rx) = rx_guard.take() else {
            return;
        };
        drop(rx_guard);

        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = publish_rx.recv() => {
                        match event {
                            Some(event) => broadcast_one(&inner, event).await,
                            None => break,
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Cancels all subscriptions, closes every queue, and waits up to
    /// `shutdown_timeout` for the broadcast loop to finish the event it is
    /// currently processing. Returns regardless of whether the deadline
    /// elapsed; in-flight subscribers may observe abrupt closure.
    ///
    /// The loop is parked in `recv().await` on a channel whose sender lives
    /// inside the same `Arc<BrokerInner>` the task holds, so the channel
    /// never closes on its own — `notified()` is what actually wakes it.
    pub async fn stop(&self) {
        self.shutdown.notify_one();

        if let Some(handle) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(self.shutdown_timeout, handle).await;
        }

        self.inner.subscribers.clear();
    }

    /// Non-blocking publish. Returns `BufferFull` immediately (dropping the
    /// event) if the publish channel is saturated; the system is
    /// intentionally lossy for real-time distribution.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        match self.inner.publish_tx.try_send(event) {
            Ok(()) => PublishOutcome::Ok,
            Err(_) => PublishOutcome::BufferFull,
        }
    }

    /// Registers a subscription unless `max_clients` is already reached, in
    /// which case `None` is returned — callers that only have a bare
    /// channel to hand a caller (outside this in-process API) instead close
    /// it immediately so the caller observes an empty, disconnected channel
    /// on first read. The admission check and insertion are atomic under an
    /// exclusive lock.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Option<Subscription> {
        let _guard = self.inner.admission_lock.lock().await;
        if self.inner.subscribers.len() >= self.inner.max_clients {
            return None;
        }

        let id = Uuid::new_v4();
        let buffer_size = options.buffer_size.unwrap_or(DEFAULT_SUBSCRIBER_BUFFER);
        let (tx, rx) = mpsc::channel(buffer_size);

        self.inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter: options.filter,
                closed: Arc::new(AtomicBool::new(false)),
                last_active: Arc::new(AtomicI64::new(0)),
            },
        );

        Some(Subscription {
            id,
            receiver: rx,
            broker: self.inner.clone(),
        })
    }

    pub fn client_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

async fn broadcast_one(inner: &Arc<BrokerInner>, event: Event) {
    let event = Arc::new(event);
    let snapshot: Vec<(Uuid, mpsc::Sender<Arc<Event>>, Option<Filter>)> = inner
        .subscribers
        .iter()
        .map(|entry| (*entry.key(), entry.value().tx.clone(), entry.value().filter.clone()))
        .collect();

    let mut to_evict = Vec::new();
    for (id, tx, filter) in snapshot {
        if let Some(filter) = &filter {
            if !filter(&event) {
                // A filtered-out event still counts as "sent" — it never
                // contributes to backpressure eviction.
                continue;
            }
        }
        if tx.try_send(event.clone()).is_err() {
            to_evict.push(id);
        }
    }

    for id in to_evict {
        if let Some((_, subscriber)) = inner.subscribers.remove(&id) {
            subscriber.closed.store(true, Ordering::Release);
            log::warn!("evicting slow SSE subscriber {id}");
            // Dropping `subscriber.tx` here closes the channel exactly once.
        }
    }
}
