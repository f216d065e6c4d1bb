// Event bus - fan-out of gateway events to SSE subscribers
//
// A single-process publish/subscribe point. Producers (proxy handlers, admin
// handlers, the log tailer) publish typed events; each subscriber owns a
// bounded queue. Publishing never blocks: when a subscriber's queue is full
// the event is dropped for that subscriber only and the overflow is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::events::GatewayEvent;

/// Outbound queue capacity per subscriber
///
/// Sized to absorb bursts of backend log lines without letting one stalled
/// client grow unbounded memory.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 512;

/// A single pre-serialized event, ready to write as an SSE frame
///
/// Serialization happens once per publish; subscribers share the buffer.
#[derive(Debug, Clone)]
pub struct EventFrame {
    /// Wire tag, used as the SSE `event:` name
    pub event: &'static str,
    /// Compact JSON payload (includes the injected timestamp)
    pub data: Arc<str>,
}

impl EventFrame {
    /// Render the frame in SSE wire format
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Handle to the bus; cheap to clone and share across tasks
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<EventFrame>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// A connected SSE client's end of the bus
///
/// Lifetime matches the HTTP connection: dropping the subscriber
/// unregisters it and releases its queue.
pub struct Subscriber {
    pub id: u64,
    rx: mpsc::Receiver<EventFrame>,
    bus: EventBus,
}

impl Subscriber {
    /// Receive the next frame; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every current subscriber
    ///
    /// Synchronous and non-blocking: the event is serialized once, stamped
    /// with the current time, and offered to each queue with `try_send`.
    /// Within a subscriber, delivery order equals publish order.
    pub fn publish(&self, event: &GatewayEvent) {
        let frame = match encode(event) {
            Some(frame) => frame,
            None => return,
        };

        // Snapshot the registry so slow queue offers never hold the lock
        let targets: Vec<(u64, mpsc::Sender<EventFrame>)> = {
            let subscribers = self.inner.subscribers.lock().unwrap();
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        subscriber = id,
                        event = frame.event,
                        "subscriber queue full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }

    /// Register a new subscriber with its own bounded queue
    pub fn subscribe(&self) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().insert(id, tx);
        tracing::debug!(subscriber = id, "debug stream subscriber attached");
        Subscriber {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Remove a subscriber; idempotent
    pub fn unsubscribe(&self, id: u64) {
        if self.inner.subscribers.lock().unwrap().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "debug stream subscriber detached");
        }
    }

    /// Number of currently attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Total events dropped because a subscriber queue was full
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize an event to an SSE-ready frame, injecting the emit timestamp
fn encode(event: &GatewayEvent) -> Option<EventFrame> {
    let mut value = match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::error!("failed to serialize gateway event");
            return None;
        }
    };
    // The tag rides in the SSE `event:` line; the payload carries the rest
    value.remove("type");
    // Stamp the emit time, but never clobber an event's own timestamp
    // (debug_log carries the backend's line timestamp)
    value
        .entry("timestamp".to_string())
        .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));
    let data = serde_json::to_string(&value).ok()?;
    Some(EventFrame {
        event: event.type_name(),
        data: Arc::from(data.as_str()),
    })
}
