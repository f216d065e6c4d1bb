// Control client - persistent session to the backend's control channel
//
// Model load/unload and listing go over a WebSocket rather than the OpenAI
// HTTP surface. The gateway keeps one logical session shared by every
// caller: a reader task routes reply frames to waiters by request id, so
// listing and health calls can overlap on one connection. Load and unload
// hold the write side of an operation lock; listing and health share the
// read side, so they run in parallel with each other but wait for any
// active load/unload. The session connects on first use, validates itself
// with a listing call, retries a fixed number of times, and is thrown away
// on any channel failure so the next caller reconnects.

pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub use protocol::{DownloadedModel, GpuConfig, LoadConfig, LoadedModel};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by control channel operations
#[derive(Debug, Error)]
pub enum ControlError {
    /// Connect attempts exhausted; the admin surface maps this to 503
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// I/O or protocol failure on an established session
    #[error("control channel error: {0}")]
    Channel(String),

    /// The backend answered with an error for this operation
    #[error("backend rejected {op}: {reason}")]
    Rejected { op: String, reason: String },

    /// Unload target is not among the loaded models
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("{op} timed out after {}s", timeout.as_secs())]
    Timeout { op: String, timeout: Duration },
}

impl ControlError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Reply channels for in-flight requests, keyed by request id
type PendingReplies = std::sync::Mutex<HashMap<u64, mpsc::UnboundedSender<protocol::ReplyFrame>>>;

/// One established session: a shared writer plus a reader task that routes
/// reply frames to waiting callers by request id
///
/// Calls never hold a lock across their round trip, so any number of them
/// can be outstanding on the one connection at a time.
struct Session {
    /// Held only while sending a single frame
    writer: Arc<Mutex<WsSink>>,
    pending: Arc<PendingReplies>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Session {
    /// Start a session over an established socket, spawning its reader
    fn start(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        let writer = Arc::new(Mutex::new(sink));
        let pending: Arc<PendingReplies> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// One request/reply round trip
    ///
    /// `on_progress` receives interim progress frames for long operations.
    async fn call(
        &self,
        op: &str,
        params: Value,
        timeout: Duration,
        mut on_progress: Option<&mut (dyn FnMut(f64) + Send)>,
    ) -> Result<Value, ControlError> {
        if !self.is_alive() {
            return Err(ControlError::Channel("session closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().insert(id, reply_tx);

        let frame = protocol::RequestFrame { id, op, params };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(ControlError::Channel(e.to_string()));
            }
        };

        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Text(text)).await
        };
        if let Err(e) = sent {
            self.pending.lock().unwrap().remove(&id);
            return Err(ControlError::Channel(e.to_string()));
        }

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match reply_rx.recv().await {
                    Some(reply) if reply.is_progress() => {
                        if let (Some(callback), Some(progress)) =
                            (on_progress.as_mut(), reply.progress)
                        {
                            callback(progress);
                        }
                    }
                    Some(reply) => {
                        return match reply.error {
                            Some(reason) => Err(ControlError::Rejected {
                                op: op.to_string(),
                                reason,
                            }),
                            None => Ok(reply.result),
                        };
                    }
                    // Reader swept the pending map: the connection died
                    None => return Err(ControlError::Channel("backend closed the session".into())),
                }
            }
        })
        .await;

        self.pending.lock().unwrap().remove(&id);
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout {
                op: op.to_string(),
                timeout,
            }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route inbound frames to their waiting callers; answer pings; on
/// connection death, sweep the pending map so every waiter errors out
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    writer: Arc<Mutex<WsSink>>,
    pending: Arc<PendingReplies>,
    alive: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(reply) = serde_json::from_str::<protocol::ReplyFrame>(&text) else {
                    tracing::debug!("ignoring unparseable control frame");
                    continue;
                };
                let mut map = pending.lock().unwrap();
                if reply.is_progress() {
                    if let Some(tx) = map.get(&reply.id) {
                        let _ = tx.send(reply);
                    }
                } else if let Some(tx) = map.remove(&reply.id) {
                    let _ = tx.send(reply);
                }
            }
            Ok(Message::Ping(payload)) => {
                let mut writer = writer.lock().await;
                if writer.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    alive.store(false, Ordering::Relaxed);
    // Dropping the senders wakes every waiter with a channel error
    pending.lock().unwrap().clear();
}

/// Shared handle to the backend control channel
pub struct ControlClient {
    url: String,
    /// The one logical session; locked only long enough to clone or replace
    session: Mutex<Option<Arc<Session>>>,
    /// Load/unload hold the write side; listing and health share the read side
    op_lock: RwLock<()>,
}

impl ControlClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            session: Mutex::new(None),
            op_lock: RwLock::new(()),
        }
    }

    /// List loaded and downloaded models
    pub async fn list_models(
        &self,
    ) -> Result<(Vec<LoadedModel>, Vec<DownloadedModel>), ControlError> {
        let _op = self.op_lock.read().await;

        let loaded = self
            .call("list_loaded", Value::Null, LIST_TIMEOUT, None)
            .await?;
        let downloaded = self
            .call("list_downloaded", Value::Null, LIST_TIMEOUT, None)
            .await?;

        let loaded: Vec<LoadedModel> =
            serde_json::from_value(loaded).map_err(|e| ControlError::Channel(e.to_string()))?;
        let downloaded: Vec<DownloadedModel> =
            serde_json::from_value(downloaded).map_err(|e| ControlError::Channel(e.to_string()))?;
        Ok((loaded, downloaded))
    }

    /// Load a model; at most one load/unload runs at a time
    ///
    /// `on_progress` fires for each interim progress frame (0-100).
    pub async fn load_model(
        &self,
        model_key: &str,
        instance_id: Option<&str>,
        load_config: Option<&LoadConfig>,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<(), ControlError> {
        let _op = self.op_lock.write().await;

        let mut params = json!({ "path": model_key });
        if let Some(id) = instance_id {
            params["identifier"] = json!(id);
        }
        if let Some(config) = load_config {
            params["config"] =
                serde_json::to_value(config).map_err(|e| ControlError::Channel(e.to_string()))?;
        }

        self.call("load", params, LOAD_TIMEOUT, Some(&mut on_progress))
            .await?;
        Ok(())
    }

    /// Unload a model, resolving the target against the loaded list
    ///
    /// Returns the identifier of the instance that was unloaded.
    pub async fn unload_model(
        &self,
        model_key: &str,
        instance_id: Option<&str>,
    ) -> Result<String, ControlError> {
        let _op = self.op_lock.write().await;

        let loaded = self
            .call("list_loaded", Value::Null, LIST_TIMEOUT, None)
            .await?;
        let loaded: Vec<LoadedModel> =
            serde_json::from_value(loaded).map_err(|e| ControlError::Channel(e.to_string()))?;

        let target = protocol::resolve_unload(&loaded, model_key, instance_id)
            .ok_or_else(|| ControlError::NotFound(model_key.to_string()))?;
        let identifier = target.identifier.clone();

        self.call(
            "unload",
            json!({ "identifier": identifier }),
            UNLOAD_TIMEOUT,
            None,
        )
        .await?;
        Ok(identifier)
    }

    /// Cheap liveness probe; a failed probe invalidates the session
    pub async fn health(&self) -> bool {
        let _op = self.op_lock.read().await;
        self.call("list_loaded", Value::Null, HEALTH_TIMEOUT, None)
            .await
            .is_ok()
    }

    /// Run one call on the shared session, dialing one if needed
    async fn call(
        &self,
        op: &str,
        params: Value,
        timeout: Duration,
        on_progress: Option<&mut (dyn FnMut(f64) + Send)>,
    ) -> Result<Value, ControlError> {
        let session = self.session().await?;

        match session.call(op, params, timeout, on_progress).await {
            Ok(result) => Ok(result),
            Err(err @ (ControlError::Channel(_) | ControlError::Timeout { .. })) => {
                // Hard I/O failure: drop the session so the next call reconnects
                tracing::warn!(op, error = %err, "control session invalidated");
                self.invalidate(&session).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Get the live session, connecting if there is none
    ///
    /// The slot lock is held across the connect, so concurrent callers
    /// share a single in-flight attempt; once a session exists the lock is
    /// only held long enough to clone the handle.
    async fn session(&self) -> Result<Arc<Session>, ControlError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                return Ok(Arc::clone(session));
            }
            *guard = None;
        }

        let session = Arc::new(self.connect().await?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Clear the stored session if it is still the one that failed
    async fn invalidate(&self, failed: &Arc<Session>) {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, failed) {
                *guard = None;
            }
        }
    }

    /// Dial the control channel, validating each attempt with a listing call
    async fn connect(&self) -> Result<Session, ControlError> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=CONNECT_ATTEMPTS {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    let session = Session::start(ws);
                    match session
                        .call("list_loaded", Value::Null, LIST_TIMEOUT, None)
                        .await
                    {
                        Ok(_) => {
                            tracing::info!(url = %self.url, "control channel connected");
                            return Ok(session);
                        }
                        // Session dropped here, aborting its reader
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < CONNECT_ATTEMPTS {
                tracing::warn!(
                    attempt,
                    error = %last_error,
                    "control channel connect failed, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        Err(ControlError::BackendUnavailable(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal fake backend: answers list/load/unload frames over WS
    async fn spawn_fake_backend() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Text(text) = message else {
                            continue;
                        };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        let id = frame["id"].as_u64().unwrap();
                        let reply = match frame["op"].as_str().unwrap() {
                            "list_loaded" => json!({
                                "id": id, "ok": true,
                                "result": [{"path": "qwen2-1.5b", "identifier": "qwen2-1.5b:1"}]
                            }),
                            "list_downloaded" => json!({
                                "id": id, "ok": true,
                                "result": [{"path": "qwen2-1.5b", "size": 1_500_000u64, "type": "llm"}]
                            }),
                            "load" => {
                                // Interim progress frames precede the final reply
                                for progress in [25.0, 75.0] {
                                    ws.send(Message::Text(
                                        json!({"id": id, "progress": progress}).to_string(),
                                    ))
                                    .await
                                    .unwrap();
                                }
                                json!({"id": id, "ok": true, "result": {}})
                            }
                            "unload" => json!({"id": id, "ok": true, "result": {}}),
                            _ => json!({"id": id, "ok": false, "error": "unknown op"}),
                        };
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn list_load_unload_round_trip() {
        let addr = spawn_fake_backend().await;
        let client = ControlClient::new(format!("ws://{addr}"));

        let (loaded, downloaded) = client.list_models().await.unwrap();
        assert_eq!(loaded[0].identifier, "qwen2-1.5b:1");
        assert_eq!(downloaded[0].size_bytes, 1_500_000);
        assert_eq!(downloaded[0].model_type, "llm");

        let mut progress_seen = Vec::new();
        client
            .load_model("qwen2-1.5b", None, None, |p| progress_seen.push(p))
            .await
            .unwrap();
        assert_eq!(progress_seen, vec![25.0, 75.0]);

        let identifier = client.unload_model("qwen2-1.5b", None).await.unwrap();
        assert_eq!(identifier, "qwen2-1.5b:1");

        assert!(client.health().await);
    }

    #[tokio::test]
    async fn unload_of_unknown_model_is_not_found() {
        let addr = spawn_fake_backend().await;
        let client = ControlClient::new(format!("ws://{addr}"));

        let err = client.unload_model("missing-model", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_calls_overlap_on_one_session() {
        // Backend that answers the connect-validation call immediately, then
        // holds the next two listing requests and answers both only after
        // the second arrives. If round trips serialized on the session, the
        // second frame would never be sent and both probes would time out.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut validated = false;
            let mut held_ids = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: Value = serde_json::from_str(&text).unwrap();
                let id = frame["id"].as_u64().unwrap();

                if !validated {
                    validated = true;
                    ws.send(Message::Text(
                        json!({"id": id, "ok": true, "result": []}).to_string(),
                    ))
                    .await
                    .unwrap();
                    continue;
                }

                held_ids.push(id);
                if held_ids.len() == 2 {
                    for id in held_ids.drain(..) {
                        ws.send(Message::Text(
                            json!({"id": id, "ok": true, "result": []}).to_string(),
                        ))
                        .await
                        .unwrap();
                    }
                }
            }
        });

        let client = ControlClient::new(format!("ws://{addr}"));
        let (a, b) = tokio::join!(client.health(), client.health());
        assert!(a && b);
    }

    #[tokio::test]
    async fn unreachable_backend_exhausts_retries() {
        // Reserved port with nothing listening: connection refused fast
        let client = ControlClient::new("ws://127.0.0.1:9".to_string());
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, ControlError::BackendUnavailable(_)));
        assert!(!client.health().await);
    }
}
