//! Chrome DevTools Protocol Client
//!
//! JSON-RPC over the browser's DevTools WebSocket. Requests carry an id and
//! park a oneshot in the pending map; a reader task resolves them and fans
//! protocol events out on a broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

/// A protocol event such as `Page.domContentEventFired`.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RawError>,
    method: Option<String>,
    params: Option<Value>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct RawError {
    code: i64,
    message: String,
}

#[derive(Debug)]
enum Incoming {
    Response { id: u64, result: Result<Value, String> },
    Event(CdpEvent),
}

fn parse_incoming(text: &str) -> Result<Incoming> {
    let raw: RawMessage = serde_json::from_str(text).context("malformed CDP message")?;
    if let Some(id) = raw.id {
        let result = match raw.error {
            Some(err) => Err(format!("{} (code {})", err.message, err.code)),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response { id, result });
    }
    match raw.method {
        Some(method) => Ok(Incoming::Event(CdpEvent {
            method,
            params: raw.params.unwrap_or(Value::Null),
            session_id: raw.session_id,
        })),
        None => bail!("CDP message has neither id nor method"),
    }
}

struct ClientInner {
    sink: tokio::sync::Mutex<WsSink>,
    pending: Pending,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    closed: AtomicBool,
    command_timeout: Duration,
}

/// Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<ClientInner>,
}

impl CdpClient {
    /// Attaches onto the browser endpoint and starts the reader task.
    pub async fn connect(ws_endpoint: &str, command_timeout: Duration) -> Result<Self> {
        info!("Connecting to CDP websocket at {}", ws_endpoint);
        let (ws, _) = tokio::time::timeout(command_timeout, connect_async(ws_endpoint))
            .await
            .context("timed out connecting to DevTools")?
            .context("DevTools websocket handshake failed")?;
        let (sink, stream) = ws.split();
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(ClientInner {
            sink: tokio::sync::Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            closed: AtomicBool::new(false),
            command_timeout,
        });
        tokio::spawn(read_loop(stream, Arc::clone(&inner)));
        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dispatches one command and waits for its response.
    pub async fn send_command(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        self.send_command_with_timeout(method, params, session_id, self.inner.command_timeout)
            .await
    }

    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        limit: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            bail!("DevTools connection is closed");
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&Request {
            id,
            method,
            params,
            session_id,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        debug!(id, method, "CDP command");

        let sent = self.inner.sink.lock().await.send(Message::Text(payload.into())).await;
        if let Err(e) = sent {
            self.inner.pending.lock().remove(&id);
            return Err(anyhow!(e).context(format!("failed to send {method}")));
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => bail!("{method} failed: {message}"),
            Ok(Err(_)) => bail!("DevTools connection closed while waiting for {method}"),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                bail!("{method} timed out after {limit:?}")
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, inner: Arc<ClientInner>) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("DevTools websocket error: {}", e);
                break;
            }
        };
        match parse_incoming(text.as_str()) {
            Ok(Incoming::Response { id, result }) => {
                if let Some(tx) = inner.pending.lock().remove(&id) {
                    let _ = tx.send(result);
                }
            }
            Ok(Incoming::Event(event)) => {
                let _ = inner.events.send(event);
            }
            Err(e) => debug!("Ignoring CDP message: {:#}", e),
        }
    }

    inner.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiter.
    let abandoned = std::mem::take(&mut *inner.pending.lock());
    debug!(pending = abandoned.len(), "DevTools connection closed");
}
