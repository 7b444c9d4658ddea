//! OVSDB JSON-RPC transport (RFC 7047 section 4).
//!
//! A single background reader task owns the read half of the socket. It
//! routes replies to the waiting caller by request id, answers server
//! `echo` keep-alives, and forwards `update` notifications on an unbounded
//! channel that the client's cache listener consumes.
//!
//! Messages are concatenated JSON values with no delimiter, so the reader
//! parses incrementally and keeps any trailing partial value buffered.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{OvsdbError, OvsdbResult};
use crate::operation::{Operation, OperationResult};
use crate::types::TableUpdates;

/// Monitor id sent with `monitor`; echoed back in every `update`.
pub const MONITOR_ID: &str = "ovsbridged";

const READ_CHUNK: usize = 16 * 1024;

/// Receiving end of the `update` notification stream.
pub type UpdateReceiver = mpsc::UnboundedReceiver<TableUpdates>;

/// Request/reply access to an OVSDB server.
///
/// The notification side channel is handed out separately at construction
/// (see [`JsonRpcTransport::connect`]) so that the client, not the
/// transport, owns the cache it feeds.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits `ops` as one transaction and returns the raw per-operation
    /// results, including any trailing commit-error element.
    async fn transact(&self, db: &str, ops: &[Operation]) -> OvsdbResult<Vec<OperationResult>>;

    /// Starts monitoring every column of `tables` and returns the initial
    /// contents.
    async fn monitor(&self, db: &str, tables: &[&str]) -> OvsdbResult<TableUpdates>;

    /// Tears down the connection. Outstanding calls fail with
    /// [`OvsdbError::Disconnected`].
    async fn close(&self);
}

/// Where the OVSDB server listens, in `ovs-vsctl --db` syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl FromStr for Endpoint {
    type Err = OvsdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| OvsdbError::protocol(format!("endpoint '{}' needs a port", s)))?;
            let port = port
                .parse()
                .map_err(|_| OvsdbError::protocol(format!("bad port in endpoint '{}'", s)))?;
            return Ok(Endpoint::Tcp {
                host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
                port,
            });
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        Err(OvsdbError::protocol(format!("unsupported endpoint '{}'", s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp:[{}]:{}", host, port)
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<OvsdbResult<Value>>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

impl Shared {
    /// Marks the connection dead and wakes every waiter.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders resolves each receiver with an error
        self.pending.lock().clear();
    }
}

/// [`Transport`] speaking JSON-RPC 1.0 over a stream socket.
pub struct JsonRpcTransport {
    writer: Arc<AsyncMutex<Writer>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl JsonRpcTransport {
    /// Opens a connection and starts the reader task.
    pub async fn connect(endpoint: &Endpoint) -> OvsdbResult<(Self, UpdateReceiver)> {
        debug!(%endpoint, "Connecting to OVSDB");
        match endpoint {
            Endpoint::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                Ok(Self::spawn(r, w))
            }
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok(Self::spawn(r, w))
            }
        }
    }

    /// Runs the protocol over an already established byte stream.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, UpdateReceiver)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Arc<AsyncMutex<Writer>> = Arc::new(AsyncMutex::new(Box::new(writer)));
        let shared = Arc::new(Shared::default());
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&writer),
            Arc::clone(&shared),
            updates_tx,
        ));

        let transport = Self {
            writer,
            shared,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(handle)),
        };
        (transport, updates_rx)
    }

    async fn call(&self, method: &str, params: Value) -> OvsdbResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.pending.lock().remove(&id);
            return Err(OvsdbError::Disconnected);
        }

        let request = json!({ "method": method, "params": params, "id": id });
        if let Err(e) = write_message(&self.writer, &request).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| OvsdbError::Disconnected)?
    }
}

impl Drop for JsonRpcTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn transact(&self, db: &str, ops: &[Operation]) -> OvsdbResult<Vec<OperationResult>> {
        let mut params = Vec::with_capacity(ops.len() + 1);
        params.push(Value::String(db.to_string()));
        for op in ops {
            params.push(serde_json::to_value(op)?);
        }

        let result = self.call("transact", Value::Array(params)).await?;
        let slots: Vec<Option<OperationResult>> = serde_json::from_value(result)?;
        Ok(slots.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn monitor(&self, db: &str, tables: &[&str]) -> OvsdbResult<TableUpdates> {
        let requests: serde_json::Map<String, Value> = tables
            .iter()
            .map(|t| (t.to_string(), json!({})))
            .collect();
        let result = self
            .call("monitor", json!([db, MONITOR_ID, requests]))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shared.shut();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(error = %e, "Ignoring error shutting down OVSDB socket");
        }
    }
}

async fn write_message(writer: &AsyncMutex<Writer>, message: &Value) -> OvsdbResult<()> {
    let bytes = serde_json::to_vec(message)?;
    trace!(%message, "OVSDB send");
    let mut w = writer.lock().await;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Removes every complete JSON value from the front of `buf`.
///
/// A trailing partial value stays in the buffer for the next read.
pub fn drain_messages(buf: &mut Vec<u8>) -> OvsdbResult<Vec<Value>> {
    let mut messages = Vec::new();
    let mut consumed = 0;
    {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        loop {
            match stream.next() {
                Some(Ok(v)) => {
                    consumed = stream.byte_offset();
                    messages.push(v);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
    }
    buf.drain(..consumed);
    Ok(messages)
}

async fn read_loop<R>(
    mut reader: R,
    writer: Arc<AsyncMutex<Writer>>,
    shared: Arc<Shared>,
    updates: mpsc::UnboundedSender<TableUpdates>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break "connection closed by server".to_string(),
            Ok(n) => n,
            Err(e) => break e.to_string(),
        };
        buf.extend_from_slice(&chunk[..n]);

        let messages = match drain_messages(&mut buf) {
            Ok(m) => m,
            Err(e) => break format!("malformed JSON from server: {}", e),
        };
        for message in messages {
            dispatch(message, &writer, &shared, &updates).await;
        }
    };

    warn!(%reason, "OVSDB reader stopped");
    shared.shut();
}

async fn dispatch(
    message: Value,
    writer: &AsyncMutex<Writer>,
    shared: &Shared,
    updates: &mpsc::UnboundedSender<TableUpdates>,
) {
    trace!(%message, "OVSDB recv");

    match message.get("method").and_then(Value::as_str) {
        Some("update") => {
            let Some(payload) = message.get("params").and_then(|p| p.get(1)) else {
                warn!("Ignoring update notification without table-updates");
                return;
            };
            match serde_json::from_value::<TableUpdates>(payload.clone()) {
                Ok(batch) => {
                    // receiver gone means the client is shutting down
                    let _ = updates.send(batch);
                }
                Err(e) => warn!(error = %e, "Ignoring malformed update notification"),
            }
        }
        Some("echo") => {
            let reply = json!({
                "id": message.get("id").cloned().unwrap_or(Value::Null),
                "result": message.get("params").cloned().unwrap_or_else(|| json!([])),
                "error": Value::Null,
            });
            if let Err(e) = write_message(writer, &reply).await {
                warn!(error = %e, "Failed to answer OVSDB echo");
            }
        }
        Some(other) => debug!(method = other, "Ignoring unsolicited OVSDB request"),
        None => {
            let Some(id) = message.get("id").and_then(Value::as_u64) else {
                warn!(%message, "Ignoring OVSDB message without method or numeric id");
                return;
            };
            let call = shared.pending.lock().remove(&id);
            let Some(call) = call else {
                debug!(id, "Reply for unknown request");
                return;
            };

            let outcome = match message.get("error") {
                Some(e) if !e.is_null() => Err(OvsdbError::Rpc {
                    method: call.method,
                    message: rpc_error_text(e),
                }),
                _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = call.tx.send(outcome);
        }
    }
}

fn rpc_error_text(error: &Value) -> String {
    if let Some(s) = error.as_str() {
        return s.to_string();
    }
    match (
        error.get("error").and_then(Value::as_str),
        error.get("details").and_then(Value::as_str),
    ) {
        (Some(e), Some(d)) => format!("{}({})", e, d),
        (Some(e), None) => e.to_string(),
        _ => error.to_string(),
    }
}
