//! The coordinator↔shard boundary: command/reply types and the connection
//! trait, with an in-process implementation for tests and single-binary
//! deployments and a framed-JSON TCP implementation for the wire.
//!
//! Wire format: every message is `[length: u32 LE][payload: length bytes]`
//! where the payload is the serde_json encoding of `WireRequest` /
//! `WireResponse`. The Rust types are the source of truth; the frame is
//! only the envelope.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shrike_common::error::{CoordError, CoordResult};
use shrike_common::types::ShardId;
use shrike_common::value::Value;

use crate::plan::RemotePlan;

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The command fanned out to every shard: the remote sub-plan plus the
/// pagination and encoding flags of the external interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub plan: RemotePlan,
    /// Request a continuation token alongside the batch.
    pub with_cursor: bool,
    /// Continuation token from a previous batch, opaque to the coordinator.
    pub cursor_token: Option<String>,
    /// Ask the shard to reply with raw numeric encodings rather than
    /// client-formatted strings.
    pub numeric_encoding: bool,
}

impl RemoteCommand {
    pub fn new(plan: RemotePlan) -> Self {
        Self {
            plan,
            with_cursor: false,
            cursor_token: None,
            numeric_encoding: true,
        }
    }
}

/// One result row from a shard. `slot` carries the row's slot so the
/// aggregator can validate ownership post-hoc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: String,
    pub slot: u16,
    pub sort_key: Option<Value>,
    pub fields: Vec<(String, Value)>,
}

impl ResultRow {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// A shard's reply to one fanned-out command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReply {
    pub shard_id: ShardId,
    /// The topology version the shard itself observed, if it reports one.
    /// Advisory only — ownership validation always uses the coordinator's
    /// originating snapshot.
    pub topology_version: Option<u64>,
    pub rows: Vec<ResultRow>,
    /// Present when `with_cursor` was set and the shard has more data.
    pub cursor_token: Option<String>,
}

/// A single reusable connection to one shard.
#[async_trait]
pub trait ShardConnection: Send {
    async fn execute(&mut self, command: &RemoteCommand) -> CoordResult<ShardReply>;

    /// Liveness probe used by the coordinator's health check.
    async fn ping(&mut self) -> CoordResult<()>;
}

/// Creates connections for the pool manager. One connector serves all
/// shards; the endpoint comes from the topology snapshot.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> CoordResult<Box<dyn ShardConnection>>;
}

// ---------------------------------------------------------------------------
// In-process transport
// ---------------------------------------------------------------------------

/// Server side of the in-process transport: whatever executes the remote
/// sub-plan on one shard's local index.
#[async_trait]
pub trait ShardHandler: Send + Sync {
    async fn handle(&self, command: RemoteCommand) -> CoordResult<ShardReply>;
}

/// Connector that routes commands to handlers registered by endpoint name.
/// No sockets involved; used by tests and single-process deployments.
#[derive(Default)]
pub struct InProcessConnector {
    handlers: DashMap<String, Arc<dyn ShardHandler>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn ShardHandler>) {
        self.handlers.insert(endpoint.into(), handler);
    }

    pub fn unregister(&self, endpoint: &str) {
        self.handlers.remove(endpoint);
    }
}

#[async_trait]
impl ShardConnector for InProcessConnector {
    async fn connect(&self, endpoint: &str) -> CoordResult<Box<dyn ShardConnection>> {
        let handler = self
            .handlers
            .get(endpoint)
            .map(|h| h.clone())
            .ok_or_else(|| CoordError::Transport(format!("no handler at {}", endpoint)))?;
        Ok(Box::new(InProcessConnection { handler }))
    }
}

struct InProcessConnection {
    handler: Arc<dyn ShardHandler>,
}

#[async_trait]
impl ShardConnection for InProcessConnection {
    async fn execute(&mut self, command: &RemoteCommand) -> CoordResult<ShardReply> {
        self.handler.handle(command.clone()).await
    }

    async fn ping(&mut self) -> CoordResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub enum WireRequest {
    Search(RemoteCommand),
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WireResponse {
    Reply(ShardReply),
    Pong,
    Error(String),
}

/// Connector that dials shards over TCP with length-prefixed JSON frames.
pub struct TcpConnector {
    connect_timeout: std::time::Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: std::time::Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ShardConnector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> CoordResult<Box<dyn ShardConnection>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                CoordError::Transport(format!("connect timeout dialing {}", endpoint))
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection { stream }))
    }
}

struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl ShardConnection for TcpConnection {
    async fn execute(&mut self, command: &RemoteCommand) -> CoordResult<ShardReply> {
        write_frame(&mut self.stream, &WireRequest::Search(command.clone())).await?;
        match read_frame::<WireResponse>(&mut self.stream).await? {
            WireResponse::Reply(reply) => Ok(reply),
            WireResponse::Error(msg) => Err(CoordError::Transport(msg)),
            WireResponse::Pong => Err(CoordError::Transport(
                "unexpected Pong in response to Search".into(),
            )),
        }
    }

    async fn ping(&mut self) -> CoordResult<()> {
        write_frame(&mut self.stream, &WireRequest::Ping).await?;
        match read_frame::<WireResponse>(&mut self.stream).await? {
            WireResponse::Pong => Ok(()),
            other => Err(CoordError::Transport(format!(
                "unexpected response to Ping: {:?}",
                other
            ))),
        }
    }
}

/// Encode `msg` and write it as one `[len u32 LE][payload]` frame.
pub async fn write_frame<T: Serialize>(
    stream: &mut (impl AsyncWriteExt + Unpin),
    msg: &T,
) -> CoordResult<()> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| CoordError::Transport(format!("frame encode: {}", e)))?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame and decode its payload.
pub async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> CoordResult<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CoordError::Transport(format!(
            "frame length {} exceeds cap {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| CoordError::Transport(format!("frame decode: {}", e)))
}
