//! # RPC Layer
//!
//! TCP transport for the Whanau RPC surface.
//!
//! - [`TcpRpc`]: client side, implements [`WhanauRpc`] by opening a connection
//!   per call
//! - [`serve`]: accept loop dispatching inbound requests to a [`WhanauNode`]
//!
//! ## Framing
//!
//! Each message is a 4-byte big-endian length followed by a bincode payload.
//! A connection may carry several request/response exchanges in sequence.
//!
//! ## Limits
//!
//! - Request and response sizes are bounded before any buffer is allocated
//! - Every read has a deadline; idle connections are dropped
//! - Request processing has its own deadline, never shorter than the longest
//!   deadline the node's own forwarded calls may carry

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::messages::{
    self, Address, GetIdReply, Key, LookupReply, PutReply, RandomWalkReply, SampleSuccessorsReply,
    TrueValue, WhanauRequest, WhanauResponse, MAX_MESSAGE_SIZE,
};
use crate::overlay::WhanauNode;
use crate::protocols::WhanauRpc;

/// Maximum size of RPC response payload (1 MiB).
const MAX_RESPONSE_SIZE: usize = MAX_MESSAGE_SIZE;

const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Records accepted in one SampleSuccessors reply.
const MAX_SUCCESSORS_PER_RESPONSE: usize = 1_000;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on one full request/response exchange from the client side.
const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Client half of the TCP transport.
#[derive(Clone, Debug)]
pub struct TcpRpc {
    connect_timeout: Duration,
    stream_timeout: Duration,
}

impl Default for TcpRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpRpc {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream_timeout: RPC_STREAM_TIMEOUT,
        }
    }

    pub fn with_timeouts(connect_timeout: Duration, stream_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            stream_timeout,
        }
    }

    async fn rpc(&self, to: &Address, request: WhanauRequest) -> Result<WhanauResponse> {
        let op = request.name();
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(to.as_str()))
            .await
            .with_context(|| format!("connect to {to} timed out"))?
            .with_context(|| format!("failed to connect to {to}"))?;
        stream.set_nodelay(true).ok();

        let response = tokio::time::timeout(self.stream_timeout, async {
            let request_bytes = messages::serialize(&request).context("failed to serialize request")?;
            write_frame(&mut stream, &request_bytes).await?;

            let response_bytes = read_frame(&mut stream, MAX_RESPONSE_SIZE)
                .await
                .with_context(|| format!("failed to read {op} response from {to}"))?;
            let response: WhanauResponse = messages::deserialize_bounded(&response_bytes)
                .context("failed to deserialize response")?;
            Ok::<_, anyhow::Error>(response)
        })
        .await
        .context("RPC timed out")??;

        trace!(peer = %to, op, "rpc completed");
        match response {
            WhanauResponse::Error { message } => anyhow::bail!("RPC error: {}", message),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl WhanauRpc for TcpRpc {
    async fn random_walk(&self, to: &Address, steps: usize) -> Result<RandomWalkReply> {
        match self.rpc(to, WhanauRequest::RandomWalk { steps }).await? {
            WhanauResponse::RandomWalk(reply) => Ok(reply),
            other => anyhow::bail!("unexpected response to RandomWalk: {:?}", other),
        }
    }

    async fn get_id(&self, to: &Address, layer: usize) -> Result<GetIdReply> {
        match self.rpc(to, WhanauRequest::GetId { layer }).await? {
            WhanauResponse::GetId(reply) => Ok(reply),
            other => anyhow::bail!("unexpected response to GetId: {:?}", other),
        }
    }

    async fn sample_successors(
        &self,
        to: &Address,
        key: Key,
        t: usize,
    ) -> Result<SampleSuccessorsReply> {
        match self.rpc(to, WhanauRequest::SampleSuccessors { key, t }).await? {
            WhanauResponse::SampleSuccessors(reply) => {
                if reply.successors.len() > MAX_SUCCESSORS_PER_RESPONSE {
                    warn!(
                        peer = %to,
                        count = reply.successors.len(),
                        max = MAX_SUCCESSORS_PER_RESPONSE,
                        "peer returned too many successors, rejecting"
                    );
                    anyhow::bail!("too many successors: {}", reply.successors.len());
                }
                Ok(reply)
            }
            other => anyhow::bail!("unexpected response to SampleSuccessors: {:?}", other),
        }
    }

    async fn lookup(&self, to: &Address, key: Key, routed_from: Vec<Address>) -> Result<LookupReply> {
        match self.rpc(to, WhanauRequest::Lookup { key, routed_from }).await? {
            WhanauResponse::Lookup(reply) => Ok(reply),
            other => anyhow::bail!("unexpected response to Lookup: {:?}", other),
        }
    }

    async fn put(&self, to: &Address, key: Key, value: TrueValue) -> Result<PutReply> {
        match self.rpc(to, WhanauRequest::Put { key, value }).await? {
            WhanauResponse::Put(reply) => Ok(reply),
            other => anyhow::bail!("unexpected response to Put: {:?}", other),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("frame too large")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        anyhow::bail!("frame too large: {} bytes (max {})", len, max);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Accept connections on `listener` until the task is dropped or accept fails.
pub async fn serve<N: WhanauRpc>(listener: TcpListener, node: WhanauNode<N>) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await.context("accept failed")?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(node, stream, remote).await {
                debug!(remote = %remote, error = ?e, "connection error");
            }
        });
    }
}

pub async fn handle_connection<N: WhanauRpc>(
    node: WhanauNode<N>,
    mut stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    loop {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!(remote = %remote, "connection closed by peer");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(remote = %remote, "connection idle timeout");
                return Ok(());
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_REQUEST_SIZE {
            warn!(
                remote = %remote,
                size = len,
                max = MAX_REQUEST_SIZE,
                "rejecting oversized request"
            );
            let error_response = WhanauResponse::Error {
                message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
            };
            write_frame(&mut stream, &messages::serialize(&error_response)?).await?;
            return Ok(());
        }

        let mut request_bytes = vec![0u8; len];
        tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read_exact(&mut request_bytes))
            .await
            .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

        let request: WhanauRequest = messages::deserialize_bounded(&request_bytes)
            .context("failed to deserialize request")?;
        let op = request.name();
        trace!(remote = %remote, op, "handling request");

        let process_timeout = REQUEST_PROCESS_TIMEOUT.max(node.config().call_ceiling());
        let response = match tokio::time::timeout(
            process_timeout,
            handle_rpc_request(&node, request),
        )
        .await
        {
            Ok(resp) => resp,
            Err(_) => {
                warn!(remote = %remote, op, "request processing timed out");
                WhanauResponse::Error {
                    message: "request processing timeout".to_string(),
                }
            }
        };

        let response_bytes =
            messages::serialize(&response).context("failed to serialize response")?;
        write_frame(&mut stream, &response_bytes).await?;
    }
}

/// Dispatch one decoded request to the node's handlers.
pub async fn handle_rpc_request<N: WhanauRpc>(
    node: &WhanauNode<N>,
    request: WhanauRequest,
) -> WhanauResponse {
    match request {
        WhanauRequest::RandomWalk { steps } => {
            WhanauResponse::RandomWalk(node.handle_random_walk(steps).await)
        }
        WhanauRequest::GetId { layer } => WhanauResponse::GetId(node.handle_get_id(layer).await),
        WhanauRequest::SampleSuccessors { key, t } => {
            WhanauResponse::SampleSuccessors(node.handle_sample_successors(key, t).await)
        }
        WhanauRequest::Lookup { key, routed_from } => {
            WhanauResponse::Lookup(node.handle_lookup(key, routed_from).await)
        }
        WhanauRequest::Put { key, value } => {
            WhanauResponse::Put(node.handle_put(key, value).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.unwrap();
        let payload = read_frame(&mut server, 16).await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, MAX_REQUEST_SIZE).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let rpc = TcpRpc::with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        assert!(rpc.get_id(&addr, 0).await.is_err());
    }
}
