//! Binary protocol transport.
//!
//! Every request opens its own connection, writes one length-prefixed rkyv
//! `Envelope` and reads one back. The reply must echo the request id.

use crate::error::{TransportError, TransportResult};
use crate::topology::NodeRef;
use crate::transport::{ConfigTransport, NodeClient, RawDescriptor};
use crate::types::{
    Envelope, GetReply, NodeMessage, ObserveReply, RequestId, TransportKind,
};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rkyv::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, envelope: &Envelope) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let serialized = rkyv::to_bytes::<_, 1024>(envelope)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    if serialized.len() > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            serialized.len()
        )));
    }
    stream
        .write_u32(serialized.len() as u32)
        .await
        .map_err(network_error)?;
    stream.write_all(&serialized).await.map_err(network_error)?;
    stream.flush().await.map_err(network_error)?;
    Ok(())
}

pub async fn read_frame<R>(stream: &mut R) -> TransportResult<Envelope>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await.map_err(network_error)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).await.map_err(network_error)?;

    // archived roots must be read from an aligned buffer
    let mut aligned = rkyv::AlignedVec::with_capacity(len);
    aligned.extend_from_slice(&buf);

    let archived = rkyv::check_archived_root::<Envelope>(&aligned[..])
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| TransportError::Protocol("undecodable envelope".to_string()))
}

fn network_error(e: std::io::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

/// Sends one message to one address and waits for the matching reply.
#[derive(Debug, Clone)]
pub struct NetworkClient {
    timeout: Duration,
}

impl NetworkClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn send(&self, address: &str, message: NodeMessage) -> TransportResult<NodeMessage> {
        let request = Envelope {
            id: RequestId::new(),
            message,
        };

        let exchange = async {
            // Create a new connection for each request
            let mut stream = TcpStream::connect(address).await.map_err(network_error)?;
            write_frame(&mut stream, &request).await?;
            read_frame(&mut stream).await
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        if reply.id != request.id {
            return Err(TransportError::Protocol(format!(
                "reply {:?} does not match request {:?}",
                reply.id, request.id
            )));
        }
        Ok(reply.message)
    }
}

/// `NodeClient` over the binary protocol.
#[derive(Debug, Clone)]
pub struct TcpNodeClient {
    client: NetworkClient,
}

impl TcpNodeClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: NetworkClient::new(timeout),
        }
    }

    async fn get_like(&self, node: &NodeRef, message: NodeMessage) -> TransportResult<GetReply> {
        match self.client.send(&node.address, message).await? {
            NodeMessage::GetResponse { status, cas, value } => Ok(GetReply {
                node: node.address.clone(),
                status,
                cas,
                value,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(message: &NodeMessage) -> TransportError {
    TransportError::Protocol(format!("unexpected reply {:?}", message))
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn observe(
        &self,
        node: &NodeRef,
        key: &str,
        cas: u64,
        partition: u32,
    ) -> TransportResult<ObserveReply> {
        let request = NodeMessage::Observe {
            key: key.to_string(),
            cas,
            partition,
        };
        match self.client.send(&node.address, request).await? {
            NodeMessage::ObserveResponse { cas, state, .. } => Ok(ObserveReply {
                node: node.address.clone(),
                cas,
                state,
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn get(&self, node: &NodeRef, key: &str, partition: u32) -> TransportResult<GetReply> {
        let request = NodeMessage::Get {
            key: key.to_string(),
            partition,
        };
        self.get_like(node, request).await
    }

    async fn replica_get(
        &self,
        node: &NodeRef,
        key: &str,
        partition: u32,
        replica_index: u32,
    ) -> TransportResult<GetReply> {
        let request = NodeMessage::ReplicaGet {
            key: key.to_string(),
            partition,
            replica_index,
        };
        self.get_like(node, request).await
    }
}

/// Fetches descriptors by broadcasting a config request to every seed.
#[derive(Debug, Clone)]
pub struct BinaryConfigTransport {
    seeds: Vec<String>,
    client: NetworkClient,
}

impl BinaryConfigTransport {
    /// `seeds` are `host:port` binary addresses.
    pub fn new(seeds: Vec<String>, timeout: Duration) -> Self {
        Self {
            seeds,
            client: NetworkClient::new(timeout),
        }
    }
}

#[async_trait]
impl ConfigTransport for BinaryConfigTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Binary
    }

    /// Ask every seed at once; the first non-empty descriptor wins and the
    /// remaining requests are dropped.
    async fn fetch(&self) -> TransportResult<Vec<RawDescriptor>> {
        let mut requests: FuturesUnordered<_> = self
            .seeds
            .iter()
            .map(|seed| async move {
                let reply = self.client.send(seed, NodeMessage::GetConfig).await;
                (seed, reply)
            })
            .collect();

        while let Some((seed, reply)) = requests.next().await {
            match reply {
                Ok(NodeMessage::Config {
                    descriptor: Some(text),
                }) if !text.trim().is_empty() => {
                    let origin = seed
                        .rsplit_once(':')
                        .map(|(host, _)| host)
                        .unwrap_or(seed)
                        .to_string();
                    return Ok(vec![RawDescriptor { origin, text }]);
                }
                Ok(other) => {
                    tracing::debug!(seed = %seed, reply = ?other, "seed returned no config");
                }
                Err(e) => {
                    tracing::debug!(seed = %seed, error = %e, "config request failed");
                }
            }
        }

        Err(TransportError::NoResponse)
    }
}
