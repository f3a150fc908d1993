use crate::message::{ClusterMessage, WIRE_VERSION};
use dashmap::DashMap;
use meshos_common::{MeshError, NodeId, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

/// Upper bound on a single frame; larger frames indicate corruption or a
/// misbehaving peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Write one length-prefixed frame: 4-byte big-endian length, then the
/// bincode-serialized message.
pub async fn write_frame(stream: &mut TcpStream, message: &ClusterMessage) -> Result<()> {
    let body =
        bincode::serialize(message).map_err(|e| MeshError::Serialization(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(MeshError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and decode it.
pub async fn read_frame(stream: &mut TcpStream) -> Result<ClusterMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(MeshError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let message: ClusterMessage =
        bincode::deserialize(&body).map_err(|e| MeshError::Serialization(e.to_string()))?;
    if message.version != WIRE_VERSION {
        return Err(MeshError::Protocol(format!(
            "unsupported wire version {}",
            message.version
        )));
    }
    Ok(message)
}

/// Point-to-point request/reply transport with a per-destination
/// connection cache.
///
/// Every call is bounded by the configured timeout; a timeout or I/O
/// error drops the cached connection so the next call reconnects.
pub struct Transport {
    connections: DashMap<NodeId, Arc<Mutex<TcpStream>>>,
    timeout: Duration,
}

impl Transport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            timeout,
        }
    }

    /// One round trip to a known peer. The connection is held for the
    /// full exchange so frames from concurrent callers never interleave.
    pub async fn request(
        &self,
        dest: NodeId,
        addr: SocketAddr,
        message: &ClusterMessage,
    ) -> Result<ClusterMessage> {
        match tokio::time::timeout(self.timeout, self.exchange(dest, addr, message)).await {
            Ok(result) => result,
            Err(_) => {
                self.connections.remove(&dest);
                Err(MeshError::Timeout(format!("rpc to {dest}")))
            }
        }
    }

    /// One round trip to an explicit address with no cached connection,
    /// used to bootstrap a join before the peer is in the roster.
    pub async fn request_addr(
        &self,
        addr: SocketAddr,
        message: &ClusterMessage,
    ) -> Result<ClusterMessage> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            round_trip(&mut stream, message).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout(format!("rpc to {addr}"))),
        }
    }

    /// Drop the cached connection to a peer, if any.
    pub fn disconnect(&self, node: &NodeId) {
        self.connections.remove(node);
    }

    async fn exchange(
        &self,
        dest: NodeId,
        addr: SocketAddr,
        message: &ClusterMessage,
    ) -> Result<ClusterMessage> {
        let conn = match self.connections.get(&dest) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!("connecting to {dest} at {addr}");
                let stream = TcpStream::connect(addr).await?;
                let conn = Arc::new(Mutex::new(stream));
                self.connections.insert(dest, conn.clone());
                conn
            }
        };

        let mut stream = conn.lock().await;
        match round_trip(&mut stream, message).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                drop(stream);
                self.connections.remove(&dest);
                Err(e)
            }
        }
    }
}

async fn round_trip(stream: &mut TcpStream, message: &ClusterMessage) -> Result<ClusterMessage> {
    write_frame(stream, message).await?;
    read_frame(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use meshos_common::VectorClock;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_round_trip_over_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = stream;
            let message = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &message).await.unwrap();
        });

        let source = NodeId::new();
        let message = ClusterMessage::new(source, None, VectorClock::new(), Payload::Ping);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &message).await.unwrap();
        let back = read_frame(&mut stream).await.unwrap();

        assert_eq!(back.message_id, message.message_id);
        assert_eq!(back.source, source);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_against_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept but never reply.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = Transport::new(Duration::from_millis(100));
        let message =
            ClusterMessage::new(NodeId::new(), None, VectorClock::new(), Payload::Ping);
        let result = transport.request(NodeId::new(), addr, &message).await;
        assert!(matches!(result, Err(MeshError::Timeout(_))));
    }
}
