//! Inbound queue (§3, §4.1 `PassthroughTunnel`): hands opaque, non-intercepted
//! CONNECT/HTTPS byte streams to whatever external routing fabric sits behind
//! the proxy. The core only ever enqueues (§5 "the proxy only enqueues").

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Any duplex byte stream the session loop can hand off without further
/// interpretation — in practice always a `tokio::io::BufReader` wrapping the
/// accepted `TcpStream` after a CONNECT reply was written and a TLS peek found
/// a non-`0x16` first byte.
pub trait OpaqueStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> OpaqueStream for T {}

/// One handed-off opaque stream plus the addressing context a router needs.
pub struct InboundConnection {
    pub source: SocketAddr,
    pub target_host: String,
    pub target_port: u16,
    pub stream: Box<dyn OpaqueStream>,
}

#[async_trait]
pub trait InboundQueue: Send + Sync {
    /// Hand off an opaque stream. Ownership of `stream` transfers to the queue;
    /// the session loop does not touch it again (§4.1 `PassthroughTunnel` is
    /// terminal for that connection).
    async fn enqueue(&self, conn: InboundConnection);
}

/// Forwards handed-off streams over an `mpsc` channel to an external consumer.
pub struct ChannelInboundQueue {
    sender: mpsc::Sender<InboundConnection>,
}

impl ChannelInboundQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundConnection>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl InboundQueue for ChannelInboundQueue {
    async fn enqueue(&self, conn: InboundConnection) {
        if self.sender.send(conn).await.is_err() {
            tracing::warn!("inbound queue receiver dropped; discarding opaque stream for {}", conn_label(&conn));
        }
    }
}

fn conn_label(conn: &InboundConnection) -> String {
    format!("{}:{} (from {})", conn.target_host, conn.target_port, conn.source)
}

/// Drops every opaque stream immediately — useful for tests and for embedding
/// applications that have no use for passthrough traffic.
pub struct NullInboundQueue;

#[async_trait]
impl InboundQueue for NullInboundQueue {
    async fn enqueue(&self, conn: InboundConnection) {
        tracing::debug!("dropping opaque stream for {}", conn_label(&conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn fixture_conn() -> (InboundConnection, tokio::io::DuplexStream) {
        let (a, b) = duplex(64);
        (
            InboundConnection {
                source: "127.0.0.1:10000".parse().unwrap(),
                target_host: "example.test".to_string(),
                target_port: 443,
                stream: Box::new(a),
            },
            b,
        )
    }

    #[tokio::test]
    async fn channel_queue_delivers_connection() {
        let (queue, mut rx) = ChannelInboundQueue::new(1);
        let (conn, _peer) = fixture_conn();
        queue.enqueue(conn).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.target_host, "example.test");
    }

    #[tokio::test]
    async fn null_queue_silently_drops() {
        let queue = NullInboundQueue;
        let (conn, _peer) = fixture_conn();
        queue.enqueue(conn).await;
    }
}
