//! Transport abstraction and adapters.
//!
//! The core only needs two capabilities from the link layer: dial a peer and
//! get a byte stream ([`Connector`]), and accept incoming byte streams along
//! with the identity of whoever opened them ([`Listener`]).
//!
//! Two adapters are provided: TCP (tokio) and an in-process transport built
//! on `tokio::io::duplex` for tests and demos.

use crate::error::WireError;
use crate::message::{read_envelope, write_envelope, MessageEnvelope, MessageKind};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wroup_types::Peer;

/// A bidirectional byte stream to a peer.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream handed out by transports.
pub type BoxedStream = Box<dyn ByteStream>;

/// Dial a peer.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a byte stream to `peer`.
    async fn connect(&self, peer: &Peer) -> Result<BoxedStream, WireError>;
}

/// Accept incoming links. Infinite and not restartable.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next incoming link.
    async fn accept(&mut self) -> Result<(Peer, BoxedStream), WireError>;
}

/// TCP dialer. Sends a `Connection` envelope naming the local peer as the
/// first frame of every link.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    local: Peer,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a dialer that introduces itself as `local`.
    pub fn new(local: Peer, connect_timeout: Duration) -> Self {
        Self {
            local,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &Peer) -> Result<BoxedStream, WireError> {
        let addr = peer.endpoint.ok_or_else(|| WireError::ConnectFailed {
            peer: peer.clone(),
            reason: "peer has no endpoint".to_string(),
        })?;

        info!(peer = %peer, "connecting");
        let mut stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(WireError::ConnectFailed {
                    peer: peer.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(WireError::ConnectFailed {
                    peer: peer.clone(),
                    reason: format!("timed out after {:?}", self.connect_timeout),
                })
            }
        };
        stream.set_nodelay(true)?;

        let hello = MessageEnvelope::connection(self.local.clone());
        write_envelope(&mut stream, &hello).await?;
        Ok(Box::new(stream))
    }
}

/// TCP listener. Each accepted socket must open with a `Connection` envelope
/// naming the remote peer; sockets that don't are dropped.
pub struct TcpLinkListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(Peer, BoxedStream)>,
    accept_task: JoinHandle<()>,
}

impl TcpLinkListener {
    /// Bind and start accepting.
    pub async fn bind(
        addr: SocketAddr,
        handshake_timeout: Duration,
        max_frame_size: u32,
    ) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let (tx, incoming) = mpsc::channel(32);
        let accept_task = tokio::spawn(accept_loop(listener, tx, handshake_timeout, max_frame_size));

        Ok(Self {
            local_addr,
            incoming,
            accept_task,
        })
    }

    /// The actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpLinkListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Listener for TcpLinkListener {
    async fn accept(&mut self) -> Result<(Peer, BoxedStream), WireError> {
        self.incoming.recv().await.ok_or(WireError::ConnectionClosed)
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(Peer, BoxedStream)>,
    handshake_timeout: Duration,
    max_frame_size: u32,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted connection from {}", addr);
                let tx = tx.clone();
                tokio::spawn(async move {
                    match handshake(stream, addr, handshake_timeout, max_frame_size).await {
                        Ok(link) => {
                            let _ = tx.send(link).await;
                        }
                        Err(e) => warn!("rejected link from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => {
                error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handshake(
    mut stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
    max_frame_size: u32,
) -> Result<(Peer, BoxedStream), WireError> {
    let hello = tokio::time::timeout(handshake_timeout, read_envelope(&mut stream, max_frame_size))
        .await
        .map_err(|_| WireError::HandshakeFailed("no handshake before timeout".to_string()))??;

    match (hello.kind, hello.origin) {
        (MessageKind::Connection, Some(peer)) => {
            stream.set_nodelay(true)?;
            let peer = peer.with_endpoint(addr.ip(), addr.port());
            info!(peer = %peer, "handshake complete");
            Ok((peer, Box::new(stream)))
        }
        (kind, _) => Err(WireError::HandshakeFailed(format!(
            "expected connection envelope naming the peer, got {}",
            kind.tag()
        ))),
    }
}

/// Create an in-process transport: one listener and a dialer factory.
pub fn in_memory() -> (MemoryListener, MemoryEndpoint) {
    let (tx, rx) = mpsc::channel(32);
    (MemoryListener { incoming: rx }, MemoryEndpoint { tx })
}

/// In-process listener; see [`in_memory`].
pub struct MemoryListener {
    incoming: mpsc::Receiver<(Peer, BoxedStream)>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<(Peer, BoxedStream), WireError> {
        self.incoming.recv().await.ok_or(WireError::ConnectionClosed)
    }
}

/// Hands out dialers bound to one [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryEndpoint {
    tx: mpsc::Sender<(Peer, BoxedStream)>,
}

impl MemoryEndpoint {
    /// A dialer that introduces itself as `local`.
    pub fn connector(&self, local: Peer) -> MemoryConnector {
        MemoryConnector {
            local,
            tx: self.tx.clone(),
        }
    }
}

/// In-process dialer; see [`in_memory`].
#[derive(Clone)]
pub struct MemoryConnector {
    local: Peer,
    tx: mpsc::Sender<(Peer, BoxedStream)>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, peer: &Peer) -> Result<BoxedStream, WireError> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.tx
            .send((self.local.clone(), Box::new(far)))
            .await
            .map_err(|_| WireError::ConnectFailed {
                peer: peer.clone(),
                reason: "listener is gone".to_string(),
            })?;
        Ok(Box::new(near))
    }
}
