//! CmdNode Server
//!
//! Accepts connections and runs an independent connection actor for each
//! peer. Every actor keeps its own registry and id counter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::actor::{Actor, ActorContext};
use super::connection::{Command, ConnectionError, ConnectionHandle};
use super::netsession::BindSession;
use super::NetworkConfig;
use crate::config::MemorySettings;
use crate::dispatch::NodeEvent;
use crate::identity::NodeIdentity;
use crate::protocol::{NodeInfo, OutgoingMessage};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// A new peer has connected
    PeerConnected { addr: SocketAddr },
    /// A peer's connection actor has finished
    PeerDisconnected { addr: SocketAddr },
    /// Sink call from a peer's connection actor
    Node { addr: SocketAddr, event: NodeEvent },
    /// Error occurred
    Error { message: String },
}

fn tag_event(addr: Option<SocketAddr>, event: NodeEvent) -> ServerEvent {
    match addr {
        Some(addr) => ServerEvent::Node { addr, event },
        None => ServerEvent::Error {
            message: format!("Event without peer address: {:?}", event),
        },
    }
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, ConnectionHandle>>>;

/// CmdNode Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Collaborators handed to every accepted connection
    ctx: ActorContext,
    /// Connected peers
    peers: PeerMap,
    /// Event sender
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Bound address once started
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig, identity: NodeIdentity) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let ctx = ActorContext {
            config: config.clone(),
            identity,
            settings: Arc::new(MemorySettings::new()),
            negotiator: Arc::new(BindSession::default()),
        };

        Self {
            config,
            ctx,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let host = self
            .config
            .bind_address
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_addr = format!("{}:{}", host, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self.event_tx.send(ServerEvent::Started { bind_addr: local_addr });

        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let ctx = self.ctx.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                spawn_peer(stream, addr, ctx.clone(), peers.clone(), event_tx.clone()).await;
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                let _ = event_tx.send(ServerEvent::Error {
                                    message: format!("Accept error: {}", e),
                                });
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            let _ = event_tx.send(ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop the server, closing every peer connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let peers = self.peers.read().await;
        for handle in peers.values() {
            let _ = handle.send(Command::Close).await;
        }

        Ok(())
    }

    /// Addresses of the connected peers
    pub async fn peers(&self) -> Vec<SocketAddr> {
        let peers = self.peers.read().await;
        let mut addrs: Vec<SocketAddr> = peers.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Registry snapshot held by one peer's connection actor
    pub async fn known_nodes(&self, addr: &SocketAddr) -> ServerResult<Vec<NodeInfo>> {
        let handle = self.handle(addr).await?;
        Ok(handle.peers().await?)
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, addr: &SocketAddr, message: OutgoingMessage) -> ServerResult<()> {
        let handle = self.handle(addr).await?;
        handle.send_message(message).await?;
        Ok(())
    }

    /// Send a message to all connected peers
    pub async fn broadcast(&self, message: OutgoingMessage) {
        let peers = self.peers.read().await;
        for handle in peers.values() {
            let _ = handle.send_message(message.clone()).await;
        }
    }

    async fn handle(&self, addr: &SocketAddr) -> ServerResult<ConnectionHandle> {
        let peers = self.peers.read().await;
        peers
            .get(addr)
            .cloned()
            .ok_or(ServerError::UnknownPeer(*addr))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Run a connection actor for an accepted socket
async fn spawn_peer(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ActorContext,
    peers: PeerMap,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let capacity = ctx.config.channel_capacity;
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let handle = ConnectionHandle::new(command_tx);

    {
        let mut peers = peers.write().await;
        peers.insert(addr, handle.clone());
    }

    let _ = event_tx.send(ServerEvent::PeerConnected { addr });

    let actor = Actor::accepted(stream, addr, ctx, command_rx, event_tx.clone(), tag_event);
    tokio::spawn(async move {
        actor.run().await;
        handle.mark_stopped();

        {
            let mut peers = peers.write().await;
            peers.remove(&addr);
        }

        let _ = event_tx.send(ServerEvent::PeerDisconnected { addr });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Client, ConnectionState};
    use std::time::Duration;

    fn identity(name: &str) -> NodeIdentity {
        NodeIdentity {
            id: format!("{}-id", name),
            group: "test".into(),
            name: name.into(),
            kind: "node".into(),
            description: format!("{} node", name),
        }
    }

    async fn next_matching<E: std::fmt::Debug>(
        rx: &mut mpsc::UnboundedReceiver<E>,
        pred: impl Fn(&E) -> bool,
    ) -> E {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(NetworkConfig::default(), identity("host"));
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_client_server_roundtrip() {
        let mut server = Server::new(
            NetworkConfig::new(0).with_host("127.0.0.1"),
            identity("hub"),
        );
        let mut server_events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();
        assert!(server.is_running().await);

        let mut client = Client::new(
            NetworkConfig::new(addr.port()).with_host("127.0.0.1"),
            identity("alpha"),
        );
        let mut client_events = client.take_event_receiver().unwrap();
        client.connect().await.unwrap();
        next_matching(&mut client_events, |e| {
            matches!(e, NodeEvent::StateChanged(ConnectionState::Open))
        })
        .await;

        let peer_addr = match next_matching(&mut server_events, |e| {
            matches!(e, ServerEvent::PeerConnected { .. })
        })
        .await
        {
            ServerEvent::PeerConnected { addr } => addr,
            _ => unreachable!(),
        };

        client.identify().await.unwrap();
        let identified = next_matching(&mut server_events, |e| {
            matches!(e, ServerEvent::Node { event: NodeEvent::Identified(_), .. })
        })
        .await;
        match identified {
            ServerEvent::Node { event: NodeEvent::Identified(envelope), .. } => {
                assert_eq!(envelope.name_client.as_deref(), Some("alpha"));
                assert_eq!(envelope.description_client.as_deref(), Some("alpha node"));
            }
            _ => unreachable!(),
        }

        let nodes = server.known_nodes(&peer_addr).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "alpha");

        client.send_message_to("alpha", "beta", "hello beta").await.unwrap();
        let relay = next_matching(&mut server_events, |e| {
            matches!(e, ServerEvent::Node { event: NodeEvent::Relay { .. }, .. })
        })
        .await;
        assert_eq!(
            relay,
            ServerEvent::Node {
                addr: peer_addr,
                event: NodeEvent::Relay {
                    from: "alpha".into(),
                    to: "beta".into(),
                    message: "hello beta".into(),
                },
            }
        );

        server
            .send_to(&peer_addr, OutgoingMessage::PeersList(vec!["alpha".into(), "beta".into()]))
            .await
            .unwrap();
        let list = next_matching(&mut client_events, |e| matches!(e, NodeEvent::PeerList(_))).await;
        assert_eq!(list, NodeEvent::PeerList(vec!["alpha".into(), "beta".into()]));

        client.close().await.unwrap();
        next_matching(&mut server_events, |e| {
            matches!(e, ServerEvent::PeerDisconnected { .. })
        })
        .await;
        assert!(server.peers().await.is_empty());

        server.stop().await.unwrap();
        next_matching(&mut server_events, |e| matches!(e, ServerEvent::Stopped)).await;
        assert!(!server.is_running().await);
    }
}
