//! CmdNode Client
//!
//! Connects to a peer and exchanges command envelopes with it.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use super::actor::{Actor, ActorContext};
use super::connection::{Command, ConnectionError, ConnectionHandle};
use super::netsession::{BindSession, NetworkSession};
use super::session::ConnectionState;
use super::NetworkConfig;
use crate::config::{MemorySettings, SettingsStore};
use crate::dispatch::NodeEvent;
use crate::identity::NodeIdentity;
use crate::protocol::{NodeInfo, OutgoingMessage};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
pub type ClientEvent = NodeEvent;

/// CmdNode Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Local identity
    identity: NodeIdentity,
    /// Current state, published by the actor
    state: Arc<RwLock<ConnectionState>>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    /// Handle for sending commands to the actor
    handle: ConnectionHandle,
}

impl Client {
    /// Create a client with in-memory settings.
    ///
    /// Spawns the connection actor, so this must run inside a Tokio runtime.
    pub fn new(config: NetworkConfig, identity: NodeIdentity) -> Self {
        let negotiator = Arc::new(BindSession::new(config.bind_address.clone()));
        Self::with_collaborators(config, identity, Arc::new(MemorySettings::new()), negotiator)
    }

    /// Create a client with explicit settings store and session negotiator
    pub fn with_collaborators(
        config: NetworkConfig,
        identity: NodeIdentity,
        settings: Arc<dyn SettingsStore>,
        negotiator: Arc<dyn NetworkSession>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let state = Arc::new(RwLock::new(ConnectionState::Idle));

        let ctx = ActorContext {
            config: config.clone(),
            identity: identity.clone(),
            settings,
            negotiator,
        };
        let actor = Actor::client(ctx, command_rx, event_tx, |_, event| event, state.clone());

        let handle = ConnectionHandle::new(command_tx);
        let stopped = handle.clone();
        tokio::spawn(async move {
            actor.run().await;
            stopped.mark_stopped();
        });

        Self {
            config,
            identity,
            state,
            event_rx: Some(event_rx),
            handle,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Local identity attached to outgoing envelopes
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Connect to the configured host
    pub async fn connect(&self) -> ClientResult<()> {
        self.connect_to(&self.config.host, self.config.port).await
    }

    /// Connect to `host:port`, closing any open connection first
    pub async fn connect_to(&self, host: &str, port: u16) -> ClientResult<()> {
        self.handle
            .send(Command::Connect {
                host: host.to_string(),
                port,
            })
            .await?;
        Ok(())
    }

    /// Close the connection; the peer is notified if a socket exists
    pub async fn close(&self) -> ClientResult<()> {
        self.handle.send(Command::Close).await?;
        Ok(())
    }

    pub async fn send_message(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(OutgoingMessage::Normal(text.into())).await
    }

    pub async fn send_status(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(OutgoingMessage::Status(text.into())).await
    }

    pub async fn send_error(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(OutgoingMessage::Error(text.into())).await
    }

    /// Relay `message` from `from` to the node named `to`.
    ///
    /// A message of exactly `close` closes the connection instead.
    pub async fn send_message_to(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> ClientResult<()> {
        self.send(OutgoingMessage::MessageTo {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        })
        .await
    }

    /// Announce our identity to the peer
    pub async fn identify(&self) -> ClientResult<()> {
        self.send(OutgoingMessage::Identify).await
    }

    async fn send(&self, message: OutgoingMessage) -> ClientResult<()> {
        if !self.is_connected().await && message != OutgoingMessage::Close {
            return Err(ClientError::NotConnected);
        }
        self.handle.send_message(message).await?;
        Ok(())
    }

    /// Known peers, as of the last identify/status traffic
    pub async fn peers(&self) -> ClientResult<Vec<NodeInfo>> {
        Ok(self.handle.peers().await?)
    }

    /// Close the connection and stop the actor
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.handle.send(Command::Shutdown).await?;
        Ok(())
    }

    /// Get the current state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Open
    }
}
