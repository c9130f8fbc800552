//! Connection actor
//!
//! One task per connection. It owns the socket and the [`Session`], and
//! processes socket reads, pending connect work and commands strictly one
//! at a time, so no per-connection state is shared.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Command, Connection, ConnectionResult};
use super::netsession::{NetworkSession, NetworkSessionError, NETWORK_CONFIGURATION_KEY};
use super::session::{ConnectionState, Effect, Role, Session};
use super::{resolve_host, NetworkConfig, SocketErrorKind};
use crate::config::SettingsStore;
use crate::dispatch::{Controller, EventBuffer, NodeEvent};
use crate::identity::{HostDescription, NodeIdentity};

/// Maps a node event to whatever the owner's event channel carries
pub(crate) type EventTag<T> = fn(Option<SocketAddr>, NodeEvent) -> T;

/// Result of asynchronous connect work
enum Step {
    SessionOpened(Result<String, NetworkSessionError>),
    Dialed(io::Result<(TcpStream, SocketAddr)>),
}

type PendingStep = Pin<Box<dyn Future<Output = Step> + Send>>;

enum Input {
    Command(Command),
    Read(ConnectionResult<Option<bytes::Bytes>>),
    Step(Step),
    Shutdown,
}

/// Collaborators an actor is built with
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub config: NetworkConfig,
    pub identity: NodeIdentity,
    pub settings: Arc<dyn SettingsStore>,
    pub negotiator: Arc<dyn NetworkSession>,
}

pub(crate) struct Actor<T> {
    session: Session,
    controller: EventBuffer,
    connection: Option<Connection>,
    pending: Option<PendingStep>,
    target: Option<(String, u16)>,
    local_bind: Option<IpAddr>,
    remote: Option<SocketAddr>,
    ctx: ActorContext,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<T>,
    tag: EventTag<T>,
    state: Arc<RwLock<ConnectionState>>,
}

impl<T: Send + 'static> Actor<T> {
    /// An idle client-side actor waiting for a connect command
    pub fn client(
        ctx: ActorContext,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<T>,
        tag: EventTag<T>,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        let session = Session::new(Role::Client, ctx.config.session_required);
        Self::build(session, ctx, commands, events, tag, state)
    }

    /// A server-side actor for a socket that was just accepted
    pub fn accepted(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ActorContext,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<T>,
        tag: EventTag<T>,
    ) -> Self {
        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let mut actor = Self::build(Session::new(Role::Server, false), ctx, commands, events, tag, state);
        actor.session.accepted(addr, &mut actor.controller);
        actor.connection = Some(Connection::new(stream, addr));
        actor.remote = Some(addr);
        actor
    }

    fn build(
        session: Session,
        ctx: ActorContext,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<T>,
        tag: EventTag<T>,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        Self {
            session,
            controller: EventBuffer::new(ctx.identity.clone()),
            connection: None,
            pending: None,
            target: None,
            local_bind: None,
            remote: None,
            ctx,
            commands,
            events,
            tag,
            state,
        }
    }

    /// Run until shut down. A server-side actor also stops once its
    /// connection is closed.
    pub async fn run(mut self) {
        self.flush().await;

        loop {
            let input = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => Input::Shutdown,
                    Some(command) => Input::Command(command),
                },
                chunk = read_next(&mut self.connection), if self.connection.is_some() => {
                    Input::Read(chunk)
                }
                step = poll_pending(&mut self.pending), if self.pending.is_some() => {
                    Input::Step(step)
                }
            };

            let shutdown = matches!(input, Input::Shutdown);
            self.handle(input).await;
            self.flush().await;

            if shutdown {
                break;
            }
            if self.session.role() == Role::Server && self.session.state() == ConnectionState::Idle {
                break;
            }
        }

        tracing::debug!("Connection actor for {:?} stopped", self.remote);
    }

    async fn handle(&mut self, input: Input) {
        let ctl = &mut self.controller;

        let effects = match input {
            Input::Shutdown | Input::Command(Command::Shutdown) => self.session.close(ctl),
            Input::Command(Command::Connect { host, port }) => {
                if self.session.role() == Role::Server {
                    tracing::warn!("Connect ignored by server-side connection");
                    Vec::new()
                } else {
                    self.target = Some((host, port));
                    self.session.connect(ctl)
                }
            }
            Input::Command(Command::Close) => self.session.close(ctl),
            Input::Command(Command::Send(message)) => match self.session.send(&message, ctl) {
                Ok(effects) => effects,
                Err(e) => {
                    tracing::warn!("Could not send {:?}: {}", message.command_type(), e);
                    Vec::new()
                }
            },
            Input::Command(Command::Peers(reply)) => {
                let _ = reply.send(self.session.registry().nodes());
                Vec::new()
            }
            Input::Read(Ok(Some(bytes))) => self.session.receive(&bytes, ctl),
            Input::Read(Ok(None)) => self.session.end_of_stream(ctl),
            Input::Read(Err(e)) => self.session.socket_error(SocketErrorKind::from(&e), ctl),
            Input::Step(Step::SessionOpened(Ok(id))) => {
                self.pending = None;
                if let Err(e) = self.ctx.settings.set(NETWORK_CONFIGURATION_KEY, &id) {
                    tracing::warn!("Could not persist network configuration: {}", e);
                }
                self.local_bind = id.parse().ok();
                self.session.session_opened(&id, ctl)
            }
            Input::Step(Step::SessionOpened(Err(e))) => {
                self.pending = None;
                self.session.session_failed(&e.to_string(), ctl)
            }
            Input::Step(Step::Dialed(Ok((stream, addr)))) => {
                self.pending = None;
                self.connection = Some(Connection::new(stream, addr));
                self.session.connected(addr, ctl)
            }
            Input::Step(Step::Dialed(Err(e))) => {
                self.pending = None;
                self.session.socket_error(SocketErrorKind::from(&e), ctl)
            }
        };

        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::DescribeHost => {
                    let description = HostDescription::describe().await;
                    let (host, port) = self.target.clone().unwrap_or_default();
                    for line in description.status_lines(&host, port) {
                        self.controller.add_status_message(line);
                    }
                }
                Effect::OpenNetworkSession => {
                    let saved = self.ctx.settings.get(NETWORK_CONFIGURATION_KEY);
                    let negotiator = self.ctx.negotiator.clone();
                    self.pending = Some(Box::pin(async move {
                        Step::SessionOpened(negotiator.open(saved).await)
                    }));
                }
                Effect::Dial => {
                    let Some((host, port)) = self.target.clone() else {
                        tracing::error!("Dial requested without a target");
                        continue;
                    };
                    let bind = self.local_bind;
                    let timeout = Duration::from_millis(self.ctx.config.connect_timeout_ms);
                    tracing::info!("Connecting to {}:{}", host, port);
                    self.pending = Some(Box::pin(async move {
                        Step::Dialed(dial(host, port, bind, timeout).await)
                    }));
                }
                Effect::Write(frame) => {
                    let Some(connection) = self.connection.as_mut() else {
                        continue;
                    };
                    if let Err(e) = connection.write_frame(&frame).await {
                        if self.session.state() == ConnectionState::Idle {
                            tracing::debug!("Close notification not delivered: {}", e);
                        } else {
                            let kind = SocketErrorKind::from(&e);
                            queue.extend(self.session.socket_error(kind, &mut self.controller));
                        }
                    }
                }
                Effect::Release => {
                    self.pending = None;
                    self.local_bind = None;
                    if let Some(connection) = self.connection.take() {
                        tracing::debug!(
                            "Releasing socket to {} (idle {:?})",
                            connection.remote_addr(),
                            connection.idle_time()
                        );
                        if let Err(e) = connection.shutdown().await {
                            tracing::debug!("Socket shutdown failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Publish the state and forward buffered sink calls.
    ///
    /// The event channel is unbounded so a slow consumer never holds up
    /// command handling.
    async fn flush(&mut self) {
        *self.state.write().await = self.session.state();

        let peer = self.session.peer().or(self.remote);
        for event in self.controller.drain() {
            if self.events.send((self.tag)(peer, event)).is_err() {
                tracing::trace!("Event receiver dropped");
            }
        }
    }
}

async fn read_next(connection: &mut Option<Connection>) -> ConnectionResult<Option<bytes::Bytes>> {
    match connection {
        Some(connection) => connection.read_chunk().await,
        None => std::future::pending().await,
    }
}

async fn poll_pending(pending: &mut Option<PendingStep>) -> Step {
    match pending {
        Some(step) => step.await,
        None => std::future::pending().await,
    }
}

/// Resolve and connect, optionally from a chosen local address
async fn dial(
    host: String,
    port: u16,
    bind: Option<IpAddr>,
    timeout: Duration,
) -> io::Result<(TcpStream, SocketAddr)> {
    let addr = resolve_host(&host, port).await?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(ip) = bind.filter(|ip| ip.is_ipv4() == addr.is_ipv4() && !ip.is_unspecified()) {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    Ok((stream, addr))
}
