//! Connection handling for CmdNode
//!
//! Wraps one socket: raw chunk reads, frame writes, statistics, and the
//! mapping from I/O failures to the socket error categories reported to
//! the collaborator.

use bytes::Bytes;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{NodeInfo, OutgoingMessage};

/// Bytes requested from the socket per read
const READ_CHUNK: usize = 4096;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Command channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Socket failure categories, with the text shown to the user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketErrorKind {
    #[error("The remote host closed the connection.")]
    RemoteClosed,

    #[error("Host not found. Please check the host name and port settings.")]
    HostNotFound,

    #[error(
        "The connection was refused by the peer. Make sure the server is running, \
         and check that the host name and port settings are correct."
    )]
    ConnectionRefused,

    #[error("The connection attempt timed out.")]
    Timeout,

    #[error("The following error occurred: {0}.")]
    Other(String),
}

impl From<&std::io::Error> for SocketErrorKind {
    fn from(error: &std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => SocketErrorKind::RemoteClosed,
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => SocketErrorKind::HostNotFound,
            ErrorKind::ConnectionRefused => SocketErrorKind::ConnectionRefused,
            ErrorKind::TimedOut => SocketErrorKind::Timeout,
            _ => SocketErrorKind::Other(error.to_string()),
        }
    }
}

impl From<&ConnectionError> for SocketErrorKind {
    fn from(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::Io(e) => SocketErrorKind::from(e),
            ConnectionError::Closed => SocketErrorKind::RemoteClosed,
            other => SocketErrorKind::Other(other.to_string()),
        }
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames written
    pub frames_sent: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
}

/// One established socket
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The byte stream
    stream: S,
    /// Statistics
    stats: ConnectionStats,
    /// Last activity timestamp
    last_activity: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            stats: ConnectionStats::default(),
            last_activity: Instant::now(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Read whatever the socket has; `None` once the peer has finished
    /// sending. Cancel safe.
    pub async fn read_chunk(&mut self) -> ConnectionResult<Option<Bytes>> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;

        if n == 0 {
            return Ok(None);
        }

        self.stats.bytes_received += n as u64;
        self.last_activity = Instant::now();
        Ok(Some(Bytes::copy_from_slice(&buf[..n])))
    }

    /// Write one already framed message
    pub async fn write_frame(&mut self, frame: &[u8]) -> ConnectionResult<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Shut the write half down and drop the socket
    pub async fn shutdown(mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Get time since last activity
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Requests accepted by a connection actor
#[derive(Debug)]
pub enum Command {
    /// Open a connection to `host:port`
    Connect { host: String, port: u16 },
    /// Close the current connection, if any
    Close,
    /// Encode and send a message
    Send(OutgoingMessage),
    /// Snapshot of the peer registry
    Peers(oneshot::Sender<Vec<NodeInfo>>),
    /// Close and stop the actor
    Shutdown,
}

/// A handle for sending commands to a connection actor
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Command>) -> Self {
        Self {
            sender,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a command for the actor
    pub async fn send(&self, command: Command) -> ConnectionResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(command)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Queue an outgoing message
    pub async fn send_message(&self, message: OutgoingMessage) -> ConnectionResult<()> {
        self.send(Command::Send(message)).await
    }

    /// Ask the actor for its peer registry
    pub async fn peers(&self) -> ConnectionResult<Vec<NodeInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Peers(tx)).await?;
        rx.await.map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the actor is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the actor as stopped
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
