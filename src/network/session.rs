//! Connection lifecycle state machine
//!
//! [`Session`] owns everything one connection needs (frame buffers, id
//! counter, peer registry, dispatch table) but performs no I/O. Every
//! transition returns the [`Effect`]s the driving actor has to carry out,
//! and reports to the collaborator through a [`Controller`].

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use thiserror::Error;

use super::SocketErrorKind;
use crate::dispatch::{CommandContext, Controller, DispatchTable};
use crate::protocol::{
    decode, CodecError, EnvelopeCodec, EnvelopeError, FrameDecoder, FrameEncoder,
    OutgoingMessage, MAX_SERVER_MESSAGES, MISSING_TYPE,
};
use crate::registry::PeerRegistry;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected")]
    NotOpen,

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket, ready for a connect request
    Idle,
    /// Connect requested, socket not yet established
    Connecting,
    /// Waiting for the network session to open before dialing
    AwaitingSession,
    /// Socket established, frames flow
    Open,
    /// Tearing down
    Closing,
}

/// Which side of the connection this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Work the driving actor must perform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Report the local host description through the status sink
    DescribeHost,
    /// Negotiate a network session, then report back
    OpenNetworkSession,
    /// Open the socket to the configured peer
    Dial,
    /// Write one frame to the socket
    Write(Bytes),
    /// Drop the socket and any session object
    Release,
}

/// Per-connection protocol state
pub struct Session {
    role: Role,
    state: ConnectionState,
    session_required: bool,
    envelopes: EnvelopeCodec,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    registry: PeerRegistry,
    dispatch: DispatchTable,
    message_count: usize,
    peer: Option<SocketAddr>,
    has_socket: bool,
}

impl Session {
    pub fn new(role: Role, session_required: bool) -> Self {
        Self::with_dispatch(role, session_required, DispatchTable::default())
    }

    pub fn with_dispatch(role: Role, session_required: bool, dispatch: DispatchTable) -> Self {
        Self {
            role,
            state: ConnectionState::Idle,
            session_required,
            envelopes: EnvelopeCodec::new(),
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            registry: PeerRegistry::new(),
            dispatch,
            message_count: 0,
            peer: None,
            has_socket: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Id given to the most recent locally originated envelope
    pub fn last_id(&self) -> u64 {
        self.envelopes.last_id()
    }

    /// Messages processed since the history was last cleared
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    fn set_state(&mut self, state: ConnectionState, ctl: &mut dyn Controller) {
        if self.state != state {
            tracing::debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            ctl.state_changed(state);
        }
    }

    /// Begin a new connection attempt.
    ///
    /// Ignored while an attempt is already in flight; an open connection is
    /// closed first.
    pub fn connect(&mut self, ctl: &mut dyn Controller) -> Vec<Effect> {
        let mut effects = Vec::new();

        match self.state {
            ConnectionState::Connecting | ConnectionState::AwaitingSession => {
                tracing::warn!("Connect requested while an attempt is in progress");
                return effects;
            }
            ConnectionState::Open | ConnectionState::Closing => {
                effects.extend(self.close(ctl));
            }
            ConnectionState::Idle => {}
        }

        self.envelopes.reset();
        self.decoder.reset();
        self.read_buf.clear();

        ctl.clear_messages();
        ctl.enable_client();
        effects.push(Effect::DescribeHost);
        ctl.disable_client();

        self.set_state(ConnectionState::Connecting, ctl);
        if self.session_required {
            ctl.add_status_message("Opening network session.".to_string());
            self.set_state(ConnectionState::AwaitingSession, ctl);
            effects.push(Effect::OpenNetworkSession);
        } else {
            effects.push(Effect::Dial);
        }

        effects
    }

    /// The network session opened with configuration `id`
    pub fn session_opened(&mut self, id: &str, ctl: &mut dyn Controller) -> Vec<Effect> {
        if self.state != ConnectionState::AwaitingSession {
            tracing::debug!("Network session opened in state {:?}, ignoring", self.state);
            return Vec::new();
        }

        tracing::info!("Network session opened using configuration {}", id);
        ctl.add_status_message(format!("Network session opened ({}).", id));
        vec![Effect::Dial]
    }

    /// The socket to `peer` is established
    pub fn connected(&mut self, peer: SocketAddr, ctl: &mut dyn Controller) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::AwaitingSession => {}
            state => {
                tracing::debug!("Socket established in state {:?}, releasing", state);
                return vec![Effect::Release];
            }
        }

        tracing::info!("Connected to {}", peer);
        self.peer = Some(peer);
        self.has_socket = true;
        self.set_state(ConnectionState::Open, ctl);
        ctl.enable_client();
        Vec::new()
    }

    /// A peer connected to us; server role starts directly in `Open`
    pub fn accepted(&mut self, peer: SocketAddr, ctl: &mut dyn Controller) {
        self.envelopes.reset();
        self.decoder.reset();
        self.read_buf.clear();
        self.peer = Some(peer);
        self.has_socket = true;
        self.set_state(ConnectionState::Open, ctl);
    }

    /// Feed bytes read from the socket
    pub fn receive(&mut self, bytes: &[u8], ctl: &mut dyn Controller) -> Vec<Effect> {
        if self.state != ConnectionState::Open {
            tracing::debug!("Dropping {} bytes received in state {:?}", bytes.len(), self.state);
            return Vec::new();
        }

        self.read_buf.extend_from_slice(bytes);

        let mut effects = Vec::new();
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(payload)) => {
                    effects.extend(self.process_payload(&payload, ctl));
                    if self.state != ConnectionState::Open {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Frame error from {:?}: {}", self.peer, e);
                    break;
                }
            }
        }
        effects
    }

    fn process_payload(&mut self, payload: &str, ctl: &mut dyn Controller) -> Vec<Effect> {
        let envelopes = match decode(payload.as_bytes()) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::warn!("Undecodable payload from {:?}: {}", self.peer, e);
                ctl.add_error_message(format!("Failed to process command: {}", payload));
                return Vec::new();
            }
        };

        let mut dispatched = false;
        for mut envelope in envelopes {
            if let Some(peer) = self.peer {
                envelope.stamp_origin(peer.ip().to_string(), peer.port());
            }

            if envelope.kind == MISSING_TYPE {
                continue;
            }

            if envelope.is_close() {
                tracing::info!("Peer {:?} closed the session", self.peer);
                return self.close(ctl);
            }

            let args = envelope.handler_args();
            let mut ctx = CommandContext {
                controller: &mut *ctl,
                registry: &mut self.registry,
            };
            dispatched |= self.dispatch.dispatch(envelope.kind, &mut ctx, &args, &envelope);
        }

        if dispatched {
            self.count_message(ctl);
        }
        Vec::new()
    }

    fn count_message(&mut self, ctl: &mut dyn Controller) {
        self.message_count += 1;
        if self.message_count > MAX_SERVER_MESSAGES {
            self.message_count = 0;
            ctl.clear_messages();
        }
    }

    /// Encode a locally originated message
    pub fn send(
        &mut self,
        message: &OutgoingMessage,
        ctl: &mut dyn Controller,
    ) -> SessionResult<Vec<Effect>> {
        match message {
            OutgoingMessage::Close => return Ok(self.close(ctl)),
            OutgoingMessage::MessageTo { message, .. } if message == "close" => {
                return Ok(self.close(ctl));
            }
            _ => {}
        }

        if self.state != ConnectionState::Open {
            return Err(SessionError::NotOpen);
        }

        let payload = self.envelopes.encode(message, ctl.identity())?;
        let frame = self.encoder.frame(&payload)?;
        Ok(vec![Effect::Write(frame)])
    }

    /// Close the connection, notifying the peer if a socket exists
    pub fn close(&mut self, ctl: &mut dyn Controller) -> Vec<Effect> {
        self.teardown(true, ctl)
    }

    /// A socket level failure; no close notification is attempted
    pub fn socket_error(&mut self, kind: SocketErrorKind, ctl: &mut dyn Controller) -> Vec<Effect> {
        tracing::error!("Socket error on {:?}: {}", self.peer, kind);
        let effects = self.teardown(false, ctl);
        ctl.add_error_message(kind.to_string());
        effects
    }

    /// The network session could not be opened
    pub fn session_failed(&mut self, reason: &str, ctl: &mut dyn Controller) -> Vec<Effect> {
        self.socket_error(SocketErrorKind::Other(reason.to_string()), ctl)
    }

    /// The peer stopped sending; a partial frame left in the buffer is dropped
    pub fn end_of_stream(&mut self, ctl: &mut dyn Controller) -> Vec<Effect> {
        let dropped = self.decoder.finish(&mut self.read_buf);
        if dropped > 0 {
            tracing::warn!("Stream ended inside a frame, {} bytes discarded", dropped);
        }
        self.socket_error(SocketErrorKind::RemoteClosed, ctl)
    }

    fn teardown(&mut self, notify_peer: bool, ctl: &mut dyn Controller) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Closing, ctl);
        }

        if self.has_socket && notify_peer {
            match self
                .envelopes
                .encode(&OutgoingMessage::Close, ctl.identity())
                .map_err(SessionError::from)
                .and_then(|payload| Ok(self.encoder.frame(&payload)?))
            {
                Ok(frame) => effects.push(Effect::Write(frame)),
                Err(e) => tracing::warn!("Could not encode close notification: {}", e),
            }
        }

        if self.state != ConnectionState::Idle {
            effects.push(Effect::Release);
        }

        self.has_socket = false;
        self.peer = None;
        self.read_buf.clear();
        self.decoder.reset();
        self.envelopes.reset();
        self.registry.clear();
        self.message_count = 0;

        ctl.update_infos(&self.registry);
        ctl.clear_messages();
        ctl.enable_client();

        self.set_state(ConnectionState::Idle, ctl);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EventBuffer, NodeEvent};
    use crate::identity::NodeIdentity;
    use crate::protocol::CLOSE;

    fn peer() -> SocketAddr {
        "10.0.0.2:4100".parse().unwrap()
    }

    fn frame(payload: &str) -> Bytes {
        FrameEncoder::new().frame(payload.as_bytes()).unwrap()
    }

    fn open_session() -> (Session, EventBuffer) {
        let mut ctl = EventBuffer::new(NodeIdentity {
            name: "local".into(),
            ..Default::default()
        });
        let mut session = Session::new(Role::Client, false);
        assert_eq!(session.connect(&mut ctl), vec![Effect::DescribeHost, Effect::Dial]);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.connected(peer(), &mut ctl).is_empty());
        assert_eq!(session.state(), ConnectionState::Open);
        ctl.drain();
        (session, ctl)
    }

    fn count(ctl: &EventBuffer, pred: impl Fn(&NodeEvent) -> bool) -> usize {
        ctl.events().iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn test_connect_ignored_while_connecting() {
        let mut ctl = EventBuffer::default();
        let mut session = Session::new(Role::Client, false);
        session.connect(&mut ctl);
        assert!(session.connect(&mut ctl).is_empty());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_session_required_path() {
        let mut ctl = EventBuffer::default();
        let mut session = Session::new(Role::Client, true);

        let effects = session.connect(&mut ctl);
        assert_eq!(effects, vec![Effect::DescribeHost, Effect::OpenNetworkSession]);
        assert_eq!(session.state(), ConnectionState::AwaitingSession);

        assert_eq!(session.session_opened("0.0.0.0", &mut ctl), vec![Effect::Dial]);
        session.connected(peer(), &mut ctl);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_connect_disables_then_open_enables() {
        let mut ctl = EventBuffer::default();
        let mut session = Session::new(Role::Client, false);
        session.connect(&mut ctl);
        assert_eq!(
            ctl.events().iter().rev().find(|e| matches!(e, NodeEvent::ClientEnabled(_))),
            Some(&NodeEvent::ClientEnabled(false))
        );

        session.connected(peer(), &mut ctl);
        assert_eq!(
            ctl.events().iter().rev().find(|e| matches!(e, NodeEvent::ClientEnabled(_))),
            Some(&NodeEvent::ClientEnabled(true))
        );
    }

    #[test]
    fn test_ids_restart_after_reconnect() {
        let (mut session, mut ctl) = open_session();
        for _ in 0..3 {
            session
                .send(&OutgoingMessage::Normal("x".into()), &mut ctl)
                .unwrap();
        }
        assert_eq!(session.last_id(), 3);

        session.close(&mut ctl);
        assert_eq!(session.last_id(), 0);

        session.connect(&mut ctl);
        session.connected(peer(), &mut ctl);
        session.send(&OutgoingMessage::Identify, &mut ctl).unwrap();
        assert_eq!(session.last_id(), 1);
    }

    #[test]
    fn test_send_requires_open() {
        let mut ctl = EventBuffer::default();
        let mut session = Session::new(Role::Client, false);
        let result = session.send(&OutgoingMessage::Normal("x".into()), &mut ctl);
        assert!(matches!(result, Err(SessionError::NotOpen)));
    }

    #[test]
    fn test_duplicate_frame_dispatched_once() {
        let (mut session, mut ctl) = open_session();
        let bytes = frame(r#"[{"type":0,"args":{"message":"hi"}}]"#);

        session.receive(&bytes, &mut ctl);
        session.receive(&bytes, &mut ctl);

        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::Message(_))), 1);
        assert_eq!(session.message_count(), 1);
    }

    #[test]
    fn test_partial_frames_wait_for_completion() {
        let (mut session, mut ctl) = open_session();
        let bytes = frame(r#"[{"type":0,"args":{"message":"slow"}}]"#);

        for byte in bytes.iter() {
            session.receive(&[*byte], &mut ctl);
        }
        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::Message(_))), 1);
    }

    #[test]
    fn test_message_counter_rollover() {
        let (mut session, mut ctl) = open_session();

        for i in 0..=MAX_SERVER_MESSAGES {
            let payload = format!(r#"[{{"type":0,"args":{{"message":"m{}"}}}}]"#, i);
            session.receive(&frame(&payload), &mut ctl);
        }

        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::ClearMessages)), 1);
        assert_eq!(session.message_count(), 0);
    }

    #[test]
    fn test_close_envelope_tears_down() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame(r#"[{"type":3,"name_client":"peer"}]"#), &mut ctl);
        session
            .send(&OutgoingMessage::Normal("x".into()), &mut ctl)
            .unwrap();
        assert_eq!(session.registry().len(), 1);
        ctl.drain();

        let effects = session.receive(&frame(&format!(r#"[{{"type":{}}}]"#, CLOSE)), &mut ctl);

        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(session.registry().is_empty());
        assert_eq!(session.last_id(), 0);
        assert!(matches!(effects.as_slice(), [Effect::Write(_), Effect::Release]));
        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::Message(_) | NodeEvent::Identified(_))), 0);
        assert_eq!(ctl.events().last(), Some(&NodeEvent::StateChanged(ConnectionState::Idle)));
    }

    #[test]
    fn test_envelopes_after_close_are_not_dispatched() {
        let (mut session, mut ctl) = open_session();
        let payload = format!(
            r#"[{{"type":{}}},{{"type":0,"args":{{"message":"late"}}}}]"#,
            CLOSE
        );
        session.receive(&frame(&payload), &mut ctl);
        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::Message(_))), 0);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_relay_then_unknown_type() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame(r#"{"type":5,"from":"A","to":"B","message":"hi"}"#), &mut ctl);
        session.receive(&frame(r#"[{"type":-1,"args":{"message":"?"}}]"#), &mut ctl);

        assert_eq!(
            ctl.events(),
            &[NodeEvent::Relay {
                from: "A".into(),
                to: "B".into(),
                message: "hi".into()
            }]
        );
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_unknown_types_not_counted() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame(r#"[{"type":-1}]"#), &mut ctl);
        session.receive(&frame(r#"[{"type":6,"args":{"message":"future"}}]"#), &mut ctl);
        session.receive(&frame(r#"[{"args":{"message":"untyped"}}]"#), &mut ctl);
        assert_eq!(session.message_count(), 0);

        session.receive(&frame(r#"[{"type":6},{"type":1,"args":{"message":"ok"}}]"#), &mut ctl);
        assert_eq!(session.message_count(), 1);
    }

    #[test]
    fn test_loosely_typed_fields_still_dispatch() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame(r#"{"type":3,"name_client":"x","type_client":2}"#), &mut ctl);
        session.receive(&frame(r#"{"type":4,"peers":["a",null]}"#), &mut ctl);
        session.receive(&frame(r#"{"type":0,"id":"7","args":{"message":"hi"}}"#), &mut ctl);

        assert_eq!(session.registry().len(), 1);
        assert_eq!(session.registry().get("10.0.0.2", 4100).unwrap().kind, "2");
        assert_eq!(count(&ctl, |e| matches!(e, NodeEvent::Identified(_))), 1);
        assert!(ctl.events().contains(&NodeEvent::PeerList(vec!["a".into()])));
        assert_eq!(
            count(&ctl, |e| matches!(e, NodeEvent::Message(line) if line.ends_with("> hi"))),
            1
        );
        assert_eq!(session.message_count(), 3);
    }

    #[test]
    fn test_invalid_json_reported_connection_stays_open() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame("not json"), &mut ctl);

        assert_eq!(
            ctl.events(),
            &[NodeEvent::Error("Failed to process command: not json".into())]
        );
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_identity_stamped_with_observed_address() {
        let (mut session, mut ctl) = open_session();
        session.receive(&frame(r#"[{"type":3,"name_client":"one","IP":"6.6.6.6"}]"#), &mut ctl);

        let info = session.registry().get("10.0.0.2", 4100).unwrap();
        assert_eq!(info.name, "one");
        assert!(session.registry().get("6.6.6.6", 4100).is_none());
    }

    #[test]
    fn test_socket_error_forces_idle_without_notify() {
        let (mut session, mut ctl) = open_session();
        let effects = session.socket_error(SocketErrorKind::ConnectionRefused, &mut ctl);

        assert_eq!(effects, vec![Effect::Release]);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(matches!(ctl.events().last(), Some(NodeEvent::Error(_))));
    }

    #[test]
    fn test_close_while_connecting_releases() {
        let mut ctl = EventBuffer::default();
        let mut session = Session::new(Role::Client, false);
        session.connect(&mut ctl);

        assert_eq!(session.close(&mut ctl), vec![Effect::Release]);
        assert_eq!(session.state(), ConnectionState::Idle);

        // A socket that completes after the close is released immediately
        assert_eq!(session.connected(peer(), &mut ctl), vec![Effect::Release]);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_relay_close_shortcut() {
        let (mut session, mut ctl) = open_session();
        let effects = session
            .send(
                &OutgoingMessage::MessageTo {
                    from: "a".into(),
                    to: "b".into(),
                    message: "close".into(),
                },
                &mut ctl,
            )
            .unwrap();
        assert!(matches!(effects.as_slice(), [Effect::Write(_), Effect::Release]));
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_end_of_stream_discards_partial() {
        let (mut session, mut ctl) = open_session();
        let bytes = frame(r#"[{"type":0}]"#);
        session.receive(&bytes[..4], &mut ctl);

        session.end_of_stream(&mut ctl);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(
            ctl.events().last(),
            Some(&NodeEvent::Error(SocketErrorKind::RemoteClosed.to_string()))
        );
    }
}
