//! Collaborator interface
//!
//! Everything the protocol core reports goes through a [`Controller`].
//! Handlers call it synchronously; nothing here touches the network.

use crate::identity::NodeIdentity;
use crate::network::ConnectionState;
use crate::protocol::{Envelope, NodeInfo};
use crate::registry::PeerRegistry;

/// Sinks consumed by the protocol core
pub trait Controller: Send {
    /// Identity attached to locally originated envelopes
    fn identity(&self) -> &NodeIdentity;

    fn add_status_message(&mut self, text: String);

    fn add_error_message(&mut self, text: String);

    fn add_client_message(&mut self, text: String);

    /// A peer identified itself; its registry entry is already updated
    fn add_identify(&mut self, envelope: &Envelope);

    fn add_peer_list(&mut self, names: Vec<String>);

    /// Route a relayed message to its recipient
    fn send_message_to(&mut self, from: String, to: String, message: String);

    /// The peer registry changed
    fn update_infos(&mut self, registry: &PeerRegistry);

    /// Drop any accumulated message history
    fn clear_messages(&mut self);

    /// Allow further connect requests
    fn enable_client(&mut self);

    /// Block connect requests until the current attempt resolves
    fn disable_client(&mut self);

    /// Lifecycle transition, informational
    fn state_changed(&mut self, _state: ConnectionState) {}
}

/// A sink invocation, as delivered to consumers of the event channel
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Status(String),
    Error(String),
    Message(String),
    Identified(Envelope),
    PeerList(Vec<String>),
    Relay {
        from: String,
        to: String,
        message: String,
    },
    PeersUpdated(Vec<NodeInfo>),
    ClearMessages,
    ClientEnabled(bool),
    StateChanged(ConnectionState),
}

/// Controller that records every sink call as a [`NodeEvent`].
///
/// The connection actor drains it after each step and forwards the events.
#[derive(Debug, Default)]
pub struct EventBuffer {
    identity: NodeIdentity,
    events: Vec<NodeEvent>,
}

impl EventBuffer {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            events: Vec::new(),
        }
    }

    pub fn drain(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[NodeEvent] {
        &self.events
    }
}

impl Controller for EventBuffer {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn add_status_message(&mut self, text: String) {
        self.events.push(NodeEvent::Status(text));
    }

    fn add_error_message(&mut self, text: String) {
        self.events.push(NodeEvent::Error(text));
    }

    fn add_client_message(&mut self, text: String) {
        self.events.push(NodeEvent::Message(text));
    }

    fn add_identify(&mut self, envelope: &Envelope) {
        self.events.push(NodeEvent::Identified(envelope.clone()));
    }

    fn add_peer_list(&mut self, names: Vec<String>) {
        self.events.push(NodeEvent::PeerList(names));
    }

    fn send_message_to(&mut self, from: String, to: String, message: String) {
        self.events.push(NodeEvent::Relay { from, to, message });
    }

    fn update_infos(&mut self, registry: &PeerRegistry) {
        self.events.push(NodeEvent::PeersUpdated(registry.nodes()));
    }

    fn clear_messages(&mut self) {
        self.events.push(NodeEvent::ClearMessages);
    }

    fn enable_client(&mut self) {
        self.events.push(NodeEvent::ClientEnabled(true));
    }

    fn disable_client(&mut self) {
        self.events.push(NodeEvent::ClientEnabled(false));
    }

    fn state_changed(&mut self, state: ConnectionState) {
        self.events.push(NodeEvent::StateChanged(state));
    }
}
