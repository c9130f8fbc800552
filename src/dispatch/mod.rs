//! Command dispatch
//!
//! Routes a decoded envelope to the handler registered for its `type`.
//! Types outside the table are ignored so that newer peers can send
//! commands this node does not know yet.

mod controller;
mod handlers;

pub use controller::*;

use serde_json::{Map, Value};

use crate::protocol::{CommandType, Envelope, N_COMMANDS};
use crate::registry::PeerRegistry;

/// State a handler may touch
pub struct CommandContext<'a> {
    pub controller: &'a mut dyn Controller,
    pub registry: &'a mut PeerRegistry,
}

/// A command handler. Pure with respect to the network.
pub type Handler = fn(&mut CommandContext<'_>, &Map<String, Value>, &Envelope);

/// Fixed table of handlers indexed by command type
#[derive(Clone)]
pub struct DispatchTable {
    handlers: [Handler; N_COMMANDS],
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self {
            handlers: [
                handlers::print_message,
                handlers::print_status,
                handlers::print_error,
                handlers::process_identify,
                handlers::process_peers_list,
                handlers::send_message_to,
            ],
        }
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler for one command type
    pub fn with_handler(mut self, command: CommandType, handler: Handler) -> Self {
        self.handlers[command as usize] = handler;
        self
    }

    /// Run the handler for `command_type`.
    ///
    /// Returns `false` without doing anything when the type has no entry.
    pub fn dispatch(
        &self,
        command_type: i64,
        ctx: &mut CommandContext<'_>,
        args: &Map<String, Value>,
        envelope: &Envelope,
    ) -> bool {
        match CommandType::from_wire(command_type) {
            Some(command) => {
                (self.handlers[command as usize])(ctx, args, envelope);
                true
            }
            None => {
                tracing::debug!("Ignoring unknown command type {}", command_type);
                false
            }
        }
    }
}
