//! Protocol module - Defines the wire protocol for CmdNode communication
//!
//! Every frame on the wire is:
//! - 2 bytes payload length (big-endian, unsigned)
//! - Variable length UTF-8 payload holding a JSON array of command envelopes

mod message;
mod codec;
mod envelope;

pub use message::*;
pub use codec::*;
pub use envelope::*;

/// Default port for CmdNode communication
pub const DEFAULT_PORT: u16 = 24900;

/// Wire value of the close signal. Never reaches the dispatch table.
pub const CLOSE: i64 = 99;

/// Envelopes without a `type` field decode to this value and are skipped
pub const MISSING_TYPE: i64 = -1;

/// Processed messages kept before the collaborator is told to clear its history
pub const MAX_SERVER_MESSAGES: usize = 50;
