//! Protocol message definitions
//!
//! Defines the command envelope exchanged between CmdNode hosts and the
//! node descriptor cached for every identified peer.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::{CLOSE, MISSING_TYPE};

/// Number of entries in the dispatch table
pub const N_COMMANDS: usize = 6;

/// Command kinds carried in the `type` field.
///
/// The discriminants are wire values and double as dispatch table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Normal = 0,
    Status = 1,
    Error = 2,
    Identify = 3,
    PeersList = 4,
    MessageTo = 5,
}

impl CommandType {
    /// All command types in table order
    pub const ALL: [CommandType; N_COMMANDS] = [
        CommandType::Normal,
        CommandType::Status,
        CommandType::Error,
        CommandType::Identify,
        CommandType::PeersList,
        CommandType::MessageTo,
    ];

    /// Get the wire value
    pub fn wire(self) -> i64 {
        self as i64
    }

    /// Map a wire value back to a command type, `None` for anything outside the table
    pub fn from_wire(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}

/// One protocol command.
///
/// The schema is a flat key/value object; fields this node does not know
/// about are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-local sequence number
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<u64>,

    /// Command kind, see [`CommandType`] and [`CLOSE`]
    #[serde(
        rename = "type",
        default = "missing_type",
        deserialize_with = "lenient_type"
    )]
    pub kind: i64,

    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id_client: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub group_client: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub name_client: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub type_client: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub description_client: Option<String>,

    /// Command specific payload, e.g. `{"message": "..."}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    /// Relay fields, top level by design of the wire format
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Peer names of a peers list command
    #[serde(
        default,
        deserialize_with = "lenient_peers",
        skip_serializing_if = "Option::is_none"
    )]
    pub peers: Option<Vec<String>>,

    /// Observed address of the sender, stamped on receipt
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn missing_type() -> i64 {
    MISSING_TYPE
}

/// Non-integer `type` values are treated as unknown commands rather than
/// failing the whole payload.
fn lenient_type<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().unwrap_or(MISSING_TYPE),
        Value::String(s) => s.trim().parse().unwrap_or(MISSING_TYPE),
        _ => MISSING_TYPE,
    })
}

/// Scalars rendered as text; anything else reads as absent
fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(scalar_text))
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Entries that are not scalars are dropped from the list
fn lenient_peers<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => Some(items.into_iter().filter_map(scalar_text).collect()),
        _ => None,
    })
}

/// Older peers stamp the port as a decimal string.
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl Envelope {
    /// Create an empty envelope of the given kind
    pub fn new(kind: i64) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// The close signal. Carries nothing but its type.
    pub fn close() -> Self {
        Self::new(CLOSE)
    }

    pub fn is_close(&self) -> bool {
        self.kind == CLOSE
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_wire(self.kind)
    }

    /// Record the observed network address of the sender
    pub fn stamp_origin(&mut self, ip: impl Into<String>, port: u16) {
        self.ip = Some(ip.into());
        self.port = Some(port);
    }

    /// Arguments handed to a command handler.
    ///
    /// Falls back to the whole envelope when no `args` object is present.
    pub fn handler_args(&self) -> Map<String, Value> {
        if let Some(Value::Object(args)) = &self.args {
            return args.clone();
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Last-known identity of a remote node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub group: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub port: u16,
    pub date: String,
    pub time: String,
}

impl NodeInfo {
    /// Build a descriptor from an identify or status envelope.
    ///
    /// Returns `None` when the envelope was never stamped with an address.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let ip = envelope.ip.clone()?;
        let port = envelope.port?;
        let field = |value: &Option<String>| value.clone().unwrap_or_default();

        Some(Self {
            id: field(&envelope.id_client),
            name: field(&envelope.name_client),
            group: field(&envelope.group_client),
            kind: field(&envelope.type_client),
            description: field(&envelope.description_client),
            ip,
            port,
            date: field(&envelope.date),
            time: field(&envelope.time),
        })
    }
}
