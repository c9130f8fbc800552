//! Envelope codec
//!
//! Turns locally originated messages into the JSON array carried by a
//! frame, and decodes received payloads back into envelopes.

use chrono::Local;
use serde_json::Value;
use thiserror::Error;

use super::{CommandType, Envelope};
use crate::identity::NodeIdentity;

/// Envelope codec errors
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// A locally originated message, before it becomes an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Normal(String),
    Status(String),
    Error(String),
    Identify,
    PeersList(Vec<String>),
    MessageTo {
        from: String,
        to: String,
        message: String,
    },
    Close,
}

impl OutgoingMessage {
    pub fn command_type(&self) -> Option<CommandType> {
        match self {
            OutgoingMessage::Normal(_) => Some(CommandType::Normal),
            OutgoingMessage::Status(_) => Some(CommandType::Status),
            OutgoingMessage::Error(_) => Some(CommandType::Error),
            OutgoingMessage::Identify => Some(CommandType::Identify),
            OutgoingMessage::PeersList(_) => Some(CommandType::PeersList),
            OutgoingMessage::MessageTo { .. } => Some(CommandType::MessageTo),
            OutgoingMessage::Close => None,
        }
    }
}

/// Builds outgoing envelopes and numbers them
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    next_id: u64,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart numbering; the next envelope gets id 1
    pub fn reset(&mut self) {
        self.next_id = 0;
    }

    /// Id of the most recently numbered envelope, 0 if none since reset
    pub fn last_id(&self) -> u64 {
        self.next_id
    }

    fn new_key(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Build the envelope for a message
    pub fn build(&mut self, message: &OutgoingMessage, identity: &NodeIdentity) -> Envelope {
        let command = match message.command_type() {
            Some(command) => command,
            None => return Envelope::close(),
        };

        let now = Local::now();
        let mut envelope = Envelope {
            id: Some(self.new_key()),
            kind: command.wire(),
            time: Some(now.format(TIME_FORMAT).to_string()),
            date: Some(now.format(DATE_FORMAT).to_string()),
            id_client: Some(identity.id.clone()),
            group_client: Some(identity.group.clone()),
            name_client: Some(identity.name.clone()),
            type_client: Some(identity.kind.clone()),
            ..Default::default()
        };

        match message {
            OutgoingMessage::Normal(text)
            | OutgoingMessage::Status(text)
            | OutgoingMessage::Error(text) => {
                envelope.args = Some(serde_json::json!({ "message": text }));
            }
            OutgoingMessage::Identify => {
                envelope.description_client = Some(identity.description.clone());
            }
            OutgoingMessage::PeersList(names) => {
                envelope.peers = Some(names.clone());
            }
            OutgoingMessage::MessageTo { from, to, message } => {
                envelope.description_client = Some(identity.description.clone());
                envelope.from = Some(from.clone());
                envelope.to = Some(to.clone());
                envelope.message = Some(message.clone());
            }
            OutgoingMessage::Close => {}
        }

        envelope
    }

    /// Encode a message as the JSON array payload of one frame
    pub fn encode(
        &mut self,
        message: &OutgoingMessage,
        identity: &NodeIdentity,
    ) -> EnvelopeResult<Vec<u8>> {
        let envelope = self.build(message, identity);
        Ok(serde_json::to_vec(&[envelope])?)
    }
}

/// `%a %b %-d %Y`, e.g. `Fri Oct 16 2026`
pub const DATE_FORMAT: &str = "%a %b %-d %Y";

/// `%H:%M:%S`
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Decode a frame payload into its envelopes, in order.
///
/// The payload should be a JSON array of objects. A bare object is
/// accepted as a single envelope; array elements that are not objects
/// are skipped.
pub fn decode(payload: &[u8]) -> EnvelopeResult<Vec<Envelope>> {
    let value: Value = serde_json::from_slice(payload)?;

    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => Vec::new(),
    };

    let mut envelopes = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_object() {
            continue;
        }
        match serde_json::from_value::<Envelope>(item) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => tracing::warn!("Skipping malformed envelope: {}", e),
        }
    }

    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CLOSE, MISSING_TYPE};

    fn identity() -> NodeIdentity {
        NodeIdentity {
            id: "node-1".into(),
            group: "rack-a".into(),
            name: "alpha".into(),
            kind: "worker".into(),
            description: "first node".into(),
        }
    }

    fn encode_one(codec: &mut EnvelopeCodec, message: OutgoingMessage) -> Value {
        let bytes = codec.encode(&message, &identity()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        value.as_array().unwrap()[0].clone()
    }

    #[test]
    fn test_close_carries_only_type() {
        let mut codec = EnvelopeCodec::new();
        let value = encode_one(&mut codec, OutgoingMessage::Close);
        assert_eq!(value, serde_json::json!({ "type": CLOSE }));
        assert_eq!(codec.last_id(), 0);
    }

    #[test]
    fn test_normal_nests_message_under_args() {
        let mut codec = EnvelopeCodec::new();
        let value = encode_one(&mut codec, OutgoingMessage::Normal("hello".into()));

        assert_eq!(value["type"], 0);
        assert_eq!(value["id"], 1);
        assert_eq!(value["args"]["message"], "hello");
        assert_eq!(value["name_client"], "alpha");
        assert_eq!(value["group_client"], "rack-a");
        assert_eq!(value["type_client"], "worker");
        assert!(value.get("description_client").is_none());
        assert!(value["time"].is_string());
        assert!(value["date"].is_string());
    }

    #[test]
    fn test_identify_has_description_and_no_args() {
        let mut codec = EnvelopeCodec::new();
        let value = encode_one(&mut codec, OutgoingMessage::Identify);

        assert_eq!(value["type"], 3);
        assert_eq!(value["description_client"], "first node");
        assert!(value.get("args").is_none());
    }

    #[test]
    fn test_message_to_is_top_level() {
        let mut codec = EnvelopeCodec::new();
        let value = encode_one(
            &mut codec,
            OutgoingMessage::MessageTo {
                from: "alpha".into(),
                to: "beta".into(),
                message: "hi".into(),
            },
        );

        assert_eq!(value["type"], 5);
        assert_eq!(value["from"], "alpha");
        assert_eq!(value["to"], "beta");
        assert_eq!(value["message"], "hi");
        assert!(value.get("args").is_none());
    }

    #[test]
    fn test_ids_are_monotonic_and_reset() {
        let mut codec = EnvelopeCodec::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| {
                codec
                    .build(&OutgoingMessage::Status("up".into()), &identity())
                    .id
                    .unwrap()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        codec.reset();
        let envelope = codec.build(&OutgoingMessage::Identify, &identity());
        assert_eq!(envelope.id, Some(1));
    }

    #[test]
    fn test_decode_array_in_order() {
        let envelopes = decode(br#"[{"type":1},{"type":0},42,{"id":7}]"#).unwrap();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0].kind, 1);
        assert_eq!(envelopes[1].kind, 0);
        assert_eq!(envelopes[2].kind, MISSING_TYPE);
    }

    #[test]
    fn test_decode_bare_object() {
        let envelopes = decode(br#"{"type":5,"from":"A","to":"B","message":"hi"}"#).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].to.as_deref(), Some("B"));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            decode(b"[{\"type\":"),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_encode_then_decode() {
        let mut codec = EnvelopeCodec::new();
        let bytes = codec
            .encode(&OutgoingMessage::PeersList(vec!["a".into(), "b".into()]), &identity())
            .unwrap();
        let envelopes = decode(&bytes).unwrap();
        assert_eq!(envelopes[0].peers, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(envelopes[0].command_type(), Some(CommandType::PeersList));
    }
}
