//! Frame codec for the length-prefixed transport
//!
//! Splits a byte stream into complete payloads and drops a payload that
//! repeats the one received immediately before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// Header size: length(2)
pub const HEADER_SIZE: usize = 2;

/// Largest payload a 2-byte header can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("Stream desynchronized, discarded {0} buffered bytes")]
    Desync(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes payloads into the wire format
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Append one frame to the buffer
    pub fn encode(&self, payload: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        Ok(())
    }

    /// Encode a single frame into its own buffer
    pub fn frame(&self, payload: &[u8]) -> CodecResult<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        self.encode(payload, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decodes payloads from the wire format
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Most recently delivered payload
    last: Option<Bytes>,
    /// Frames dropped as repeats since the last reset
    suppressed: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to decode the next payload from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed; nothing is consumed in
    /// that case. A payload byte-identical to the previous one is skipped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<String>> {
        loop {
            if buf.len() < HEADER_SIZE {
                return Ok(None);
            }

            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if buf.len() < HEADER_SIZE + length {
                return Ok(None);
            }

            buf.advance(HEADER_SIZE);
            let payload = buf.split_to(length).freeze();

            if self.last.as_ref() == Some(&payload) {
                self.suppressed += 1;
                tracing::debug!("Dropping repeated frame ({} bytes)", length);
                continue;
            }

            let text = match std::str::from_utf8(&payload) {
                Ok(text) => text.to_owned(),
                Err(_) => {
                    let discarded = length + buf.len();
                    buf.clear();
                    return Err(CodecError::Desync(discarded));
                }
            };

            self.last = Some(payload);
            return Ok(Some(text));
        }
    }

    /// Discard whatever is left once the stream has ended.
    ///
    /// Returns the number of bytes dropped.
    pub fn finish(&mut self, buf: &mut BytesMut) -> usize {
        let leftover = buf.len();
        if leftover > 0 {
            tracing::debug!("Discarding {} bytes of truncated frame", leftover);
        }
        buf.clear();
        leftover
    }

    /// Forget the last delivered payload
    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &str) -> Bytes {
        FrameEncoder::new().frame(payload.as_bytes()).unwrap()
    }

    #[test]
    fn test_wire_layout() {
        let frame = framed("[{}]");
        assert_eq!(&frame[..], &[0x00, 0x04, b'[', b'{', b'}', b']']);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&framed(r#"[{"type":0}]"#)[..]);

        let payload = decoder.decode(&mut buf).unwrap();
        assert_eq!(payload.as_deref(), Some(r#"[{"type":0}]"#));
        assert!(buf.is_empty());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_split_delivery_at_every_offset() {
        let frame = framed(r#"[{"type":1,"args":{"message":"split me"}}]"#);

        for split in 0..frame.len() {
            let mut decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();

            buf.extend_from_slice(&frame[..split]);
            assert!(decoder.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), split, "partial bytes must stay buffered");

            buf.extend_from_slice(&frame[split..]);
            assert!(decoder.decode(&mut buf).unwrap().is_some());
            assert!(decoder.decode(&mut buf).unwrap().is_none());
        }
    }

    #[test]
    fn test_repeated_frame_suppressed() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&framed("same"));
        buf.extend_from_slice(&framed("same"));
        buf.extend_from_slice(&framed("other"));
        buf.extend_from_slice(&framed("same"));

        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some("same"));
        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some("other"));
        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some("same"));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(decoder.suppressed(), 1);
    }

    #[test]
    fn test_reset_forgets_last_payload() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&framed("ping")[..]);
        decoder.decode(&mut buf).unwrap();

        decoder.reset();
        buf.extend_from_slice(&framed("ping"));
        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some("ping"));
    }

    #[test]
    fn test_invalid_utf8_discards_buffer() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(&[0xff, 0xfe], &mut buf).unwrap();
        encoder.encode(b"after", &mut buf).unwrap();

        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(CodecError::Desync(9))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_tail_discarded() {
        let frame = framed("truncated");
        let mut buf = BytesMut::from(&frame[..5]);
        let mut decoder = FrameDecoder::new();

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(decoder.finish(&mut buf), 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![b'x'; MAX_PAYLOAD_SIZE + 1];
        let mut buf = BytesMut::new();
        let result = FrameEncoder::new().encode(&payload, &mut buf);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge(_, _))));
        assert!(buf.is_empty());
    }
}
