//! Wire framing codecs.
//!
//! The platform's exact framing is a protocol detail kept behind the
//! [`WireCodec`] trait so the rest of the gateway never hard-codes it.
//! The default codec frames each message as a 4-byte little-endian
//! length prefix followed by a JSON object carrying the type code in a
//! `"Type"` field.

use crate::error::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use desk_core::RawMessage;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// A codec that can both parse and produce [`RawMessage`] frames.
///
/// Blanket-implemented for any tokio-util codec with the right item and
/// error types; supply a custom implementation to speak a different
/// framing without touching the connection logic.
pub trait WireCodec:
    Encoder<RawMessage, Error = TransportError>
    + Decoder<Item = RawMessage, Error = TransportError>
    + Send
    + 'static
{
}

impl<T> WireCodec for T where
    T: Encoder<RawMessage, Error = TransportError>
        + Decoder<Item = RawMessage, Error = TransportError>
        + Send
        + 'static
{
}

const LENGTH_PREFIX_BYTES: usize = 4;
const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

/// Length-prefixed JSON framing.
#[derive(Debug, Clone)]
pub struct LengthPrefixedJson {
    max_frame_bytes: usize,
}

impl LengthPrefixedJson {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for LengthPrefixedJson {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for LengthPrefixedJson {
    type Item = RawMessage;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawMessage>, TransportError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        if src.len() < LENGTH_PREFIX_BYTES + len {
            // Not enough data yet; reserve what the full frame needs.
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(len);

        let fields: Value = serde_json::from_slice(&body)?;
        let type_code = fields
            .get("Type")
            .and_then(Value::as_u64)
            .and_then(|t| u16::try_from(t).ok())
            .ok_or_else(|| {
                TransportError::Codec("frame body missing numeric Type field".to_string())
            })?;

        Ok(Some(RawMessage::new(type_code, fields)))
    }
}

impl Encoder<RawMessage> for LengthPrefixedJson {
    type Error = TransportError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), TransportError> {
        let mut fields = item.fields;
        if !fields.is_object() {
            fields = Value::Object(serde_json::Map::new());
        }
        fields["Type"] = Value::from(item.type_code);

        let body = serde_json::to_vec(&fields)?;
        if body.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
