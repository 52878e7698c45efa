//! Length-delimited framing of relay messages
//!
//! Each message travels as `[length: u32 big-endian][bincode payload]`.

use crate::messages::RelayMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Relay message codec for [`tokio_util::codec::Framed`]
#[derive(Debug)]
pub struct RelayCodec {
    frames: LengthDelimitedCodec,
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCodec {
    pub fn new() -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX)
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        Self { frames }
    }

    /// Encode one message into its own buffer
    pub fn encode_message(msg: &RelayMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::new().encode(msg.clone(), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`; `None` means more bytes are needed
    pub fn decode_message(buf: &mut BytesMut) -> Result<Option<RelayMessage>, CodecError> {
        Self::new().decode(buf)
    }

    fn announced_length(src: &BytesMut) -> Option<usize> {
        let prefix: [u8; LENGTH_PREFIX] = src.get(..LENGTH_PREFIX)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src) {
            Ok(Some(payload)) => Ok(Some(bincode::deserialize(&payload)?)),
            Ok(None) => Ok(None),
            // The header is left in place when the length is refused
            Err(e) if is_oversized(&e) => Err(CodecError::MessageTooLarge(
                Self::announced_length(src).unwrap_or(MAX_FRAME_SIZE + 1),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_oversized(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::InvalidData
        && err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}
