//! Stream mux frames
//!
//! A relay connection carries one ordered byte stream. Several local sockets
//! share it by wrapping their bytes in frames tagged with a stream id:
//!
//! ```text
//! Open  : [0x01][stream_id: u32]
//! Data  : [0x02][stream_id: u32][length: u16][payload]
//! Close : [0x03][stream_id: u32]
//! Eof   : [0x04][stream_id: u32]
//! ```
//!
//! `Eof` half-closes a stream: the sender has nothing more to write but keeps
//! reading until the peer sends its own `Eof` or a `Close`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub type StreamId = u32;

const TAG_OPEN: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_CLOSE: u8 = 0x03;
const TAG_EOF: u8 = 0x04;

/// Tag plus stream id
const PREFIX_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    Open(StreamId),
    Data(StreamId, Bytes),
    Close(StreamId),
    Eof(StreamId),
}

impl MuxFrame {
    /// Largest payload one Data frame can carry
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    pub fn stream_id(&self) -> StreamId {
        match self {
            MuxFrame::Open(id)
            | MuxFrame::Data(id, _)
            | MuxFrame::Close(id)
            | MuxFrame::Eof(id) => *id,
        }
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::new();
        MuxCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("unknown mux frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("mux payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental encoder and decoder for [`MuxFrame`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Encoder<MuxFrame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), MuxError> {
        match frame {
            MuxFrame::Open(id) => {
                dst.put_u8(TAG_OPEN);
                dst.put_u32(id);
            }
            MuxFrame::Close(id) => {
                dst.put_u8(TAG_CLOSE);
                dst.put_u32(id);
            }
            MuxFrame::Eof(id) => {
                dst.put_u8(TAG_EOF);
                dst.put_u32(id);
            }
            MuxFrame::Data(id, payload) => {
                let len = u16::try_from(payload.len())
                    .map_err(|_| MuxError::PayloadTooLarge(payload.len()))?;
                dst.reserve(PREFIX_LEN + 2 + payload.len());
                dst.put_u8(TAG_DATA);
                dst.put_u32(id);
                dst.put_u16(len);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxFrame>, MuxError> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        let needed = match tag {
            TAG_OPEN | TAG_CLOSE | TAG_EOF => PREFIX_LEN,
            TAG_DATA if src.len() < PREFIX_LEN + 2 => return Ok(None),
            TAG_DATA => {
                let len = u16::from_be_bytes([src[PREFIX_LEN], src[PREFIX_LEN + 1]]);
                PREFIX_LEN + 2 + len as usize
            }
            other => return Err(MuxError::UnknownTag(other)),
        };
        if src.len() < needed {
            return Ok(None);
        }

        let mut frame = src.split_to(needed);
        frame.advance(1);
        let id = frame.get_u32();

        Ok(Some(match tag {
            TAG_OPEN => MuxFrame::Open(id),
            TAG_CLOSE => MuxFrame::Close(id),
            TAG_EOF => MuxFrame::Eof(id),
            _ => {
                frame.advance(2);
                MuxFrame::Data(id, frame.freeze())
            }
        }))
    }
}
