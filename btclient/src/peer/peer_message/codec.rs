use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageError};
use crate::BLOCK_SIZE;

/// Upper bound on an accepted frame length. The largest legitimate frame is
/// a PIECE carrying one block; anything past this is a protocol violation.
const MAX_FRAME_SIZE: u32 = BLOCK_SIZE * 10;

/// Posible `PeerCodec` errors.
#[derive(Debug)]
pub enum CodecError {
    IoError(io::Error),
    InvalidMessage(MessageError),
    FrameTooLong(u32),
}

impl From<io::Error> for CodecError {
    fn from(error: io::Error) -> Self {
        CodecError::IoError(error)
    }
}

/// Length-prefixed framing for peer wire messages.
///
/// Decodes `length: u32 big-endian` + `id: u8` + payload frames, mapping a
/// zero length to a keep-alive. Used through `Framed` so partially received
/// frames survive a cancelled read.
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&src[0..4]);
        let len = u32::from_be_bytes(len_bytes);

        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLong(len));
        }

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::keep_alive()));
        }

        let len = len as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);

        Message::from_bytes(&body)
            .map(Some)
            .map_err(CodecError::InvalidMessage)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(&msg.as_bytes());
        Ok(())
    }
}
