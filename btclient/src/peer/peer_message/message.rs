// IDs of the messages defined in the protocol.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MessageId {
    KeepAlive = -1,
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

/// A framed peer wire message: the message ID and its payload.
///
/// Keep-alives are represented as `MessageId::KeepAlive` with an empty
/// payload; on the wire they are a bare zero length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    InvalidMessage,
}

impl Message {
    /// Creates a new `Message` from a message ID and a payload.
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Creates a keep-alive message.
    pub fn keep_alive() -> Self {
        Self {
            id: MessageId::KeepAlive,
            payload: vec![],
        }
    }

    /// Creates a HAVE message for the given piece index.
    pub fn have(piece_index: u32) -> Self {
        Self::new(MessageId::Have, piece_index.to_be_bytes().to_vec())
    }

    /// Parses the body of a frame (ID byte plus payload) into a `Message`.
    pub fn from_bytes(body: &[u8]) -> Result<Self, MessageError> {
        if body.is_empty() {
            return Err(MessageError::InvalidMessage);
        }
        let id = match body[0] {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => return Err(MessageError::InvalidMessage),
        };

        let payload = if body.len() > 1 {
            body[1..].to_vec()
        } else {
            vec![]
        };

        Ok(Self { id, payload })
    }

    /// Converts a `Message` to its wire frame: 4-byte big-endian length,
    /// 1-byte ID, payload. A keep-alive is a bare zero length prefix.
    pub fn as_bytes(&self) -> Vec<u8> {
        if self.id == MessageId::KeepAlive {
            return 0u32.to_be_bytes().to_vec();
        }
        let len = self.payload.len() + 1;
        let len_bytes: [u8; 4] = (len as u32).to_be_bytes();
        let mut bytes = vec![0; 4 + len];
        bytes[0..4].copy_from_slice(&len_bytes);
        bytes[4] = self.id as u8;
        bytes[5..].copy_from_slice(&self.payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_unchoke_from_bytes() {
        let body = 1u8.to_be_bytes();
        let msg = Message::from_bytes(&body).unwrap();

        assert_eq!(msg.id, MessageId::Unchoke);
        assert_eq!(msg.payload, vec![]);
    }

    #[test]
    fn test_message_interested_from_bytes() {
        let body = 2u8.to_be_bytes();
        let msg = Message::from_bytes(&body).unwrap();

        assert_eq!(msg.id, MessageId::Interested);
        assert_eq!(msg.payload, vec![]);
    }

    #[test]
    fn test_message_unknown_id_from_bytes() {
        let body = [42u8];
        assert_eq!(
            Message::from_bytes(&body).unwrap_err(),
            MessageError::InvalidMessage
        );
    }

    #[test]
    fn test_message_empty_body_from_bytes() {
        assert_eq!(
            Message::from_bytes(&[]).unwrap_err(),
            MessageError::InvalidMessage
        );
    }

    #[test]
    fn test_message_request_as_bytes() {
        let index = 0u32.to_be_bytes();
        let begin = 0u32.to_be_bytes();
        let length = 16384u32.to_be_bytes();
        let payload = [index, begin, length].concat();
        let msg = Message::new(MessageId::Request, payload.clone());

        let bytes = msg.as_bytes();

        let len = 13u32.to_be_bytes();
        let msg_type = 6u8.to_be_bytes();
        let mut expected = vec![];
        expected.extend(&len);
        expected.extend(&msg_type);
        expected.extend(&payload);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_message_choke_as_bytes() {
        let msg = Message::new(MessageId::Choke, vec![]);

        assert_eq!(msg.as_bytes(), vec![0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_message_keep_alive_as_bytes() {
        let msg = Message::keep_alive();

        assert_eq!(msg.as_bytes(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_message_round_trip() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let msg = Message::new(MessageId::Piece, payload.clone());

        let bytes = msg.as_bytes();
        let parsed = Message::from_bytes(&bytes[4..]).unwrap();

        assert_eq!(parsed.id, MessageId::Piece);
        assert_eq!(parsed.payload, payload);
    }
}
