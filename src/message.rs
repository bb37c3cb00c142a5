//! # BitTorrent Peer Wire Messages
//!
//! After the handshake, a peer connection carries length-prefixed messages:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - bytes of message ID + payload
//! - **Message ID**: 1 byte - message type
//! - **Payload**: `length - 1` bytes of message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | availability bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//!
//! A length prefix of 0 is a keep-alive: no ID, no payload. It is modeled
//! here with an internal pseudo-ID that never appears on the wire.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::Cursor;

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
/// Internal pseudo-ID for keep-alive messages (length 0 on the wire).
pub const MESSAGE_KEEPALIVE: MessageId = 255;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message.
    ///
    /// Keep-alives serialize to the bare zero length prefix; everything else
    /// to `<length><id><payload>`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // A keep-alive has no id and no payload
        if self.id == MESSAGE_KEEPALIVE {
            return Ok(vec![0; 4]);
        }

        let message_len = 1 + self.payload.len();
        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);

        // Add message length
        serialized.write_u32::<BigEndian>(message_len as u32)?;

        // Add message id
        serialized.push(self.id);

        // Add message payload
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize message.
///
/// # Arguments
///
/// * `message_buf` - The message body, length prefix already stripped.
///
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    // The body of a non-keep-alive message carries at least the id
    if message_buf.is_empty() {
        return Err(anyhow!("received empty message from peer"));
    }

    let id: MessageId = message_buf[0];
    let payload: MessagePayload = message_buf[1..].to_vec();

    Ok(Message::new_with_payload(id, payload))
}

/// Parse the piece index out of a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    // Check if message id and payload are valid
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(anyhow!("received invalid MESSAGE_HAVE from peer"));
    }

    let mut payload_cursor = Cursor::new(&message.payload);
    let index = payload_cursor.read_u32::<BigEndian>()?;

    Ok(index)
}

/// Parse a PIECE message and copy its block into the piece buffer.
///
/// Validates that the message carries the expected piece index and that the
/// block fits the buffer, then writes it at its `begin` offset.
///
/// # Arguments
///
/// * `index` - Piece index the caller is downloading.
/// * `buffer` - Piece buffer of the full piece length.
/// * `message` - PIECE message with payload `<index><begin><block>`.
///
/// # Returns
///
/// The number of block bytes copied into the buffer.
pub fn parse_piece(index: u32, buffer: &mut [u8], message: &Message) -> Result<u32> {
    // Check if message id and payload are valid
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!("received MESSAGE_PIECE with truncated payload"));
    }

    // Get piece index
    let mut payload_cursor = Cursor::new(&message.payload[0..8]);
    let piece_index = payload_cursor.read_u32::<BigEndian>()?;
    if piece_index != index {
        return Err(anyhow!(
            "received piece {:?} from peer, expected {:?}",
            piece_index,
            index
        ));
    }

    // Get byte offset within piece
    let begin = payload_cursor.read_u32::<BigEndian>()? as usize;

    // Get piece block
    let block = &message.payload[8..];
    if begin + block.len() > buffer.len() {
        return Err(anyhow!(
            "received block past the end of the piece from peer"
        ));
    }

    // Add block to piece data
    buffer[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len() as u32)
}
