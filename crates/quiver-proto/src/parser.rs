//! Zero-copy message parser and builder.
//!
//! Uses bytemuck for safe transmutation from raw bytes.

use bytemuck::try_from_bytes;
use core::fmt;

use crate::messages::*;

/// Parse error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer bytes than one full record.
    Truncated { len: usize },
    /// Tag byte outside the known message types.
    UnknownMessageType(u8),
    /// Zero id, zero timestamp or an out-of-range payload length.
    InvalidMessage,
    /// Payload length smaller than the typed body the tag implies.
    BodyTooShort { expected: usize, actual: usize },
    /// Buffer is not properly aligned.
    MisalignedBuffer,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated { len } => {
                write!(f, "truncated record: {} of {} bytes", len, MESSAGE_SIZE)
            }
            ParseError::UnknownMessageType(tag) => write!(f, "unknown message type 0x{:02x}", tag),
            ParseError::InvalidMessage => f.write_str("invalid message header"),
            ParseError::BodyTooShort { expected, actual } => {
                write!(f, "payload of {} bytes, body needs {}", actual, expected)
            }
            ParseError::MisalignedBuffer => f.write_str("buffer is not aligned for a message"),
        }
    }
}

/// Zero-copy message parser.
pub struct MessageParser;

impl MessageParser {
    /// View the first record of `buffer` in place.
    ///
    /// The buffer must be aligned to [`CACHE_LINE`]; use [`MessageParser::read`]
    /// for arbitrary byte buffers.
    #[inline(always)]
    pub fn parse(buffer: &[u8]) -> Result<&Message, ParseError> {
        if buffer.len() < MESSAGE_SIZE {
            return Err(ParseError::Truncated { len: buffer.len() });
        }

        try_from_bytes(&buffer[..MESSAGE_SIZE]).map_err(|_| ParseError::MisalignedBuffer)
    }

    /// Copy the first record out of `buffer`, whatever its alignment.
    #[inline]
    pub fn read(buffer: &[u8]) -> Result<Message, ParseError> {
        if buffer.len() < MESSAGE_SIZE {
            return Err(ParseError::Truncated { len: buffer.len() });
        }

        Ok(bytemuck::pod_read_unaligned(&buffer[..MESSAGE_SIZE]))
    }

    /// Check the tag and header fields of a received record.
    #[inline]
    pub fn validate(msg: &Message) -> Result<MessageType, ParseError> {
        let msg_type = msg.message_type()?;
        if !msg.is_valid() {
            return Err(ParseError::InvalidMessage);
        }
        Ok(msg_type)
    }
}

/// Stamps outbound messages with increasing ids and sequence numbers.
pub struct MessageBuilder {
    sequence: u32,
    message_id: u64,
}

impl MessageBuilder {
    pub const fn new() -> Self {
        Self {
            sequence: 0,
            message_id: 0,
        }
    }

    /// Get next sequence number.
    #[inline(always)]
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Get next message id. Never returns zero.
    #[inline(always)]
    pub fn next_message_id(&mut self) -> u64 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    fn stamp(&mut self, mut msg: Message) -> Message {
        msg.header.sequence = self.next_sequence();
        msg
    }

    pub fn order(&mut self, msg_type: MessageType, timestamp: u64, order: &OrderMessage) -> Message {
        let id = self.next_message_id();
        self.stamp(Message::order(id, msg_type, timestamp, order))
    }

    pub fn market_data(&mut self, timestamp: u64, data: &MarketDataMessage) -> Message {
        let id = self.next_message_id();
        self.stamp(Message::market_data(id, timestamp, data))
    }

    pub fn heartbeat(&mut self, timestamp: u64) -> Message {
        let id = self.next_message_id();
        self.stamp(Message::new(id, MessageType::Heartbeat, timestamp))
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
