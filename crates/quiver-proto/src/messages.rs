//! Binary message definitions.
//!
//! Every record is a [`Message`] envelope: a 40-byte [`MessageHeader`]
//! followed by an 88-byte payload region, 128 bytes in total and aligned to
//! the cache line. Typed bodies are written at the start of the payload
//! region and never change the record length.
//!
//! Integers use native byte order. Both ends must run on the same
//! architecture; no endianness normalization is performed.

use bytemuck::{Pod, Zeroable};
use core::fmt;
use core::mem::{align_of, size_of};

use crate::parser::ParseError;

/// Platform cache-line width.
pub const CACHE_LINE: usize = 64;

/// Size of every record on the wire.
pub const MESSAGE_SIZE: usize = 128;

/// Size of the generic header.
pub const HEADER_SIZE: usize = 40;

/// Size of the opaque payload region following the header.
pub const PAYLOAD_SIZE: usize = MESSAGE_SIZE - HEADER_SIZE;

/// Width of a zero-padded symbol.
pub const SYMBOL_LEN: usize = 16;

/// Message type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Order entry (client → server)
    NewOrder = 0x01,
    Cancel = 0x02,
    Replace = 0x03,
    Fill = 0x04,
    Reject = 0x05,

    // Market data
    MarketData = 0x06,

    // Session
    Heartbeat = 0x07,
    Login = 0x08,
    Logout = 0x09,

    // Acknowledgments (server → client)
    OrderAck = 0x10,
    MarketDataAck = 0x11,

    Error = 0xFF,
}

impl MessageType {
    /// Order-entry messages routed to the order handler.
    #[inline(always)]
    pub const fn is_order(self) -> bool {
        matches!(self, MessageType::NewOrder | MessageType::Cancel | MessageType::Replace)
    }

    #[inline(always)]
    pub const fn is_ack(self) -> bool {
        matches!(self, MessageType::OrderAck | MessageType::MarketDataAck)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(MessageType::NewOrder),
            0x02 => Ok(MessageType::Cancel),
            0x03 => Ok(MessageType::Replace),
            0x04 => Ok(MessageType::Fill),
            0x05 => Ok(MessageType::Reject),
            0x06 => Ok(MessageType::MarketData),
            0x07 => Ok(MessageType::Heartbeat),
            0x08 => Ok(MessageType::Login),
            0x09 => Ok(MessageType::Logout),
            0x10 => Ok(MessageType::OrderAck),
            0x11 => Ok(MessageType::MarketDataAck),
            0xFF => Ok(MessageType::Error),
            other => Err(other),
        }
    }
}

/// Processing status carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    Pending = 0x01,
    Processed = 0x02,
    Completed = 0x03,
    Failed = 0x04,
}

impl TryFrom<u8> for MessageStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(MessageStatus::Pending),
            0x02 => Ok(MessageStatus::Processed),
            0x03 => Ok(MessageStatus::Completed),
            0x04 => Ok(MessageStatus::Failed),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Side {
    Buy = 0x01,
    Sell = 0x02,
}

impl TryFrom<u8> for Side {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(Side::Buy),
            0x02 => Ok(Side::Sell),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OrderType {
    Market = 0x01,
    Limit = 0x02,
    Stop = 0x03,
    StopLimit = 0x04,
}

impl TryFrom<u8> for OrderType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(OrderType::Market),
            0x02 => Ok(OrderType::Limit),
            0x03 => Ok(OrderType::Stop),
            0x04 => Ok(OrderType::StopLimit),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeInForce {
    Day = 0x01,
    /// Immediate-Or-Cancel.
    Ioc = 0x02,
    /// Fill-Or-Kill.
    Fok = 0x03,
    /// Good-Til-Cancelled.
    Gtc = 0x04,
}

impl TryFrom<u8> for TimeInForce {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(TimeInForce::Day),
            0x02 => Ok(TimeInForce::Ioc),
            0x03 => Ok(TimeInForce::Fok),
            0x04 => Ok(TimeInForce::Gtc),
            other => Err(other),
        }
    }
}

/// Fixed-width, zero-padded symbol text.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Symbol(pub [u8; SYMBOL_LEN]);

unsafe impl Pod for Symbol {}
unsafe impl Zeroable for Symbol {}

impl Symbol {
    /// Build from text, truncating to [`SYMBOL_LEN`] bytes.
    pub fn new(text: &str) -> Self {
        let mut raw = [0u8; SYMBOL_LEN];
        let len = text.len().min(SYMBOL_LEN);
        raw[..len].copy_from_slice(&text.as_bytes()[..len]);
        Self(raw)
    }

    /// Text up to the first NUL. Non-UTF-8 content yields an empty string.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SYMBOL_LEN);
        core::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic header (40 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MessageHeader {
    pub message_id: u64,            // 8 bytes (non-zero when valid)
    pub timestamp: u64,             // 8 bytes (monotonic nanos, set by sender)
    pub sequence: u32,              // 4 bytes
    pub msg_type: u8,               // 1 byte
    pub status: u8,                 // 1 byte
    pub _padding: [u8; 2],          // 2 bytes
    pub source_id: u32,             // 4 bytes
    pub destination_id: u32,        // 4 bytes
    pub payload_len: u32,           // 4 bytes
    pub _reserved: u32,             // 4 bytes
}

const _: () = assert!(size_of::<MessageHeader>() == HEADER_SIZE);

// SAFETY: repr(C), every field is an integer, no implicit padding.
unsafe impl Pod for MessageHeader {}
unsafe impl Zeroable for MessageHeader {}

/// The wire record: header plus a fixed payload region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct Message {
    pub header: MessageHeader,
    pub payload: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(size_of::<Message>() == MESSAGE_SIZE);
const _: () = assert!(align_of::<Message>() == CACHE_LINE);

// SAFETY: header (40) + payload (88) fill the 128-byte envelope exactly.
unsafe impl Pod for Message {}
unsafe impl Zeroable for Message {}

impl Default for Message {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Message {
    /// Create an envelope with an empty payload and PENDING status.
    pub fn new(message_id: u64, msg_type: MessageType, timestamp: u64) -> Self {
        let mut msg = Self::zeroed();
        msg.header.message_id = message_id;
        msg.header.timestamp = timestamp;
        msg.header.msg_type = msg_type as u8;
        msg.header.status = MessageStatus::Pending as u8;
        msg
    }

    fn with_body<B: Pod>(message_id: u64, msg_type: MessageType, timestamp: u64, body: &B) -> Self {
        let bytes = bytemuck::bytes_of(body);
        debug_assert!(bytes.len() <= PAYLOAD_SIZE);

        let mut msg = Self::new(message_id, msg_type, timestamp);
        msg.payload[..bytes.len()].copy_from_slice(bytes);
        msg.header.payload_len = bytes.len() as u32;
        msg
    }

    /// Envelope carrying an order body. `msg_type` should be one of the
    /// order-entry tags (NEW_ORDER, CANCEL, REPLACE).
    pub fn order(message_id: u64, msg_type: MessageType, timestamp: u64, order: &OrderMessage) -> Self {
        Self::with_body(message_id, msg_type, timestamp, order)
    }

    pub fn new_order(message_id: u64, timestamp: u64, order: &OrderMessage) -> Self {
        Self::order(message_id, MessageType::NewOrder, timestamp, order)
    }

    pub fn market_data(message_id: u64, timestamp: u64, data: &MarketDataMessage) -> Self {
        Self::with_body(message_id, MessageType::MarketData, timestamp, data)
    }

    pub fn fill(message_id: u64, timestamp: u64, fill: &FillMessage) -> Self {
        Self::with_body(message_id, MessageType::Fill, timestamp, fill)
    }

    /// Acknowledgment for `request`: same id and sequence, fresh timestamp,
    /// PROCESSED status, source and destination swapped.
    pub fn ack(request: &Message, ack_type: MessageType, timestamp: u64) -> Self {
        let mut ack = Self::zeroed();
        ack.header = MessageHeader {
            message_id: request.header.message_id,
            timestamp,
            sequence: request.header.sequence,
            msg_type: ack_type as u8,
            status: MessageStatus::Processed as u8,
            source_id: request.header.destination_id,
            destination_id: request.header.source_id,
            ..MessageHeader::default()
        };
        ack
    }

    /// Decode the type tag.
    #[inline(always)]
    pub fn message_type(&self) -> Result<MessageType, ParseError> {
        MessageType::try_from(self.header.msg_type).map_err(ParseError::UnknownMessageType)
    }

    #[inline]
    pub fn status(&self) -> Option<MessageStatus> {
        MessageStatus::try_from(self.header.status).ok()
    }

    /// Non-zero id, non-zero timestamp and an in-bounds payload length.
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.header.message_id != 0
            && self.header.timestamp != 0
            && self.header.payload_len as usize <= PAYLOAD_SIZE
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    #[inline(always)]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }

    fn body_as<B: Pod>(&self) -> Result<&B, ParseError> {
        let expected = size_of::<B>();
        let actual = self.header.payload_len as usize;
        if actual < expected {
            return Err(ParseError::BodyTooShort { expected, actual });
        }

        bytemuck::try_from_bytes(&self.payload[..expected]).map_err(|_| ParseError::MisalignedBuffer)
    }

    /// Order body (zero-copy).
    #[inline]
    pub fn order_body(&self) -> Result<&OrderMessage, ParseError> {
        self.body_as()
    }

    /// Market-data body (zero-copy).
    #[inline]
    pub fn market_data_body(&self) -> Result<&MarketDataMessage, ParseError> {
        self.body_as()
    }

    /// Fill body (zero-copy).
    #[inline]
    pub fn fill_body(&self) -> Result<&FillMessage, ParseError> {
        self.body_as()
    }

    /// Typed view of the payload selected by the type tag.
    pub fn body(&self) -> Result<Body<'_>, ParseError> {
        let msg_type = self.message_type()?;
        if msg_type.is_order() {
            return self.order_body().map(Body::Order);
        }

        match msg_type {
            MessageType::MarketData => self.market_data_body().map(Body::MarketData),
            MessageType::Fill => self.fill_body().map(Body::Fill),
            _ => {
                let len = (self.header.payload_len as usize).min(PAYLOAD_SIZE);
                Ok(Body::Raw(&self.payload[..len]))
            }
        }
    }
}

/// Borrowed, typed view of a message payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Body<'a> {
    Order(&'a OrderMessage),
    MarketData(&'a MarketDataMessage),
    Fill(&'a FillMessage),
    Raw(&'a [u8]),
}

/// Order body (56 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct OrderMessage {
    pub symbol: Symbol,             // 16 bytes
    pub order_id: u64,              // 8 bytes
    pub client_order_id: u64,       // 8 bytes
    pub price: u64,                 // 8 bytes (ticks)
    pub stop_price: u64,            // 8 bytes (ticks)
    pub quantity: u32,              // 4 bytes
    pub side: u8,                   // 1 byte
    pub order_type: u8,             // 1 byte
    pub time_in_force: u8,          // 1 byte
    pub _padding: u8,               // 1 byte
}

const _: () = assert!(size_of::<OrderMessage>() == 56);
const _: () = assert!(size_of::<OrderMessage>() <= PAYLOAD_SIZE);

unsafe impl Pod for OrderMessage {}
unsafe impl Zeroable for OrderMessage {}

impl OrderMessage {
    /// Limit order, DAY, no stop price.
    pub fn limit(symbol: &str, side: Side, order_id: u64, quantity: u32, price: u64) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            order_id,
            client_order_id: 0,
            price,
            stop_price: 0,
            quantity,
            side: side as u8,
            order_type: OrderType::Limit as u8,
            time_in_force: TimeInForce::Day as u8,
            _padding: 0,
        }
    }

    #[inline]
    pub fn side(&self) -> Option<Side> {
        Side::try_from(self.side).ok()
    }

    #[inline]
    pub fn order_type(&self) -> Option<OrderType> {
        OrderType::try_from(self.order_type).ok()
    }

    #[inline]
    pub fn time_in_force(&self) -> Option<TimeInForce> {
        TimeInForce::try_from(self.time_in_force).ok()
    }
}

/// Market-data body (80 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MarketDataMessage {
    pub symbol: Symbol,             // 16 bytes
    pub bid_price: u64,             // 8 bytes
    pub ask_price: u64,             // 8 bytes
    pub last_price: u64,            // 8 bytes
    pub volume: u64,                // 8 bytes (cumulative)
    pub high_price: u64,            // 8 bytes
    pub low_price: u64,             // 8 bytes
    pub bid_size: u32,              // 4 bytes
    pub ask_size: u32,              // 4 bytes
    pub last_size: u32,             // 4 bytes
    pub _padding: u32,              // 4 bytes
}

const _: () = assert!(size_of::<MarketDataMessage>() == 80);
const _: () = assert!(size_of::<MarketDataMessage>() <= PAYLOAD_SIZE);

unsafe impl Pod for MarketDataMessage {}
unsafe impl Zeroable for MarketDataMessage {}

impl MarketDataMessage {
    /// Top-of-book quote with empty trade fields.
    pub fn quote(symbol: &str, bid_price: u64, bid_size: u32, ask_price: u64, ask_size: u32) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            bid_price,
            bid_size,
            ask_price,
            ask_size,
            ..Self::default()
        }
    }
}

/// Fill body (56 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FillMessage {
    pub order_id: u64,              // 8 bytes
    pub fill_id: u64,               // 8 bytes
    pub fill_price: u64,            // 8 bytes
    pub commission: u64,            // 8 bytes
    pub fill_quantity: u32,         // 4 bytes
    pub _padding: u32,              // 4 bytes
    pub execution_venue: Symbol,    // 16 bytes
}

const _: () = assert!(size_of::<FillMessage>() == 56);
const _: () = assert!(size_of::<FillMessage>() <= PAYLOAD_SIZE);

unsafe impl Pod for FillMessage {}
unsafe impl Zeroable for FillMessage {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sizes() {
        assert_eq!(size_of::<MessageHeader>(), 40);
        assert_eq!(size_of::<Message>(), 128);
        assert_eq!(align_of::<Message>(), 64);
        assert_eq!(PAYLOAD_SIZE, 88);
    }

    #[test]
    fn test_new_order_creation() {
        let order = OrderMessage::limit("AAPL", Side::Buy, 7, 100, 1_500_000);
        let msg = Message::new_order(12345, 99, &order);

        assert_eq!(msg.message_type(), Ok(MessageType::NewOrder));
        assert_eq!(msg.status(), Some(MessageStatus::Pending));
        assert_eq!(msg.header.payload_len, 56);
        assert!(msg.is_valid());

        let body = msg.order_body().unwrap();
        assert_eq!(body.symbol.as_str(), "AAPL");
        assert_eq!(body.side(), Some(Side::Buy));
        assert_eq!(body.order_type(), Some(OrderType::Limit));
    }

    #[test]
    fn test_variants_share_record_length() {
        let order = Message::new_order(1, 1, &OrderMessage::limit("AAPL", Side::Buy, 1, 100, 1_500_000));
        let quote = Message::market_data(2, 1, &MarketDataMessage::quote("MSFT", 10, 1, 11, 2));
        let fill = Message::fill(3, 1, &FillMessage::default());

        assert_eq!(order.as_bytes().len(), MESSAGE_SIZE);
        assert_eq!(quote.as_bytes().len(), order.as_bytes().len());
        assert_eq!(fill.as_bytes().len(), order.as_bytes().len());
    }

    #[test]
    fn test_validity_rules() {
        let mut msg = Message::new(1, MessageType::Heartbeat, 1);
        assert!(msg.is_valid());

        msg.header.message_id = 0;
        assert!(!msg.is_valid());

        msg.header.message_id = 1;
        msg.header.timestamp = 0;
        assert!(!msg.is_valid());

        msg.header.timestamp = 1;
        msg.header.payload_len = PAYLOAD_SIZE as u32 + 1;
        assert!(!msg.is_valid());
    }

    #[test]
    fn test_ack_mirrors_request() {
        let mut request = Message::new_order(77, 1_000, &OrderMessage::default());
        request.header.sequence = 5;
        request.header.source_id = 10;
        request.header.destination_id = 20;

        let ack = Message::ack(&request, MessageType::OrderAck, 2_000);
        assert_eq!(ack.header.message_id, 77);
        assert_eq!(ack.header.timestamp, 2_000);
        assert_eq!(ack.header.sequence, 5);
        assert_eq!(ack.header.source_id, 20);
        assert_eq!(ack.header.destination_id, 10);
        assert_eq!(ack.message_type(), Ok(MessageType::OrderAck));
        assert_eq!(ack.status(), Some(MessageStatus::Processed));
    }

    #[test]
    fn test_body_view_follows_tag() {
        let msg = Message::market_data(1, 1, &MarketDataMessage::quote("ES", 100, 3, 101, 4));
        match msg.body() {
            Ok(Body::MarketData(md)) => {
                assert_eq!(md.symbol.as_str(), "ES");
                assert_eq!(md.ask_size, 4);
            }
            other => panic!("unexpected body: {:?}", other),
        }

        let mut cancel = Message::order(2, MessageType::Cancel, 1, &OrderMessage::default());
        assert!(matches!(cancel.body(), Ok(Body::Order(_))));

        cancel.header.payload_len = 8;
        assert_eq!(
            cancel.order_body(),
            Err(ParseError::BodyTooShort { expected: 56, actual: 8 })
        );

        let heartbeat = Message::new(3, MessageType::Heartbeat, 1);
        assert_eq!(heartbeat.body(), Ok(Body::Raw(&[])));
    }

    #[test]
    fn test_symbol_truncation_and_padding() {
        assert_eq!(Symbol::new("AAPL").0[4..], [0u8; 12]);
        assert_eq!(Symbol::new("ABCDEFGHIJKLMNOPQRS").as_str(), "ABCDEFGHIJKLMNOP");
        assert_eq!(Symbol::default().as_str(), "");
    }

    #[test]
    fn test_unknown_tags_rejected() {
        assert_eq!(MessageType::try_from(0x42), Err(0x42));
        assert_eq!(Side::try_from(0), Err(0));
        assert_eq!(MessageStatus::try_from(9), Err(9));
    }
}
