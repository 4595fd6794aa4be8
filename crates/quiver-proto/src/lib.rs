//! Fixed-size binary wire protocol.
//!
//! Every record is one cache-line-aligned [`Message`] envelope of
//! [`MESSAGE_SIZE`] bytes. Typed bodies (orders, market data, fills) live
//! inside the envelope's payload region, so a single read of the fixed size
//! is always exactly one message.

#![no_std]

pub mod messages;
pub mod parser;

pub use messages::*;
pub use parser::*;
