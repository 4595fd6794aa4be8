//! Per-type message routing.
//!
//! A [`HandlerTable`] maps every possible tag byte to an optional plain
//! function pointer, so routing is one array index. The table is filled at
//! startup and read-only afterwards.

use std::io;

use quiver_metrics::{monotonic_nanos, CycleClock, ServerStats};
use quiver_proto::{Body, Message, MessageType};
use tracing::{debug, trace, warn};

use crate::pool::MessagePools;
use crate::registry::Connection;

/// Handler signature. Handlers run on the worker thread that read the
/// message and must not block.
pub type Handler = fn(&Message, &Connection) -> Reply;

/// What the dispatcher sends back after a handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledge with this tag.
    Ack(MessageType),
    /// Send nothing.
    Silent,
}

/// Called once when a connection is admitted and once when it is torn down.
pub type ConnectionHook = fn(&Connection);

/// Tag-indexed handler table, plus optional connection lifecycle hooks.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: [Option<Handler>; 256],
    on_connect: Option<ConnectionHook>,
    on_close: Option<ConnectionHook>,
}

impl HandlerTable {
    /// An empty table. Every tag is dropped.
    pub const fn new() -> Self {
        Self {
            handlers: [None; 256],
            on_connect: None,
            on_close: None,
        }
    }

    /// Orders, market data and heartbeats.
    pub fn with_default_handlers() -> Self {
        let mut table = Self::new();
        table.register(MessageType::NewOrder, handle_order);
        table.register(MessageType::Cancel, handle_order);
        table.register(MessageType::Replace, handle_order);
        table.register(MessageType::MarketData, handle_market_data);
        table.register(MessageType::Heartbeat, handle_heartbeat);
        table
    }

    /// Install `handler` for `msg_type`, returning the one it replaces.
    pub fn register(&mut self, msg_type: MessageType, handler: Handler) -> Option<Handler> {
        self.handlers[msg_type as u8 as usize].replace(handler)
    }

    #[inline(always)]
    pub fn get(&self, msg_type: MessageType) -> Option<Handler> {
        self.handlers[msg_type as u8 as usize]
    }

    /// Runs on the accepting worker after the connection is active and
    /// before its first readiness event can be delivered.
    pub fn set_on_connect(&mut self, hook: ConnectionHook) -> Option<ConnectionHook> {
        self.on_connect.replace(hook)
    }

    /// Runs exactly once per admitted connection, whichever path closes it.
    pub fn set_on_close(&mut self, hook: ConnectionHook) -> Option<ConnectionHook> {
        self.on_close.replace(hook)
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

/// NEW_ORDER, CANCEL and REPLACE.
pub fn handle_order(msg: &Message, conn: &Connection) -> Reply {
    match msg.body() {
        Ok(Body::Order(order)) => debug!(
            client_id = conn.client_id(),
            message_id = msg.header.message_id,
            symbol = %order.symbol,
            side = ?order.side(),
            quantity = order.quantity,
            price = order.price,
            "order"
        ),
        _ => debug!(
            client_id = conn.client_id(),
            message_id = msg.header.message_id,
            "order without body"
        ),
    }
    Reply::Ack(MessageType::OrderAck)
}

pub fn handle_market_data(msg: &Message, conn: &Connection) -> Reply {
    if let Ok(data) = msg.market_data_body() {
        trace!(
            client_id = conn.client_id(),
            symbol = %data.symbol,
            bid = data.bid_price,
            ask = data.ask_price,
            "market data"
        );
    }
    Reply::Ack(MessageType::MarketDataAck)
}

/// Refresh the connection's heartbeat and echo one back.
pub fn handle_heartbeat(_msg: &Message, conn: &Connection) -> Reply {
    conn.touch_heartbeat(monotonic_nanos());
    Reply::Ack(MessageType::Heartbeat)
}

/// Why a complete record was not handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    UnknownType(u8),
    Invalid,
    NoHandler(MessageType),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `acked` is false for silent handlers and when the send pool was empty.
    Handled { latency_ns: u64, acked: bool },
    /// The handler ran but its ack was not written in full. The stream may
    /// now hold a partial record, so the connection has to go.
    WriteFailed { latency_ns: u64, kind: io::ErrorKind },
    Dropped(DropReason),
}

/// Validates, routes and acknowledges one record at a time.
pub struct Dispatcher {
    table: HandlerTable,
    clock: CycleClock,
}

impl Dispatcher {
    pub fn new(table: HandlerTable) -> Self {
        Self {
            table,
            clock: CycleClock::new(),
        }
    }

    pub(crate) fn connection_opened(&self, conn: &Connection) {
        if let Some(hook) = self.table.on_connect {
            hook(conn);
        }
    }

    pub(crate) fn connection_closed(&self, conn: &Connection) {
        if let Some(hook) = self.table.on_close {
            hook(conn);
        }
    }

    /// Route `msg` to its handler and write the acknowledgment.
    ///
    /// Processing latency covers validation, the handler and the ack write.
    /// Dropped records are counted but contribute no latency sample. A
    /// failed ack write still counts the record and its latency.
    pub fn dispatch(
        &self,
        msg: &Message,
        conn: &Connection,
        pools: &MessagePools,
        stats: &ServerStats,
    ) -> DispatchOutcome {
        let start = self.clock.now();

        let msg_type = match msg.message_type() {
            Ok(t) => t,
            Err(_) => {
                warn!(
                    client_id = conn.client_id(),
                    tag = msg.header.msg_type,
                    "unknown message type, dropping"
                );
                stats.record_drop();
                return DispatchOutcome::Dropped(DropReason::UnknownType(msg.header.msg_type));
            }
        };

        if !msg.is_valid() {
            warn!(
                client_id = conn.client_id(),
                message_id = msg.header.message_id,
                ?msg_type,
                "invalid header, dropping"
            );
            stats.record_drop();
            return DispatchOutcome::Dropped(DropReason::Invalid);
        }

        let Some(handler) = self.table.get(msg_type) else {
            debug!(client_id = conn.client_id(), ?msg_type, "no handler, dropping");
            stats.record_drop();
            return DispatchOutcome::Dropped(DropReason::NoHandler(msg_type));
        };

        let received = monotonic_nanos();
        if let Some(wire) = received.checked_sub(msg.header.timestamp) {
            stats.record_wire_latency(wire);
        }

        let sent = match handler(msg, conn) {
            Reply::Ack(ack_type) => self.send_ack(msg, ack_type, conn, pools, stats),
            Reply::Silent => Ok(false),
        };

        let latency_ns = self.clock.delta_as_nanos(start, self.clock.now());
        stats.record_message(latency_ns);

        match sent {
            Ok(acked) => DispatchOutcome::Handled { latency_ns, acked },
            Err(e) => DispatchOutcome::WriteFailed {
                latency_ns,
                kind: e.kind(),
            },
        }
    }

    /// `Ok(false)` when no send slot was free: the ack is skipped and
    /// nothing touched the socket. Any write error is returned.
    fn send_ack(
        &self,
        request: &Message,
        ack_type: MessageType,
        conn: &Connection,
        pools: &MessagePools,
        stats: &ServerStats,
    ) -> io::Result<bool> {
        let Some(mut slot) = pools.next_send_slot() else {
            warn!(client_id = conn.client_id(), "send pool exhausted, ack dropped");
            stats.record_send_failure();
            return Ok(false);
        };

        *slot = Message::ack(request, ack_type, monotonic_nanos());
        if let Err(e) = conn.send(&slot) {
            debug!(
                client_id = conn.client_id(),
                slot = slot.index(),
                error = %e,
                "ack send failed"
            );
            stats.record_send_failure();
            return Err(e);
        }
        trace!(client_id = conn.client_id(), slot = slot.index(), "ack sent");
        Ok(true)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(HandlerTable::with_default_handlers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use quiver_proto::{MessageParser, MessageStatus, OrderMessage, Side, MESSAGE_SIZE};
    use std::io::Read;
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        client: TcpStream,
        conn: Arc<Connection>,
        _registry: ConnectionRegistry,
        pools: MessagePools,
        stats: ServerStats,
    }

    fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let registry = ConnectionRegistry::new(4);
        let conn = registry.register(server, peer, true, 1).unwrap();
        conn.activate();

        Fixture {
            client,
            conn,
            _registry: registry,
            pools: MessagePools::new(4),
            stats: ServerStats::new(),
        }
    }

    fn order_msg(id: u64) -> Message {
        Message::new_order(
            id,
            monotonic_nanos(),
            &OrderMessage::limit("AAPL", Side::Buy, 1, 100, 1_500_000),
        )
    }

    fn read_reply(client: &mut TcpStream) -> Message {
        let mut buf = [0u8; MESSAGE_SIZE];
        client.read_exact(&mut buf).unwrap();
        MessageParser::read(&buf).unwrap()
    }

    #[test]
    fn test_default_routes() {
        let table = HandlerTable::with_default_handlers();
        for t in [
            MessageType::NewOrder,
            MessageType::Cancel,
            MessageType::Replace,
            MessageType::MarketData,
            MessageType::Heartbeat,
        ] {
            assert!(table.get(t).is_some(), "{:?} should be routed", t);
        }
        assert!(table.get(MessageType::Fill).is_none());
        assert!(table.get(MessageType::Login).is_none());
    }

    #[test]
    fn test_register_replaces_handler() {
        fn silent(_: &Message, _: &Connection) -> Reply {
            Reply::Silent
        }

        let mut table = HandlerTable::new();
        assert!(table.register(MessageType::Fill, silent).is_none());
        assert!(table.register(MessageType::Fill, silent).is_some());
    }

    #[test]
    fn test_order_is_acked() {
        let mut f = fixture();
        let dispatcher = Dispatcher::default();

        let mut msg = order_msg(42);
        msg.header.sequence = 9;

        let outcome = dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);
        assert!(matches!(outcome, DispatchOutcome::Handled { acked: true, .. }));

        let ack = read_reply(&mut f.client);
        assert_eq!(ack.header.message_id, 42);
        assert_eq!(ack.header.sequence, 9);
        assert_eq!(ack.message_type().unwrap(), MessageType::OrderAck);
        assert_eq!(ack.status(), Some(MessageStatus::Processed));

        let snap = f.stats.snapshot();
        assert_eq!(snap.total_messages, 1);
        assert_eq!(snap.dropped_messages, 0);
        assert_eq!(f.pools.send.in_use(), 0);
    }

    #[test]
    fn test_unknown_type_dropped_without_ack() {
        let mut f = fixture();
        let dispatcher = Dispatcher::default();

        let mut msg = Message::new(5, MessageType::NewOrder, 1);
        msg.header.msg_type = 0x42;

        let outcome = dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::UnknownType(0x42)));

        let mut buf = [0u8; MESSAGE_SIZE];
        assert!(f.client.read_exact(&mut buf).is_err());
        assert_eq!(f.stats.total_messages(), 0);
        assert_eq!(f.stats.snapshot().dropped_messages, 1);
    }

    #[test]
    fn test_invalid_header_dropped() {
        let f = fixture();
        let dispatcher = Dispatcher::default();

        let msg = Message::new(0, MessageType::Heartbeat, 1);
        let outcome = dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::Invalid));
    }

    #[test]
    fn test_unrouted_type_dropped() {
        let f = fixture();
        let dispatcher = Dispatcher::new(HandlerTable::new());

        let msg = Message::new(1, MessageType::Logout, 1);
        let outcome = dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);
        assert_eq!(
            outcome,
            DispatchOutcome::Dropped(DropReason::NoHandler(MessageType::Logout))
        );
    }

    #[test]
    fn test_heartbeat_refreshes_and_echoes() {
        let mut f = fixture();
        let dispatcher = Dispatcher::default();
        assert_eq!(f.conn.last_heartbeat_ns(), 1);

        let msg = Message::new(3, MessageType::Heartbeat, monotonic_nanos());
        dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);

        assert!(f.conn.last_heartbeat_ns() > 1);
        let echo = read_reply(&mut f.client);
        assert_eq!(echo.message_type().unwrap(), MessageType::Heartbeat);
    }

    #[test]
    fn test_exhausted_send_pool_counts_failure() {
        let f = fixture();
        let dispatcher = Dispatcher::default();
        let pools = MessagePools::new(1);
        let _held = pools.next_send_slot().unwrap();

        let msg = Message::new(3, MessageType::Heartbeat, 1);
        let outcome = dispatcher.dispatch(&msg, &f.conn, &pools, &f.stats);
        assert!(matches!(outcome, DispatchOutcome::Handled { acked: false, .. }));
        assert_eq!(f.stats.snapshot().send_failures, 1);
    }

    #[test]
    fn test_failed_ack_write_is_reported() {
        let f = fixture();
        let dispatcher = Dispatcher::default();
        f.conn.stream().shutdown(Shutdown::Write).unwrap();

        let outcome = dispatcher.dispatch(&order_msg(8), &f.conn, &f.pools, &f.stats);
        assert!(matches!(
            outcome,
            DispatchOutcome::WriteFailed {
                kind: io::ErrorKind::BrokenPipe,
                ..
            }
        ));

        let snap = f.stats.snapshot();
        assert_eq!(snap.send_failures, 1);
        assert_eq!(snap.total_messages, 1);
        assert_eq!(f.pools.send.in_use(), 0);
    }

    #[test]
    fn test_connection_hooks() {
        static OPENED: AtomicUsize = AtomicUsize::new(0);
        static CLOSED: AtomicUsize = AtomicUsize::new(0);

        let f = fixture();
        let mut table = HandlerTable::new();
        let previous = table.set_on_connect(|_| {
            OPENED.fetch_add(1, Ordering::Relaxed);
        });
        assert!(previous.is_none());
        table.set_on_close(|conn| {
            assert_eq!(conn.client_id(), 1);
            CLOSED.fetch_add(1, Ordering::Relaxed);
        });
        let dispatcher = Dispatcher::new(table);

        dispatcher.connection_opened(&f.conn);
        assert_eq!(OPENED.load(Ordering::Relaxed), 1);
        assert_eq!(CLOSED.load(Ordering::Relaxed), 0);
        dispatcher.connection_closed(&f.conn);
        assert_eq!(CLOSED.load(Ordering::Relaxed), 1);

        // No hooks installed.
        Dispatcher::default().connection_closed(&f.conn);
        assert_eq!(CLOSED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mean_latency_tracks_handler_delay() {
        // Sleeps `message_id` milliseconds.
        fn slow(msg: &Message, _: &Connection) -> Reply {
            std::thread::sleep(Duration::from_millis(msg.header.message_id));
            Reply::Silent
        }

        let f = fixture();
        let mut table = HandlerTable::new();
        table.register(MessageType::Heartbeat, slow);
        let dispatcher = Dispatcher::new(table);

        for id in 1..=3 {
            let msg = Message::new(id, MessageType::Heartbeat, 1);
            dispatcher.dispatch(&msg, &f.conn, &f.pools, &f.stats);
        }

        // (1 + 2 + 3) / 3 ms, plus scheduling slack.
        let mean_ms = f.stats.average_latency_ns() / 1_000_000.0;
        assert!(mean_ms >= 2.0, "mean {mean_ms} ms");
        assert!(mean_ms < 12.0, "mean {mean_ms} ms");
        assert_eq!(f.stats.total_messages(), 3);
    }
}
