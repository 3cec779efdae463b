//! Connection Handler Module
//!
//! Each client gets its own task that reads requests, runs them through the
//! [`CommandRegistry`] and writes the replies back, in order.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP or Unix socket)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  Read bytes from socket      │ <─────────┐
//!    └───────────┬──────────────────┘           │
//!                ▼                              │
//!    ┌──────────────────────────────┐           │
//!    │  Parse every complete frame  │── error ──┼──> -ERR Protocol error, close
//!    └───────────┬──────────────────┘           │
//!                ▼                              │
//!    ┌──────────────────────────────┐           │
//!    │  Dispatch, buffer the reply  │           │
//!    └───────────┬──────────────────┘           │
//!                ▼                              │
//!    ┌──────────────────────────────┐           │
//!    │  Flush replies               │ ──────────┘
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects, protocol error, or server shutdown while idle
//! ```
//!
//! ## Buffer Management
//!
//! A `BytesMut` accumulates incoming data, since a read may carry half a
//! frame or several pipelined ones. The parser bounds single frames (bulk
//! size, element count, inline length). On top of that, a client that
//! buffers [`MAX_QUERY_BUFFER`] bytes without completing a frame gets a
//! protocol error reply and is disconnected.

use crate::commands::CommandRegistry;
use crate::protocol::{ParseError, Request, RespParser, RespValue};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Default limit for buffered bytes of an incomplete frame (1 GiB)
pub const MAX_QUERY_BUFFER: usize = 1024 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Connections closed because of a malformed frame
    pub protocol_errors: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler<S, H> {
    stream: BufWriter<S>,

    /// Peer name, for logs and monitor lines
    peer: String,

    /// Buffer for incoming data
    buffer: BytesMut,

    registry: Arc<CommandRegistry<H>>,

    parser: RespParser,

    stats: Arc<ConnectionStats>,

    /// Flips to `true` when the server stops
    shutdown: watch::Receiver<bool>,

    buffer_limit: usize,
}

impl<S, H> ConnectionHandler<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Send + Sync + 'static,
{
    pub fn new(
        stream: S,
        peer: String,
        registry: Arc<CommandRegistry<H>>,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            peer,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            registry,
            parser: RespParser::new(),
            stats,
            shutdown,
            buffer_limit: MAX_QUERY_BUFFER,
        }
    }

    /// Overrides [`MAX_QUERY_BUFFER`] for this connection.
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Serves the client until it disconnects, misbehaves, or the server
    /// shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.peer, "client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.peer, "client closed by server shutdown"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.peer, "client disconnected")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.peer, "connection reset by client")
            }
            Err(e) => warn!(client = %self.peer, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.clone();

        loop {
            let mut wrote = false;
            while let Some(request) = self.next_request().await? {
                let reply = self.registry.apply(&request).await;
                self.stats.command_processed();
                self.write_reply(&reply).await?;
                wrote = true;
            }
            if wrote {
                self.stream.flush().await?;
            }

            if *shutdown.borrow() {
                return Ok(());
            }

            if self.buffer.len() >= self.buffer_limit {
                let e = ParseError::TooLarge {
                    size: self.buffer.len(),
                    max: self.buffer_limit,
                };
                return Err(self.reject(e).await);
            }

            tokio::select! {
                result = self.read_more_data() => result?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Takes the next complete request out of the buffer. A malformed frame
    /// is answered with one protocol error reply before failing.
    async fn next_request(&mut self) -> Result<Option<Request>, ConnectionError> {
        match self.try_parse_request() {
            Ok(request) => Ok(request),
            Err(e) => Err(self.reject(e).await),
        }
    }

    /// Sends the protocol error reply that precedes closing the connection.
    async fn reject(&mut self, e: ParseError) -> ConnectionError {
        self.stats.protocol_error();
        warn!(client = %self.peer, error = %e, "protocol error");

        let reply = RespValue::error(format!("ERR Protocol error: {}", e));
        if let Err(write_err) = self.write_reply(&reply).await {
            return write_err;
        }
        if let Err(flush_err) = self.stream.flush().await {
            return flush_err.into();
        }
        ConnectionError::Protocol(e)
    }

    fn try_parse_request(&mut self) -> Result<Option<Request>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer)? {
            Some((frame, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.peer,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "parsed frame"
                );
                Request::from_frame(frame, &self.peer).map(Some)
            }
            None => {
                trace!(
                    client = %self.peer,
                    buffered = self.buffer.len(),
                    "incomplete frame, need more data"
                );
                Ok(None)
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.peer, bytes = n, "read data");

        Ok(())
    }

    /// Buffers a reply; the caller flushes.
    async fn write_reply(&mut self, reply: &RespValue) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.stream.write_all(&bytes).await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.peer, bytes = bytes.len(), "queued reply");
        Ok(())
    }
}

/// Errors that can end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized frame; the client already got an error reply
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("client disconnected")]
    ClientDisconnected,

    /// The stream ended inside a frame
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

/// Runs a [`ConnectionHandler`] to completion. Ordinary disconnects are not
/// reported.
pub async fn handle_connection<S, H>(
    stream: S,
    peer: String,
    registry: Arc<CommandRegistry<H>>,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Send + Sync + 'static,
{
    let handler = ConnectionHandler::new(stream, peer, registry, stats, shutdown);
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandError;
    use tokio_test::io::Builder;

    struct Echo;

    impl Echo {
        async fn ping(self: Arc<Self>, message: Option<String>) -> Result<String, CommandError> {
            Ok(message.unwrap_or_else(|| "PONG".to_string()))
        }
    }

    fn registry() -> Arc<CommandRegistry<Echo>> {
        let registry = CommandRegistry::builder(Arc::new(Echo))
            .register("ping", Echo::ping)
            .unwrap()
            .build();
        Arc::new(registry)
    }

    async fn run(stream: tokio_test::io::Mock) -> (Result<(), ConnectionError>, Arc<ConnectionStats>) {
        let stats = Arc::new(ConnectionStats::new());
        let (_tx, rx) = watch::channel(false);
        let handler = ConnectionHandler::new(
            stream,
            "mock".to_string(),
            registry(),
            Arc::clone(&stats),
            rx,
        );
        (handler.run().await, stats)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"$4\r\nPONG\r\n")
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let mock = Builder::new()
            .read(b"*2\r\n$4\r\nPING\r\n$1\r\na\r\n*2\r\n$4\r\nPING\r\n$1\r\nb\r\n")
            .write(b"$1\r\na\r\n$1\r\nb\r\n")
            .build();

        let (_, stats) = run(mock).await;
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPI")
            .read(b"NG\r\n")
            .write(b"$4\r\nPONG\r\n")
            .build();

        let (result, _) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_inline_command() {
        let mock = Builder::new()
            .read(b"PING hello\r\n")
            .write(b"$5\r\nhello\r\n")
            .build();

        let _ = run(mock).await;
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection() {
        let mock = Builder::new()
            .read(b"*1\r\n$3\r\nGET\r\n")
            .write(b"-ERR unknown command 'GET'\r\n")
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"$4\r\nPONG\r\n")
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_non_array_frame_closes_with_protocol_error() {
        // The second frame is never answered.
        let mock = Builder::new()
            .read(b":1\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"-ERR Protocol error: expected a multibulk request\r\n")
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_empty_multibulk_is_protocol_error() {
        let mock = Builder::new()
            .read(b"*0\r\n")
            .write(b"-ERR Protocol error: empty request\r\n")
            .build();

        let (result, _) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_large_bulk_spanning_reads() {
        let message = "x".repeat(70 * 1024);
        let request = format!("*2\r\n$4\r\nPING\r\n${}\r\n{}\r\n", message.len(), message);
        let (head, tail) = request.as_bytes().split_at(32 * 1024);
        let reply = format!("${}\r\n{}\r\n", message.len(), message);

        let mock = Builder::new()
            .read(head)
            .read(tail)
            .write(reply.as_bytes())
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_buffer_limit_replies_before_close() {
        let mut input = b"*2\r\n$4\r\nPING\r\n$100\r\n".to_vec();
        input.extend_from_slice(&[b'x'; 20]);
        assert_eq!(input.len(), 40);

        let mock = Builder::new()
            .read(&input)
            .write(b"-ERR Protocol error: frame too large: 40 bytes (max: 16)\r\n")
            .build();

        let stats = Arc::new(ConnectionStats::new());
        let (_tx, rx) = watch::channel(false);
        let handler = ConnectionHandler::new(mock, "mock".to_string(), registry(), Arc::clone(&stats), rx)
            .with_buffer_limit(16);

        let result = handler.run().await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ParseError::TooLarge { size: 40, max: 16 }))
        ));
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_oversized_bulk_header_replies_before_close() {
        let mock = Builder::new()
            .read(b"*2\r\n$4\r\nPING\r\n$600000000\r\n")
            .write(b"-ERR Protocol error: frame too large: 600000000 bytes (max: 536870912)\r\n")
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ParseError::TooLarge { .. }))
        ));
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_non_utf8_command_name_is_unknown() {
        let mock = Builder::new()
            .read(b"*1\r\n$2\r\n\xff\xfe\r\n")
            .write("-ERR unknown command '\u{fffd}\u{fffd}'\r\n".as_bytes())
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"$4\r\nPONG\r\n")
            .build();

        let (result, stats) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 0);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_partial_frame_at_eof() {
        let mock = Builder::new().read(b"*1\r\n$4\r\nPI").build();

        let (result, _) = run(mock).await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let stats = Arc::new(ConnectionStats::new());
        let (tx, rx) = watch::channel(false);
        let handler =
            ConnectionHandler::new(server, "duplex".to_string(), registry(), Arc::clone(&stats), rx);
        let task = tokio::spawn(handler.run());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send_replace(true);

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        drop(client);
    }
}
