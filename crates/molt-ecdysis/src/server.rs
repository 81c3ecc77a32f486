//! Accept loop, per-connection dispatch and bounded drain.
//!
//! The accept loop runs on its own task and hands every connection to a
//! [`Handler`]. Shutdown is two-phase:
//! - cancel the stop token, which ends the accept loop
//! - wait for every [`ConnectionGuard`] to drop, up to a deadline, then
//!   cancel the force-close token so stragglers drop their sockets

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{EcdysisError, Result};
use crate::listener::SocketHandle;

/// Default time a client gets to send its complete request.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(6);

/// Default upper bound on request size.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Pause after a failed `accept` (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long force-closed connections get to unwind after the deadline.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// End of a request head.
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// One request read from an accepted connection.
#[derive(Debug, Clone)]
pub struct Request {
    pub peer: SocketAddr,
    /// Raw bytes up to and including the first blank line, or up to the
    /// client's half-close.
    pub bytes: Bytes,
}

/// Bytes written back before the connection is closed.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub bytes: Bytes,
}

impl Response {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// Application callback invoked once per accepted connection.
///
/// Called concurrently across connections. Implementations must not assume
/// the process outlives the call by much: a drain deadline drops it.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

/// Splits a byte stream at the first `\r\n\r\n`.
#[derive(Debug)]
pub(crate) struct RequestCodec {
    max_len: usize,
    scanned: usize,
}

impl RequestCodec {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
        }
    }

    fn too_large(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request exceeds {} bytes", self.max_len),
        )
    }
}

impl Decoder for RequestCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        // Back up so a terminator split across two reads is still found.
        let start = self.scanned.saturating_sub(TERMINATOR.len() - 1);
        if let Some(pos) = src[start..]
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
        {
            let end = start + pos + TERMINATOR.len();
            if end > self.max_len {
                return Err(self.too_large());
            }
            self.scanned = 0;
            return Ok(Some(src.split_to(end).freeze()));
        }

        if src.len() > self.max_len {
            return Err(self.too_large());
        }
        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.scanned = 0;
        Ok(Some(src.split().freeze()))
    }
}

/// Tracks one in-flight connection. Drain waits for all guards to drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

#[derive(Clone)]
struct Drain {
    /// Cancelled when the accept loop should stop.
    stop_accepting: CancellationToken,

    /// Cancelled when the deadline passes and open connections must go.
    force_close: CancellationToken,

    connection_count: Arc<AtomicUsize>,

    /// Notified when the last connection drops its guard.
    drain_notify: Arc<Notify>,
}

impl Drain {
    fn new() -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            force_close: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        }
    }

    fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(&self.connection_count),
            notify: Arc::clone(&self.drain_notify),
        }
    }

    fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a guard dropped in between still wakes us.
            notified.as_mut().enable();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A running accept loop over one [`SocketHandle`].
///
/// Consumed by [`Server::shutdown`]; a stopped server cannot be restarted.
pub struct Server {
    socket: Arc<SocketHandle>,
    drain: Drain,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Start accepting on a background task. Must be called inside a tokio runtime.
    pub fn serve(socket: SocketHandle, handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        let socket = Arc::new(socket);
        let drain = Drain::new();

        info!(
            addr = %socket.local_addr(),
            read_timeout_secs = config.read_timeout.as_secs_f64(),
            "Starting accept loop"
        );

        let accept_task = tokio::spawn(
            accept_loop(Arc::clone(&socket), handler, config, drain.clone()).in_current_span(),
        );

        Self {
            socket,
            drain,
            accept_task,
        }
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn active_connections(&self) -> usize {
        self.drain.active_connections()
    }

    /// Stop accepting, then wait up to `deadline` for in-flight connections.
    ///
    /// Connections still open at the deadline are forcibly closed and
    /// [`EcdysisError::ShutdownTimeout`] is returned.
    pub async fn shutdown(self, deadline: Duration) -> Result<()> {
        let Server {
            socket,
            drain,
            accept_task,
        } = self;
        let expires_at = tokio::time::Instant::now() + deadline;

        info!("Stopping accept loop");
        drain.stop_accepting.cancel();
        if let Err(e) = accept_task.await {
            error!(error = %e, "Accept loop task failed");
        }
        drop(socket);

        let active = drain.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return Ok(());
        }

        info!(
            active_connections = active,
            timeout_secs = deadline.as_secs_f64(),
            "Draining active connections"
        );

        match tokio::time::timeout_at(expires_at, drain.wait_for_drain()).await {
            Ok(()) => {
                info!("All connections drained cleanly");
                Ok(())
            }
            Err(_) => {
                let remaining = drain.active_connections();
                warn!(
                    remaining_connections = remaining,
                    timeout_secs = deadline.as_secs_f64(),
                    "Drain deadline expired, forcibly closing connections"
                );
                drain.force_close.cancel();
                if tokio::time::timeout(FORCE_CLOSE_GRACE, drain.wait_for_drain())
                    .await
                    .is_err()
                {
                    error!(
                        remaining_connections = drain.active_connections(),
                        "Connections did not unwind after force close"
                    );
                }
                Err(EcdysisError::ShutdownTimeout {
                    remaining,
                    deadline,
                })
            }
        }
    }
}

async fn accept_loop(
    socket: Arc<SocketHandle>,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    drain: Drain,
) {
    loop {
        tokio::select! {
            biased;
            _ = drain.stop_accepting.cancelled() => {
                info!(addr = %socket.local_addr(), "Accept loop stopped");
                return;
            }
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let guard = drain.connection_guard();
                        let force_close = drain.force_close.clone();
                        let handler = Arc::clone(&handler);
                        tokio::spawn(
                            async move {
                                let _guard = guard;
                                tokio::select! {
                                    _ = force_close.cancelled() => {
                                        debug!(%peer, "Connection forcibly closed at drain deadline");
                                    }
                                    _ = serve_connection(stream, peer, handler, config) => {}
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
) {
    let (reader, mut writer) = stream.split();
    let mut frames = FramedRead::new(reader, RequestCodec::new(config.max_request_bytes));

    let bytes = match tokio::time::timeout(config.read_timeout, frames.next()).await {
        Err(_) => {
            debug!(%peer, "Read timeout, aborting connection");
            return;
        }
        Ok(None) => {
            debug!(%peer, "Connection closed before a request arrived");
            return;
        }
        Ok(Some(Err(e))) => {
            debug!(%peer, error = %e, "Failed to read request");
            return;
        }
        Ok(Some(Ok(bytes))) => bytes,
    };

    let response = handler.handle(Request { peer, bytes }).await;

    if let Err(e) = writer.write_all(&response.bytes).await {
        debug!(%peer, error = %e, "Failed to write response");
        return;
    }
    if let Err(e) = writer.shutdown().await {
        debug!(%peer, error = %e, "Failed to shut down connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    struct Fixed {
        delay: Duration,
    }

    #[async_trait]
    impl Handler for Fixed {
        async fn handle(&self, _request: Request) -> Response {
            tokio::time::sleep(self.delay).await;
            Response::new("this is test response")
        }
    }

    async fn start(delay: Duration, config: ServerConfig) -> Server {
        let socket = SocketHandle::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Server::serve(socket, Arc::new(Fixed { delay }), config)
    }

    async fn request(addr: SocketAddr) -> io::Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await?;
        let mut body = String::new();
        stream.read_to_string(&mut body).await?;
        Ok(body)
    }

    async fn wait_for_connections(server: &Server, n: usize) {
        while server.active_connections() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_codec_splits_at_blank_line() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\r\ntrailing");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(&buf[..], b"trailing");
    }

    #[test]
    fn test_codec_finds_terminator_split_across_reads() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::from(&b"PING\r\n\r"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"PING\r\n\r\n");
    }

    #[test]
    fn test_codec_yields_remainder_on_eof() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::from(&b"ping"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let frame = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"ping");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_request() {
        let mut codec = RequestCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_serves_fixed_response() {
        let server = start(Duration::ZERO, ServerConfig::default()).await;

        let body = request(server.local_addr()).await.unwrap();
        assert_eq!(body, "this is test response");

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_aborts_slow_client() {
        let config = ServerConfig {
            read_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let server = start(Duration::ZERO, config).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut body = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut body))
            .await
            .expect("server should abort the connection");
        assert!(read.is_err() || body.is_empty());

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_request_survives_shutdown() {
        let server = start(Duration::from_millis(300), ServerConfig::default()).await;
        let addr = server.local_addr();

        let client = tokio::spawn(request(addr));
        wait_for_connections(&server, 1).await;

        server.shutdown(Duration::from_secs(5)).await.unwrap();

        let body = client.await.unwrap().unwrap();
        assert_eq!(body, "this is test response");
    }

    #[tokio::test]
    async fn test_no_accepts_after_shutdown() {
        let server = start(Duration::ZERO, ServerConfig::default()).await;
        let addr = server.local_addr();

        server.shutdown(Duration::from_secs(1)).await.unwrap();

        // The listener is closed once the server has stopped.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_deadline_forces_close() {
        let server = start(Duration::from_secs(30), ServerConfig::default()).await;
        let addr = server.local_addr();

        let client = tokio::spawn(request(addr));
        wait_for_connections(&server, 1).await;

        let err = server
            .shutdown(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EcdysisError::ShutdownTimeout { remaining: 1, .. }
        ));

        // Forcibly closed: the client sees the connection end without a body.
        let body = tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .expect("client should be disconnected")
            .unwrap();
        assert!(body.map(|b| b.is_empty()).unwrap_or(true));
    }

    #[tokio::test]
    async fn test_connection_guard_counting() {
        let drain = Drain::new();
        assert_eq!(drain.active_connections(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| drain.connection_guard()).collect();
        assert_eq!(drain.active_connections(), 10);

        guards.truncate(5);
        assert_eq!(drain.active_connections(), 5);

        drop(guards);
        assert_eq!(drain.active_connections(), 0);
        drain.wait_for_drain().await;
    }
}
