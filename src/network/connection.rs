//! Connection handling
//!
//! A connection owns one byte stream and drives it with two tasks:
//! - a read pump turning incoming frames into payloads on the inbound queue
//! - a write pump draining the outbound queue one frame at a time
//!
//! Each pump is the sole owner of its half of the stream, so there is never
//! more than one read and one write in flight on a connection.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::NetworkConfig;
use crate::protocol::{
    self, FramingError, GameMessage, FOOTER_MAGIC, FOOTER_SIZE, FRAME_OVERHEAD, HEADER_SIZE,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection is already connecting or connected")]
    AlreadyActive,

    #[error("Connection timeout")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Outbound queue full")]
    QueueFull,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Outcome of a connect or accept attempt, carrying the peer address on success
pub type ConnectResult = ConnectionResult<SocketAddr>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never used
    Idle,
    /// Connect or accept in flight
    Connecting,
    /// Pumps running, ready for traffic
    Connected,
    /// Closed explicitly, by a failed attempt or by a stream error
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames written to the stream
    pub frames_sent: u64,
    /// Frames read from the stream
    pub frames_received: u64,
    /// Bytes written, envelope included
    pub bytes_sent: u64,
    /// Bytes read, envelope included
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatCounters {
    fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A frame sitting in the outbound queue
#[derive(Debug)]
struct OutboundFrame {
    header: [u8; HEADER_SIZE],
    payload: Bytes,
}

impl OutboundFrame {
    fn new(payload: Bytes) -> Self {
        Self {
            header: protocol::encode_header(payload.len()),
            payload,
        }
    }

    fn len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Header, payload and footer go out as one vectored write
    async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let footer = FOOTER_MAGIC;
        let mut frame = Buf::chain(Buf::chain(&self.header[..], &self.payload[..]), &footer[..]);
        writer.write_all_buf(&mut frame).await?;
        writer.flush().await
    }
}

/// Mutable session bookkeeping, guarded by a single lock
struct Link {
    state: ConnectionState,
    /// Bumped on every connect/accept/attach so stale tasks cannot touch a newer session
    generation: u64,
    peer_addr: Option<SocketAddr>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    /// Dropped on close, starting the write pump's drain deadline
    closing: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
}

/// State shared between a connection and its tasks
struct Shared {
    name: String,
    link: Mutex<Link>,
    inbound: Mutex<VecDeque<Bytes>>,
    readable: Notify,
    peer_name: Mutex<Option<String>>,
    stats: StatCounters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(name: String) -> Self {
        Self {
            name,
            link: Mutex::new(Link {
                state: ConnectionState::Idle,
                generation: 0,
                peer_addr: None,
                outbound: None,
                closing: None,
                reader: None,
                writer: None,
                attempt: None,
            }),
            inbound: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            peer_name: Mutex::new(None),
            stats: StatCounters::default(),
        }
    }

    fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    /// Move to `Connecting`, rejecting the call if a session is already in progress
    fn begin_attempt(&self) -> ConnectionResult<u64> {
        let mut link = lock(&self.link);
        match link.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ConnectionError::AlreadyActive)
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                link.state = ConnectionState::Connecting;
                link.generation += 1;
                link.peer_addr = None;
                Ok(link.generation)
            }
        }
    }

    fn set_attempt(&self, generation: u64, task: JoinHandle<()>) {
        let mut link = lock(&self.link);
        if link.generation == generation && link.state == ConnectionState::Connecting {
            link.attempt = Some(task);
        } else {
            // Closed before the task was registered, release its socket now
            task.abort();
        }
    }

    fn fail_attempt(&self, generation: u64, error: &ConnectionError) {
        match error {
            ConnectionError::Timeout => {
                tracing::info!("{} : Timed out on waiting for connections", self.name)
            }
            e => tracing::info!("{} : Connection failed with error {}", self.name, e),
        }

        let mut link = lock(&self.link);
        if link.generation == generation && link.state == ConnectionState::Connecting {
            link.state = ConnectionState::Closed;
            link.attempt = None;
        }
    }

    /// Install a freshly connected stream and start both pumps
    fn establish<S>(
        self: &Arc<Self>,
        generation: u64,
        stream: S,
        peer_addr: Option<SocketAddr>,
        runtime: &Handle,
        config: &NetworkConfig,
    ) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut link = lock(&self.link);
        if link.generation != generation || link.state != ConnectionState::Connecting {
            // close() won the race against the attempt
            return Err(ConnectionError::Closed);
        }

        lock(&self.inbound).clear();

        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.max_pending_frames.max(1));
        let (closing_tx, closing_rx) = oneshot::channel();

        if let Some(previous) = link.writer.take() {
            if !previous.is_finished() {
                tracing::debug!("{} : Dropping frames left by the previous session", self.name);
                previous.abort();
            }
        }

        link.state = ConnectionState::Connected;
        link.peer_addr = peer_addr;
        link.attempt = None;
        link.outbound = Some(outbound_tx);
        link.closing = Some(closing_tx);
        link.reader = Some(runtime.spawn(read_pump(
            reader,
            self.clone(),
            generation,
            config.max_payload_size,
        )));
        link.writer = Some(runtime.spawn(write_pump(
            writer,
            outbound_rx,
            closing_rx,
            self.clone(),
            generation,
            config.drain_timeout(),
        )));

        match peer_addr {
            Some(addr) => tracing::info!("{} : Connected to {}", self.name, addr),
            None => tracing::info!("{} : Connected", self.name),
        }
        Ok(())
    }

    /// Close the connection if `generation` is still the current session
    fn close_session(&self, generation: u64) {
        let mut link = lock(&self.link);
        if link.generation == generation {
            self.shutdown(&mut link);
            drop(link);
            self.readable.notify_waiters();
        }
    }

    fn close(&self) {
        let mut link = lock(&self.link);
        self.shutdown(&mut link);
        drop(link);
        self.readable.notify_waiters();
    }

    fn shutdown(&self, link: &mut Link) {
        if matches!(
            link.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::info!("{} : Closing connection", self.name);
        }

        link.state = ConnectionState::Closed;
        if let Some(attempt) = link.attempt.take() {
            attempt.abort();
        }
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        // Dropping the sender lets the write pump drain what is queued, then exit.
        // The drain is bounded by the drain timeout once `closing` is gone.
        link.outbound = None;
        link.closing = None;
    }

    fn push_inbound(&self, payload: Bytes) {
        lock(&self.inbound).push_back(payload);
        self.readable.notify_waiters();
    }
}

async fn read_frame<R>(reader: &mut R, max_payload: usize) -> ConnectionResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let payload_len = protocol::decode_header(&header)?;
    if payload_len > max_payload {
        return Err(FramingError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        }
        .into());
    }

    let mut body = BytesMut::zeroed(payload_len + FOOTER_SIZE);
    reader.read_exact(&mut body).await?;

    let payload_len = protocol::decode_body(&body)?.len();
    body.truncate(payload_len);
    Ok(body.freeze())
}

async fn read_pump<R>(mut reader: R, shared: Arc<Shared>, generation: u64, max_payload: usize)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, max_payload).await {
            Ok(payload) => {
                let size = payload.len() + FRAME_OVERHEAD;
                tracing::trace!("{} : Read message of size {}", shared.name, size);
                shared.stats.record_received(size);
                shared.push_inbound(payload);
            }
            Err(ConnectionError::Framing(e)) => {
                tracing::warn!("{} : Received invalid frame ({}), disconnecting", shared.name, e);
                break;
            }
            Err(e) => {
                tracing::debug!("{} : Read pump stopped: {}", shared.name, e);
                break;
            }
        }
    }

    shared.close_session(generation);
}

async fn write_pump<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<OutboundFrame>,
    closing: oneshot::Receiver<()>,
    shared: Arc<Shared>,
    generation: u64,
    drain_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let drained = async {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = frame.write_to(&mut writer).await {
                tracing::debug!("{} : Received error in write pump: {}", shared.name, e);
                queue.close();
                shared.close_session(generation);
                return;
            }

            tracing::trace!("{} : Wrote {} bytes", shared.name, frame.len());
            shared.stats.record_sent(frame.len());
        }

        let _ = writer.shutdown().await;
    };

    // Starts counting once the session is closed
    let deadline = async {
        let _ = closing.await;
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        _ = drained => {}
        _ = deadline => {
            tracing::debug!("{} : Pending writes did not drain in time, dropping them", shared.name);
        }
    }
}

/// Future resolving once a connect or accept attempt finishes.
///
/// Exactly one outcome is ever produced: the peer address, or the reason the
/// attempt failed (`Timeout`, `Io`, or `Closed` when the connection was closed
/// while the attempt was in flight).
#[derive(Debug)]
pub struct PendingConnect {
    local_addr: Option<SocketAddr>,
    result: oneshot::Receiver<ConnectResult>,
}

impl PendingConnect {
    /// Address the listener is bound to (accept attempts only)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Non-blocking check, returns the outcome once it is available
    pub fn try_result(&mut self) -> Option<ConnectResult> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ConnectionError::Closed)),
        }
    }

    /// Block the current thread until the attempt finishes.
    ///
    /// Must not be called from within an async context.
    pub fn wait(self) -> ConnectResult {
        self.result
            .blocking_recv()
            .unwrap_or(Err(ConnectionError::Closed))
    }
}

impl Future for PendingConnect {
    type Output = ConnectResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().result)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Closed)))
    }
}

/// Represents a framed connection to a remote peer
pub struct Connection {
    runtime: Handle,
    config: NetworkConfig,
    shared: Arc<Shared>,
}

impl Connection {
    /// Create an idle connection whose tasks run on `runtime`
    pub fn new(name: impl Into<String>, runtime: Handle, config: NetworkConfig) -> Self {
        Self {
            runtime,
            config,
            shared: Arc::new(Shared::new(name.into())),
        }
    }

    /// Diagnostic label
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.link).peer_addr
    }

    /// Name the peer announced during the handshake
    pub fn peer_name(&self) -> Option<String> {
        lock(&self.shared.peer_name).clone()
    }

    pub fn set_peer_name(&self, name: impl Into<String>) {
        *lock(&self.shared.peer_name) = Some(name.into());
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    /// Start connecting to `endpoint`, giving up after `timeout`.
    ///
    /// Returns `AlreadyActive` right away if the connection is connecting or connected.
    pub fn connect_async(
        &self,
        endpoint: SocketAddr,
        timeout: Duration,
    ) -> ConnectionResult<PendingConnect> {
        let generation = self.shared.begin_attempt()?;
        tracing::info!("{} : Connecting to {}...", self.name(), endpoint);

        let attempt = async move {
            match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => Ok((stream, endpoint)),
                Ok(Err(e)) => Err(ConnectionError::Io(e)),
                Err(_) => Err(ConnectionError::Timeout),
            }
        };

        Ok(self.spawn_attempt(generation, None, attempt))
    }

    /// Listen on `port` on all interfaces and wait for a single peer
    pub fn accept_async(&self, port: u16, timeout: Duration) -> ConnectionResult<PendingConnect> {
        self.accept_on(SocketAddr::from(([0, 0, 0, 0], port)), timeout)
    }

    /// Listen on `addr` and wait for a single peer, giving up after `timeout`
    pub fn accept_on(&self, addr: SocketAddr, timeout: Duration) -> ConnectionResult<PendingConnect> {
        let generation = self.shared.begin_attempt()?;

        let listener = match self.bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) => {
                let error = ConnectionError::Io(e);
                self.shared.fail_attempt(generation, &error);
                return Err(error);
            }
        };
        let local_addr = listener.local_addr().ok();
        tracing::info!(
            "{} : Accepting connections on {}...",
            self.name(),
            local_addr.unwrap_or(addr)
        );

        let attempt = async move {
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(Ok((stream, peer))) => Ok((stream, peer)),
                Ok(Err(e)) => Err(ConnectionError::Io(e)),
                Err(_) => Err(ConnectionError::Timeout),
            }
        };

        Ok(self.spawn_attempt(generation, local_addr, attempt))
    }

    /// Adopt an already established byte stream and start the pumps on it
    pub fn attach<S>(&self, stream: S) -> ConnectionResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let generation = self.shared.begin_attempt()?;
        self.shared
            .establish(generation, stream, None, &self.runtime, &self.config)
    }

    fn bind_listener(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let _guard = self.runtime.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(1)
    }

    fn spawn_attempt<F>(
        &self,
        generation: u64,
        local_addr: Option<SocketAddr>,
        attempt: F,
    ) -> PendingConnect
    where
        F: Future<Output = ConnectionResult<(TcpStream, SocketAddr)>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let runtime = self.runtime.clone();
        let config = self.config.clone();

        let task = self.runtime.spawn(async move {
            let result = match attempt.await {
                Ok((stream, peer)) => shared
                    .establish(generation, stream, Some(peer), &runtime, &config)
                    .map(|()| peer),
                Err(e) => {
                    shared.fail_attempt(generation, &e);
                    Err(e)
                }
            };
            let _ = result_tx.send(result);
        });
        self.shared.set_attempt(generation, task);

        PendingConnect {
            local_addr,
            result: result_rx,
        }
    }

    /// Close the connection. Safe to call any number of times, from any state.
    ///
    /// Frames already queued for sending are still flushed by the write pump.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Hand over the write pump of the latest session so its drain can be awaited
    pub(crate) fn take_writer(&self) -> Option<JoinHandle<()>> {
        lock(&self.shared.link).writer.take()
    }

    /// Queue a payload for sending. Returns `false` if it could not be queued.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        self.try_send(payload).is_ok()
    }

    /// Queue a payload for sending, reporting why it was refused
    pub fn try_send(&self, payload: impl Into<Bytes>) -> ConnectionResult<()> {
        let payload = payload.into();
        protocol::check_payload_len(payload.len())?;

        let link = lock(&self.shared.link);
        let outbound = match (&link.state, &link.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => return Err(ConnectionError::NotConnected),
        };

        outbound
            .try_send(OutboundFrame::new(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Queue a game message for sending
    pub fn send_message(&self, message: &GameMessage) -> bool {
        self.send(message.to_payload())
    }

    /// Pop the next received payload without waiting
    pub fn try_receive(&self) -> Option<Bytes> {
        let payload = lock(&self.shared.inbound).pop_front()?;
        tracing::debug!(
            "{} : Extracted message of size {}",
            self.name(),
            payload.len() + FRAME_OVERHEAD
        );
        Some(payload)
    }

    /// Wait up to `timeout` for the next received payload.
    ///
    /// Returns `None` on timeout, or once the connection is closed and every
    /// payload received before the close has been handed out.
    pub async fn receive(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_receive() {
                return Some(payload);
            }
            if !self.is_connected() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!("{} : Extracting message timed out", self.name());
                return self.try_receive();
            }
        }
    }

    /// Wait up to `timeout` for the next game message
    pub async fn receive_message(&self, timeout: Duration) -> Option<GameMessage> {
        self.receive(timeout).await.map(protocol::unwrap)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        tracing::debug!("{} : instance destroyed", self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GameMessageType, HEADER_MAGIC};
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const WAIT: Duration = Duration::from_secs(2);

    fn connection(name: &str) -> Connection {
        Connection::new(name, Handle::current(), NetworkConfig::default())
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Connect two connections over real loopback TCP
    async fn connected_pair() -> (Connection, Connection) {
        let server = connection("server");
        let client = connection("client");

        let accept = server.accept_on(loopback(), WAIT).unwrap();
        let addr = accept.local_addr().unwrap();
        let connect = client.connect_async(addr, WAIT).unwrap();

        let (accepted, connected) = tokio::join!(accept, connect);
        assert_eq!(connected.unwrap(), addr);
        assert!(accepted.is_ok());

        (server, client)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loopback_preserves_order() {
        let (server, client) = connected_pair().await;
        assert!(server.is_connected());
        assert!(client.is_connected());

        for message in ["m1", "m2", "m3"] {
            assert!(client.send(Bytes::from_static(message.as_bytes())));
        }

        for expected in ["m1", "m2", "m3"] {
            let payload = server.receive(WAIT).await.unwrap();
            assert_eq!(&payload[..], expected.as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_duplex_game_messages() {
        let (server, client) = connected_pair().await;

        assert!(client.send_message(&GameMessage::handshake1("Alice")));
        assert!(server.send_message(&GameMessage::handshake2("Bob")));

        let at_server = server.receive_message(WAIT).await.unwrap();
        let at_client = client.receive_message(WAIT).await.unwrap();
        assert_eq!(at_server.message_type, GameMessageType::Handshake1);
        assert_eq!(at_server.body_text(), "Alice");
        assert_eq!(at_client.message_type, GameMessageType::Handshake2);
        assert_eq!(at_client.body_text(), "Bob");

        let stats = client.stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.bytes_received, (8 + 2 + 3) as u64);
    }

    #[tokio::test]
    async fn test_second_attempt_is_rejected() {
        let server = connection("server");
        let pending = server.accept_on(loopback(), WAIT).unwrap();
        let addr = pending.local_addr().unwrap();

        assert!(matches!(
            server.accept_on(loopback(), WAIT),
            Err(ConnectionError::AlreadyActive)
        ));
        assert!(matches!(
            server.connect_async(addr, WAIT),
            Err(ConnectionError::AlreadyActive)
        ));

        let client = connection("client");
        let _first = client.connect_async(addr, WAIT).unwrap();
        assert!(matches!(
            client.connect_async(addr, WAIT),
            Err(ConnectionError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let server = connection("server");
        let pending = server
            .accept_on(loopback(), Duration::from_millis(50))
            .unwrap();

        assert!(matches!(pending.await, Err(ConnectionError::Timeout)));
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(!server.send(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_close_cancels_pending_accept() {
        let server = connection("server");
        let mut pending = server.accept_on(loopback(), WAIT).unwrap();
        assert!(pending.try_result().is_none());

        server.close();
        assert!(matches!(pending.await, Err(ConnectionError::Closed)));
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = connection("idle");
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.send(Bytes::from_static(b"nope")));
        assert!(matches!(
            conn.try_send(Bytes::new()),
            Err(ConnectionError::NotConnected)
        ));
        assert!(conn.try_receive().is_none());
        assert!(conn.receive(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = connection("closing");
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_header_closes_connection() {
        let mock = Builder::new()
            .read(&[0x00, 0x00, 0x0A, 0x00, 0x00, 0x00])
            .build();
        let conn = connection("bad-header");
        conn.attach(mock).unwrap();

        assert!(conn.receive(WAIT).await.is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_footer_closes_connection() {
        let mut header = [0u8; HEADER_SIZE];
        header[..2].copy_from_slice(&HEADER_MAGIC);
        header[2..].copy_from_slice(&10u32.to_le_bytes());

        let mock = Builder::new()
            .read(&header)
            .read(&[b'h', b'i', 0xFA, 0x00])
            .build();
        let conn = connection("bad-footer");
        conn.attach(mock).unwrap();

        assert!(conn.receive(WAIT).await.is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let config = NetworkConfig {
            max_payload_size: 4,
            ..Default::default()
        };
        let conn = Connection::new("small", Handle::current(), config);
        let mock = Builder::new().read(&protocol::encode_header(5)).build();
        conn.attach(mock).unwrap();

        assert!(conn.receive(WAIT).await.is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_frames_received_before_eof_are_kept() {
        let (local, mut remote) = duplex(1024);
        let conn = connection("duplex");
        conn.attach(local).unwrap();

        remote.write_all(&protocol::encode(b"first")).await.unwrap();
        remote.write_all(&protocol::encode(b"")).await.unwrap();
        drop(remote);

        assert_eq!(&conn.receive(WAIT).await.unwrap()[..], b"first");
        assert_eq!(&conn.receive(WAIT).await.unwrap()[..], b"");
        assert!(conn.receive(WAIT).await.is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_sent_frames_are_encoded_on_the_wire() {
        let (local, mut remote) = duplex(1024);
        let conn = connection("writer");
        conn.attach(local).unwrap();

        assert!(conn.send(Bytes::from_static(b"hi")));

        let mut wire = [0u8; 10];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..], &protocol::encode(b"hi")[..]);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (local, _remote) = duplex(64);
        let conn = Arc::new(connection("waiting"));
        conn.attach(local).unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_receive_times_out_while_connected() {
        let (local, _remote) = duplex(64);
        let conn = connection("quiet");
        conn.attach(local).unwrap();

        assert!(conn.receive(Duration::from_millis(20)).await.is_none());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_outbound_queue_is_bounded() {
        let config = NetworkConfig {
            max_pending_frames: 1,
            ..Default::default()
        };
        // A one byte pipe nobody reads from keeps the writer stuck on its first frame
        let (local, _remote) = duplex(1);
        let conn = Connection::new("bounded", Handle::current(), config);
        conn.attach(local).unwrap();

        let mut refused = false;
        for _ in 0..4 {
            if matches!(
                conn.try_send(Bytes::from_static(b"payload")),
                Err(ConnectionError::QueueFull)
            ) {
                refused = true;
            }
            tokio::task::yield_now().await;
        }
        assert!(refused);
    }

    #[tokio::test]
    async fn test_closed_connection_can_be_rearmed() {
        let conn = connection("rearm");
        let (first, _keep) = duplex(64);
        conn.attach(first).unwrap();
        conn.close();

        let (second, mut remote) = duplex(64);
        conn.attach(second).unwrap();
        assert!(conn.is_connected());

        remote.write_all(&protocol::encode(b"again")).await.unwrap();
        assert_eq!(&conn.receive(WAIT).await.unwrap()[..], b"again");
    }

    #[tokio::test]
    async fn test_connect_refused_closes() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let client = connection("refused");
        let pending = client.connect_async(addr, WAIT).unwrap();
        assert!(matches!(pending.await, Err(ConnectionError::Io(_))));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.send(Bytes::from_static(b"late")));

        assert!(client.connect_async(addr, WAIT).is_ok());
    }

    #[tokio::test]
    async fn test_write_error_closes_connection() {
        let mock = Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer went away",
            ))
            .build();
        let conn = connection("broken-pipe");
        conn.attach(mock).unwrap();

        assert!(conn.send(Bytes::from_static(b"lost")));
        assert!(conn.receive(WAIT).await.is_none());

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.send(Bytes::from_static(b"after")));
        assert_eq!(conn.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_close_bounds_stuck_write_pump() {
        let config = NetworkConfig {
            drain_timeout_ms: 50,
            ..Default::default()
        };
        // Nobody reads the remote end, so the writer blocks on the first frame
        let (local, _remote) = duplex(1);
        let conn = Connection::new("stuck", Handle::current(), config);
        conn.attach(local).unwrap();

        assert!(conn.send(Bytes::from(vec![0u8; 4096])));
        tokio::task::yield_now().await;
        conn.close();

        let writer = conn.take_writer().unwrap();
        drop(conn);
        tokio::time::timeout(WAIT, writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rearm_stops_previous_write_pump() {
        let (first, mut stalled) = duplex(1);
        let conn = connection("rearm-writer");
        conn.attach(first).unwrap();
        assert!(conn.send(Bytes::from(vec![0u8; 4096])));
        tokio::task::yield_now().await;
        conn.close();

        let (second, _remote) = duplex(64);
        conn.attach(second).unwrap();
        assert!(conn.is_connected());

        // The old stream is released well before the drain timeout would expire
        let mut leftover = Vec::new();
        tokio::time::timeout(Duration::from_millis(500), stalled.read_to_end(&mut leftover))
            .await
            .unwrap()
            .unwrap();
        assert!(leftover.len() < 4096 + FRAME_OVERHEAD);
    }

    #[tokio::test]
    async fn test_attempt_closed_before_registration_is_aborted() {
        let server = connection("racing");
        let generation = server.shared.begin_attempt().unwrap();
        let listener = server.bind_listener(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();

        // Close lands before the attempt task is registered
        server.close();
        let attempt = async move { listener.accept().await.map_err(ConnectionError::from) };
        let pending = server.spawn_attempt(generation, Some(addr), attempt);
        assert!(matches!(pending.await, Err(ConnectionError::Closed)));

        // The aborted task took the listener with it
        assert!(server.accept_on(addr, WAIT).is_ok());
    }
}
