//! TCP transport: listener, framed connections and outbound dialing.
//!
//! A [`Transport`] owns the listening socket. Every accepted or dialed
//! stream becomes a [`Connection`], which can be split into an [`Inbound`]
//! half (framed `receive`) and an [`Outbound`] half (`send`, `close`).
//! Both halves share a close signal: closing the outbound half, or
//! dropping it, unblocks a pending `receive` with [`NetworkError::Closed`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::NetworkError;
use crate::message::{self, DEFAULT_MAX_PAYLOAD, Message};

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest payload accepted from a peer.
    pub max_payload: usize,
    /// Upper bound on writing a single frame.
    pub write_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl FrameLimits {
    /// Largest frame body a peer may announce.
    pub fn max_body_len(&self) -> usize {
        message::max_body_len(self.max_payload)
    }
}

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// The listening endpoint of a node.
pub struct Transport {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
    limits: FrameLimits,
}

impl Transport {
    /// Bind the listening socket.
    pub async fn listen(addr: SocketAddr, limits: FrameLimits) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Transport listening on {local_addr}");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed,
            limits,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the next inbound connection.
    ///
    /// Fails with [`NetworkError::Closed`] once the transport is closed,
    /// including when the close happens while this call is waiting.
    pub async fn accept(&self) -> Result<Connection, NetworkError> {
        let mut closed = self.closed.subscribe();
        let listener = self.listener.lock().clone().ok_or(NetworkError::Closed)?;

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(NetworkError::Closed),
            result = listener.accept() => {
                let (stream, remote_addr) = result
                    .map_err(|e| NetworkError::Connection(format!("accept failed: {e}")))?;
                debug!("Accepted connection from {remote_addr}");
                Ok(Connection::new(stream, remote_addr, self.limits))
            }
        }
    }

    /// Release the listening socket. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if self.listener.lock().take().is_some() {
            info!("Transport on {} closed", self.local_addr);
        }
    }

    /// Dial a remote node.
    pub async fn connect(
        addr: SocketAddr,
        limits: FrameLimits,
        timeout: Duration,
    ) -> Result<Connection, NetworkError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(timeout))?
            .map_err(|e| NetworkError::Connection(format!("connect to {addr} failed: {e}")))?;
        debug!("Connected to {addr}");
        Ok(Connection::new(stream, addr, limits))
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A full-duplex framed connection to a remote node.
pub struct Connection {
    inbound: Inbound,
    outbound: Outbound,
}

impl Connection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, limits: FrameLimits) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {remote_addr}: {e}");
        }

        let id = ConnectionId::next();
        let (reader, writer) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);

        Self {
            inbound: Inbound {
                id,
                remote_addr,
                reader: BufReader::new(reader),
                closed: closed_rx,
                max_payload: limits.max_payload,
            },
            outbound: Outbound {
                id,
                remote_addr,
                writer: tokio::sync::Mutex::new(Some(writer)),
                closed: closed_tx,
                write_timeout: limits.write_timeout,
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.outbound.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.outbound.remote_addr
    }

    /// Write raw bytes. Returns the number of bytes written.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, NetworkError> {
        self.outbound.send(bytes).await
    }

    /// Encode and write a message frame.
    pub async fn send_message(&self, message: &Message) -> Result<usize, NetworkError> {
        self.outbound.send_message(message).await
    }

    /// Read the next message frame.
    pub async fn receive(&mut self) -> Result<Message, NetworkError> {
        self.inbound.receive().await
    }

    /// Close the connection; pending and future calls fail with `Closed`.
    pub fn close(&self) {
        self.outbound.close();
    }

    /// Separate the read and write halves.
    pub fn split(self) -> (Inbound, Outbound) {
        (self.inbound, self.outbound)
    }
}

/// Read half of a [`Connection`].
pub struct Inbound {
    id: ConnectionId,
    remote_addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    closed: watch::Receiver<bool>,
    max_payload: usize,
}

impl Inbound {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Read and decode the next frame.
    ///
    /// A frame whose body does not decode, or whose payload exceeds the
    /// limit, yields [`NetworkError::MalformedMessage`]; the frame has been
    /// consumed and the connection remains usable. A clean end of stream, a local close
    /// or a dropped outbound half yields [`NetworkError::Closed`]. Anything
    /// that loses frame alignment yields [`NetworkError::Connection`].
    pub async fn receive(&mut self) -> Result<Message, NetworkError> {
        let mut closed = self.closed.clone();
        if *closed.borrow_and_update() {
            return Err(NetworkError::Closed);
        }

        let max_body_len = message::max_body_len(self.max_payload);
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(NetworkError::Closed),
            frame = read_frame(&mut self.reader, max_body_len) => {
                message::decode_body(&frame?, self.max_payload)
            }
        }
    }
}

/// Write half of a [`Connection`]. Owning it means owning the connection:
/// dropping it closes the connection.
pub struct Outbound {
    id: ConnectionId,
    remote_addr: SocketAddr,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    write_timeout: Duration,
}

impl Outbound {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write raw bytes. Returns the number of bytes written.
    ///
    /// Any failure closes the connection, since a partially written frame
    /// leaves the stream undelimitable.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, NetworkError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(NetworkError::Closed);
        }

        let mut guard = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return Err(NetworkError::Closed),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(NetworkError::Closed);
        };

        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(NetworkError::Closed),
            written = tokio::time::timeout(self.write_timeout, writer.write_all(bytes)) => {
                match written {
                    Ok(Ok(())) => Ok(bytes.len()),
                    Ok(Err(e)) => Err(NetworkError::Connection(format!(
                        "write to {} failed: {e}",
                        self.remote_addr
                    ))),
                    Err(_) => Err(NetworkError::Timeout(self.write_timeout)),
                }
            }
        };

        if result.is_err() {
            guard.take();
            self.closed.send_replace(true);
        }
        result
    }

    /// Encode and write a message frame.
    pub async fn send_message(&self, message: &Message) -> Result<usize, NetworkError> {
        self.send(&message::encode(message)).await
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        // A send in progress holds the lock; it observes the signal and
        // drops the writer itself.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if !was_closed {
            debug!("Closed {} to {}", self.id, self.remote_addr);
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body_len: usize,
) -> Result<Vec<u8>, NetworkError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::Closed);
        }
        Err(e) => return Err(NetworkError::Connection(format!("read failed: {e}"))),
    };
    if len > max_body_len {
        return Err(NetworkError::Connection(format!(
            "frame of {len} bytes exceeds the {max_body_len} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NetworkError::Connection(format!("read failed mid-frame: {e}")))?;
    Ok(body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
