//! Byte-stream connection: one socket (or any duplex stream) with timed, cancellable reads
//! and writes. Reads and writes are serialized independently so a read loop and writers
//! can share one connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::network::handlers::EventHandlers;
use crate::options::ConnectionOptions;
use crate::{Result, SoulseekError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
        reason: Option<String>,
    },
    /// Raw bytes arrived from the socket.
    DataRead { bytes: usize },
    /// A connection that had reached `Connected` was torn down. Emitted once.
    Disconnected { reason: String },
}

pub struct Connection {
    address: SocketAddr,
    options: ConnectionOptions,
    state: StdMutex<ConnectionState>,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    disconnect_token: CancellationToken,
    events: EventHandlers<ConnectionEvent>,
}

enum ReadFailure {
    Cancelled,
    Inactive(Duration),
    Closed,
    Io(std::io::Error),
}

impl Connection {
    /// A connection that has not been opened yet; call [`Connection::connect`].
    pub fn new(address: SocketAddr, options: ConnectionOptions) -> Self {
        Self {
            address,
            options,
            state: StdMutex::new(ConnectionState::Disconnected),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            disconnect_token: CancellationToken::new(),
            events: EventHandlers::new(),
        }
    }

    /// Wrap an already-open stream, e.g. an accepted socket or an in-memory duplex.
    pub fn from_stream<S>(address: SocketAddr, options: ConnectionOptions, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            address,
            options,
            state: StdMutex::new(ConnectionState::Connected),
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            disconnect_token: CancellationToken::new(),
            events: EventHandlers::new(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn events(&self) -> &EventHandlers<ConnectionEvent> {
        &self.events
    }

    /// Cancelled exactly when the connection is disconnected.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect_token.clone()
    }

    /// Open the socket, retrying up to `connect_attempts` times with `connect_timeout` each.
    /// A connection is single-use: once disconnected it cannot be reconnected.
    pub async fn connect(&self) -> Result<()> {
        if self.disconnect_token.is_cancelled()
            || !self.try_transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(SoulseekError::InvalidOperation(format!(
                "connection to {} is {:?} and cannot be connected",
                self.address,
                self.state()
            )));
        }

        let attempts = self.options.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = self.disconnect_token.cancelled() => {
                    self.set_state(ConnectionState::Disconnected, Some("connect cancelled".into()));
                    return Err(SoulseekError::connection(
                        format!("connect to {} cancelled", self.address),
                        None,
                    ));
                }
                r = tokio::time::timeout(self.options.connect_timeout(), TcpStream::connect(self.address)) => r,
            };
            match outcome {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(address = %self.address, error = %e, "set_nodelay failed");
                    }
                    let (reader, writer) = stream.into_split();
                    *self.reader.lock().await = Some(Box::new(reader));
                    *self.writer.lock().await = Some(Box::new(writer));
                    self.set_state(ConnectionState::Connected, None);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(address = %self.address, attempt, error = %e, "connect failed");
                    last_error = Some(SoulseekError::connection(
                        format!("failed to connect to {}: {e}", self.address),
                        Some(e),
                    ));
                }
                Err(_) => {
                    debug!(address = %self.address, attempt, "connect timed out");
                    last_error = Some(SoulseekError::connection(
                        format!(
                            "connect to {} timed out after {}ms",
                            self.address, self.options.connect_timeout_ms
                        ),
                        None,
                    ));
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            SoulseekError::connection(format!("failed to connect to {}", self.address), None)
        });
        self.set_state(ConnectionState::Disconnected, Some(error.to_string()));
        Err(error)
    }

    pub async fn read(&self, length: usize) -> Result<Vec<u8>> {
        self.read_with(length, |_| {}).await
    }

    /// Read exactly `length` bytes, reporting the running total after every socket read.
    /// Inactivity beyond the read timeout, a remote close, or an I/O error disconnects.
    pub async fn read_with(&self, length: usize, mut progress: impl FnMut(usize)) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(SoulseekError::read(
                format!("connection to {} is {:?}", self.address, self.state()),
                None,
            ));
        }

        let outcome = {
            let mut guard = self.reader.lock().await;
            let outcome = match guard.as_mut() {
                Some(reader) => self.fill(reader, length, &mut progress).await,
                None => Err(ReadFailure::Closed),
            };
            if outcome.is_err() {
                guard.take();
            }
            outcome
        };

        outcome.map_err(|failure| match failure {
            ReadFailure::Cancelled => SoulseekError::Cancelled(format!(
                "read from {} interrupted by disconnect",
                self.address
            )),
            ReadFailure::Inactive(limit) => {
                let reason = format!("inactivity timeout of {}ms reached", limit.as_millis());
                self.disconnect(reason.clone());
                SoulseekError::read(format!("{} {reason}", self.address), None)
            }
            ReadFailure::Closed => {
                self.disconnect("remote connection closed");
                SoulseekError::read(format!("{} closed the connection", self.address), None)
            }
            ReadFailure::Io(e) => {
                self.disconnect(format!("read error: {e}"));
                SoulseekError::read(format!("failed to read from {}", self.address), Some(e))
            }
        })
    }

    async fn fill(
        &self,
        reader: &mut BoxedReader,
        length: usize,
        progress: &mut impl FnMut(usize),
    ) -> std::result::Result<Vec<u8>, ReadFailure> {
        let mut buffer = vec![0u8; length];
        let chunk = self.options.read_buffer_size.max(1);
        let mut total = 0;
        while total < length {
            let end = (total + chunk).min(length);
            let read = reader.read(&mut buffer[total..end]);
            let outcome = tokio::select! {
                _ = self.disconnect_token.cancelled() => return Err(ReadFailure::Cancelled),
                r = with_timeout(self.options.read_timeout(), read) => r,
            };
            match outcome {
                None => {
                    return Err(ReadFailure::Inactive(
                        self.options.read_timeout().unwrap_or_default(),
                    ))
                }
                Some(Ok(0)) => return Err(ReadFailure::Closed),
                Some(Ok(n)) => {
                    total += n;
                    self.events.emit(&ConnectionEvent::DataRead { bytes: n });
                    progress(total);
                }
                Some(Err(e)) => return Err(ReadFailure::Io(e)),
            }
        }
        Ok(buffer)
    }

    /// Write all bytes and flush within the write timeout. Failure disconnects.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(SoulseekError::write(
                format!("connection to {} is {:?}", self.address, self.state()),
                None,
            ));
        }

        let outcome = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(SoulseekError::write(
                    format!("connection to {} has no open stream", self.address),
                    None,
                ));
            };
            let write = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            };
            tokio::select! {
                _ = self.disconnect_token.cancelled() => None,
                r = tokio::time::timeout(self.options.write_timeout(), write) => Some(r),
            }
        };

        match outcome {
            Some(Ok(Ok(()))) => Ok(()),
            None => Err(SoulseekError::write(
                format!("write to {} interrupted by disconnect", self.address),
                None,
            )),
            Some(Ok(Err(e))) => {
                self.disconnect(format!("write error: {e}"));
                Err(SoulseekError::write(
                    format!("failed to write to {}", self.address),
                    Some(e),
                ))
            }
            Some(Err(_)) => {
                self.disconnect("write timed out");
                Err(SoulseekError::write(
                    format!(
                        "write to {} timed out after {}ms",
                        self.address, self.options.write_timeout_ms
                    ),
                    None,
                ))
            }
        }
    }

    /// Tear the connection down. Idempotent; pending reads and writes are interrupted.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    drop(state);
                    self.disconnect_token.cancel();
                    return;
                }
                previous => {
                    *state = ConnectionState::Disconnecting;
                    previous
                }
            }
        };
        self.events.emit(&ConnectionEvent::StateChanged {
            previous,
            current: ConnectionState::Disconnecting,
            reason: Some(reason.clone()),
        });

        self.disconnect_token.cancel();
        // Halves held by an in-flight read or write are dropped by that operation instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        self.set_state(ConnectionState::Disconnected, Some(reason.clone()));
        if previous == ConnectionState::Connected {
            debug!(address = %self.address, %reason, "disconnected");
            self.events.emit(&ConnectionEvent::Disconnected { reason });
        }
    }

    fn try_transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.events.emit(&ConnectionEvent::StateChanged {
            previous: from,
            current: to,
            reason: None,
        });
        true
    }

    fn set_state(&self, next: ConnectionState, reason: Option<String>) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            self.events.emit(&ConnectionEvent::StateChanged {
                previous,
                current: next,
                reason,
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect_token.cancel();
    }
}

async fn with_timeout<F: Future>(limit: Option<Duration>, future: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as TestMutex};
    use tokio::net::TcpListener;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn quick() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout_ms: 1_000,
            read_timeout_ms: Some(1_000),
            write_timeout_ms: 1_000,
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn connect_write_and_read() {
        let listener = TcpListener::bind(local()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let conn = Connection::new(addr, quick());
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.write(b"hello").await.unwrap();
        assert_eq!(conn.read(5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_connect_fails_and_resets_state() {
        let listener = TcpListener::bind(local()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(addr, quick());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, SoulseekError::Connection { .. }), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn second_connect_is_invalid() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = Connection::from_stream(local(), quick(), a);
        assert!(matches!(
            conn.connect().await,
            Err(SoulseekError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn progress_reports_running_total() {
        let (a, mut b) = tokio::io::duplex(64);
        let options = ConnectionOptions {
            read_buffer_size: 4,
            ..quick()
        };
        let conn = Connection::from_stream(local(), options, a);
        b.write_all(&[1u8; 10]).await.unwrap();
        let mut seen = Vec::new();
        let bytes = conn.read_with(10, |n| seen.push(n)).await.unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(seen.last(), Some(&10));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn inactivity_timeout_disconnects() {
        let (a, _b) = tokio::io::duplex(64);
        let options = ConnectionOptions {
            read_timeout_ms: Some(50),
            ..quick()
        };
        let conn = Connection::from_stream(local(), options, a);
        let reasons = Arc::new(TestMutex::new(Vec::new()));
        let r = reasons.clone();
        conn.events().subscribe(move |e| {
            if let ConnectionEvent::Disconnected { reason } = e {
                r.lock().unwrap().push(reason.clone());
            }
        });

        let err = conn.read(4).await.unwrap_err();
        assert!(matches!(err, SoulseekError::ConnectionRead { .. }), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("inactivity"));
    }

    #[tokio::test]
    async fn remote_close_is_read_error() {
        let (a, b) = tokio::io::duplex(64);
        let conn = Connection::from_stream(local(), quick(), a);
        drop(b);
        assert!(matches!(
            conn.read(1).await,
            Err(SoulseekError::ConnectionRead { .. })
        ));
        assert!(conn.disconnect_token().is_cancelled());
    }

    #[tokio::test]
    async fn disconnect_interrupts_pending_read() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::from_stream(local(), ConnectionOptions::server(), a));
        let reader = conn.clone();
        let pending = tokio::spawn(async move { reader.read(4).await });
        tokio::task::yield_now().await;
        conn.disconnect("shutting down");
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SoulseekError::Cancelled(_))), "{result:?}");
        assert!(matches!(
            conn.write(b"x").await,
            Err(SoulseekError::ConnectionWrite { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_emits_once() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = Connection::from_stream(local(), quick(), a);
        let count = Arc::new(TestMutex::new(0));
        let c = count.clone();
        conn.events().subscribe(move |e| {
            if matches!(e, ConnectionEvent::Disconnected { .. }) {
                *c.lock().unwrap() += 1;
            }
        });
        conn.disconnect("one");
        conn.disconnect("two");
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
