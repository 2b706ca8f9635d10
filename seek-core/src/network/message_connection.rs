//! Message framing over a [`Connection`]: one continuous read loop per connection that
//! splits the byte stream into envelopes and publishes them to subscribers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use crate::network::connection::{Connection, ConnectionState};
use crate::network::handlers::EventHandlers;
use crate::options::ConnectionOptions;
use crate::wire::{payload_len, CODE_SIZE, LEN_SIZE};
use crate::{Result, SoulseekError};

#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// Length and code are known; the payload has not been read yet.
    HeaderReceived { length: i32, code: i32 },
    /// Payload progress for the message currently being read.
    DataRead { code: i32, current: usize, total: usize },
    /// A complete envelope, length prefix included.
    MessageRead(Vec<u8>),
    /// The read loop of the server connection failed.
    Faulted(SoulseekError),
}

pub struct MessageConnection {
    username: Option<String>,
    connection: Connection,
    reading: AtomicBool,
    events: EventHandlers<MessageEvent>,
}

impl MessageConnection {
    /// `username` is `None` for the server connection and the peer's name otherwise.
    pub fn new(username: Option<String>, address: SocketAddr, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self::with_connection(username, Connection::new(address, options)))
    }

    pub fn from_stream<S>(
        username: Option<String>,
        address: SocketAddr,
        options: ConnectionOptions,
        stream: S,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Arc::new(Self::with_connection(
            username,
            Connection::from_stream(address, options, stream),
        ))
    }

    fn with_connection(username: Option<String>, connection: Connection) -> Self {
        Self {
            username,
            connection,
            reading: AtomicBool::new(false),
            events: EventHandlers::new(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_server(&self) -> bool {
        self.username.is_none()
    }

    pub fn address(&self) -> SocketAddr {
        self.connection.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn events(&self) -> &EventHandlers<MessageEvent> {
        &self.events
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Connect and start the read loop.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.connection.connect().await?;
        self.start_reading_continuously();
        Ok(())
    }

    /// Spawn the read loop unless one is already running. Returns whether this call started it.
    pub fn start_reading_continuously(self: &Arc<Self>) -> bool {
        if self
            .reading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tokio::spawn(self.clone().read_continuously());
        true
    }

    pub async fn write_message(&self, bytes: &[u8]) -> Result<()> {
        self.connection.write(bytes).await
    }

    pub fn disconnect(&self, reason: impl Into<String>) {
        self.connection.disconnect(reason);
    }

    async fn read_continuously(self: Arc<Self>) {
        let failure = loop {
            if let Err(e) = self.read_message().await {
                break e;
            }
        };
        self.reading.store(false, Ordering::SeqCst);

        if matches!(failure, SoulseekError::Cancelled(_)) {
            debug!(address = %self.address(), "read loop stopped");
            return;
        }

        match &self.username {
            None => {
                error!(address = %self.address(), error = %failure, "server connection read failed");
                self.connection.disconnect(format!("read error: {failure}"));
                self.events.emit(&MessageEvent::Faulted(failure));
            }
            Some(username) => {
                debug!(%username, address = %self.address(), error = %failure, "peer connection read failed");
                self.connection.disconnect(format!("read error: {failure}"));
            }
        }
    }

    async fn read_message(&self) -> Result<()> {
        let length_bytes = self.connection.read(LEN_SIZE).await?;
        let length = i32::from_le_bytes(le4(&length_bytes)?);
        let payload = payload_len(length)?;

        let code_bytes = self.connection.read(CODE_SIZE).await?;
        let code = i32::from_le_bytes(le4(&code_bytes)?);

        self.events.emit(&MessageEvent::DataRead {
            code,
            current: 0,
            total: payload,
        });
        self.events.emit(&MessageEvent::HeaderReceived { length, code });

        let body = if payload > 0 {
            self.connection
                .read_with(payload, |current| {
                    self.events.emit(&MessageEvent::DataRead {
                        code,
                        current,
                        total: payload,
                    })
                })
                .await?
        } else {
            Vec::new()
        };

        let mut envelope = Vec::with_capacity(LEN_SIZE + CODE_SIZE + body.len());
        envelope.extend_from_slice(&length_bytes);
        envelope.extend_from_slice(&code_bytes);
        envelope.extend_from_slice(&body);
        self.events.emit(&MessageEvent::MessageRead(envelope));
        Ok(())
    }
}

fn le4(bytes: &[u8]) -> Result<[u8; 4]> {
    bytes
        .try_into()
        .map_err(|_| SoulseekError::MessageRead(format!("expected 4 bytes, read {}", bytes.len())))
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("username", &self.username)
            .field("address", &self.address())
            .field("state", &self.state())
            .field("reading", &self.is_reading())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerCode;
    use crate::wire::MessageBuilder;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn forward(conn: &MessageConnection) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.events().subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        rx
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<MessageEvent>) -> Vec<u8> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event within deadline")
                .expect("channel open");
            if let MessageEvent::MessageRead(bytes) = event {
                return bytes;
            }
        }
    }

    #[tokio::test]
    async fn emits_one_message_per_envelope() {
        let (a, mut b) = tokio::io::duplex(1024);
        let conn = MessageConnection::from_stream(Some("peer".into()), local(), ConnectionOptions::default(), a);
        let mut rx = forward(&conn);
        assert!(conn.start_reading_continuously());

        let first = MessageBuilder::new(PeerCode::PlaceInQueueRequest)
            .write_string("a.mp3")
            .build();
        let second = MessageBuilder::new(PeerCode::UploadFailed).build();
        b.write_all(&[first.clone(), second.clone()].concat()).await.unwrap();

        let got = next_message(&mut rx).await;
        assert_eq!(got, first);
        let length = i32::from_le_bytes(got[..4].try_into().unwrap()) as usize;
        assert_eq!(got.len(), length + 4);
        assert_eq!(next_message(&mut rx).await, second);
    }

    #[tokio::test]
    async fn header_precedes_payload_progress() {
        let (a, mut b) = tokio::io::duplex(1024);
        let conn = MessageConnection::from_stream(Some("peer".into()), local(), ConnectionOptions::default(), a);
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        conn.events().subscribe(move |ev| e.lock().unwrap().push(ev.clone()));
        let mut rx = forward(&conn);
        conn.start_reading_continuously();

        let msg = MessageBuilder::new(PeerCode::SearchRequest)
            .write_integer(1)
            .write_string("x")
            .build();
        b.write_all(&msg).await.unwrap();
        next_message(&mut rx).await;

        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            MessageEvent::DataRead { current: 0, total: 9, code: 8 }
        ));
        assert!(matches!(
            events[1],
            MessageEvent::HeaderReceived { length: 13, code: 8 }
        ));
        assert!(matches!(
            events[events.len() - 2],
            MessageEvent::DataRead { current: 9, total: 9, .. }
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = MessageConnection::from_stream(Some("peer".into()), local(), ConnectionOptions::server(), a);
        assert!(conn.start_reading_continuously());
        assert!(!conn.start_reading_continuously());
        assert!(conn.is_reading());
    }

    #[tokio::test]
    async fn short_length_faults_server_connection() {
        let (a, mut b) = tokio::io::duplex(64);
        let conn = MessageConnection::from_stream(None, local(), ConnectionOptions::server(), a);
        let mut rx = forward(&conn);
        conn.start_reading_continuously();
        b.write_all(&3i32.to_le_bytes()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            MessageEvent::Faulted(SoulseekError::MessageRead(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn peer_failure_is_swallowed() {
        let (a, b) = tokio::io::duplex(64);
        let conn = MessageConnection::from_stream(Some("peer".into()), local(), ConnectionOptions::default(), a);
        let faults = Arc::new(Mutex::new(0));
        let f = faults.clone();
        conn.events().subscribe(move |e| {
            if matches!(e, MessageEvent::Faulted(_)) {
                *f.lock().unwrap() += 1;
            }
        });
        let token = conn.connection().disconnect_token();
        conn.start_reading_continuously();
        drop(b);
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert_eq!(*faults.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_stop_loop() {
        let (a, mut b) = tokio::io::duplex(1024);
        let conn = MessageConnection::from_stream(Some("peer".into()), local(), ConnectionOptions::default(), a);
        conn.events().subscribe(|e| {
            if matches!(e, MessageEvent::MessageRead(_)) {
                panic!("subscriber failure");
            }
        });
        let mut rx = forward(&conn);
        conn.start_reading_continuously();

        let msg = MessageBuilder::new(PeerCode::UploadFailed).write_string("f").build();
        b.write_all(&msg).await.unwrap();
        next_message(&mut rx).await;
        b.write_all(&msg).await.unwrap();
        next_message(&mut rx).await;
        assert!(conn.is_reading());
    }
}
