//! Registry of peer message connections keyed by username, with single-flight establishment.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::network::connection::{ConnectionEvent, ConnectionState};
use crate::network::handlers::EventHandlers;
use crate::network::message_connection::{MessageConnection, MessageEvent};
use crate::options::ConnectionOptions;
use crate::{Result, SoulseekError};

type Establishment = Shared<BoxFuture<'static, Result<Arc<MessageConnection>>>>;

struct Entry {
    generation: u64,
    establishment: Establishment,
}

/// A complete message read from a peer connection owned by the registry.
#[derive(Debug, Clone)]
pub struct PeerMessage {
    pub username: String,
    pub bytes: Vec<u8>,
    /// The connection the message arrived on, for replies.
    pub connection: Arc<MessageConnection>,
}

pub struct PeerConnectionManager {
    options: ConnectionOptions,
    entries: DashMap<String, Entry>,
    next_generation: AtomicU64,
    messages: EventHandlers<PeerMessage>,
    disconnected: EventHandlers<String>,
}

impl PeerConnectionManager {
    pub fn new(options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            entries: DashMap::new(),
            next_generation: AtomicU64::new(0),
            messages: EventHandlers::new(),
            disconnected: EventHandlers::new(),
        })
    }

    /// Every message read from any registered peer connection.
    pub fn messages(&self) -> &EventHandlers<PeerMessage> {
        &self.messages
    }

    /// Username of a ready connection that has since disconnected.
    pub fn peer_disconnected(&self) -> &EventHandlers<String> {
        &self.disconnected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Return the ready connection to `username`, join an establishment already in flight,
    /// or start a new one. The establishment runs as its own task, so it completes and
    /// registers even if every caller gives up waiting.
    pub async fn get_or_add_message_connection(
        self: &Arc<Self>,
        username: &str,
        address: SocketAddr,
    ) -> Result<Arc<MessageConnection>> {
        let establishment = match self.entries.entry(username.to_owned()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get().establishment.clone();
                match current.peek() {
                    Some(Ok(conn)) if conn.state() == ConnectionState::Connected => {
                        return Ok(conn.clone());
                    }
                    Some(Ok(_)) => {
                        debug!(%username, "replacing stale peer connection");
                        let entry = self.spawn_establishment(username, address);
                        let establishment = entry.establishment.clone();
                        occupied.insert(entry);
                        establishment
                    }
                    _ => current.clone(),
                }
            }
            MapEntry::Vacant(vacant) => {
                let entry = self.spawn_establishment(username, address);
                let establishment = entry.establishment.clone();
                vacant.insert(entry);
                establishment
            }
        };
        establishment.await
    }

    fn spawn_establishment(self: &Arc<Self>, username: &str, address: SocketAddr) -> Entry {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(Self::establish(
            Arc::downgrade(self),
            self.options.clone(),
            username.to_owned(),
            address,
            generation,
        ));
        let establishment = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(SoulseekError::connection(
                    format!("connection task failed: {e}"),
                    None,
                )),
            }
        }
        .boxed()
        .shared();
        Entry {
            generation,
            establishment,
        }
    }

    async fn establish(
        manager: Weak<Self>,
        options: ConnectionOptions,
        username: String,
        address: SocketAddr,
        generation: u64,
    ) -> Result<Arc<MessageConnection>> {
        debug!(%username, %address, "connecting to peer");
        let conn = MessageConnection::new(Some(username.clone()), address, options);

        let routed = manager.clone();
        let from = username.clone();
        let this = Arc::downgrade(&conn);
        conn.events().subscribe(move |event| {
            let MessageEvent::MessageRead(bytes) = event else { return };
            if let (Some(manager), Some(connection)) = (routed.upgrade(), this.upgrade()) {
                manager.messages.emit(&PeerMessage {
                    username: from.clone(),
                    bytes: bytes.clone(),
                    connection,
                });
            }
        });

        let evicting = manager.clone();
        let who = username.clone();
        conn.connection().events().subscribe(move |event| {
            if let (ConnectionEvent::Disconnected { reason }, Some(manager)) = (event, evicting.upgrade()) {
                debug!(username = %who, %reason, "peer connection dropped");
                manager.evict(&who, generation);
                manager.disconnected.emit(&who);
            }
        });

        match conn.connect().await {
            Ok(()) => {
                debug!(%username, %address, "peer connection ready");
                Ok(conn)
            }
            Err(e) => {
                if let Some(manager) = manager.upgrade() {
                    manager.evict(&username, generation);
                }
                Err(e)
            }
        }
    }

    fn evict(&self, username: &str, generation: u64) {
        self.entries
            .remove_if(username, |_, entry| entry.generation == generation);
    }

    /// Drop the entry for `username` and disconnect its connection if it was ready.
    pub fn remove_and_dispose(&self, username: &str) -> bool {
        match self.entries.remove(username) {
            Some((_, entry)) => {
                dispose(entry, "removed from registry");
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let usernames: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for username in usernames {
            if let Some((_, entry)) = self.entries.remove(&username) {
                dispose(entry, "registry cleared");
            }
        }
    }
}

fn dispose(entry: Entry, reason: &str) {
    if let Some(Ok(conn)) = entry.establishment.peek() {
        conn.disconnect(reason);
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("entries", &self.entries.len())
            .finish()
    }
}
