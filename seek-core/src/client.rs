//! The client: owns the server connection, the waiter, the peer registry, the transfer set
//! and the distributed branch, and dispatches every inbound message to them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::distributed::{BranchPosition, DistributedBranch, RelayAction};
use crate::events::{ClientEvent, ClientState};
use crate::network::connection::{Connection, ConnectionEvent};
use crate::network::message_connection::{MessageConnection, MessageEvent};
use crate::network::peer_manager::{PeerConnectionManager, PeerMessage};
use crate::options::ClientOptions;
use crate::protocol::distributed::{DistributedBranchLevel, DistributedBranchRoot, DistributedSearchRequest};
use crate::protocol::peer::{
    PeerSearchRequest, PlaceInQueueRequest, PlaceInQueueResponse, QueueFailed, TransferRequest,
    TransferResponse, UploadFailed,
};
use crate::protocol::server::{UserAddressRequest, UserAddressResponse};
use crate::protocol::{DistributedCode, PeerCode, ServerCode};
use crate::token::TokenFactory;
use crate::transfer::{
    Transfer, TransferDirection, TransferOptions, TransferState, TransferStateChange, TransferTracker,
};
use crate::waiter::{WaitKey, Waiter};
use crate::wire::peek_code;
use crate::{Result, SoulseekError};

const EVENT_CAPACITY: usize = 1024;

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SoulseekClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    state: Mutex<ClientState>,
    username: Mutex<Option<String>>,
    server: Mutex<Option<Arc<MessageConnection>>>,
    waiter: Arc<Waiter>,
    peers: Arc<PeerConnectionManager>,
    transfers: TransferTracker,
    tokens: TokenFactory,
    branch: Mutex<DistributedBranch>,
    distributed_parent: Mutex<Option<Arc<MessageConnection>>>,
    distributed_children: DashMap<String, Arc<MessageConnection>>,
    relay: mpsc::UnboundedSender<Vec<RelayAction>>,
    events: broadcast::Sender<ClientEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn require(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SoulseekError::InvalidArgument(format!(
            "the {name} must not be empty or whitespace"
        )));
    }
    Ok(())
}

impl SoulseekClient {
    /// Must be called from within a tokio runtime.
    pub fn new(options: ClientOptions) -> Self {
        let (relay, relay_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tokens = match options.starting_token {
            Some(start) => TokenFactory::new(start),
            None => TokenFactory::random(),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let peers = PeerConnectionManager::new(options.peer_connection.clone());
            let w = weak.clone();
            peers.messages().subscribe(move |message| {
                if let Some(inner) = w.upgrade() {
                    inner.handle_peer_message(message);
                }
            });
            let w = weak.clone();
            peers.peer_disconnected().subscribe(move |username| {
                if let Some(inner) = w.upgrade() {
                    inner.on_peer_disconnected(username);
                }
            });

            Inner {
                waiter: Waiter::new(options.message_timeout()),
                branch: Mutex::new(DistributedBranch::new(String::new(), options.max_relay_depth)),
                options,
                state: Mutex::new(ClientState::Disconnected),
                username: Mutex::new(None),
                server: Mutex::new(None),
                peers,
                transfers: TransferTracker::new(),
                tokens,
                distributed_parent: Mutex::new(None),
                distributed_children: DashMap::new(),
                relay,
                events,
            }
        });

        tokio::spawn(write_relay_actions(Arc::downgrade(&inner), relay_rx));
        Self { inner }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.inner.state)
    }

    pub fn username(&self) -> Option<String> {
        lock(&self.inner.username).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_waits(&self) -> usize {
        self.inner.waiter.pending_count()
    }

    pub fn peer_connection_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Open the server connection and start reading from it.
    pub async fn connect(&self, address: SocketAddr) -> Result<()> {
        if self.state() != ClientState::Disconnected {
            return Err(SoulseekError::InvalidOperation(format!(
                "the client is already {:?}",
                self.state()
            )));
        }

        let server = MessageConnection::new(None, address, self.inner.options.server_connection.clone());
        let w = Arc::downgrade(&self.inner);
        server.events().subscribe(move |event| {
            let Some(inner) = w.upgrade() else { return };
            match event {
                MessageEvent::MessageRead(bytes) => inner.handle_server_message(bytes),
                MessageEvent::Faulted(e) => inner.disconnect(format!("server connection faulted: {e}")),
                _ => {}
            }
        });
        let w = Arc::downgrade(&self.inner);
        server.connection().events().subscribe(move |event| {
            if let (ConnectionEvent::Disconnected { reason }, Some(inner)) = (event, w.upgrade()) {
                inner.disconnect(format!("server connection closed: {reason}"));
            }
        });

        // Reading starts only once the session is Connected, so a server that hangs up
        // straight away is seen by the disconnect handlers.
        server.connection().connect().await?;
        *lock(&self.inner.server) = Some(server.clone());
        self.inner.set_state(ClientState::Connected);
        info!(%address, "connected to server");
        server.start_reading_continuously();
        Ok(())
    }

    /// Record a successful login. Operations that talk to peers require it.
    pub fn set_logged_in(&self, username: &str) -> Result<()> {
        require(username, "username")?;
        if self.state() != ClientState::Connected {
            return Err(SoulseekError::InvalidOperation(format!(
                "cannot log in while {:?}",
                self.state()
            )));
        }
        *lock(&self.inner.username) = Some(username.to_owned());
        *lock(&self.inner.branch) = DistributedBranch::new(username, self.inner.options.max_relay_depth);
        self.inner.set_state(ClientState::LoggedIn);
        info!(%username, "logged in");
        Ok(())
    }

    pub fn disconnect(&self, reason: &str) {
        self.inner.disconnect(reason.to_owned());
    }

    /// Ask the server where `username` is listening.
    pub async fn get_peer_address(&self, username: &str, cancel: &CancellationToken) -> Result<SocketAddr> {
        require(username, "username")?;
        self.ensure_logged_in()?;
        self.inner.resolve(username, cancel).await
    }

    /// Ask the peer for the position of one of our downloads in its upload queue.
    pub async fn get_download_place_in_queue(
        &self,
        username: &str,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        require(username, "username")?;
        require(filename, "filename")?;
        self.ensure_logged_in()?;
        let transfer = self
            .inner
            .transfers
            .find(TransferDirection::Download, username, filename)
            .ok_or_else(|| {
                SoulseekError::TransferNotFound(format!(
                    "a download of {filename} from {username} is not active"
                ))
            })?;

        self.place_in_queue(&transfer, cancel).await.map_err(|e| {
            if e.passes_through() {
                e
            } else {
                SoulseekError::wrap(
                    format!("failed to get place in queue for {filename} from {username}"),
                    e,
                )
            }
        })
    }

    async fn place_in_queue(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<i32> {
        let conn = self.inner.peer_connection(&transfer.username, cancel).await?;
        let key = WaitKey::new(PeerCode::PlaceInQueueResponse)
            .with_part(&transfer.username)
            .with_part(&transfer.filename);
        let wait = self.inner.waiter.register::<i32>(key, None)?;
        conn.write_message(&PlaceInQueueRequest::new(transfer.filename.clone()).to_bytes())
            .await?;
        let place = wait.wait(cancel).await?;

        if let Err(e) = self.inner.transfers.set_place_in_queue(transfer.token, place) {
            debug!(token = transfer.token, error = %e, "transfer finished before its queue position arrived");
        }
        debug!(username = %transfer.username, filename = %transfer.filename, place, "place in queue");
        Ok(place)
    }

    /// Request a file from a peer. Returns once the peer has queued or started the transfer.
    pub async fn enqueue_download(
        &self,
        username: &str,
        filename: &str,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<Transfer> {
        require(username, "username")?;
        require(filename, "filename")?;
        self.ensure_logged_in()?;

        let transfers = &self.inner.transfers;
        let token = self
            .inner
            .tokens
            .next_available(|t| transfers.contains_token(t))
            .ok_or_else(|| SoulseekError::InvalidOperation("no free transfer token".into()))?;
        let transfer = transfers.add(
            Transfer::new(TransferDirection::Download, username, filename, token),
            options,
        )?;

        match self.request_download(&transfer, cancel).await {
            Ok(transfer) => Ok(transfer),
            Err(e) => {
                if let Ok(change) = transfers.fail(token, e.to_string()) {
                    self.inner.publish_change(change);
                }
                if e.passes_through() {
                    Err(e)
                } else {
                    Err(SoulseekError::wrap(
                        format!("failed to download {filename} from {username}"),
                        e,
                    ))
                }
            }
        }
    }

    async fn request_download(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<Transfer> {
        let conn = self.inner.peer_connection(&transfer.username, cancel).await?;
        let key = WaitKey::new(PeerCode::TransferResponse)
            .with_part(&transfer.username)
            .with_part(transfer.token);
        let wait = self.inner.waiter.register::<TransferResponse>(key, None)?;
        conn.write_message(&TransferRequest::download(transfer.token, transfer.filename.clone()).to_bytes())
            .await?;
        let response = wait.wait(cancel).await?;

        let next = if response.allowed {
            if let Some(size) = response.size {
                self.inner.transfers.set_size(transfer.token, size)?;
            }
            TransferState::InProgress
        } else if response.is_queued() {
            TransferState::Queued
        } else {
            let reason = response.reason.unwrap_or_default();
            warn!(username = %transfer.username, filename = %transfer.filename, %reason, "download rejected");
            return Err(SoulseekError::TransferRejected(reason));
        };
        self.inner.change_state(transfer.token, next)
    }

    /// Send a search to a single peer. Returns the search token.
    pub async fn send_peer_search_request(
        &self,
        username: &str,
        search_text: &str,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        require(username, "username")?;
        require(search_text, "search text")?;
        self.ensure_logged_in()?;
        let token = self.inner.tokens.next_token();
        let conn = self.inner.peer_connection(username, cancel).await?;
        conn.write_message(&PeerSearchRequest::new(search_text, token).to_bytes())
            .await?;
        Ok(token)
    }

    pub fn cancel_transfer(&self, token: i32) -> Result<Transfer> {
        self.inner.change_state(token, TransferState::Cancelled)
    }

    /// Report the absolute number of bytes moved for an in-progress transfer.
    pub fn record_progress(&self, token: i32, bytes_transferred: i64) -> Result<Transfer> {
        let (progress, completion) = self.inner.transfers.record_progress(token, bytes_transferred)?;
        let transfer = progress.transfer.clone();
        self.inner.publish(ClientEvent::TransferProgressUpdated(progress));
        Ok(match completion {
            Some(change) => {
                let transfer = change.transfer.clone();
                self.inner.publish_change(change);
                transfer
            }
            None => transfer,
        })
    }

    pub fn attach_data_connection(&self, token: i32, connection: Arc<Connection>) -> Result<()> {
        self.inner.transfers.attach_data_connection(token, connection)
    }

    pub fn transfer(&self, token: i32) -> Option<Transfer> {
        self.inner.transfers.get(token)
    }

    pub fn downloads(&self) -> Vec<Transfer> {
        self.inner.transfers.downloads()
    }

    pub fn uploads(&self) -> Vec<Transfer> {
        self.inner.transfers.uploads()
    }

    pub fn branch_position(&self) -> BranchPosition {
        lock(&self.inner.branch).position().clone()
    }

    /// Take searches directly from the server as the root of our own branch.
    pub fn become_branch_root(&self) -> Result<()> {
        self.ensure_logged_in()?;
        let actions = lock(&self.inner.branch).become_root();
        self.inner.relay_and_announce(actions);
        Ok(())
    }

    /// Connect to `username` as our distributed parent, replacing any current parent.
    pub async fn set_distributed_parent(&self, username: &str, address: SocketAddr) -> Result<()> {
        require(username, "username")?;
        self.ensure_logged_in()?;

        let conn = MessageConnection::new(
            Some(username.to_owned()),
            address,
            self.inner.options.distributed_connection.clone(),
        );
        self.inner.bind_distributed(&conn, username, DistributedRole::Parent);
        conn.connection().connect().await?;

        let previous = lock(&self.inner.distributed_parent).replace(conn.clone());
        if let Some(previous) = previous {
            previous.disconnect("replaced by a new parent");
        }
        let position = {
            let mut branch = lock(&self.inner.branch);
            branch.set_parent(username);
            branch.position().clone()
        };
        info!(parent = %username, %address, "distributed parent set");
        self.inner.publish(ClientEvent::BranchChanged(position));
        conn.start_reading_continuously();
        Ok(())
    }

    /// Adopt an accepted distributed connection from `username` as a child.
    pub fn attach_distributed_child<S>(&self, username: &str, address: SocketAddr, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        require(username, "username")?;
        self.ensure_logged_in()?;

        let conn = MessageConnection::from_stream(
            Some(username.to_owned()),
            address,
            self.inner.options.distributed_connection.clone(),
            stream,
        );
        self.inner.bind_distributed(&conn, username, DistributedRole::Child);
        conn.start_reading_continuously();
        if let Some(previous) = self.inner.distributed_children.insert(username.to_owned(), conn) {
            previous.disconnect("replaced by a new connection");
        }

        let actions = lock(&self.inner.branch).add_child(username);
        debug!(child = %username, "distributed child added");
        self.inner.send_relay(actions);
        Ok(())
    }

    pub fn distributed_children(&self) -> Vec<String> {
        lock(&self.inner.branch).children().map(str::to_owned).collect()
    }

    fn ensure_logged_in(&self) -> Result<()> {
        match self.state() {
            ClientState::LoggedIn => Ok(()),
            state => Err(SoulseekError::InvalidOperation(format!(
                "the client must be connected and logged in (currently {state:?})"
            ))),
        }
    }
}

impl std::fmt::Debug for SoulseekClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoulseekClient")
            .field("state", &self.state())
            .field("username", &self.username())
            .field("pending_waits", &self.pending_waits())
            .field("peers", &self.peer_connection_count())
            .field("transfers", &self.inner.transfers.len())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum DistributedRole {
    Parent,
    Child,
}

impl Inner {
    fn set_state(&self, next: ClientState) {
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        if previous != next {
            self.publish(ClientEvent::StateChanged {
                previous,
                current: next,
            });
        }
    }

    fn publish(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn publish_change(&self, change: TransferStateChange) {
        self.publish(ClientEvent::TransferStateChanged(change));
    }

    fn change_state(&self, token: i32, next: TransferState) -> Result<Transfer> {
        let change = self.transfers.transition(token, next)?;
        let transfer = change.transfer.clone();
        self.publish_change(change);
        Ok(transfer)
    }

    fn disconnect(&self, reason: String) {
        {
            let mut state = lock(&self.state);
            if *state == ClientState::Disconnected {
                return;
            }
            let previous = std::mem::replace(&mut *state, ClientState::Disconnected);
            drop(state);
            self.publish(ClientEvent::StateChanged {
                previous,
                current: ClientState::Disconnected,
            });
        }
        info!(%reason, "disconnected");

        let server = lock(&self.server).take();
        if let Some(server) = server {
            server.disconnect(reason.clone());
        }
        self.waiter.cancel_all();
        self.peers.remove_all();
        self.drop_distributed(&reason);
        *lock(&self.username) = None;
        *lock(&self.branch) = DistributedBranch::new(String::new(), self.options.max_relay_depth);
        self.publish(ClientEvent::Disconnected { reason });
    }

    fn drop_distributed(&self, reason: &str) {
        // Taken first: the disconnect handler locks the slot again.
        let parent = lock(&self.distributed_parent).take();
        if let Some(parent) = parent {
            parent.disconnect(reason.to_owned());
        }
        let children: Vec<String> = self.distributed_children.iter().map(|e| e.key().clone()).collect();
        for child in children {
            if let Some((_, conn)) = self.distributed_children.remove(&child) {
                conn.disconnect(reason.to_owned());
            }
        }
    }

    fn server(&self) -> Result<Arc<MessageConnection>> {
        lock(&self.server)
            .clone()
            .ok_or_else(|| SoulseekError::InvalidOperation("the server connection is not open".into()))
    }

    async fn resolve(&self, username: &str, cancel: &CancellationToken) -> Result<SocketAddr> {
        let server = self.server()?;
        let key = WaitKey::new(ServerCode::GetPeerAddress).with_part(username);
        let wait = self.waiter.register::<UserAddressResponse>(key, None)?;
        server
            .write_message(&UserAddressRequest::new(username).to_bytes())
            .await?;
        let response = wait.wait(cancel).await?;
        Ok(SocketAddr::from((response.ip, response.port)))
    }

    async fn peer_connection(&self, username: &str, cancel: &CancellationToken) -> Result<Arc<MessageConnection>> {
        let address = self.resolve(username, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(SoulseekError::Cancelled(format!(
                "connecting to {username} cancelled"
            ))),
            r = self.peers.get_or_add_message_connection(username, address) => r,
        }
    }

    fn handle_server_message(&self, bytes: &[u8]) {
        let code = match peek_code(bytes) {
            Ok(code) => code,
            Err(e) => {
                debug!(error = %e, "undecodable server message");
                return;
            }
        };
        match ServerCode::from_i32(code) {
            Some(ServerCode::GetPeerAddress) => match UserAddressResponse::from_bytes(bytes) {
                Ok(response) => {
                    let key = WaitKey::new(ServerCode::GetPeerAddress).with_part(&response.username);
                    if response.is_offline() {
                        let message = format!("user {} appears to be offline", response.username);
                        self.waiter.throw(&key, SoulseekError::UserOffline(message));
                    } else {
                        self.waiter.complete(&key, response);
                    }
                }
                Err(e) => debug!(error = %e, "bad peer address response"),
            },
            _ => debug!(code, "unhandled server message"),
        }
    }

    fn handle_peer_message(&self, message: &PeerMessage) {
        let PeerMessage { username, bytes, connection } = message;
        let code = match peek_code(bytes) {
            Ok(code) => code,
            Err(e) => {
                debug!(%username, error = %e, "undecodable peer message");
                return;
            }
        };
        let outcome = match PeerCode::from_i32(code) {
            Some(PeerCode::PlaceInQueueResponse) => PlaceInQueueResponse::from_bytes(bytes).map(|r| {
                let key = WaitKey::new(PeerCode::PlaceInQueueResponse)
                    .with_part(username)
                    .with_part(&r.filename);
                self.waiter.complete(&key, r.place_in_queue);
            }),
            Some(PeerCode::TransferResponse) => TransferResponse::from_bytes(bytes).map(|r| {
                let key = WaitKey::new(PeerCode::TransferResponse)
                    .with_part(username)
                    .with_part(r.token);
                self.waiter.complete(&key, r);
            }),
            Some(PeerCode::TransferRequest) => TransferRequest::from_bytes(bytes)
                .map(|r| self.on_transfer_request(username, connection, r)),
            Some(PeerCode::PlaceInQueueRequest) => PlaceInQueueRequest::from_bytes(bytes)
                .map(|r| self.on_place_in_queue_request(username, connection, r)),
            Some(PeerCode::QueueFailed) => QueueFailed::from_bytes(bytes)
                .map(|r| self.fail_download(username, &r.filename, format!("queue failed: {}", r.reason))),
            Some(PeerCode::UploadFailed) => UploadFailed::from_bytes(bytes)
                .map(|r| self.fail_download(username, &r.filename, "upload failed".to_owned())),
            Some(PeerCode::SearchRequest) => PeerSearchRequest::from_bytes(bytes).map(|r| {
                debug!(%username, token = r.token, text = %r.search_text, "peer search request");
            }),
            None => {
                debug!(%username, code, "unhandled peer message");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            debug!(%username, code, error = %e, "failed to handle peer message");
        }
    }

    fn on_transfer_request(&self, username: &str, connection: &Arc<MessageConnection>, request: TransferRequest) {
        match request.direction {
            // The peer is ready to send us a file we asked for.
            TransferDirection::Upload => {
                let Some(download) = self.transfers.find(TransferDirection::Download, username, &request.filename) else {
                    debug!(%username, filename = %request.filename, "upload offered for unknown download");
                    reply(connection, TransferResponse::rejected(request.token, "Cancelled").to_bytes());
                    return;
                };
                let token = download.token;
                if let Err(e) = self.transfers.set_remote_token(token, request.token) {
                    debug!(token, error = %e, "could not record remote token");
                    return;
                }
                if let Some(size) = request.size {
                    if let Err(e) = self.transfers.set_size(token, size) {
                        debug!(token, error = %e, "could not record transfer size");
                        return;
                    }
                }
                if download.state != TransferState::InProgress {
                    if let Err(e) = self.change_state(token, TransferState::InProgress) {
                        debug!(token, error = %e, "could not start download");
                        return;
                    }
                }
                reply(
                    connection,
                    TransferResponse::allowed(request.token, request.size.unwrap_or(0)).to_bytes(),
                );
            }
            // The peer wants a file from us; queue it.
            TransferDirection::Download => {
                if self
                    .transfers
                    .find(TransferDirection::Upload, username, &request.filename)
                    .is_none()
                {
                    let transfers = &self.transfers;
                    let Some(token) = self.tokens.next_available(|t| transfers.contains_token(t)) else {
                        warn!(%username, "no free transfer token for upload");
                        return;
                    };
                    let mut upload = Transfer::new(TransferDirection::Upload, username, &request.filename, token);
                    upload.remote_token = Some(request.token);
                    if let Err(e) = transfers.add(upload, TransferOptions::default()) {
                        debug!(%username, error = %e, "could not register upload");
                        return;
                    }
                    if let Err(e) = self.change_state(token, TransferState::Queued) {
                        debug!(token, error = %e, "could not queue upload");
                    }
                    info!(%username, filename = %request.filename, token, "upload queued");
                }
                reply(connection, TransferResponse::queued(request.token).to_bytes());
            }
        }
    }

    fn on_place_in_queue_request(
        &self,
        username: &str,
        connection: &Arc<MessageConnection>,
        request: PlaceInQueueRequest,
    ) {
        let place = self
            .transfers
            .find(TransferDirection::Upload, username, &request.filename)
            .and_then(|upload| self.transfers.upload_queue_position(upload.token));
        match place {
            Some(place) => reply(connection, PlaceInQueueResponse::new(request.filename, place).to_bytes()),
            None => debug!(%username, filename = %request.filename, "place requested for unqueued upload"),
        }
    }

    fn fail_download(&self, username: &str, filename: &str, reason: String) {
        let Some(download) = self.transfers.find(TransferDirection::Download, username, filename) else {
            debug!(%username, %filename, "failure reported for unknown download");
            return;
        };
        warn!(%username, %filename, %reason, "download failed");
        match self.transfers.fail(download.token, reason) {
            Ok(change) => self.publish_change(change),
            Err(e) => debug!(token = download.token, error = %e, "could not fail download"),
        }
    }

    /// Every live transfer with a peer errors when its connection drops.
    fn on_peer_disconnected(&self, username: &str) {
        for token in self.transfers.tokens_for(username) {
            match self.transfers.fail(token, "peer disconnected") {
                Ok(change) => {
                    debug!(%username, token, previous = ?change.previous, "transfer errored by disconnect");
                    self.publish_change(change);
                }
                // finished concurrently
                Err(e) => debug!(token, error = %e, "transfer already gone"),
            }
        }
    }

    fn bind_distributed(self: &Arc<Self>, conn: &Arc<MessageConnection>, username: &str, role: DistributedRole) {
        let w = Arc::downgrade(self);
        let from = username.to_owned();
        conn.events().subscribe(move |event| {
            if let (MessageEvent::MessageRead(bytes), Some(inner)) = (event, w.upgrade()) {
                inner.handle_distributed_message(&from, bytes);
            }
        });

        let w = Arc::downgrade(self);
        let who = username.to_owned();
        let this = Arc::downgrade(conn);
        conn.connection().events().subscribe(move |event| {
            if let (ConnectionEvent::Disconnected { .. }, Some(inner)) = (event, w.upgrade()) {
                match role {
                    DistributedRole::Parent => inner.on_parent_disconnected(&who, &this),
                    DistributedRole::Child => inner.on_child_disconnected(&who, &this),
                }
            }
        });
    }

    fn on_parent_disconnected(&self, username: &str, conn: &Weak<MessageConnection>) {
        {
            let mut parent = lock(&self.distributed_parent);
            if !parent.as_ref().is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), conn.as_ptr())) {
                return;
            }
            parent.take();
        }
        let position = {
            let mut branch = lock(&self.branch);
            branch.parent_disconnected(username);
            branch.position().clone()
        };
        info!(parent = %username, "distributed parent lost");
        self.publish(ClientEvent::BranchChanged(position));
    }

    fn on_child_disconnected(&self, username: &str, conn: &Weak<MessageConnection>) {
        let removed = self
            .distributed_children
            .remove_if(username, |_, c| std::ptr::eq(Arc::as_ptr(c), conn.as_ptr()))
            .is_some();
        if removed {
            lock(&self.branch).remove_child(username);
            debug!(child = %username, "distributed child removed");
        }
    }

    fn handle_distributed_message(&self, from: &str, bytes: &[u8]) {
        let code = match peek_code(bytes) {
            Ok(code) => code,
            Err(e) => {
                debug!(%from, error = %e, "undecodable distributed message");
                return;
            }
        };
        let outcome = match DistributedCode::from_i32(code) {
            Some(DistributedCode::BranchLevel) => DistributedBranchLevel::from_bytes(bytes).map(|m| {
                let actions = lock(&self.branch).on_parent_branch_level(from, m.level);
                self.relay_and_announce(actions);
            }),
            Some(DistributedCode::BranchRoot) => DistributedBranchRoot::from_bytes(bytes).map(|m| {
                let actions = lock(&self.branch).on_parent_branch_root(from, &m.root);
                self.relay_and_announce(actions);
            }),
            Some(DistributedCode::SearchRequest) => DistributedSearchRequest::from_bytes(bytes).map(|request| {
                let actions = lock(&self.branch).on_search_request(from, &request);
                match actions {
                    Some(actions) => {
                        self.send_relay(actions);
                        self.publish(ClientEvent::DistributedSearchReceived(request));
                    }
                    None => debug!(%from, "search from non-parent ignored"),
                }
            }),
            None => {
                debug!(%from, code, "unhandled distributed message");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            debug!(%from, code, error = %e, "failed to handle distributed message");
        }
    }

    /// Queue branch announcements and publish the new position if anything changed.
    fn relay_and_announce(&self, actions: Vec<RelayAction>) {
        if actions.is_empty() {
            return;
        }
        self.send_relay(actions);
        let position = lock(&self.branch).position().clone();
        self.publish(ClientEvent::BranchChanged(position));
    }

    fn send_relay(&self, actions: Vec<RelayAction>) {
        if !actions.is_empty() && self.relay.send(actions).is_err() {
            debug!("relay writer stopped");
        }
    }

    async fn perform(&self, action: RelayAction) {
        match action {
            RelayAction::Server(bytes) => match self.server() {
                Ok(server) => {
                    if let Err(e) = server.write_message(&bytes).await {
                        debug!(error = %e, "failed to write branch update to server");
                    }
                }
                Err(e) => debug!(error = %e, "no server connection for branch update"),
            },
            RelayAction::Children(bytes) => {
                let children: Vec<Arc<MessageConnection>> =
                    self.distributed_children.iter().map(|e| e.value().clone()).collect();
                for child in children {
                    if let Err(e) = child.write_message(&bytes).await {
                        debug!(child = ?child.username(), error = %e, "failed to relay to child");
                    }
                }
            }
            RelayAction::Child { username, bytes } => {
                let child = self.distributed_children.get(&username).map(|c| c.value().clone());
                if let Some(child) = child {
                    if let Err(e) = child.write_message(&bytes).await {
                        debug!(child = %username, error = %e, "failed to write to child");
                    }
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let server = lock(&self.server).take();
        if let Some(server) = server {
            server.disconnect("client dropped");
        }
        self.peers.remove_all();
        self.drop_distributed("client dropped");
    }
}

/// Writes relay actions in the order they were produced.
async fn write_relay_actions(inner: Weak<Inner>, mut actions: mpsc::UnboundedReceiver<Vec<RelayAction>>) {
    while let Some(batch) = actions.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        for action in batch {
            inner.perform(action).await;
        }
    }
}

fn reply(connection: &Arc<MessageConnection>, bytes: Vec<u8>) {
    let connection = connection.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.write_message(&bytes).await {
            debug!(peer = ?connection.username(), error = %e, "failed to reply to peer");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server::BranchLevel;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_envelope<R: AsyncRead + Unpin>(r: &mut R) -> Option<Vec<u8>> {
        let mut len = [0u8; 4];
        r.read_exact(&mut len).await.ok()?;
        let mut rest = vec![0u8; i32::from_le_bytes(len) as usize];
        r.read_exact(&mut rest).await.ok()?;
        Some([len.to_vec(), rest].concat())
    }

    struct Fake {
        addr: SocketAddr,
        received: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// A TCP endpoint that answers each envelope it reads with `respond`, and reports
    /// everything it read.
    async fn fake_endpoint<F>(respond: F) -> Fake
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.into_split();
                    while let Some(msg) = read_envelope(&mut r).await {
                        for reply in (*respond)(&msg) {
                            if w.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(msg);
                    }
                });
            }
        });
        Fake { addr, received }
    }

    /// A server that resolves every user to `peer`, or reports them offline when `None`.
    async fn fake_server(peer: Option<SocketAddr>) -> Fake {
        fake_endpoint(move |msg| match UserAddressRequest::from_bytes(msg) {
            Ok(req) => {
                let (ip, port) = match peer {
                    Some(addr) => (Ipv4Addr::LOCALHOST, addr.port()),
                    None => (Ipv4Addr::UNSPECIFIED, 0),
                };
                vec![UserAddressResponse::new(req.username, ip, port).to_bytes()]
            }
            Err(_) => Vec::new(),
        })
        .await
    }

    /// A peer that queues downloads and reports `place` when asked, if any.
    async fn fake_peer(place: Option<i32>) -> Fake {
        fake_endpoint(move |msg| {
            if let Ok(req) = TransferRequest::from_bytes(msg) {
                return vec![TransferResponse::queued(req.token).to_bytes()];
            }
            match (PlaceInQueueRequest::from_bytes(msg), place) {
                (Ok(req), Some(place)) => vec![PlaceInQueueResponse::new(req.filename, place).to_bytes()],
                _ => Vec::new(),
            }
        })
        .await
    }

    fn options(timeout_ms: u64) -> ClientOptions {
        ClientOptions {
            message_timeout_ms: timeout_ms,
            starting_token: Some(100),
            ..ClientOptions::default()
        }
    }

    async fn logged_in(server: SocketAddr, options: ClientOptions) -> SoulseekClient {
        let client = SoulseekClient::new(options);
        client.connect(server).await.unwrap();
        client.set_logged_in("me").unwrap();
        client
    }

    async fn expect<T>(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, parse: impl Fn(&[u8]) -> Result<T>) -> T {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("message within deadline")
                .expect("endpoint alive");
            if let Ok(value) = parse(&msg) {
                return value;
            }
        }
    }

    fn queued_download(client: &SoulseekClient, username: &str, filename: &str) {
        let t = client
            .inner
            .transfers
            .add(
                Transfer::new(TransferDirection::Download, username, filename, 1),
                TransferOptions::default(),
            )
            .unwrap();
        client.inner.transfers.transition(t.token, TransferState::Queued).unwrap();
    }

    #[tokio::test]
    async fn place_in_queue_returns_peer_position() {
        let peer = fake_peer(Some(5)).await;
        let server = fake_server(Some(peer.addr)).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let cancel = CancellationToken::new();

        let download = client
            .enqueue_download("alice", "song.mp3", TransferOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(download.state, TransferState::Queued);

        let place = client
            .get_download_place_in_queue("alice", "song.mp3", &cancel)
            .await
            .unwrap();
        assert_eq!(place, 5);
        assert_eq!(client.downloads()[0].place_in_queue, Some(5));
        assert_eq!(client.peer_connection_count(), 1);
        assert_eq!(client.pending_waits(), 0);
    }

    #[tokio::test]
    async fn offline_user_never_reaches_peer() {
        let server = fake_server(None).await;
        let client = logged_in(server.addr, options(2_000)).await;
        queued_download(&client, "alice", "song.mp3");

        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::UserOffline(_)), "{err:?}");
        assert_eq!(client.peer_connection_count(), 0);
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_wait_is_removed() {
        let peer = fake_peer(None).await;
        let server = fake_server(Some(peer.addr)).await;
        let client = logged_in(server.addr, options(200)).await;
        queued_download(&client, "alice", "song.mp3");

        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::Timeout(_)), "{err:?}");
        assert_eq!(client.pending_waits(), 0);
        assert_eq!(client.downloads()[0].place_in_queue, None);
    }

    #[tokio::test]
    async fn argument_errors_come_first() {
        let client = SoulseekClient::new(ClientOptions::default());
        let cancel = CancellationToken::new();
        for (user, file) in [("", "file"), ("user", ""), ("  ", "file"), ("user", "\t")] {
            let err = client
                .get_download_place_in_queue(user, file, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, SoulseekError::InvalidArgument(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn requires_login() {
        let server = fake_server(None).await;
        let client = SoulseekClient::new(ClientOptions::default());
        let cancel = CancellationToken::new();
        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::InvalidOperation(_)));

        client.connect(server.addr).await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn unknown_download_is_not_found() {
        let mut server = fake_server(None).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::TransferNotFound(_)));
        assert!(server.received.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_download_is_errored() {
        let peer = fake_endpoint(|msg| match TransferRequest::from_bytes(msg) {
            Ok(req) => vec![TransferResponse::rejected(req.token, "File not shared.").to_bytes()],
            Err(_) => Vec::new(),
        })
        .await;
        let server = fake_server(Some(peer.addr)).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let mut events = client.subscribe();

        let err = client
            .enqueue_download("alice", "missing.mp3", TransferOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::Wrapped { .. }), "{err:?}");
        assert!(client.downloads().is_empty());

        let mut saw_errored = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::TransferStateChanged(change) = event {
                saw_errored |= change.transfer.state == TransferState::Errored;
            }
        }
        assert!(saw_errored);
    }

    #[tokio::test]
    async fn inbound_download_request_is_queued_as_upload() {
        let mut peer = fake_endpoint(|msg| match PeerSearchRequest::from_bytes(msg) {
            Ok(_) => vec![
                TransferRequest::download(77, "shared/track.flac").to_bytes(),
                PlaceInQueueRequest::new("shared/track.flac").to_bytes(),
            ],
            Err(_) => Vec::new(),
        })
        .await;
        let server = fake_server(Some(peer.addr)).await;
        let client = logged_in(server.addr, options(2_000)).await;

        client
            .send_peer_search_request("bob", "track", &CancellationToken::new())
            .await
            .unwrap();

        // replies are written independently and may arrive in either order
        let (mut response, mut place) = (None, None);
        while response.is_none() || place.is_none() {
            let msg = tokio::time::timeout(Duration::from_secs(2), peer.received.recv())
                .await
                .unwrap()
                .unwrap();
            response = response.or(TransferResponse::from_bytes(&msg).ok());
            place = place.or(PlaceInQueueResponse::from_bytes(&msg).ok());
        }
        let (response, place) = (response.unwrap(), place.unwrap());
        assert_eq!(response.token, 77);
        assert!(response.is_queued());
        assert_eq!(place.filename, "shared/track.flac");
        assert_eq!(place.place_in_queue, 1);

        let uploads = client.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].state, TransferState::Queued);
        assert_eq!(uploads[0].remote_token, Some(77));
    }

    #[tokio::test]
    async fn cancel_and_progress() {
        let server = fake_server(None).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let transfers = &client.inner.transfers;
        transfers
            .add(
                Transfer::new(TransferDirection::Download, "alice", "a.mp3", 1).with_size(10),
                TransferOptions::default(),
            )
            .unwrap();
        transfers.transition(1, TransferState::InProgress).unwrap();
        transfers
            .add(
                Transfer::new(TransferDirection::Download, "alice", "b.mp3", 2),
                TransferOptions::default(),
            )
            .unwrap();

        assert_eq!(client.record_progress(1, 4).unwrap().bytes_transferred, 4);
        assert_eq!(client.record_progress(1, 10).unwrap().state, TransferState::Completed);
        assert_eq!(client.cancel_transfer(2).unwrap().state, TransferState::Cancelled);
        assert!(matches!(
            client.cancel_transfer(2),
            Err(SoulseekError::TransferNotFound(_))
        ));
        assert!(client.downloads().is_empty());
    }

    #[tokio::test]
    async fn server_loss_disconnects_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = SoulseekClient::new(ClientOptions::default());
        let mut events = client.subscribe();
        client.connect(addr).await.unwrap();
        let socket = accept.await.unwrap();
        drop(socket);

        let reason = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::Disconnected { reason } = event {
                break reason;
            }
        };
        assert!(reason.contains("server connection"));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn branch_level_is_derived_and_relayed() {
        let mut server = fake_server(None).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let mut events = client.subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        client.set_distributed_parent("parent", parent_addr).await.unwrap();
        let mut parent = accept.await.unwrap();

        let (ours, mut child) = tokio::io::duplex(4096);
        client
            .attach_distributed_child("kid", "127.0.0.1:1".parse().unwrap(), ours)
            .unwrap();
        assert_eq!(client.distributed_children(), vec!["kid".to_string()]);

        parent
            .write_all(&DistributedBranchLevel::new(2).to_bytes())
            .await
            .unwrap();
        let announced = expect(&mut server.received, BranchLevel::from_bytes).await;
        assert_eq!(announced.level, 3);
        let to_child = read_envelope(&mut child).await.unwrap();
        assert_eq!(DistributedBranchLevel::from_bytes(&to_child).unwrap().level, 3);
        assert_eq!(client.branch_position().level, Some(3));

        let search = DistributedSearchRequest::new("searcher", 9, "needle");
        parent.write_all(&search.to_bytes()).await.unwrap();
        assert_eq!(read_envelope(&mut child).await.unwrap(), search.to_bytes());

        let received = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::DistributedSearchReceived(request) = event {
                break request;
            }
        };
        assert_eq!(received, search);

        drop(parent);
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.branch_position().parent.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.branch_position().level, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn server_hanging_up_at_once_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        for _ in 0..50 {
            let client = SoulseekClient::new(ClientOptions::default());
            client.connect(addr).await.unwrap();
            tokio::time::timeout(Duration::from_secs(2), async {
                while client.state() != ClientState::Disconnected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("session ends when the server hangs up");
        }
    }

    #[tokio::test]
    async fn peer_disconnect_errors_every_live_transfer_with_that_peer() {
        let peer = fake_peer(None).await;
        let server = fake_server(None).await;
        let client = logged_in(server.addr, options(2_000)).await;
        let transfers = &client.inner.transfers;
        for (token, user, file) in [(1, "alice", "f1"), (2, "alice", "f2"), (3, "bob", "f3")] {
            transfers
                .add(
                    Transfer::new(TransferDirection::Download, user, file, token),
                    TransferOptions::default(),
                )
                .unwrap();
        }
        transfers.transition(2, TransferState::Queued).unwrap();
        let mut events = client.subscribe();

        client
            .inner
            .peers
            .get_or_add_message_connection("alice", peer.addr)
            .await
            .unwrap();
        assert!(client.inner.peers.remove_and_dispose("alice"));

        let mut errored = Vec::new();
        while errored.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::TransferStateChanged(change) = event {
                if change.transfer.state == TransferState::Errored {
                    errored.push((change.transfer.filename, change.previous));
                }
            }
        }
        errored.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            errored,
            vec![
                ("f1".to_string(), TransferState::Requested),
                ("f2".to_string(), TransferState::Queued),
            ]
        );
        let left: Vec<String> = client.downloads().into_iter().map(|t| t.filename).collect();
        assert_eq!(left, vec!["f3".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_peer_is_wrapped_with_its_cause() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = closed.local_addr().unwrap();
        drop(closed);
        let server = fake_server(Some(peer_addr)).await;
        let client = logged_in(server.addr, options(2_000)).await;
        queued_download(&client, "alice", "song.mp3");

        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &CancellationToken::new())
            .await
            .unwrap_err();
        let SoulseekError::Wrapped { message, source } = &err else {
            panic!("expected a wrapped error, got {err:?}");
        };
        assert!(message.contains("song.mp3") && message.contains("alice"), "{message}");
        assert!(matches!(**source, SoulseekError::Connection { .. }), "{source:?}");
        let cause = std::error::Error::source(&err).map(|c| c.to_string());
        assert!(cause.is_some_and(|c| c.starts_with("connection error")));
        assert_eq!(client.peer_connection_count(), 0);
        assert_eq!(client.pending_waits(), 0);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_is_not_wrapped() {
        let mut peer = fake_peer(None).await;
        let server = fake_server(Some(peer.addr)).await;
        let client = logged_in(server.addr, options(5_000)).await;
        queued_download(&client, "alice", "song.mp3");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let asked = tokio::spawn(async move {
            let request = expect(&mut peer.received, PlaceInQueueRequest::from_bytes).await;
            trigger.cancel();
            request
        });

        let err = client
            .get_download_place_in_queue("alice", "song.mp3", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SoulseekError::Cancelled(_)), "{err:?}");
        assert_eq!(asked.await.unwrap().filename, "song.mp3");
        assert_eq!(client.pending_waits(), 0);
        assert_eq!(client.downloads()[0].state, TransferState::Queued);
    }
}
