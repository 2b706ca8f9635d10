//! Transfer records and the state machine that owns them.
//!
//! Records are only mutated through [`TransferTracker`]; callers get [`Transfer`] snapshots.
//! A record leaves the active set as soon as it reaches a terminal state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::network::connection::Connection;
use crate::network::handlers::invoke_isolated;
use crate::{Result, SoulseekError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

impl TransferDirection {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Download),
            1 => Some(Self::Upload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Requested,
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Errored,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Errored
        )
    }

    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Requested, Queued | InProgress) => true,
            (Queued, InProgress) => true,
            (InProgress, Completed) => true,
            (from, Cancelled | Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Snapshot of a transfer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
    pub token: i32,
    /// The peer's token for the same file, once it has announced one.
    pub remote_token: Option<i32>,
    pub size: Option<i64>,
    pub bytes_transferred: i64,
    /// Only meaningful while `state` is `Queued`.
    pub place_in_queue: Option<i32>,
    pub state: TransferState,
    pub error: Option<String>,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        username: impl Into<String>,
        filename: impl Into<String>,
        token: i32,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            filename: filename.into(),
            token,
            remote_token: None,
            size: None,
            bytes_transferred: 0,
            place_in_queue: None,
            state: TransferState::Requested,
            error: None,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn percent_complete(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => self.bytes_transferred as f64 / size as f64 * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferStateChange {
    pub previous: TransferState,
    pub transfer: Transfer,
}

#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub previous_bytes: i64,
    pub transfer: Transfer,
}

type StateCallback = Arc<dyn Fn(&TransferStateChange) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Per-transfer callbacks. Panics inside them are contained.
#[derive(Clone, Default)]
pub struct TransferOptions {
    state_changed: Option<StateCallback>,
    progress_updated: Option<ProgressCallback>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_changed(mut self, f: impl Fn(&TransferStateChange) + Send + Sync + 'static) -> Self {
        self.state_changed = Some(Arc::new(f));
        self
    }

    pub fn on_progress_updated(mut self, f: impl Fn(&TransferProgress) + Send + Sync + 'static) -> Self {
        self.progress_updated = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("state_changed", &self.state_changed.is_some())
            .field("progress_updated", &self.progress_updated.is_some())
            .finish()
    }
}

struct Record {
    sequence: u64,
    transfer: Transfer,
    options: TransferOptions,
    data_connection: Option<Arc<Connection>>,
}

type FileKey = (TransferDirection, String, String);

/// The active transfer set, keyed by token.
#[derive(Default)]
pub struct TransferTracker {
    active: DashMap<i32, Record>,
    /// direction, username and filename of every active record, to its token.
    files: DashMap<FileKey, i32>,
    sequence: AtomicU64,
}

fn file_key(direction: TransferDirection, username: &str, filename: &str) -> FileKey {
    (direction, username.to_owned(), filename.to_owned())
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transfer: Transfer, options: TransferOptions) -> Result<Transfer> {
        if transfer.state.is_terminal() {
            return Err(SoulseekError::InvalidOperation(format!(
                "transfer {} is already {:?}",
                transfer.token, transfer.state
            )));
        }
        let token = transfer.token;
        // The file slot is held while the token is claimed, so concurrent adds of one file
        // cannot both succeed. Lock order is always files, then active.
        let file = match self
            .files
            .entry(file_key(transfer.direction, &transfer.username, &transfer.filename))
        {
            Entry::Occupied(_) => {
                return Err(SoulseekError::InvalidOperation(format!(
                    "an active {:?} of {} from {} already exists",
                    transfer.direction, transfer.filename, transfer.username
                )))
            }
            Entry::Vacant(file) => file,
        };
        match self.active.entry(token) {
            Entry::Occupied(_) => Err(SoulseekError::InvalidOperation(format!(
                "token {token} is already in use"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Record {
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                    transfer: transfer.clone(),
                    options,
                    data_connection: None,
                });
                file.insert(token);
                debug!(token, username = %transfer.username, filename = %transfer.filename, direction = ?transfer.direction, "transfer added");
                Ok(transfer)
            }
        }
    }

    pub fn get(&self, token: i32) -> Option<Transfer> {
        self.active.get(&token).map(|r| r.transfer.clone())
    }

    pub fn contains_token(&self, token: i32) -> bool {
        self.active.contains_key(&token)
    }

    pub fn find(&self, direction: TransferDirection, username: &str, filename: &str) -> Option<Transfer> {
        let token = *self.files.get(&file_key(direction, username, filename))?;
        self.get(token)
    }

    pub fn downloads(&self) -> Vec<Transfer> {
        self.list(TransferDirection::Download)
    }

    pub fn uploads(&self) -> Vec<Transfer> {
        self.list(TransferDirection::Upload)
    }

    /// Active tokens of transfers with `username`.
    pub fn tokens_for(&self, username: &str) -> Vec<i32> {
        self.active
            .iter()
            .filter(|r| r.transfer.username == username)
            .map(|r| *r.key())
            .collect()
    }

    fn list(&self, direction: TransferDirection) -> Vec<Transfer> {
        let mut records: Vec<(u64, Transfer)> = self
            .active
            .iter()
            .filter(|r| r.transfer.direction == direction)
            .map(|r| (r.sequence, r.transfer.clone()))
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, t)| t).collect()
    }

    /// 1-based position of a queued upload among all queued uploads, oldest first.
    pub fn upload_queue_position(&self, token: i32) -> Option<i32> {
        let position = self
            .list(TransferDirection::Upload)
            .into_iter()
            .filter(|t| t.state == TransferState::Queued)
            .position(|t| t.token == token)?;
        i32::try_from(position + 1).ok()
    }

    pub fn transition(&self, token: i32, next: TransferState) -> Result<TransferStateChange> {
        self.transition_with(token, next, None)
    }

    /// Move to `Errored`, recording why.
    pub fn fail(&self, token: i32, reason: impl Into<String>) -> Result<TransferStateChange> {
        self.transition_with(token, TransferState::Errored, Some(reason.into()))
    }

    fn transition_with(
        &self,
        token: i32,
        next: TransferState,
        error: Option<String>,
    ) -> Result<TransferStateChange> {
        let (change, callback, data_connection) = {
            let mut record = self.active.get_mut(&token).ok_or_else(|| {
                SoulseekError::TransferNotFound(format!("no active transfer with token {token}"))
            })?;
            let previous = record.transfer.state;
            if !previous.can_transition_to(next) {
                return Err(SoulseekError::InvalidOperation(format!(
                    "transfer {token} cannot move from {previous:?} to {next:?}"
                )));
            }
            record.transfer.state = next;
            if next != TransferState::Queued {
                record.transfer.place_in_queue = None;
            }
            if error.is_some() {
                record.transfer.error = error;
            }
            let data_connection = if next == TransferState::Cancelled {
                record.data_connection.take()
            } else {
                None
            };
            (
                TransferStateChange {
                    previous,
                    transfer: record.transfer.clone(),
                },
                record.options.state_changed.clone(),
                data_connection,
            )
        };

        if next.is_terminal() {
            if let Some((_, record)) = self.active.remove(&token) {
                let t = &record.transfer;
                self.files
                    .remove_if(&file_key(t.direction, &t.username, &t.filename), |_, v| *v == token);
            }
        }
        if let Some(conn) = data_connection {
            conn.disconnect("transfer cancelled");
        }
        debug!(token, previous = ?change.previous, current = ?next, "transfer state changed");
        if let Some(callback) = callback {
            invoke_isolated("transfer state callback", || callback(&change));
        }
        Ok(change)
    }

    pub fn set_place_in_queue(&self, token: i32, place: i32) -> Result<Transfer> {
        self.update(token, |t| t.place_in_queue = Some(place))
    }

    pub fn set_remote_token(&self, token: i32, remote_token: i32) -> Result<Transfer> {
        self.update(token, |t| t.remote_token = Some(remote_token))
    }

    pub fn set_size(&self, token: i32, size: i64) -> Result<Transfer> {
        self.update(token, |t| t.size = Some(size))
    }

    fn update(&self, token: i32, f: impl FnOnce(&mut Transfer)) -> Result<Transfer> {
        let mut record = self.active.get_mut(&token).ok_or_else(|| {
            SoulseekError::TransferNotFound(format!("no active transfer with token {token}"))
        })?;
        f(&mut record.transfer);
        Ok(record.transfer.clone())
    }

    /// Associate the connection carrying file data; it is closed if the transfer is cancelled.
    pub fn attach_data_connection(&self, token: i32, connection: Arc<Connection>) -> Result<()> {
        let mut record = self.active.get_mut(&token).ok_or_else(|| {
            SoulseekError::TransferNotFound(format!("no active transfer with token {token}"))
        })?;
        record.data_connection = Some(connection);
        Ok(())
    }

    /// Record the absolute byte count of an in-progress transfer. Reaching the declared size
    /// completes it.
    pub fn record_progress(
        &self,
        token: i32,
        bytes_transferred: i64,
    ) -> Result<(TransferProgress, Option<TransferStateChange>)> {
        let (progress, callback, complete) = {
            let mut record = self.active.get_mut(&token).ok_or_else(|| {
                SoulseekError::TransferNotFound(format!("no active transfer with token {token}"))
            })?;
            if record.transfer.state != TransferState::InProgress {
                return Err(SoulseekError::InvalidOperation(format!(
                    "transfer {token} is {:?}, not in progress",
                    record.transfer.state
                )));
            }
            if bytes_transferred < 0 {
                return Err(SoulseekError::InvalidArgument(format!(
                    "negative byte count {bytes_transferred}"
                )));
            }
            let bytes = match record.transfer.size {
                Some(size) => bytes_transferred.min(size),
                None => bytes_transferred,
            };
            let previous_bytes = std::mem::replace(&mut record.transfer.bytes_transferred, bytes);
            let complete = record.transfer.size.is_some_and(|size| bytes >= size);
            (
                TransferProgress {
                    previous_bytes,
                    transfer: record.transfer.clone(),
                },
                record.options.progress_updated.clone(),
                complete,
            )
        };

        if let Some(callback) = callback {
            invoke_isolated("transfer progress callback", || callback(&progress));
        }
        let completion = if complete {
            Some(self.transition(token, TransferState::Completed)?)
        } else {
            None
        };
        Ok((progress, completion))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl fmt::Debug for TransferTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTracker")
            .field("active", &self.active.len())
            .finish()
    }
}
