//! Peer message connection messages.

use crate::protocol::{expect_code, PeerCode};
use crate::transfer::TransferDirection;
use crate::wire::{MessageBuilder, MessageReader};
use crate::{Result, SoulseekError};

/// Reason a peer gives when it accepts a download into its upload queue.
pub const QUEUED_REASON: &str = "Queued";

/// Requests a search from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSearchRequest {
    pub token: i32,
    pub search_text: String,
}

impl PeerSearchRequest {
    pub fn new(search_text: impl Into<String>, token: i32) -> Self {
        Self {
            token,
            search_text: search_text.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(PeerCode::SearchRequest)
            .write_integer(self.token)
            .write_string(&self.search_text)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::SearchRequest)?;
        let token = r.read_integer()?;
        let search_text = r.read_string()?;
        Ok(Self { token, search_text })
    }
}

/// Announces a transfer. Download direction asks the peer to send us a file; upload
/// direction tells the peer we are ready to send it one, with its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: i32,
    pub filename: String,
    pub size: Option<i64>,
}

impl TransferRequest {
    pub fn download(token: i32, filename: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Download,
            token,
            filename: filename.into(),
            size: None,
        }
    }

    pub fn upload(token: i32, filename: impl Into<String>, size: i64) -> Self {
        Self {
            direction: TransferDirection::Upload,
            token,
            filename: filename.into(),
            size: Some(size),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let b = MessageBuilder::new(PeerCode::TransferRequest)
            .write_integer(self.direction.as_i32())
            .write_integer(self.token)
            .write_string(&self.filename);
        match (self.direction, self.size) {
            (TransferDirection::Upload, Some(size)) => b.write_long(size).build(),
            _ => b.build(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::TransferRequest)?;
        let direction = r.read_integer()?;
        let direction = TransferDirection::from_i32(direction).ok_or_else(|| {
            SoulseekError::MessageRead(format!("unknown transfer direction {direction}"))
        })?;
        let token = r.read_integer()?;
        let filename = r.read_string()?;
        let size = match direction {
            TransferDirection::Upload => Some(r.read_long()?),
            TransferDirection::Download => None,
        };
        Ok(Self {
            direction,
            token,
            filename,
            size,
        })
    }
}

/// Answer to a [`TransferRequest`]: allowed with a size, or refused with a reason
/// (`"Queued"` when the peer accepted the request into its queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub token: i32,
    pub allowed: bool,
    pub size: Option<i64>,
    pub reason: Option<String>,
}

impl TransferResponse {
    pub fn allowed(token: i32, size: i64) -> Self {
        Self {
            token,
            allowed: true,
            size: Some(size),
            reason: None,
        }
    }

    pub fn rejected(token: i32, reason: impl Into<String>) -> Self {
        Self {
            token,
            allowed: false,
            size: None,
            reason: Some(reason.into()),
        }
    }

    pub fn queued(token: i32) -> Self {
        Self::rejected(token, QUEUED_REASON)
    }

    pub fn is_queued(&self) -> bool {
        !self.allowed && self.reason.as_deref() == Some(QUEUED_REASON)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let b = MessageBuilder::new(PeerCode::TransferResponse)
            .write_integer(self.token)
            .write_byte(u8::from(self.allowed));
        if self.allowed {
            b.write_long(self.size.unwrap_or(0)).build()
        } else {
            b.write_string(self.reason.as_deref().unwrap_or_default())
                .build()
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::TransferResponse)?;
        let token = r.read_integer()?;
        let allowed = r.read_byte()? == 1;
        if allowed {
            let size = if r.has_more_data() {
                Some(r.read_long()?)
            } else {
                None
            };
            Ok(Self {
                token,
                allowed,
                size,
                reason: None,
            })
        } else {
            let reason = if r.has_more_data() {
                Some(r.read_string()?)
            } else {
                None
            };
            Ok(Self {
                token,
                allowed,
                size: None,
                reason,
            })
        }
    }
}

/// Asks a peer where one of our downloads sits in its upload queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueRequest {
    pub filename: String,
}

impl PlaceInQueueRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(PeerCode::PlaceInQueueRequest)
            .write_string(&self.filename)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::PlaceInQueueRequest)?;
        Ok(Self {
            filename: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueResponse {
    pub filename: String,
    pub place_in_queue: i32,
}

impl PlaceInQueueResponse {
    pub fn new(filename: impl Into<String>, place_in_queue: i32) -> Self {
        Self {
            filename: filename.into(),
            place_in_queue,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(PeerCode::PlaceInQueueResponse)
            .write_string(&self.filename)
            .write_integer(self.place_in_queue)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::PlaceInQueueResponse)?;
        let filename = r.read_string()?;
        let place_in_queue = r.read_integer()?;
        Ok(Self {
            filename,
            place_in_queue,
        })
    }
}

/// The peer could not queue the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFailed {
    pub filename: String,
    pub reason: String,
}

impl QueueFailed {
    pub fn new(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            reason: reason.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(PeerCode::QueueFailed)
            .write_string(&self.filename)
            .write_string(&self.reason)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::QueueFailed)?;
        let filename = r.read_string()?;
        let reason = r.read_string()?;
        Ok(Self { filename, reason })
    }
}

/// The peer's upload of the file failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailed {
    pub filename: String,
}

impl UploadFailed {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(PeerCode::UploadFailed)
            .write_string(&self.filename)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, PeerCode::UploadFailed)?;
        Ok(Self {
            filename: r.read_string()?,
        })
    }
}
