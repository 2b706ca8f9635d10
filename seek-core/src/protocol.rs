//! Wire message codes and the typed messages the client exchanges.

pub mod distributed;
pub mod peer;
pub mod server;

/// Codes understood on the server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServerCode {
    GetPeerAddress = 3,
    BranchLevel = 126,
    BranchRoot = 127,
}

impl ServerCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            3 => Some(Self::GetPeerAddress),
            126 => Some(Self::BranchLevel),
            127 => Some(Self::BranchRoot),
            _ => None,
        }
    }
}

/// Codes understood on peer message connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PeerCode {
    SearchRequest = 8,
    TransferRequest = 40,
    TransferResponse = 41,
    PlaceInQueueResponse = 44,
    UploadFailed = 46,
    QueueFailed = 50,
    PlaceInQueueRequest = 51,
}

impl PeerCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            8 => Some(Self::SearchRequest),
            40 => Some(Self::TransferRequest),
            41 => Some(Self::TransferResponse),
            44 => Some(Self::PlaceInQueueResponse),
            46 => Some(Self::UploadFailed),
            50 => Some(Self::QueueFailed),
            51 => Some(Self::PlaceInQueueRequest),
            _ => None,
        }
    }
}

/// Codes understood on distributed (search relay) connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DistributedCode {
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
}

impl DistributedCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            3 => Some(Self::SearchRequest),
            4 => Some(Self::BranchLevel),
            5 => Some(Self::BranchRoot),
            _ => None,
        }
    }
}

/// A code qualified by the connection kind it belongs to. The same number means different
/// things on server, peer and distributed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    Server(ServerCode),
    Peer(PeerCode),
    Distributed(DistributedCode),
}

impl MessageCode {
    pub fn as_i32(self) -> i32 {
        match self {
            MessageCode::Server(c) => c as i32,
            MessageCode::Peer(c) => c as i32,
            MessageCode::Distributed(c) => c as i32,
        }
    }
}

impl From<ServerCode> for MessageCode {
    fn from(c: ServerCode) -> Self {
        MessageCode::Server(c)
    }
}

impl From<PeerCode> for MessageCode {
    fn from(c: PeerCode) -> Self {
        MessageCode::Peer(c)
    }
}

impl From<DistributedCode> for MessageCode {
    fn from(c: DistributedCode) -> Self {
        MessageCode::Distributed(c)
    }
}

/// Fail decoding when the envelope carries a different code than expected.
pub(crate) fn expect_code(
    reader: &crate::wire::MessageReader<'_>,
    expected: impl Into<MessageCode>,
) -> crate::Result<()> {
    let expected = expected.into();
    if reader.code() != expected.as_i32() {
        return Err(crate::SoulseekError::MessageRead(format!(
            "expected {:?} ({}), received code {}",
            expected,
            expected.as_i32(),
            reader.code()
        )));
    }
    Ok(())
}
