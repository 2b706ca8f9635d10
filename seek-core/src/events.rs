//! Notifications published by the client for hosts and user interfaces.

use crate::distributed::BranchPosition;
use crate::protocol::distributed::DistributedSearchRequest;
use crate::transfer::{TransferProgress, TransferStateChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    LoggedIn,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged {
        previous: ClientState,
        current: ClientState,
    },
    Disconnected {
        reason: String,
    },
    TransferStateChanged(TransferStateChange),
    TransferProgressUpdated(TransferProgress),
    /// A search arrived from our distributed parent.
    DistributedSearchReceived(DistributedSearchRequest),
    BranchChanged(BranchPosition),
}
