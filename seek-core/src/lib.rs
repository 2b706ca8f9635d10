//! Soulseek client core.
//! Framed message connections, reply correlation, a peer connection registry, transfer
//! tracking and distributed branch relay. The host drives it through [`SoulseekClient`].

pub mod client;
pub mod distributed;
pub mod error;
pub mod events;
pub mod network;
pub mod options;
pub mod protocol;
pub mod token;
pub mod transfer;
pub mod waiter;
pub mod wire;

pub use client::SoulseekClient;
pub use distributed::{BranchPosition, DistributedBranch, RelayAction};
pub use error::{Result, SoulseekError};
pub use events::{ClientEvent, ClientState};
pub use options::{ClientOptions, ConnectionOptions};
pub use protocol::MessageCode;
pub use transfer::{
    Transfer, TransferDirection, TransferOptions, TransferProgress, TransferState, TransferStateChange,
};
pub use waiter::{PendingWait, WaitKey, Waiter};
