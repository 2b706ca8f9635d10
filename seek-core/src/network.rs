//! Connections: raw byte streams, message framing on top of them, and the peer registry.

pub mod connection;
pub mod handlers;
pub mod message_connection;
pub mod peer_manager;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use handlers::{EventHandlers, SubscriptionId};
pub use message_connection::{MessageConnection, MessageEvent};
pub use peer_manager::{PeerConnectionManager, PeerMessage};
