//! Server connection messages.

use std::net::Ipv4Addr;

use crate::protocol::{expect_code, ServerCode};
use crate::wire::{MessageBuilder, MessageReader};
use crate::Result;

/// Asks the server for a peer's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAddressRequest {
    pub username: String,
}

impl UserAddressRequest {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(ServerCode::GetPeerAddress)
            .write_string(&self.username)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, ServerCode::GetPeerAddress)?;
        Ok(Self {
            username: r.read_string()?,
        })
    }
}

/// The server's answer to [`UserAddressRequest`]. An unspecified address means the user is offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl UserAddressResponse {
    pub fn new(username: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            username: username.into(),
            ip,
            port,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(ServerCode::GetPeerAddress)
            .write_string(&self.username)
            .write_ip(self.ip)
            .write_integer(i32::from(self.port))
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, ServerCode::GetPeerAddress)?;
        let username = r.read_string()?;
        let ip = r.read_ip()?;
        let port = r.read_integer()?;
        let port = u16::try_from(port).map_err(|_| {
            crate::SoulseekError::MessageRead(format!("port {port} out of range"))
        })?;
        Ok(Self { username, ip, port })
    }
}

/// Informs the server of the current distributed branch level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLevel {
    pub level: i32,
}

impl BranchLevel {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(ServerCode::BranchLevel)
            .write_integer(self.level)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, ServerCode::BranchLevel)?;
        Ok(Self {
            level: r.read_integer()?,
        })
    }
}

/// Informs the server of the current distributed branch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRoot {
    pub root: String,
}

impl BranchRoot {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(ServerCode::BranchRoot)
            .write_string(&self.root)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, ServerCode::BranchRoot)?;
        Ok(Self {
            root: r.read_string()?,
        })
    }
}
