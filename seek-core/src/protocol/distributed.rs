//! Distributed network messages, relayed from parent to children.

use crate::protocol::{expect_code, DistributedCode};
use crate::wire::{MessageBuilder, MessageReader};
use crate::Result;

/// A search travelling down the distributed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearchRequest {
    /// Leading field with no known meaning; preserved when relaying.
    pub unknown: i32,
    pub username: String,
    pub token: i32,
    pub query: String,
}

impl DistributedSearchRequest {
    pub fn new(username: impl Into<String>, token: i32, query: impl Into<String>) -> Self {
        Self {
            unknown: 0,
            username: username.into(),
            token,
            query: query.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(DistributedCode::SearchRequest)
            .write_integer(self.unknown)
            .write_string(&self.username)
            .write_integer(self.token)
            .write_string(&self.query)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, DistributedCode::SearchRequest)?;
        let unknown = r.read_integer()?;
        let username = r.read_string()?;
        let token = r.read_integer()?;
        let query = r.read_string()?;
        Ok(Self {
            unknown,
            username,
            token,
            query,
        })
    }
}

/// Tells a child our depth in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedBranchLevel {
    pub level: i32,
}

impl DistributedBranchLevel {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(DistributedCode::BranchLevel)
            .write_integer(self.level)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, DistributedCode::BranchLevel)?;
        Ok(Self {
            level: r.read_integer()?,
        })
    }
}

/// Tells a child which user roots our branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedBranchRoot {
    pub root: String,
}

impl DistributedBranchRoot {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        MessageBuilder::new(DistributedCode::BranchRoot)
            .write_string(&self.root)
            .build()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes)?;
        expect_code(&r, DistributedCode::BranchRoot)?;
        Ok(Self {
            root: r.read_string()?,
        })
    }
}
