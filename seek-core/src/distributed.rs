//! Position in the distributed search tree. Host-driven: callers feed in announcements
//! and get back the messages to send; no I/O happens here.

use std::collections::BTreeSet;

use tracing::debug;

use crate::protocol::distributed::{DistributedBranchLevel, DistributedBranchRoot, DistributedSearchRequest};
use crate::protocol::server::{BranchLevel, BranchRoot};

/// Something the host must write after a branch update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Write to the server connection.
    Server(Vec<u8>),
    /// Write to every distributed child.
    Children(Vec<u8>),
    /// Write to a single child.
    Child { username: String, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchPosition {
    /// Depth below the branch root; `None` until derived from a parent announcement.
    pub level: Option<i32>,
    pub root: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug)]
pub struct DistributedBranch {
    username: String,
    max_relay_depth: Option<i32>,
    position: BranchPosition,
    children: BTreeSet<String>,
}

impl DistributedBranch {
    pub fn new(username: impl Into<String>, max_relay_depth: Option<i32>) -> Self {
        Self {
            username: username.into(),
            max_relay_depth,
            position: BranchPosition::default(),
            children: BTreeSet::new(),
        }
    }

    pub fn position(&self) -> &BranchPosition {
        &self.position
    }

    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    pub fn is_parent(&self, username: &str) -> bool {
        self.position.parent.as_deref() == Some(username)
    }

    /// We receive searches straight from the server: level 0, our own root.
    pub fn become_root(&mut self) -> Vec<RelayAction> {
        debug!(username = %self.username, "branch root");
        self.position = BranchPosition {
            level: Some(0),
            root: Some(self.username.clone()),
            parent: None,
        };
        let mut actions = self.announce_level(0);
        actions.extend(self.announce_root(self.username.clone()));
        actions
    }

    /// Adopt a parent connection. Level and root are forgotten until it announces them,
    /// even when reconnecting to the same user.
    pub fn set_parent(&mut self, parent: impl Into<String>) {
        let parent = parent.into();
        debug!(%parent, "branch parent changed");
        self.position = BranchPosition {
            level: None,
            root: None,
            parent: Some(parent),
        };
    }

    /// Returns true if `username` was the parent, in which case the position is cleared.
    pub fn parent_disconnected(&mut self, username: &str) -> bool {
        if !self.is_parent(username) {
            return false;
        }
        debug!(parent = %username, "branch parent lost");
        self.position = BranchPosition::default();
        true
    }

    /// The parent announced its level; ours is one deeper.
    pub fn on_parent_branch_level(&mut self, from: &str, parent_level: i32) -> Vec<RelayAction> {
        if !self.is_parent(from) {
            debug!(%from, "ignoring branch level from non-parent");
            return Vec::new();
        }
        let level = parent_level.saturating_add(1);
        if self.position.level == Some(level) {
            return Vec::new();
        }
        debug!(level, "branch level derived");
        self.position.level = Some(level);
        self.announce_level(level)
    }

    pub fn on_parent_branch_root(&mut self, from: &str, root: &str) -> Vec<RelayAction> {
        if !self.is_parent(from) {
            debug!(%from, "ignoring branch root from non-parent");
            return Vec::new();
        }
        if self.position.root.as_deref() == Some(root) {
            return Vec::new();
        }
        debug!(%root, "branch root changed");
        self.position.root = Some(root.to_owned());
        self.announce_root(root.to_owned())
    }

    /// Searches are passed down only while our depth is known and under the relay limit.
    pub fn should_relay(&self) -> bool {
        match (self.position.level, self.max_relay_depth) {
            (None, _) => false,
            (Some(level), Some(max)) => level < max,
            (Some(_), None) => true,
        }
    }

    /// A search from `from`. `None` if it did not come from our parent; otherwise the
    /// relay actions, empty when relaying is not allowed.
    pub fn on_search_request(
        &self,
        from: &str,
        request: &DistributedSearchRequest,
    ) -> Option<Vec<RelayAction>> {
        if !self.is_parent(from) {
            return None;
        }
        if !self.should_relay() || self.children.is_empty() {
            return Some(Vec::new());
        }
        Some(vec![RelayAction::Children(request.to_bytes())])
    }

    /// Register a child and tell it where we are.
    pub fn add_child(&mut self, username: impl Into<String>) -> Vec<RelayAction> {
        let username = username.into();
        self.children.insert(username.clone());
        let mut actions = Vec::new();
        if let Some(level) = self.position.level {
            actions.push(RelayAction::Child {
                username: username.clone(),
                bytes: DistributedBranchLevel::new(level).to_bytes(),
            });
        }
        if let Some(root) = &self.position.root {
            actions.push(RelayAction::Child {
                username,
                bytes: DistributedBranchRoot::new(root.clone()).to_bytes(),
            });
        }
        actions
    }

    pub fn remove_child(&mut self, username: &str) -> bool {
        self.children.remove(username)
    }

    fn announce_level(&self, level: i32) -> Vec<RelayAction> {
        let mut actions = vec![RelayAction::Server(BranchLevel::new(level).to_bytes())];
        if !self.children.is_empty() {
            actions.push(RelayAction::Children(DistributedBranchLevel::new(level).to_bytes()));
        }
        actions
    }

    fn announce_root(&self, root: String) -> Vec<RelayAction> {
        let mut actions = vec![RelayAction::Server(BranchRoot::new(root.clone()).to_bytes())];
        if !self.children.is_empty() {
            actions.push(RelayAction::Children(DistributedBranchRoot::new(root).to_bytes()));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_parent(max: Option<i32>) -> DistributedBranch {
        let mut b = DistributedBranch::new("me", max);
        b.set_parent("parent");
        b
    }

    #[test]
    fn level_is_parent_plus_one_and_reannounced() {
        let mut b = with_parent(None);
        b.add_child("kid");
        let actions = b.on_parent_branch_level("parent", 2);
        assert_eq!(b.position().level, Some(3));
        assert_eq!(
            actions,
            vec![
                RelayAction::Server(BranchLevel::new(3).to_bytes()),
                RelayAction::Children(DistributedBranchLevel::new(3).to_bytes()),
            ]
        );
        // repeated announcement changes nothing
        assert!(b.on_parent_branch_level("parent", 2).is_empty());
    }

    #[test]
    fn root_node_is_level_zero() {
        let mut b = DistributedBranch::new("me", None);
        let actions = b.become_root();
        assert_eq!(b.position().level, Some(0));
        assert_eq!(b.position().root.as_deref(), Some("me"));
        assert!(actions.contains(&RelayAction::Server(BranchLevel::new(0).to_bytes())));
        assert!(actions.contains(&RelayAction::Server(BranchRoot::new("me").to_bytes())));
    }

    #[test]
    fn non_parent_announcements_ignored() {
        let mut b = with_parent(None);
        assert!(b.on_parent_branch_level("stranger", 1).is_empty());
        assert_eq!(b.position().level, None);
        assert!(b.on_parent_branch_root("stranger", "x").is_empty());
    }

    #[test]
    fn parent_change_clears_position() {
        let mut b = with_parent(None);
        b.on_parent_branch_level("parent", 1);
        b.on_parent_branch_root("parent", "rooty");
        b.set_parent("other");
        assert_eq!(b.position().level, None);
        assert_eq!(b.position().root, None);
        assert!(!b.should_relay());
    }

    #[test]
    fn parent_loss_clears_position() {
        let mut b = with_parent(None);
        b.on_parent_branch_level("parent", 1);
        assert!(!b.parent_disconnected("kid"));
        assert!(b.parent_disconnected("parent"));
        assert_eq!(b.position(), &BranchPosition::default());
    }

    #[test]
    fn relay_respects_depth_limit() {
        let request = DistributedSearchRequest::new("searcher", 7, "query");
        let mut b = with_parent(Some(3));
        b.add_child("kid");
        assert_eq!(b.on_search_request("parent", &request), Some(Vec::new()));
        b.on_parent_branch_level("parent", 1);
        assert_eq!(
            b.on_search_request("parent", &request),
            Some(vec![RelayAction::Children(request.to_bytes())])
        );
        b.on_parent_branch_level("parent", 2);
        assert_eq!(b.on_search_request("parent", &request), Some(Vec::new()));
        assert_eq!(b.on_search_request("stranger", &request), None);
    }

    #[test]
    fn new_child_told_level_and_root() {
        let mut b = with_parent(None);
        b.on_parent_branch_level("parent", 0);
        b.on_parent_branch_root("parent", "top");
        let actions = b.add_child("kid");
        assert_eq!(
            actions,
            vec![
                RelayAction::Child {
                    username: "kid".into(),
                    bytes: DistributedBranchLevel::new(1).to_bytes()
                },
                RelayAction::Child {
                    username: "kid".into(),
                    bytes: DistributedBranchRoot::new("top").to_bytes()
                },
            ]
        );
        assert!(DistributedBranch::new("x", None).add_child("kid").is_empty());
    }
}
