//! Cluster membership.
//!
//! A tag appears in at most one of `members` (voters), `promotables`
//! (replicated to, promoted once caught up) and `watchers` (non-voters).
//! `topology_id == None` means the node is not part of any cluster.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag of a node that has not been assigned one by a cluster yet.
pub const INITIAL_TAG: &str = "?";

/// Membership change requested through the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyModification {
    Voter,
    Promotable,
    NonVoter,
    Remove,
}

impl std::fmt::Display for TopologyModification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyModification::Voter => write!(f, "voter"),
            TopologyModification::Promotable => write!(f, "promotable"),
            TopologyModification::NonVoter => write!(f, "non-voter"),
            TopologyModification::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub topology_id: Option<String>,
    pub members: BTreeMap<String, String>,
    pub promotables: BTreeMap<String, String>,
    pub watchers: BTreeMap<String, String>,
    pub last_node_id: String,
}

impl ClusterTopology {
    pub fn new_passive() -> Self {
        Self::default()
    }

    /// Single-node topology with `tag` as its only voter.
    pub fn bootstrap(tag: &str, url: &str) -> Self {
        let mut members = BTreeMap::new();
        members.insert(tag.to_string(), url.to_string());
        Self {
            topology_id: Some(uuid::Uuid::new_v4().to_string()),
            members,
            promotables: BTreeMap::new(),
            watchers: BTreeMap::new(),
            last_node_id: tag.to_string(),
        }
    }

    pub fn is_passive(&self) -> bool {
        self.topology_id.is_none()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.members.contains_key(tag)
            || self.promotables.contains_key(tag)
            || self.watchers.contains_key(tag)
    }

    pub fn is_voter(&self, tag: &str) -> bool {
        self.members.contains_key(tag)
    }

    /// Tag of the node registered under `url`, if any.
    pub fn has_url(&self, url: &str) -> Option<String> {
        self.all_nodes()
            .into_iter()
            .find(|(_, node_url)| node_url == url)
            .map(|(tag, _)| tag)
    }

    pub fn get_url_from_tag(&self, tag: &str) -> Option<&str> {
        self.members
            .get(tag)
            .or_else(|| self.promotables.get(tag))
            .or_else(|| self.watchers.get(tag))
            .map(String::as_str)
    }

    /// Union of members, promotables and watchers.
    pub fn all_nodes(&self) -> BTreeMap<String, String> {
        let mut all = self.members.clone();
        all.extend(self.promotables.clone());
        all.extend(self.watchers.clone());
        all
    }

    /// Which role `tag` currently holds, `Remove` when it is absent.
    pub fn role_of(&self, tag: &str) -> TopologyModification {
        if self.members.contains_key(tag) {
            TopologyModification::Voter
        } else if self.promotables.contains_key(tag) {
            TopologyModification::Promotable
        } else if self.watchers.contains_key(tag) {
            TopologyModification::NonVoter
        } else {
            TopologyModification::Remove
        }
    }

    pub fn voters_count(&self) -> usize {
        self.members.len()
    }

    /// Strictly more than half of the voting members.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Tag following `last_node_id`: A, B, .. Z, AA, AB, ..
    pub fn next_tag(&self) -> String {
        let mut tag = increment_tag(&self.last_node_id);
        while self.contains(&tag) {
            tag = increment_tag(&tag);
        }
        tag
    }

    /// Copy of this topology with `tag` moved into the role named by `kind`.
    pub fn with_modification(&self, tag: &str, url: &str, kind: TopologyModification) -> Self {
        let mut next = self.clone();
        next.members.remove(tag);
        next.promotables.remove(tag);
        next.watchers.remove(tag);
        match kind {
            TopologyModification::Voter => {
                next.members.insert(tag.to_string(), url.to_string());
            }
            TopologyModification::Promotable => {
                next.promotables.insert(tag.to_string(), url.to_string());
            }
            TopologyModification::NonVoter => {
                next.watchers.insert(tag.to_string(), url.to_string());
            }
            TopologyModification::Remove => {}
        }
        if kind != TopologyModification::Remove && tag_order(tag) > tag_order(&next.last_node_id) {
            next.last_node_id = tag.to_string();
        }
        next
    }
}

/// Keys added to and removed from `old` to reach `new`. A key whose value
/// changed shows up in both lists.
pub fn dictionary_diff<V: PartialEq>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
) -> (Vec<String>, Vec<String>) {
    let added = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    let removed = old
        .iter()
        .filter(|(key, value)| new.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    (added, removed)
}

fn increment_tag(tag: &str) -> String {
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_uppercase()) {
        return "A".to_string();
    }
    let mut bytes = tag.as_bytes().to_vec();
    for i in (0..bytes.len()).rev() {
        if bytes[i] < b'Z' {
            bytes[i] += 1;
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes[i] = b'A';
    }
    bytes.insert(0, b'A');
    String::from_utf8_lossy(&bytes).into_owned()
}

fn tag_order(tag: &str) -> (usize, String) {
    if tag.bytes().all(|b| b.is_ascii_uppercase()) {
        (tag.len(), tag.to_string())
    } else {
        (0, String::new())
    }
}
