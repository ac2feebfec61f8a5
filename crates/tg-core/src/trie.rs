//! Reversed-hostname trie
//!
//! Nodes live in a single arena and refer to each other by [`NodeIndex`].
//! The key of a node is one domain label; walking from the root consumes the
//! hostname TLD first, so `ads.example.com` is stored as
//! `com -> example -> ads`.

use std::collections::HashMap;

use crate::url::reversed_labels;

/// Handle of a node in the trie arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(u32);

impl NodeIndex {
    pub const ROOT: NodeIndex = NodeIndex(0);

    fn get(self) -> usize {
        self.0 as usize
    }
}

/// A path prefix registered under a host, without the leading '/'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub prefix: String,
    pub target: u32,
}

/// What a node carries besides its children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodePayload {
    #[default]
    Internal,
    Terminal(u32),
    Paths(Vec<PathEntry>),
    TerminalWithPaths(u32, Vec<PathEntry>),
}

impl NodePayload {
    pub fn terminal(&self) -> Option<u32> {
        match self {
            Self::Terminal(target) | Self::TerminalWithPaths(target, _) => Some(*target),
            _ => None,
        }
    }

    pub fn paths(&self) -> &[PathEntry] {
        match self {
            Self::Paths(paths) | Self::TerminalWithPaths(_, paths) => paths,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostTrieNode {
    children: HashMap<String, NodeIndex>,
    payload: NodePayload,
}

impl HostTrieNode {
    pub fn payload(&self) -> &NodePayload {
        &self.payload
    }
}

/// Arena-backed trie keyed by reversed hostname labels.
#[derive(Debug, Clone)]
pub struct HostTrie {
    nodes: Vec<HostTrieNode>,
}

impl Default for HostTrie {
    fn default() -> Self {
        Self {
            nodes: vec![HostTrieNode::default()],
        }
    }
}

impl HostTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: NodeIndex) -> &HostTrieNode {
        &self.nodes[index.get()]
    }

    fn child_or_insert(&mut self, parent: NodeIndex, label: &str) -> NodeIndex {
        if let Some(&child) = self.nodes[parent.get()].children.get(label) {
            return child;
        }
        let child = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(HostTrieNode::default());
        self.nodes[parent.get()].children.insert(label.to_string(), child);
        child
    }

    fn node_for_host(&mut self, host: &str) -> NodeIndex {
        let mut current = NodeIndex::ROOT;
        for label in reversed_labels(host) {
            current = self.child_or_insert(current, label);
        }
        current
    }

    /// Mark `host` (and every subdomain) as belonging to `target`.
    /// A later insert for the same host replaces the earlier one.
    pub fn insert_host(&mut self, host: &str, target: u32) {
        let index = self.node_for_host(host);
        let node = &mut self.nodes[index.get()];
        node.payload = match std::mem::take(&mut node.payload) {
            NodePayload::Internal | NodePayload::Terminal(_) => NodePayload::Terminal(target),
            NodePayload::Paths(paths) | NodePayload::TerminalWithPaths(_, paths) => {
                NodePayload::TerminalWithPaths(target, paths)
            }
        };
    }

    /// Register a path prefix under `host`.
    pub fn insert_host_path(&mut self, host: &str, path: &str, target: u32) {
        let prefix = path.trim_start_matches('/').to_string();
        let index = self.node_for_host(host);
        let node = &mut self.nodes[index.get()];
        let entry = PathEntry { prefix, target };
        node.payload = match std::mem::take(&mut node.payload) {
            NodePayload::Internal => NodePayload::Paths(vec![entry]),
            NodePayload::Terminal(id) => NodePayload::TerminalWithPaths(id, vec![entry]),
            NodePayload::Paths(mut paths) => {
                paths.push(entry);
                NodePayload::Paths(paths)
            }
            NodePayload::TerminalWithPaths(id, mut paths) => {
                paths.push(entry);
                NodePayload::TerminalWithPaths(id, paths)
            }
        };
    }

    /// Walk the trie along `host`, returning every visited node from the
    /// shallowest to the deepest. The walk stops at the first missing label.
    pub fn walk(&self, host: &str) -> Vec<NodeIndex> {
        let mut visited = Vec::new();
        let mut current = NodeIndex::ROOT;
        for label in reversed_labels(host) {
            match self.nodes[current.get()].children.get(label) {
                Some(&child) => {
                    visited.push(child);
                    current = child;
                }
                None => break,
            }
        }
        visited
    }

    /// Host+path lookup: path-bearing nodes are tried deepest first; inside a
    /// node the longest prefix of `path` wins.
    pub fn match_host_path(&self, visited: &[NodeIndex], path: &str) -> Option<u32> {
        let path = path.trim_start_matches('/');
        visited.iter().rev().find_map(|&index| {
            self.node(index)
                .payload
                .paths()
                .iter()
                .filter(|entry| path.starts_with(entry.prefix.as_str()))
                .max_by_key(|entry| entry.prefix.len())
                .map(|entry| entry.target)
        })
    }

    /// Host-only lookup: the deepest terminal among the visited nodes.
    pub fn match_host(&self, visited: &[NodeIndex]) -> Option<u32> {
        visited
            .iter()
            .rev()
            .find_map(|&index| self.node(index).payload.terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_stops_at_missing_label() {
        let mut trie = HostTrie::new();
        trie.insert_host("example.com", 1);
        assert_eq!(trie.walk("a.b.example.com").len(), 2);
        assert_eq!(trie.walk("example.org").len(), 0);
        assert_eq!(trie.node_count(), 3);
    }

    #[test]
    fn deepest_terminal_wins() {
        let mut trie = HostTrie::new();
        trie.insert_host("google.com", 1);
        trie.insert_host("analytics.google.com", 2);
        assert_eq!(trie.match_host(&trie.walk("x.analytics.google.com")), Some(2));
        assert_eq!(trie.match_host(&trie.walk("mail.google.com")), Some(1));
        assert_eq!(trie.match_host(&trie.walk("google.org")), None);
    }

    #[test]
    fn payload_variants_merge() {
        let mut trie = HostTrie::new();
        trie.insert_host_path("cdn.com", "/track", 3);
        trie.insert_host("cdn.com", 4);
        let visited = trie.walk("cdn.com");
        let payload = trie.node(visited[1]).payload();
        assert_eq!(payload.terminal(), Some(4));
        assert_eq!(payload.paths().len(), 1);
        assert_eq!(payload.paths()[0].prefix, "track");
    }

    #[test]
    fn shallow_path_beats_nothing_deeper() {
        let mut trie = HostTrie::new();
        trie.insert_host_path("example.com", "pixel", 5);
        trie.insert_host_path("sub.example.com", "other", 6);
        let visited = trie.walk("sub.example.com");
        assert_eq!(trie.match_host_path(&visited, "/pixel.gif"), Some(5));
        assert_eq!(trie.match_host_path(&visited, "/other/x"), Some(6));
        assert_eq!(trie.match_host_path(&visited, "/none"), None);
    }

    #[test]
    fn longest_prefix_within_node() {
        let mut trie = HostTrie::new();
        trie.insert_host_path("example.com", "ads", 1);
        trie.insert_host_path("example.com", "ads/video", 2);
        let visited = trie.walk("example.com");
        assert_eq!(trie.match_host_path(&visited, "/ads/video/x.mp4"), Some(2));
        assert_eq!(trie.match_host_path(&visited, "/ads/banner.png"), Some(1));
    }

    #[test]
    fn ip_literal_single_segment() {
        let mut trie = HostTrie::new();
        trie.insert_host("10.1.2.3", 9);
        assert_eq!(trie.match_host(&trie.walk("10.1.2.3")), Some(9));
        assert_eq!(trie.match_host(&trie.walk("3.2.1.10")), None);
    }
}
