use crate::lamport::LamportClock;
use crate::swim::proto::DisseminationUpdateMsg;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// One peer known to this SWIM instance, keyed by its `host:port` name.
pub struct SwimNode {
    pub addr: SocketAddr,
    pub name: String,
    pub last_changed: Instant,
    pub update: Option<DisseminationUpdateMsg>,
}

impl SwimNode {
    fn new(addr: SocketAddr, name: String) -> Self {
        Self {
            addr,
            name,
            last_changed: Instant::now(),
            update: None,
        }
    }

    /// True iff the latest update exists and its alive flag is set.
    pub fn is_up(&self) -> bool {
        self.update.as_ref().map(|u| u.alive).unwrap_or(false)
    }

    /// Apply a remote update if it strictly supersedes the stored one,
    /// comparing `(timestamp, alive)` lexicographically (this corrects
    /// the alive-only comparison of the system this design descends
    /// from, which was blind to message reordering).
    fn apply_update(&mut self, update: DisseminationUpdateMsg) -> bool {
        let supersedes = match &self.update {
            None => true,
            Some(cur) => (update.timestamp, update.alive) > (cur.timestamp, cur.alive),
        };
        if supersedes {
            self.update = Some(update);
            self.last_changed = Instant::now();
        }
        supersedes
    }

    /// Mark the node up/down from local observation (a direct ping or
    /// ping-req result), stamping the update with a freshly incremented
    /// Lamport timestamp so it is comparable against remote updates.
    fn set_up_local(&mut self, is_up: bool, clock: &LamportClock) -> bool {
        let changed = self.update.as_ref().map(|u| u.alive) != Some(is_up);
        if changed || self.update.is_none() {
            self.update = Some(DisseminationUpdateMsg {
                timestamp: clock.increment_epoch(),
                node_name: self.name.clone(),
                alive: is_up,
            });
            self.last_changed = Instant::now();
        }
        changed
    }
}

/// All known peers plus the outbound dissemination log, guarded by one
/// mutex shared by the protocol executor, the server loop, and any
/// membership introspection.
pub struct NodeTable {
    pub nodes: Vec<SwimNode>,
    pub by_name: HashMap<String, usize>,
    pub outbound_updates: Vec<DisseminationUpdateMsg>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            outbound_updates: Vec::new(),
        }
    }

    /// Find an existing node or insert it in the down state.
    pub fn get_or_insert(&mut self, name: &str, addr: SocketAddr) -> usize {
        if let Some(&idx) = self.by_name.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(SwimNode::new(addr, name.to_string()));
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Regenerate the outbound log from the latest update of every known
    /// node with a non-null update.
    pub fn regenerate_outbound(&mut self) {
        self.outbound_updates = self
            .nodes
            .iter()
            .filter_map(|n| n.update.clone())
            .collect();
    }

    /// Apply a local state transition for `name` (creating it if
    /// unknown); regenerates the outbound log if the state changed.
    pub fn set_up_local(&mut self, name: &str, addr: SocketAddr, is_up: bool, clock: &LamportClock) -> bool {
        let idx = self.get_or_insert(name, addr);
        let changed = self.nodes[idx].set_up_local(is_up, clock);
        if changed {
            self.regenerate_outbound();
        }
        changed
    }

    /// Apply a batch of remote dissemination updates, returning whether
    /// any of them changed local state.
    pub fn apply_updates(&mut self, updates: Vec<DisseminationUpdateMsg>, local_addr_hint: SocketAddr) -> bool {
        let mut any_changed = false;
        for update in updates {
            let idx = self.get_or_insert(&update.node_name, local_addr_hint);
            if self.nodes[idx].apply_update(update) {
                any_changed = true;
            }
        }
        if any_changed {
            self.regenerate_outbound();
        }
        any_changed
    }

    pub fn up_nodes_excluding(&self, exclude: &str) -> Vec<&SwimNode> {
        self.nodes
            .iter()
            .filter(|n| n.name != exclude && n.is_up())
            .collect()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    #[test]
    fn unknown_node_starts_down() {
        let mut table = NodeTable::new();
        let idx = table.get_or_insert("a", addr());
        assert!(!table.nodes[idx].is_up());
    }

    #[test]
    fn newer_timestamp_supersedes_even_with_same_alive_flag() {
        let mut node = SwimNode::new(addr(), "a".to_string());
        node.apply_update(DisseminationUpdateMsg {
            timestamp: 5,
            node_name: "a".to_string(),
            alive: true,
        });
        let applied = node.apply_update(DisseminationUpdateMsg {
            timestamp: 3,
            node_name: "a".to_string(),
            alive: true,
        });
        assert!(!applied);
        assert_eq!(node.update.unwrap().timestamp, 5);
    }

    #[test]
    fn equal_pair_does_not_supersede() {
        let mut node = SwimNode::new(addr(), "a".to_string());
        node.apply_update(DisseminationUpdateMsg {
            timestamp: 5,
            node_name: "a".to_string(),
            alive: true,
        });
        let applied = node.apply_update(DisseminationUpdateMsg {
            timestamp: 5,
            node_name: "a".to_string(),
            alive: true,
        });
        assert!(!applied);
    }

    #[test]
    fn regenerate_outbound_collects_latest_updates_only() {
        let mut table = NodeTable::new();
        let clock = LamportClock::new();
        table.set_up_local("a", addr(), true, &clock);
        table.set_up_local("b", addr(), false, &clock);
        assert_eq!(table.outbound_updates.len(), 2);
    }
}
