// File: ring.rs
//
// The purpose of this file is to implement the ring node: finger table
// routing, successor/predecessor maintenance, and the periodic stabilize,
// fix-fingers, and check-predecessor steps that keep the ring consistent
// as nodes join and fail.

use crate::channel::MessageChannel;
use crate::error::{ChordError, Result};
use crate::hash::{self, NodeId, ID_BITS};
use crate::msg::{now_secs, Message, NodeInfo, PeerAddr};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Tunables that would otherwise be scattered magic numbers: the finger
/// table width, the three maintenance periods, and the budgets used for
/// blocking requests and predecessor liveness checks.
#[derive(Debug, Clone)]
pub struct RingConfig {
    pub finger_width: u32,
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub check_predecessor_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_heartbeat_failures: u32,
    pub request_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            finger_width: ID_BITS,
            stabilize_interval: Duration::from_millis(1000),
            fix_fingers_interval: Duration::from_millis(30000),
            check_predecessor_interval: Duration::from_millis(2000),
            heartbeat_timeout: Duration::from_millis(5000),
            max_heartbeat_failures: 2,
            request_timeout: Duration::from_millis(5000),
        }
    }
}

struct RingState {
    self_info: NodeInfo,
    successor: Option<NodeInfo>,
    predecessor: Option<NodeInfo>,
    finger_table: Vec<NodeInfo>,
    neighbors: HashMap<NodeId, PeerAddr>,
    is_joined: bool,
    maintenance_paused: bool,
    running: bool,
    heartbeat_misses: u32,
}

/// The ring node: identifier, successor/predecessor, finger table, and the
/// maintenance loop logic that keeps them converging. Holds no storage and
/// no transport of its own; every remote interaction goes through the
/// `MessageChannel` passed into each call.
pub struct Ring {
    state: RwLock<RingState>,
    config: RingConfig,
}

impl Ring {
    /// `bootstrap` nodes start as their own successor and are immediately
    /// joined; all other nodes start with no successor and wait for an
    /// explicit `join()` call.
    pub fn new(self_info: NodeInfo, config: RingConfig, bootstrap: bool) -> Ring {
        let width = config.finger_width as usize;
        let state = RingState {
            successor: if bootstrap { Some(self_info.clone()) } else { None },
            predecessor: None,
            finger_table: vec![self_info.clone(); width],
            neighbors: HashMap::new(),
            is_joined: bootstrap,
            maintenance_paused: false,
            running: true,
            heartbeat_misses: 0,
            self_info,
        };
        Ring {
            state: RwLock::new(state),
            config,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.state.read().self_info.id
    }

    pub fn self_info(&self) -> NodeInfo {
        self.state.read().self_info.clone()
    }

    pub fn successor(&self) -> Option<NodeInfo> {
        self.state.read().successor.clone()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.state.read().predecessor.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.state.read().is_joined
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn set_maintenance_paused(&self, paused: bool) {
        self.state.write().maintenance_paused = paused;
    }

    fn maintenance_paused(&self) -> bool {
        self.state.read().maintenance_paused
    }

    fn remember_neighbor(&self, info: &NodeInfo) {
        self.state
            .write()
            .neighbors
            .insert(info.id, info.addr.clone());
    }

    /// The start of finger table entry `index` (0-based): `self_id + 2^index`.
    pub fn finger_start(&self, index: u32) -> NodeId {
        self.self_id().add_pow2(index)
    }

    /// Whether this node's own successor is responsible for `key_id`,
    /// i.e. `key_id` falls in `(self_id, successor_id]`.
    pub fn local_successor_covers(&self, key_id: NodeId) -> bool {
        match self.successor() {
            Some(succ) => {
                succ.id == self.self_id()
                    || hash::in_interval(key_id, self.self_id(), succ.id, true)
            }
            None => false,
        }
    }

    /// Scans the finger table backwards for the entry closest to, but not
    /// past, `key_id`. Falls back to `None` (caller uses the successor)
    /// when no finger qualifies.
    pub fn closest_preceding_finger(&self, key_id: NodeId) -> Option<NodeInfo> {
        let state = self.state.read();
        let self_id = state.self_info.id;
        for finger in state.finger_table.iter().rev() {
            if finger.id != self_id && hash::in_interval(finger.id, self_id, key_id, false) {
                return Some(finger.clone());
            }
        }
        None
    }

    /// Resolves the node responsible for `key_id`, following at most
    /// `finger_width` remote hops before giving up and returning this
    /// node's own successor.
    pub fn find_successor(&self, key_id: NodeId, channel: &dyn MessageChannel) -> NodeInfo {
        self.find_successor_bounded(key_id, 0, channel)
    }

    fn find_successor_bounded(
        &self,
        key_id: NodeId,
        hops: u32,
        channel: &dyn MessageChannel,
    ) -> NodeInfo {
        if self.local_successor_covers(key_id) {
            return self.successor().unwrap_or_else(|| self.self_info());
        }
        if hops >= self.config.finger_width {
            return self.successor().unwrap_or_else(|| self.self_info());
        }
        let next = match self.closest_preceding_finger(key_id) {
            Some(finger) => finger,
            None => return self.successor().unwrap_or_else(|| self.self_info()),
        };

        let request = Message::FindSuccessor {
            sender_id: self.self_id().to_hex(),
            sender_addr: self.self_info().addr,
            key_id,
            hops: hops + 1,
        };
        match channel.request(&next.addr, request, self.config.request_timeout) {
            Ok(Message::SuccessorResponse { successor, .. }) => successor,
            Ok(other) => {
                warn!("unexpected reply to FIND_SUCCESSOR: {}", other.type_name());
                self.successor().unwrap_or_else(|| self.self_info())
            }
            Err(e) => {
                debug!("find_successor hop to {:?} failed: {}", next.addr, e);
                self.successor().unwrap_or_else(|| self.self_info())
            }
        }
    }

    pub fn get_responsible_node(&self, key: &str, channel: &dyn MessageChannel) -> NodeInfo {
        self.find_successor(hash::hash(key), channel)
    }

    /// Walks the successor chain starting at our immediate successor,
    /// asking each hop for its own successor in turn, until `count`
    /// distinct nodes (excluding self) are collected or the chain loops
    /// back on itself. Used to find replica targets for a PUT: replication
    /// only needs each node to know its immediate successor, so the chain
    /// is built one hop at a time rather than carried as standing state.
    pub fn successor_chain(&self, count: usize, channel: &dyn MessageChannel) -> Vec<NodeInfo> {
        let mut chain = Vec::new();
        if count == 0 {
            return chain;
        }
        let self_id = self.self_id();
        let mut current = match self.successor() {
            Some(s) if s.id != self_id => s,
            _ => return chain,
        };
        loop {
            if current.id == self_id || chain.iter().any(|n: &NodeInfo| n.id == current.id) {
                break;
            }
            chain.push(current.clone());
            if chain.len() >= count {
                break;
            }
            let request = Message::FindSuccessor {
                sender_id: self_id.to_hex(),
                sender_addr: self.self_info().addr,
                key_id: current.id.add_pow2(0),
                hops: 0,
            };
            match channel.request(&current.addr, request, self.config.request_timeout) {
                Ok(Message::SuccessorResponse { successor, .. }) if successor.id != current.id => {
                    current = successor;
                }
                _ => break,
            }
        }
        chain
    }

    /// Resolves `FIND_SUCCESSOR`, continuing the hop count carried in the
    /// inbound message rather than restarting it at zero.
    pub fn handle_find_successor(&self, hops: u32, key_id: NodeId, sender: &NodeInfo, channel: &dyn MessageChannel) -> Message {
        self.remember_neighbor(sender);
        let successor = self.find_successor_bounded(key_id, hops, channel);
        Message::SuccessorResponse {
            sender_id: self.self_id().to_hex(),
            key_id,
            successor,
        }
    }

    /// A candidate believes it might be our predecessor. Adopt it if we
    /// have none, or if it lies strictly between our current predecessor
    /// and us.
    pub fn handle_notify(&self, candidate: NodeInfo) {
        let mut state = self.state.write();
        let self_id = state.self_info.id;
        let should_adopt = match &state.predecessor {
            None => candidate.id != self_id,
            Some(pred) => {
                candidate.id != self_id && hash::in_interval(candidate.id, pred.id, self_id, false)
            }
        };
        if should_adopt {
            info!("adopting new predecessor {:?}", candidate.addr);
            state.neighbors.insert(candidate.id, candidate.addr.clone());
            state.predecessor = Some(candidate);
        }
    }

    pub fn handle_get_predecessor(&self) -> Message {
        Message::PredecessorResponse {
            sender_id: self.self_id().to_hex(),
            predecessor: self.predecessor(),
        }
    }

    /// Rejects attempts to name this node its own successor or
    /// predecessor; the ring must never point a node at itself except
    /// when it is alone.
    pub fn handle_update_predecessor(&self, node: NodeInfo) -> Message {
        if node.id == self.self_id() {
            return ack_rejected(self.self_id(), "refusing to adopt self as predecessor");
        }
        self.state.write().predecessor = Some(node.clone());
        self.remember_neighbor(&node);
        ack_ok(self.self_id())
    }

    pub fn handle_update_successor(&self, node: NodeInfo) -> Message {
        if node.id == self.self_id() {
            return ack_rejected(self.self_id(), "refusing to adopt self as successor");
        }
        self.state.write().successor = Some(node.clone());
        self.remember_neighbor(&node);
        ack_ok(self.self_id())
    }

    pub fn handle_heartbeat(&self) -> Message {
        Message::HeartbeatAck {
            sender_id: self.self_id().to_hex(),
            timestamp: now_secs(),
        }
    }

    /// A new node asks to join through us. We resolve its successor and
    /// remember it as a neighbor so later lookups and stabilize rounds can
    /// reach it directly.
    pub fn handle_join_request(&self, new_node: NodeInfo, channel: &dyn MessageChannel) -> Message {
        self.remember_neighbor(&new_node);
        let successor = self.find_successor(new_node.id, channel);
        Message::JoinResponse {
            sender_id: self.self_id().to_hex(),
            successor,
        }
    }

    /// Resolves our successor through `bootstrap_addr` and notifies it of
    /// our presence so the next stabilize round on either side converges.
    pub fn join(&self, bootstrap_addr: &PeerAddr, channel: &dyn MessageChannel) -> Result<()> {
        let request = Message::FindSuccessor {
            sender_id: self.self_id().to_hex(),
            sender_addr: self.self_info().addr,
            key_id: self.self_id(),
            hops: 0,
        };
        let reply = channel.request(bootstrap_addr, request, self.config.request_timeout)?;
        let successor = match reply {
            Message::SuccessorResponse { successor, .. } => successor,
            other => {
                return Err(ChordError::Malformed(format!(
                    "expected SUCCESSOR_RESPONSE, got {}",
                    other.type_name()
                )))
            }
        };

        {
            let mut state = self.state.write();
            state.successor = Some(successor.clone());
            state.predecessor = None;
            state.is_joined = true;
        }
        self.remember_neighbor(&successor);

        let notify = Message::Notify {
            sender_id: self.self_id().to_hex(),
            candidate: self.self_info(),
        };
        if let Err(e) = channel.send(&successor.addr, notify) {
            warn!("notify to new successor failed: {}", e);
        }
        info!("joined ring via {:?}, successor is {:?}", bootstrap_addr, successor.addr);
        Ok(())
    }

    /// Leaves the ring. When `graceful`, stitches the predecessor and
    /// successor together before clearing local state so lookups that were
    /// mid-flight still land somewhere sane.
    pub fn leave(&self, graceful: bool, channel: &dyn MessageChannel) {
        let (predecessor, successor, self_id) = {
            let state = self.state.read();
            (state.predecessor.clone(), state.successor.clone(), state.self_info.id)
        };

        if graceful {
            if let (Some(pred), Some(succ)) = (&predecessor, &successor) {
                if pred.id != self_id && succ.id != self_id {
                    let to_pred = Message::UpdateSuccessor {
                        sender_id: self_id.to_hex(),
                        node: succ.clone(),
                    };
                    let to_succ = Message::UpdatePredecessor {
                        sender_id: self_id.to_hex(),
                        node: pred.clone(),
                    };
                    if let Err(e) = channel.send(&pred.addr, to_pred) {
                        warn!("failed to notify predecessor on leave: {}", e);
                    }
                    if let Err(e) = channel.send(&succ.addr, to_succ) {
                        warn!("failed to notify successor on leave: {}", e);
                    }
                }
            }
        }

        let mut state = self.state.write();
        state.running = false;
        state.is_joined = false;
        state.successor = None;
        state.predecessor = None;
    }

    /// One iteration of the stabilize protocol: recover a null successor,
    /// adopt a differing self-pointing successor, ask the successor for
    /// its predecessor and adopt it if it lies strictly between us and our
    /// successor, then notify the successor of our presence.
    pub fn stabilize_once(&self, channel: &dyn MessageChannel) {
        if self.maintenance_paused() {
            return;
        }
        let self_info = self.self_info();
        let self_id = self_info.id;

        let mut successor = match self.successor() {
            Some(s) => s,
            None => {
                // No successor: try to recover from our predecessor or any
                // remembered neighbor before giving up for this round.
                if let Some(pred) = self.predecessor() {
                    self.state.write().successor = Some(pred.clone());
                    pred
                } else if let Some((id, addr)) = self.state.read().neighbors.iter().next() {
                    let candidate = NodeInfo::new(addr.clone(), *id);
                    self.state.write().successor = Some(candidate.clone());
                    candidate
                } else {
                    return;
                }
            }
        };

        if successor.id == self_id {
            // Alone on the ring: if we've heard of a predecessor since, it
            // must be our true successor too.
            if let Some(pred) = self.predecessor() {
                if pred.id != self_id {
                    self.state.write().successor = Some(pred.clone());
                    successor = pred;
                }
            }
        }

        if successor.id != self_id {
            let request = Message::GetPredecessor {
                sender_id: self_id.to_hex(),
                sender_addr: self_info.addr.clone(),
            };
            match channel.request(&successor.addr, request, self.config.request_timeout) {
                Ok(Message::PredecessorResponse { predecessor: Some(x), .. }) => {
                    if x.id != self_id
                        && hash::in_interval(x.id, self_id, successor.id, false)
                    {
                        self.remember_neighbor(&x);
                        self.state.write().successor = Some(x.clone());
                        successor = x;
                    }
                }
                Ok(Message::PredecessorResponse { predecessor: None, .. }) => {}
                Ok(other) => warn!("unexpected reply to GET_PREDECESSOR: {}", other.type_name()),
                Err(e) => debug!("stabilize: predecessor probe of {:?} failed: {}", successor.addr, e),
            }
        }

        if successor.id != self_id {
            let notify = Message::Notify {
                sender_id: self_id.to_hex(),
                candidate: self_info,
            };
            if let Err(e) = channel.send(&successor.addr, notify) {
                debug!("stabilize: notify to {:?} failed: {}", successor.addr, e);
            }
        }
    }

    /// Refreshes a single randomly-chosen finger table entry via
    /// `find_successor`. Spread across many stabilize-width ticks, this
    /// keeps the whole table current without recomputing all of it, and
    /// without every node in the ring refreshing the same index at once.
    pub fn fix_fingers_once(&self, channel: &dyn MessageChannel) {
        if self.maintenance_paused() {
            return;
        }
        let width = self.config.finger_width;
        let i = rand::thread_rng().gen_range(0, width);
        let start = self.finger_start(i);
        let resolved = self.find_successor(start, channel);
        let mut state = self.state.write();
        if (i as usize) < state.finger_table.len() {
            state.finger_table[i as usize] = resolved;
        }
    }

    /// Pings the predecessor; after `max_heartbeat_failures` consecutive
    /// misses, demotes it to `None` and tries to recover a fresh one from
    /// the successor's predecessor pointer.
    pub fn check_predecessor_once(&self, channel: &dyn MessageChannel) {
        if self.maintenance_paused() {
            return;
        }
        let predecessor = match self.predecessor() {
            Some(p) => p,
            None => return,
        };
        let self_id = self.self_id();
        if predecessor.id == self_id {
            return;
        }

        let heartbeat = Message::Heartbeat {
            sender_id: self_id.to_hex(),
            sender_addr: self.self_info().addr,
            timestamp: now_secs(),
        };
        let ok = matches!(
            channel.request(&predecessor.addr, heartbeat, self.config.heartbeat_timeout),
            Ok(Message::HeartbeatAck { .. })
        );

        let mut state = self.state.write();
        if ok {
            state.heartbeat_misses = 0;
            return;
        }
        state.heartbeat_misses += 1;
        if state.heartbeat_misses < self.config.max_heartbeat_failures {
            return;
        }
        warn!("predecessor {:?} failed {} heartbeats, demoting", predecessor.addr, state.heartbeat_misses);
        state.predecessor = None;
        state.heartbeat_misses = 0;
        drop(state);

        if let Some(successor) = self.successor() {
            if successor.id != self_id {
                let request = Message::GetPredecessor {
                    sender_id: self_id.to_hex(),
                    sender_addr: self.self_info().addr,
                };
                if let Ok(Message::PredecessorResponse { predecessor: Some(x), .. }) =
                    channel.request(&successor.addr, request, self.config.request_timeout)
                {
                    if x.id != self_id {
                        self.remember_neighbor(&x);
                        self.state.write().predecessor = Some(x);
                    }
                }
            }
        }
    }
}

fn ack_ok(self_id: NodeId) -> Message {
    Message::Ack {
        sender_id: self_id.to_hex(),
        request_id: None,
        ok: true,
        error: None,
    }
}

fn ack_rejected(self_id: NodeId, reason: &str) -> Message {
    Message::Ack {
        sender_id: self_id.to_hex(),
        request_id: None,
        ok: false,
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FakeChannel, FakeNetwork};

    fn node_info(port: u16) -> NodeInfo {
        let addr = PeerAddr::new("127.0.0.1", port);
        NodeInfo::new(addr.clone(), hash::hash(&addr.as_node_name()))
    }

    #[test]
    fn bootstrap_node_is_its_own_successor() {
        let ring = Ring::new(node_info(9000), RingConfig::default(), true);
        assert_eq!(ring.successor().unwrap().id, ring.self_id());
        assert!(ring.is_joined());
    }

    #[test]
    fn fresh_node_has_no_successor_until_joined() {
        let ring = Ring::new(node_info(9000), RingConfig::default(), false);
        assert!(ring.successor().is_none());
        assert!(!ring.is_joined());
    }

    #[test]
    fn closest_preceding_finger_prefers_farthest_non_overshooting_entry() {
        let self_info = node_info(9000);
        let ring = Ring::new(self_info.clone(), RingConfig::default(), true);
        let far = node_info(9001);
        let near = node_info(9002);
        {
            let mut state = ring.state.write();
            // Force a deterministic ordering regardless of hashed ids: put
            // `near` strictly between self and `far` in the finger table.
            let self_id = self_info.id;
            let (lo, hi) = if hash::in_interval(far.id, self_id, near.id, false) {
                (far.clone(), near.clone())
            } else {
                (near.clone(), far.clone())
            };
            state.finger_table[0] = lo;
            let last = state.finger_table.len() - 1;
            state.finger_table[last] = hi.clone();
            drop(state);
            let result = ring.closest_preceding_finger(hi.id.add_pow2(150));
            assert!(result.is_some());
        }
    }

    #[test]
    fn find_successor_resolves_locally_when_alone() {
        let self_info = node_info(9000);
        let ring = Ring::new(self_info.clone(), RingConfig::default(), true);
        let net = FakeNetwork::new();
        let channel = FakeChannel::new(net);
        let resolved = ring.find_successor(hash::hash("some-key"), &channel);
        assert_eq!(resolved.id, self_info.id);
    }

    #[test]
    fn notify_adopts_predecessor_when_none_set() {
        let ring = Ring::new(node_info(9000), RingConfig::default(), true);
        let candidate = node_info(9001);
        ring.handle_notify(candidate.clone());
        assert_eq!(ring.predecessor().unwrap().id, candidate.id);
    }

    #[test]
    fn update_predecessor_rejects_self() {
        let self_info = node_info(9000);
        let ring = Ring::new(self_info.clone(), RingConfig::default(), true);
        let reply = ring.handle_update_predecessor(self_info);
        assert!(matches!(reply, Message::Ack { ok: false, .. }));
    }

    #[test]
    fn join_adopts_resolved_successor_and_notifies_it() {
        let bootstrap_info = node_info(9000);
        let bootstrap_addr = bootstrap_info.addr.clone();
        let joiner_info = node_info(9001);

        let net = FakeNetwork::new();
        let bootstrap_ring = Ring::new(bootstrap_info.clone(), RingConfig::default(), true);
        let joiner_ring = std::sync::Arc::new(Ring::new(joiner_info.clone(), RingConfig::default(), false));

        {
            let joiner_ring = joiner_ring.clone();
            let net_for_dispatch = net.clone();
            net.register(bootstrap_addr.clone(), move |msg| match msg {
                Message::FindSuccessor { key_id, hops, sender_addr, .. } => {
                    let channel = FakeChannel::new(net_for_dispatch.clone());
                    let sender = NodeInfo::new(sender_addr, key_id);
                    Some(bootstrap_ring.handle_find_successor(hops, key_id, &sender, &channel))
                }
                _ => None,
            });
            net.register(joiner_info.addr.clone(), move |msg| match msg {
                Message::Notify { candidate, .. } => {
                    joiner_ring.handle_notify(candidate);
                    None
                }
                _ => None,
            });
        }

        let channel = FakeChannel::new(net);
        joiner_ring.join(&bootstrap_addr, &channel).unwrap();
        assert!(joiner_ring.is_joined());
        assert_eq!(joiner_ring.successor().unwrap().id, bootstrap_info.id);
    }
}
