// File: storage.rs
//
// The purpose of this file is to hold the key-value data this node is
// responsible for (and the replicas it holds on behalf of others), track
// outstanding client GETs until their RESULT arrives or the timeout
// expires, and replicate PUTs to the successor list.

use crate::channel::MessageChannel;
use crate::error::{ChordError, Result};
use crate::msg::{now_secs, Message, NodeInfo};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// A key's value plus the replication metadata needed to answer `stats()`.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    stored_at: f64,
}

/// Snapshot returned by `stats()`: counts of primary and replica entries
/// plus the number of GETs still waiting on a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub primary_count: usize,
    pub replica_count: usize,
    pub pending_requests: usize,
}

/// The outcome of a completed GET, delivered to whichever thread is
/// blocked in `get()`.
#[derive(Debug, Clone)]
struct GetOutcome {
    value: Option<String>,
}

/// Holds this node's primary key-value store, the replicas it keeps for
/// its predecessors, and the bookkeeping for synchronous client GETs.
/// Built against `MessageChannel` so it never depends on a concrete
/// transport.
pub struct Storage {
    local_store: Mutex<HashMap<String, Entry>>,
    replica_store: Mutex<HashMap<String, Entry>>,
    pending: Mutex<HashMap<u64, mpsc::Sender<GetOutcome>>>,
    next_request_id: AtomicU64,
    replication_factor: usize,
    default_timeout: Duration,
}

impl Storage {
    pub fn new(replication_factor: usize, default_timeout: Duration) -> Storage {
        Storage {
            local_store: Mutex::new(HashMap::new()),
            replica_store: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            replication_factor,
            default_timeout,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Writes directly into the primary store, bypassing routing. Used by
    /// the node that actually owns `key`.
    pub fn store_local(&self, key: &str, value: &str) {
        self.local_store.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                stored_at: now_secs(),
            },
        );
    }

    pub fn read_local(&self, key: &str) -> Option<String> {
        self.local_store.lock().get(key).map(|e| e.value.clone())
    }

    /// Writes into the replica store on behalf of a node forwarding its
    /// key to us as one of its `replication_factor - 1` successors.
    pub fn store_replica(&self, key: &str, value: &str) {
        self.replica_store.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                stored_at: now_secs(),
            },
        );
    }

    pub fn read_replica(&self, key: &str) -> Option<String> {
        self.replica_store.lock().get(key).map(|e| e.value.clone())
    }

    /// Sends `key` to the node responsible for it. The owner stores it as
    /// primary and replicates it onward to its own successors; this call
    /// has no say in, and no knowledge of, who those successors are.
    pub fn put(
        &self,
        owner: &NodeInfo,
        key: &str,
        value: &str,
        self_id: &str,
        channel: &dyn MessageChannel,
    ) -> Result<()> {
        let request_id = self.next_id();
        let put_msg = Message::Put {
            sender_id: self_id.to_string(),
            sender_addr: owner.addr.clone(),
            request_id,
            key: key.to_string(),
            value: value.to_string(),
            timestamp: now_secs(),
        };
        channel.request(&owner.addr, put_msg, self.default_timeout)?;
        Ok(())
    }

    /// Issues a GET to `owner` and blocks on a completion channel that
    /// `resolve_result` wakes once the matching RESULT message arrives, or
    /// until `timeout` elapses.
    pub fn get(
        &self,
        owner: &NodeInfo,
        key: &str,
        self_id: &str,
        self_addr: &crate::msg::PeerAddr,
        timeout: Duration,
        channel: &dyn MessageChannel,
    ) -> Result<Option<String>> {
        let request_id = self.next_id();
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(request_id, tx);

        let get_msg = Message::Get {
            sender_id: self_id.to_string(),
            sender_addr: self_addr.clone(),
            request_id,
            key: key.to_string(),
            timestamp: now_secs(),
        };

        match channel.request(&owner.addr, get_msg, timeout) {
            Ok(Message::Result { value, found, .. }) => {
                self.pending.lock().remove(&request_id);
                return Ok(if found { value } else { None });
            }
            Ok(other) => {
                self.pending.lock().remove(&request_id);
                return Err(ChordError::Malformed(format!(
                    "expected RESULT, got {}",
                    other.type_name()
                )));
            }
            Err(ChordError::Timeout) => {
                // The responsible node answers asynchronously elsewhere in
                // the ring's fabric; fall through and wait on the pending
                // map for a RESULT delivered out-of-band.
            }
            Err(e) => {
                self.pending.lock().remove(&request_id);
                return Err(e);
            }
        }

        let outcome = rx.recv_timeout(timeout);
        self.pending.lock().remove(&request_id);
        match outcome {
            Ok(outcome) => Ok(outcome.value),
            Err(_) => Err(ChordError::Timeout),
        }
    }

    /// Called when a RESULT message arrives out-of-band (not as the direct
    /// reply to a blocking `request()`); wakes the matching pending GET if
    /// one is still waiting.
    pub fn resolve_result(&self, request_id: u64, value: Option<String>, found: bool) {
        if let Some(tx) = self.pending.lock().remove(&request_id) {
            let _ = tx.send(GetOutcome {
                value: if found { value } else { None },
            });
        } else {
            debug!("dropping RESULT for unknown request {}", request_id);
        }
    }

    /// Answers an inbound GET against our own primary store.
    pub fn handle_get(&self, sender_id: &str, request_id: u64, key: &str, self_id: &str) -> Message {
        let value = self.read_local(key);
        let found = value.is_some();
        debug!("GET {:?} from {} -> found={}", key, sender_id, found);
        Message::Result {
            sender_id: self_id.to_string(),
            request_id,
            key: key.to_string(),
            value,
            found,
            node: self_id.to_string(),
            timestamp: now_secs(),
        }
    }

    /// How many distinct successors a primary write should replicate to.
    pub fn replica_width(&self) -> usize {
        self.replication_factor.saturating_sub(1)
    }

    /// Answers an inbound PUT against our own primary store: stores `key`
    /// as primary, fires REPLICATE at each of `replicas` (already resolved
    /// by the caller to this node's own successor chain, up to
    /// `replica_width()` entries), and reports how many actually went out.
    /// Replication failures are logged, not propagated: a PUT succeeds
    /// once the primary write lands.
    pub fn handle_put(
        &self,
        key: &str,
        value: &str,
        self_info: &NodeInfo,
        request_id: u64,
        replicas: &[NodeInfo],
        channel: &dyn MessageChannel,
    ) -> Message {
        self.store_local(key, value);

        let mut replicated = 0;
        for replica in replicas {
            let replicate_msg = Message::Replicate {
                sender_id: self_info.id.to_hex(),
                sender_addr: self_info.addr.clone(),
                request_id: self.next_id(),
                key: key.to_string(),
                value: value.to_string(),
                timestamp: now_secs(),
            };
            match channel.send(&replica.addr, replicate_msg) {
                Ok(()) => replicated += 1,
                Err(e) => warn!("replication of {:?} to {:?} failed: {}", key, replica.addr, e),
            }
        }
        debug!("PUT {:?}: stored as primary, replicated to {}/{}", key, replicated, replicas.len());

        Message::Result {
            sender_id: self_info.id.to_hex(),
            request_id,
            key: key.to_string(),
            value: Some(value.to_string()),
            found: true,
            node: self_info.id.to_hex(),
            timestamp: now_secs(),
        }
    }

    pub fn handle_replicate(&self, key: &str, value: &str) {
        self.store_replica(key, value);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            primary_count: self.local_store.lock().len(),
            replica_count: self.replica_store.lock().len(),
            pending_requests: self.pending.lock().len(),
        }
    }

    /// Fails every GET still waiting past its deadline, so a thread blocked
    /// in `get()` is never woken only by its own timeout while a stray
    /// RESULT for a different purpose sits unclaimed.
    pub fn sweep_expired(&self) {
        // `rx.recv_timeout` inside `get()` already enforces the deadline
        // per caller; this exists so a maintenance thread can periodically
        // shed entries for callers that gave up without waiting out the
        // full timeout (e.g. a dropped connection).
        let mut pending = self.pending.lock();
        pending.retain(|_, tx| tx.send(GetOutcome { value: None }).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FakeChannel, FakeNetwork};
    use crate::hash;
    use crate::msg::PeerAddr;

    fn node_info(port: u16) -> NodeInfo {
        let addr = PeerAddr::new("127.0.0.1", port);
        NodeInfo::new(addr.clone(), hash::hash(&addr.as_node_name()))
    }

    #[test]
    fn store_and_read_local_round_trips() {
        let storage = Storage::new(2, Duration::from_millis(100));
        storage.store_local("k1", "v1");
        assert_eq!(storage.read_local("k1"), Some("v1".to_string()));
        assert_eq!(storage.read_local("missing"), None);
    }

    #[test]
    fn handle_get_reports_found_and_not_found() {
        let storage = Storage::new(2, Duration::from_millis(100));
        storage.store_local("k1", "v1");
        let found = storage.handle_get("peer", 1, "k1", "self");
        assert!(matches!(found, Message::Result { found: true, .. }));
        let missing = storage.handle_get("peer", 2, "nope", "self");
        assert!(matches!(missing, Message::Result { found: false, .. }));
    }

    #[test]
    fn put_reaches_owner_and_replicates_to_successors() {
        let owner = node_info(9000);
        let replica = node_info(9001);
        let net = FakeNetwork::new();

        let owner_storage = std::sync::Arc::new(Storage::new(2, Duration::from_millis(200)));
        let replica_storage = std::sync::Arc::new(Storage::new(2, Duration::from_millis(200)));

        {
            let owner_storage = owner_storage.clone();
            let owner_info = owner.clone();
            let replica_info = replica.clone();
            let net_for_replicate = net.clone();
            net.register(owner.addr.clone(), move |msg| match msg {
                Message::Put { key, value, request_id, .. } => {
                    let replicate_channel = FakeChannel::new(net_for_replicate.clone());
                    Some(owner_storage.handle_put(
                        &key,
                        &value,
                        &owner_info,
                        request_id,
                        &[replica_info.clone()],
                        &replicate_channel,
                    ))
                }
                _ => None,
            });
        }
        {
            let replica_storage = replica_storage.clone();
            net.register(replica.addr.clone(), move |msg| match msg {
                Message::Replicate { key, value, .. } => {
                    replica_storage.handle_replicate(&key, &value);
                    None
                }
                _ => None,
            });
        }

        let channel = FakeChannel::new(net);
        owner_storage
            .put(&owner, "k1", "v1", "client", &channel)
            .unwrap();

        assert_eq!(owner_storage.read_local("k1"), Some("v1".to_string()));
        assert_eq!(replica_storage.read_replica("k1"), Some("v1".to_string()));
    }

    #[test]
    fn get_times_out_when_owner_never_replies() {
        let owner = node_info(9002);
        let net = FakeNetwork::new();
        net.register(owner.addr.clone(), |_| None);
        let channel = FakeChannel::new(net);

        let storage = Storage::new(2, Duration::from_millis(50));
        let self_addr = PeerAddr::new("127.0.0.1", 9999);
        let result = storage.get(&owner, "k1", "client", &self_addr, Duration::from_millis(50), &channel);
        assert!(result.is_err());
    }

    #[test]
    fn stats_reflects_primary_replica_and_pending_counts() {
        let storage = Storage::new(2, Duration::from_millis(100));
        storage.store_local("a", "1");
        storage.store_replica("b", "2");
        let stats = storage.stats();
        assert_eq!(stats.primary_count, 1);
        assert_eq!(stats.replica_count, 1);
        assert_eq!(stats.pending_requests, 0);
    }
}
