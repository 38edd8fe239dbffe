//! Identity registry: which peer id is reachable on which connection.
//!
//! This is the only state shared between connections. Callers hold the
//! [`SharedRegistry`] write lock across any check-then-modify sequence so a
//! frame is never forwarded to a connection that is mid-teardown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use freespeak_common::ServerFrame;
use freespeak_crypto::PeerId;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Identifies one WebSocket connection for the lifetime of the socket.
pub type ConnectionId = Uuid;

/// Queue of encoded frames waiting to be written to one socket.
#[derive(Debug, Clone)]
pub struct Outbox(mpsc::Sender<String>);

impl Outbox {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self(tx)
    }

    /// Queue a frame without waiting. Returns false if the socket is gone or
    /// its queue is full.
    pub fn try_send(&self, frame: &ServerFrame) -> bool {
        self.0.try_send(frame.to_json()).is_ok()
    }

    /// Queue a frame, waiting for space. Errors only once the socket is gone.
    pub async fn send(&self, frame: &ServerFrame) -> bool {
        self.0.send(frame.to_json()).await.is_ok()
    }
}

/// A registered identity and the connection currently serving it.
#[derive(Debug)]
pub struct Entry {
    pub id: PeerId,
    pub pubkey: String,
    pub nonce: String,
    pub conn: ConnectionId,
    pub outbox: Outbox,
    /// Peers that exchanged `accept` or `msg` with this id; each is told
    /// about the disconnect when this entry goes away.
    pub peers: HashSet<PeerId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<PeerId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Entry for `id`, but only while `conn` still owns it.
    pub fn get_owned(&self, id: &str, conn: ConnectionId) -> Option<&Entry> {
        self.entries.get(id).filter(|entry| entry.conn == conn)
    }

    /// Insert or replace. Later registration wins; the replaced entry is
    /// returned so the caller can notify its connection.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.id.clone(), entry)
    }

    /// Remove `id` if `conn` still owns it, unlinking it from every peer.
    ///
    /// Returns the outboxes of the peers that must be told about the
    /// disconnect.
    pub fn remove_owned(&mut self, id: &str, conn: ConnectionId) -> Option<(Entry, Vec<Outbox>)> {
        self.get_owned(id, conn)?;
        let entry = self.entries.remove(id)?;

        let mut notify = Vec::with_capacity(entry.peers.len());
        for peer_id in &entry.peers {
            if let Some(peer) = self.entries.get_mut(peer_id) {
                peer.peers.remove(id);
                notify.push(peer.outbox.clone());
            }
        }
        Some((entry, notify))
    }

    /// Record `a` and `b` as connected to each other. Missing ids are skipped.
    pub fn link(&mut self, a: &PeerId, b: &PeerId) {
        if let Some(entry) = self.entries.get_mut(a) {
            entry.peers.insert(b.clone());
        }
        if let Some(entry) = self.entries.get_mut(b) {
            entry.peers.insert(a.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, conn: ConnectionId) -> (Entry, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let entry = Entry {
            id: PeerId::parse(id).unwrap(),
            pubkey: format!("key-{id}"),
            nonce: format!("nonce-{id}"),
            conn,
            outbox: Outbox::new(tx),
            peers: HashSet::new(),
        };
        (entry, rx)
    }

    #[test]
    fn test_insert_replaces_duplicate_id() {
        let mut registry = Registry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let (a, _rx1) = entry("aaaaaaaa", first);
        assert!(registry.insert(a).is_none());
        let (mut b, _rx2) = entry("aaaaaaaa", second);
        b.pubkey = "newer".into();

        let replaced = registry.insert(b).unwrap();
        assert_eq!(replaced.conn, first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("aaaaaaaa").unwrap().pubkey, "newer");
    }

    #[test]
    fn test_remove_owned_ignores_other_connection() {
        let mut registry = Registry::new();
        let old_conn = Uuid::new_v4();
        let new_conn = Uuid::new_v4();
        let (a, _rx1) = entry("aaaaaaaa", old_conn);
        let (b, _rx2) = entry("aaaaaaaa", new_conn);
        registry.insert(a);
        registry.insert(b);

        assert!(registry.remove_owned("aaaaaaaa", old_conn).is_none());
        assert!(registry.get("aaaaaaaa").is_some());
        assert!(registry.remove_owned("aaaaaaaa", new_conn).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unlinks_peers() {
        let mut registry = Registry::new();
        let (a, _rx_a) = entry("aaaaaaaa", Uuid::new_v4());
        let (b, _rx_b) = entry("bbbbbbbb", Uuid::new_v4());
        let a_conn = a.conn;
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        registry.insert(a);
        registry.insert(b);

        registry.link(&a_id, &b_id);
        assert!(registry.get("bbbbbbbb").unwrap().peers.contains(&a_id));

        let (_, notify) = registry.remove_owned("aaaaaaaa", a_conn).unwrap();
        assert_eq!(notify.len(), 1);
        assert!(registry.get("bbbbbbbb").unwrap().peers.is_empty());
    }

    #[test]
    fn test_link_skips_missing_ids() {
        let mut registry = Registry::new();
        let (a, _rx) = entry("aaaaaaaa", Uuid::new_v4());
        let a_id = a.id.clone();
        registry.insert(a);

        let ghost = PeerId::parse("cccccccc").unwrap();
        registry.link(&a_id, &ghost);
        assert!(registry.get("aaaaaaaa").unwrap().peers.contains(&ghost));
        assert!(registry.get("cccccccc").is_none());
    }
}
