//! Server-side peer membership state.
//!
//! The directory is the only structure touched by more than one request
//! handler. One mutex guards the whole map; every operation is a single
//! short critical section, so registration, heartbeat, logout and the
//! reaper sweep never interleave on a key.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One registered peer. Created on REGISTER, refreshed on HEARTBEAT,
/// replaced wholesale on re-REGISTER, removed on LOGOUT or eviction.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub username: String,
    pub addr: IpAddr,
    pub port: u16,
    last_seen: Instant,
}

/// Registration refused: the name belongs to a live peer.
#[derive(Debug, PartialEq, Eq)]
pub struct AlreadyTaken;

/// Shared handle to the peer map. Clones refer to the same state.
#[derive(Clone)]
pub struct Directory {
    peers: Arc<Mutex<HashMap<String, PeerRecord>>>,
    timeout: Duration,
}

impl Directory {
    /// `timeout` is how long a peer may stay silent before it no longer
    /// counts as live.
    pub fn new(timeout: Duration) -> Self {
        Directory {
            peers: Default::default(),
            timeout,
        }
    }

    /// Claim `username` for the peer at `addr:port`. Fails if the name is
    /// held by a record that has not yet expired; an expired holder is
    /// overwritten in place of waiting for the next sweep.
    pub fn register(&self, username: &str, addr: IpAddr, port: u16) -> Result<(), AlreadyTaken> {
        let mut peers = self.peers.lock().unwrap();

        if let Some(existing) = peers.get(username) {
            if existing.last_seen.elapsed() <= self.timeout {
                return Err(AlreadyTaken);
            }
        }

        peers.insert(
            username.to_string(),
            PeerRecord {
                username: username.to_string(),
                addr,
                port,
                last_seen: Instant::now(),
            },
        );

        Ok(())
    }

    /// Refresh a peer's liveness stamp. Unknown names are not an error,
    /// heartbeats may race logout or eviction.
    pub fn touch(&self, username: &str) -> bool {
        match self.peers.lock().unwrap().get_mut(username) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop a peer if present. Idempotent.
    pub fn remove(&self, username: &str) {
        self.peers.lock().unwrap().remove(username);
    }

    /// Copy of every live record. Records past the timeout are excluded
    /// even when the reaper has not swept them away yet.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.last_seen.elapsed() <= self.timeout)
            .cloned()
            .collect()
    }

    /// Remove every record past the timeout, returning the evicted names.
    /// The decision is made against the latest `last_seen` under the lock,
    /// so a heartbeat that landed first always wins.
    pub fn evict_expired(&self) -> Vec<String> {
        let mut evicted = Vec::new();

        self.peers.lock().unwrap().retain(|username, record| {
            let live = record.last_seen.elapsed() <= self.timeout;
            if !live {
                evicted.push(username.clone());
            }
            live
        });

        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    const SHORT: Duration = Duration::from_millis(100);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn register_then_snapshot() {
        let dir = Directory::new(SHORT);
        assert_eq!(dir.register("alice", ip(1), 5000), Ok(()));

        let snap = dir.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].username, "alice");
        assert_eq!(snap[0].addr, ip(1));
        assert_eq!(snap[0].port, 5000);
    }

    #[test]
    fn live_name_is_taken() {
        let dir = Directory::new(Duration::from_secs(30));
        dir.register("carol", ip(1), 5000).unwrap();

        assert_eq!(dir.register("carol", ip(2), 6000), Err(AlreadyTaken));

        // the conflicting attempt must not have touched the record
        let snap = dir.snapshot();
        assert_eq!(snap[0].addr, ip(1));
        assert_eq!(snap[0].port, 5000);
    }

    #[test]
    fn expired_name_is_reusable() {
        let dir = Directory::new(SHORT);
        dir.register("alice", ip(1), 5000).unwrap();
        sleep(SHORT * 2);

        assert_eq!(dir.register("alice", ip(2), 6000), Ok(()));
        let snap = dir.snapshot();
        assert_eq!(snap[0].addr, ip(2));
    }

    #[test]
    fn removed_name_is_reusable() {
        let dir = Directory::new(Duration::from_secs(30));
        dir.register("alice", ip(1), 5000).unwrap();
        dir.remove("alice");
        assert_eq!(dir.register("alice", ip(2), 6000), Ok(()));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = Directory::new(SHORT);
        dir.remove("ghost");
        dir.register("alice", ip(1), 5000).unwrap();
        dir.remove("alice");
        dir.remove("alice");
        assert!(dir.snapshot().is_empty());
    }

    #[test]
    fn touch_unknown_is_ignored() {
        let dir = Directory::new(SHORT);
        assert!(!dir.touch("ghost"));
        assert!(dir.snapshot().is_empty());
    }

    #[test]
    fn sweep_evicts_silent_peers() {
        let dir = Directory::new(SHORT);
        dir.register("alice", ip(1), 5000).unwrap();
        dir.register("bob", ip(2), 6000).unwrap();
        sleep(SHORT / 2);
        assert!(dir.touch("bob"));
        sleep(SHORT * 3 / 4);

        // alice has been silent past the timeout, bob heartbeated in time
        let evicted = dir.evict_expired();
        assert_eq!(evicted, vec!["alice".to_string()]);

        let snap = dir.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].username, "bob");
    }

    #[test]
    fn snapshot_hides_expired_records() {
        let dir = Directory::new(SHORT);
        dir.register("alice", ip(1), 5000).unwrap();
        sleep(SHORT * 2);

        // not swept yet, but no longer live
        assert!(dir.snapshot().is_empty());
    }
}
