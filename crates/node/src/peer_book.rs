use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bchd_net::external::BanManager;
use bchd_net::peer::Peer;
use serde::{Deserialize, Serialize};

const BAN_THRESHOLD: i32 = 100;
const DEFAULT_BAN_SECS: i64 = 24 * 60 * 60;

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BanEntry {
    pub banned_until: i64,
    pub reason_code: u8,
}

/// Misbehavior scores and timed bans keyed by address.
#[derive(Default)]
pub struct BanBook {
    banned: Mutex<HashMap<IpAddr, BanEntry>>,
}

impl BanBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banned_peers(&self) -> Vec<(IpAddr, BanEntry)> {
        let now = unix_now_secs();
        let Ok(mut banned) = self.banned.lock() else {
            return Vec::new();
        };
        banned.retain(|_, entry| entry.banned_until > now);
        banned.iter().map(|(addr, entry)| (*addr, *entry)).collect()
    }

    pub fn load_entries(&self, entries: Vec<(IpAddr, BanEntry)>) {
        let now = unix_now_secs();
        if let Ok(mut banned) = self.banned.lock() {
            for (addr, entry) in entries {
                if entry.banned_until > now {
                    banned.insert(addr, entry);
                }
            }
        }
    }
}

impl BanManager for BanBook {
    fn misbehaving(&self, peer: &Peer, score: i32) {
        let total = peer
            .misbehavior
            .fetch_add(score, std::sync::atomic::Ordering::Relaxed)
            + score;
        log_warn!(
            "misbehaving: peer {} ({} -> {})",
            peer.log_name(),
            total - score,
            total
        );
        if total >= BAN_THRESHOLD {
            log_warn!(
                "peer {} exceeded ban threshold, disconnecting",
                peer.log_name()
            );
            peer.set_disconnect();
            if !peer.whitelisted {
                self.ban(peer.addr.ip(), "node misbehaving", DEFAULT_BAN_SECS);
            }
        }
    }

    fn ban(&self, addr: IpAddr, reason: &str, seconds: i64) {
        log_warn!("banning {addr} for {seconds}s: {reason}");
        if let Ok(mut banned) = self.banned.lock() {
            let until = unix_now_secs() + seconds;
            let entry = banned.entry(addr).or_insert(BanEntry {
                banned_until: until,
                reason_code: 1,
            });
            if entry.banned_until < until {
                entry.banned_until = until;
            }
        }
    }

    fn is_banned(&self, addr: IpAddr) -> bool {
        let now = unix_now_secs();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(entry) = banned.get(&addr).copied() {
            if entry.banned_until > now {
                return true;
            }
            banned.remove(&addr);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_expires() {
        let book = BanBook::new();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        book.ban(addr, "test", -1);
        assert!(!book.is_banned(addr));
        book.ban(addr, "test", 600);
        assert!(book.is_banned(addr));
    }

    #[test]
    fn threshold_sets_disconnect_and_ban() {
        let book = BanBook::new();
        let (peer, _rx) = Peer::new(1, "10.0.0.2:8333".parse().unwrap(), true, false, 0);
        book.misbehaving(&peer, 50);
        assert!(!peer.is_disconnecting());
        book.misbehaving(&peer, 50);
        assert!(peer.is_disconnecting());
        assert!(book.is_banned("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn whitelisted_peer_is_not_banned() {
        let book = BanBook::new();
        let (peer, _rx) = Peer::new(2, "10.0.0.3:8333".parse().unwrap(), true, true, 0);
        book.misbehaving(&peer, 200);
        assert!(peer.is_disconnecting());
        assert!(!book.is_banned("10.0.0.3".parse().unwrap()));
    }
}
