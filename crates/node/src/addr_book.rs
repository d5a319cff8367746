use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bchd_net::external::AddrManager;
use bchd_net::message::{NetAddress, TimedNetAddress};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const ADDR_BOOK_MAX: usize = 5_000;
const ADDR_BOOK_SAMPLE: usize = 1_000;
const STALE_AFTER_SECS: u64 = 30 * 24 * 60 * 60;

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct AddrBookEntry {
    pub last_seen: u64,
    pub last_success: u64,
    pub last_failure: u64,
    pub successes: u32,
    pub failures: u32,
    pub evictions: u32,
    pub services: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct AddrBookFile {
    version: u32,
    entries: Vec<(SocketAddr, AddrBookEntry)>,
}

const ADDR_FILE_VERSION: u32 = 1;

/// A scored address book backing the `AddrManager` seam. Eviction policy
/// stays simple: stale and repeatedly failing entries are pruned first.
#[derive(Default)]
pub struct AddrBook {
    entries: Mutex<HashMap<SocketAddr, AddrBookEntry>>,
}

fn addr_score(entry: &AddrBookEntry, now: u64) -> i64 {
    let mut score = entry.successes as i64 * 4 - entry.failures as i64 * 2
        - entry.evictions as i64;
    if entry.last_success > 0 && now.saturating_sub(entry.last_success) < 24 * 60 * 60 {
        score += 8;
    }
    if now.saturating_sub(entry.last_seen) > STALE_AFTER_SECS {
        score -= 16;
    }
    score
}

fn prune(entries: &mut HashMap<SocketAddr, AddrBookEntry>, now: u64) {
    if entries.len() < ADDR_BOOK_MAX {
        return;
    }
    let mut scored: Vec<(SocketAddr, i64)> = entries
        .iter()
        .map(|(addr, entry)| (*addr, addr_score(entry, now)))
        .collect();
    scored.sort_by_key(|(_, score)| *score);
    for (addr, _) in scored.into_iter().take(entries.len() / 10 + 1) {
        entries.remove(&addr);
    }
}

impl AddrBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&self, limit: usize) -> Vec<SocketAddr> {
        let now = unix_now_secs();
        let Ok(book) = self.entries.lock() else {
            return Vec::new();
        };
        let mut scored: Vec<(SocketAddr, i64)> = book
            .iter()
            .map(|(addr, entry)| (*addr, addr_score(entry, now)))
            .filter(|(_, score)| *score > -16)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        let top = scored.len().min(limit.saturating_mul(4).max(limit));
        let mut addrs: Vec<SocketAddr> = scored
            .into_iter()
            .take(top)
            .map(|(addr, _)| addr)
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(limit);
        addrs
    }

    pub fn record_attempt(&self, addr: SocketAddr) {
        if let Ok(mut book) = self.entries.lock() {
            book.entry(addr).or_default();
        }
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        let now = unix_now_secs();
        if let Ok(mut book) = self.entries.lock() {
            let entry = book.entry(addr).or_default();
            entry.last_failure = now;
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    pub fn load_file(&self, path: &Path) -> Result<usize, String> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        let file: AddrBookFile = serde_json::from_slice(&bytes)
            .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
        if file.version != ADDR_FILE_VERSION {
            return Err(format!("unsupported peers file version {}", file.version));
        }
        let count = file.entries.len();
        if let Ok(mut book) = self.entries.lock() {
            for (addr, entry) in file.entries {
                book.entry(addr).or_insert(entry);
            }
        }
        Ok(count)
    }

    pub fn save_file(&self, path: &Path) -> Result<(), String> {
        let entries: Vec<(SocketAddr, AddrBookEntry)> = {
            let Ok(mut book) = self.entries.lock() else {
                return Ok(());
            };
            prune(&mut book, unix_now_secs());
            book.iter().map(|(addr, entry)| (*addr, *entry)).collect()
        };
        let file = AddrBookFile {
            version: ADDR_FILE_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec(&file)
            .map_err(|err| format!("failed to encode peers file: {err}"))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .map_err(|err| format!("failed to write {}: {err}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .map_err(|err| format!("failed to replace {}: {err}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|book| book.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddrManager for AddrBook {
    fn add(&self, addrs: Vec<TimedNetAddress>, _source: IpAddr, penalty_secs: i64) {
        let now = unix_now_secs();
        let Ok(mut book) = self.entries.lock() else {
            return;
        };
        for timed in addrs {
            if !timed.addr.is_routable() {
                continue;
            }
            let addr = timed.addr.socket_addr();
            if !book.contains_key(&addr) && book.len() >= ADDR_BOOK_MAX {
                prune(&mut book, now);
                if book.len() >= ADDR_BOOK_MAX {
                    break;
                }
            }
            let entry = book.entry(addr).or_default();
            let seen = (timed.time as i64 - penalty_secs).max(0) as u64;
            if seen > entry.last_seen {
                entry.last_seen = seen;
            }
            entry.services = timed.addr.services;
        }
    }

    fn good(&self, addr: IpAddr) {
        let now = unix_now_secs();
        if let Ok(mut book) = self.entries.lock() {
            for (key, entry) in book.iter_mut() {
                if key.ip() == addr {
                    entry.last_seen = now;
                    entry.last_success = now;
                    entry.successes = entry.successes.saturating_add(1);
                    entry.failures = entry.failures.saturating_sub(1);
                }
            }
        }
    }

    fn get_addrs(&self) -> Vec<TimedNetAddress> {
        let Ok(book) = self.entries.lock() else {
            return Vec::new();
        };
        let sampled: Vec<(SocketAddr, AddrBookEntry)> = {
            let mut entries: Vec<_> =
                book.iter().map(|(addr, entry)| (*addr, *entry)).collect();
            entries.shuffle(&mut rand::thread_rng());
            entries.truncate(ADDR_BOOK_SAMPLE);
            entries
        };
        sampled
            .into_iter()
            .map(|(addr, entry)| TimedNetAddress {
                time: entry.last_seen as u32,
                addr: NetAddress::new(addr, entry.services),
            })
            .collect()
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn record_eviction(&self, addr: IpAddr) {
        if let Ok(mut book) = self.entries.lock() {
            for (key, entry) in book.iter_mut() {
                if key.ip() == addr {
                    entry.evictions = entry.evictions.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed(ip: &str, port: u16) -> TimedNetAddress {
        TimedNetAddress {
            time: unix_now_secs() as u32,
            addr: NetAddress::new(format!("{ip}:{port}").parse().unwrap(), 1),
        }
    }

    #[test]
    fn add_and_sample() {
        let book = AddrBook::new();
        book.add(vec![timed("8.8.8.8", 8333), timed("9.9.9.9", 8333)], "1.1.1.1".parse().unwrap(), 0);
        assert_eq!(book.size(), 2);
        assert!(!book.sample(10).is_empty());
    }

    #[test]
    fn unroutable_addresses_are_dropped() {
        let book = AddrBook::new();
        book.add(vec![timed("127.0.0.1", 8333)], "1.1.1.1".parse().unwrap(), 0);
        assert_eq!(book.size(), 0);
    }

    #[test]
    fn good_improves_score() {
        let book = AddrBook::new();
        let addr = timed("8.8.8.8", 8333);
        book.add(vec![addr], "1.1.1.1".parse().unwrap(), 0);
        book.good("8.8.8.8".parse().unwrap());
        let entries = book.entries.lock().unwrap();
        let entry = entries.values().next().unwrap();
        assert_eq!(entry.successes, 1);
    }
}
