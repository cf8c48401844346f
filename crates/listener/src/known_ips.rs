//! Recently observed local IP addresses.

use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Number of addresses remembered
pub const KNOWN_IPS_CAPACITY: usize = 20;

/// Group keys list up to this many addresses verbatim
const MAX_LISTED_IPS: usize = 5;

/// Bounded LRU of local addresses clients reached the listener on.
#[derive(Debug)]
pub struct KnownIps {
    ips: LruCache<IpAddr, ()>,
    synced: Option<String>,
}

impl KnownIps {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(KNOWN_IPS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ips: LruCache::new(capacity),
            synced: None,
        }
    }

    /// Record an address; returns `true` if it wasn't known.
    pub fn observe(&mut self, ip: IpAddr) -> bool {
        self.ips.put(ip, ()).is_none()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    /// Known addresses, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ips.iter().map(|(ip, _)| ip.to_string()).collect();
        names.sort();
        names
    }

    /// Key identifying the current address group.
    pub fn group_key(&self) -> String {
        let names = self.names();
        match names.len() {
            0 => "local/0".to_string(),
            1 => format!("local/{}", names[0]),
            n if n <= MAX_LISTED_IPS => format!("local/[{}]", names.join(" ")),
            _ => {
                let mut digest = Sha256::new();
                for name in &names {
                    digest.update(name.as_bytes());
                }
                format!("local/{}", hex::encode(digest.finalize()))
            }
        }
    }

    /// Names to add if the group changed since the last [`KnownIps::mark_synced`].
    pub fn pending(&self) -> Option<(String, Vec<String>)> {
        if self.is_empty() {
            return None;
        }
        let key = self.group_key();
        if self.synced.as_deref() == Some(key.as_str()) {
            return None;
        }
        Some((key, self.names()))
    }

    pub fn mark_synced(&mut self, key: String) {
        self.synced = Some(key);
    }
}

impl Default for KnownIps {
    fn default() -> Self {
        Self::new()
    }
}
