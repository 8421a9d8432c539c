//! Consistent hash ring used for sticky key routing.
//!
//! Every member is placed on a `u64` ring at `replicas` points (virtual nodes).
//! A key is served by the first virtual node at or after the key's hash,
//! wrapping around to the start of the ring. Adding or removing a member only
//! moves the keys that land on that member's virtual nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::error::HashRingError;

pub const DEFAULT_REPLICAS: usize = 20;

#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    ring: BTreeMap<u64, String>,
    members: BTreeSet<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    pub fn with_replicas(replicas: usize) -> Self {
        assert!(replicas > 0, "replicas must be > 0");
        Self {
            replicas,
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Ring labelled with worker identifiers "0".."count-1"
    pub fn for_workers(count: usize) -> Self {
        let mut ring = Self::new();
        for index in 0..count {
            ring.add(&index.to_string());
        }
        ring
    }

    pub fn add(&mut self, member: &str) {
        if !self.members.insert(member.to_string()) {
            return;
        }
        for replica in 0..self.replicas {
            self.ring
                .insert(hash_key(&vnode_label(member, replica)), member.to_string());
        }
    }

    pub fn remove(&mut self, member: &str) {
        if !self.members.remove(member) {
            return;
        }
        for replica in 0..self.replicas {
            let point = hash_key(&vnode_label(member, replica));
            // Only drop the point if this member still owns it
            if self.ring.get(&point).is_some_and(|owner| owner == member) {
                self.ring.remove(&point);
            }
        }
    }

    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up the member owning `key`. Pure function of membership and key.
    pub fn get(&self, key: &str) -> Result<&str, HashRingError> {
        let point = hash_key(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.as_str())
            .ok_or(HashRingError::Empty)
    }
}

fn vnode_label(member: &str, replica: usize) -> String {
    format!("{member}#{replica}")
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(key.as_bytes());
    hasher.finish()
}
