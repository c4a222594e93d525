use std::collections::BTreeMap;
use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::endpoint::Endpoint;

/// Fixed hash key shared by every node of every cluster.
///
/// Ring placement must agree across nodes and across versions, so the key
/// is baked into the build and must never change.
const RING_HASH_KEY: (u64, u64) = (0x6469_7370_6174_6368, 0x2d72_696e_672d_7631);

/// Position a byte string on the ring.
#[inline]
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(RING_HASH_KEY.0, RING_HASH_KEY.1);
    hasher.write(bytes);
    hasher.finish()
}

/// A consistent-hash ring over service endpoints.
///
/// Each member endpoint occupies `replication` virtual positions derived
/// from its canonical serialization. Lookups walk clockwise from the key's
/// hash position; two positions that hash identically are ordered by the
/// lexicographic order of the occupying endpoint's canonical bytes, which
/// keeps every walk deterministic across nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Vnode position -> owning endpoint, keyed by `(hash, canonical)` so
    /// that colliding hashes stay distinct entries with a stable order.
    vnodes: BTreeMap<(u64, Vec<u8>), Endpoint>,
    /// Canonical bytes -> member endpoint.
    members: BTreeMap<Vec<u8>, Endpoint>,
    replication: usize,
}

impl HashRing {
    pub fn new(replication: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            members: BTreeMap::new(),
            replication: replication.max(1),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[inline]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.members.contains_key(&endpoint.canonical_bytes())
    }

    /// Add an endpoint to the ring. Adding an existing member is a no-op.
    pub fn insert(&mut self, endpoint: Endpoint) {
        let canonical = endpoint.canonical_bytes();
        if self.members.contains_key(&canonical) {
            return;
        }

        for position in self.vnode_positions(&canonical) {
            self.vnodes
                .insert((position, canonical.clone()), endpoint.clone());
        }
        self.members.insert(canonical, endpoint);
    }

    /// Remove an endpoint from the ring if present.
    pub fn remove(&mut self, endpoint: &Endpoint) {
        let canonical = endpoint.canonical_bytes();
        if self.members.remove(&canonical).is_none() {
            return;
        }

        for position in self.vnode_positions(&canonical) {
            self.vnodes.remove(&(position, canonical.clone()));
        }
    }

    /// The endpoint owning the given key: the occupant of the smallest
    /// vnode position at or after `hash(key)`, wrapping around the ring.
    pub fn find_one(&self, key: &[u8]) -> Option<&Endpoint> {
        let position = ring_hash(key);
        self.walk_from(position).next()
    }

    /// Up to `count` distinct endpoints following the ring clockwise from
    /// the key's position. Shorter than `count` only when the ring holds
    /// fewer members.
    pub fn find_many(&self, key: &[u8], count: usize) -> Vec<Endpoint> {
        let position = ring_hash(key);
        let mut seen: Vec<&Endpoint> = Vec::with_capacity(count.min(self.members.len()));

        for endpoint in self.walk_from(position) {
            if seen.len() == count {
                break;
            }
            if !seen.contains(&endpoint) {
                seen.push(endpoint);
            }
        }

        seen.into_iter().cloned().collect()
    }

    /// Every member endpoint, in canonical-byte order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.members.values()
    }

    /// Walks every vnode clockwise starting at `position`.
    fn walk_from(&self, position: u64) -> impl Iterator<Item = &Endpoint> {
        let start = (position, Vec::new());
        self.vnodes
            .range(start.clone()..)
            .chain(self.vnodes.range(..start))
            .map(|(_, endpoint)| endpoint)
    }

    /// The vnode positions an endpoint occupies: the hash of its canonical
    /// bytes with the vnode index appended.
    fn vnode_positions<'a>(
        &self,
        canonical: &'a [u8],
    ) -> impl Iterator<Item = u64> + 'a {
        (0..self.replication as u32).map(move |index| {
            let mut buf = Vec::with_capacity(canonical.len() + 4);
            buf.extend_from_slice(canonical);
            buf.extend_from_slice(&index.to_le_bytes());
            ring_hash(&buf)
        })
    }
}
