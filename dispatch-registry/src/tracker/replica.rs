use std::collections::HashMap;
use std::time::Duration;

use crate::endpoint::{Endpoint, NodeId, ServiceMeta, ServiceState, ServiceType};
use crate::error::DispatchError;

type PresenceKey = (ServiceType, Endpoint);
type PresenceMap = HashMap<PresenceKey, ServiceMeta>;

#[derive(Debug, Default, Clone)]
/// The converged membership change for one service type.
///
/// Subscribers observe leaves before joins; the ring applies leaves first
/// and then joins, so an entry present in both (a replace-in-place) ends up
/// ringed under its new metadata.
pub struct TypeDiff {
    pub service: ServiceType,
    pub joins: Vec<(Endpoint, ServiceMeta)>,
    pub leaves: Vec<(Endpoint, ServiceMeta)>,
}

impl TypeDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// The outcome of merging one received heartbeat.
pub struct HeartbeatOutcome {
    pub diffs: Vec<TypeDiff>,
    /// Entries dropped because they claimed a node other than the sender.
    pub rejected: usize,
}

/// The eventually-consistent presence state of one node.
///
/// `local` holds the entries owned by this node, which only this node may
/// mutate; `remote` holds read-only copies of every peer's entries,
/// converged by replacing a peer's slice wholesale on each heartbeat and
/// reporting the difference. All methods are pure state transitions so the
/// protocol can be tested without tasks or timers.
pub struct Replica {
    node: NodeId,
    local: PresenceMap,
    remote: HashMap<NodeId, PresenceMap>,
    last_heard: HashMap<NodeId, Duration>,
    /// Version mint for local writes. Strictly increasing across every
    /// entry this node owns, which makes it strictly increasing per entry.
    next_version: u64,
}

impl Replica {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            local: HashMap::new(),
            remote: HashMap::new(),
            last_heard: HashMap::new(),
            next_version: 0,
        }
    }

    #[inline]
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    #[inline]
    pub fn num_local(&self) -> usize {
        self.local.len()
    }

    #[inline]
    pub fn num_peers(&self) -> usize {
        self.remote.len()
    }

    fn mint_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Insert or replace a local entry, minting a fresh version.
    ///
    /// Fails unless the endpoint is owned by this node.
    pub fn track(
        &mut self,
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
    ) -> Result<(u64, TypeDiff), DispatchError> {
        if endpoint.node != self.node {
            return Err(DispatchError::NotOwned(endpoint));
        }

        let version = self.mint_version();
        let meta = ServiceMeta {
            node: self.node.clone(),
            state,
            version,
        };

        let prior = self
            .local
            .insert((service.clone(), endpoint.clone()), meta.clone());

        let mut diff = TypeDiff {
            service,
            ..Default::default()
        };
        if let Some(prior) = prior {
            diff.leaves.push((endpoint.clone(), prior));
        }
        diff.joins.push((endpoint, meta));

        Ok((version, diff))
    }

    /// Flip the state of an existing local entry, minting a fresh version.
    ///
    /// Unlike [`Replica::track`] the entry must already exist. Re-asserting
    /// the state the entry is already in is a no-op: the existing version
    /// is returned unchanged and no leave/join pair is emitted.
    pub fn update(
        &mut self,
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
    ) -> Result<(u64, TypeDiff), DispatchError> {
        if endpoint.node != self.node {
            return Err(DispatchError::NotOwned(endpoint));
        }
        let Some(existing) = self.local.get(&(service.clone(), endpoint.clone())) else {
            return Err(DispatchError::NotRegistered);
        };

        if existing.state == state {
            return Ok((
                existing.version,
                TypeDiff {
                    service,
                    ..Default::default()
                },
            ));
        }

        self.track(service, endpoint, state)
    }

    /// Remove a local entry. Returns `None` if the entry was never tracked,
    /// which callers treat as success (removal is idempotent).
    pub fn untrack(
        &mut self,
        service: ServiceType,
        endpoint: Endpoint,
    ) -> Option<TypeDiff> {
        let prior = self.local.remove(&(service.clone(), endpoint.clone()))?;
        Some(TypeDiff {
            service,
            joins: Vec::new(),
            leaves: vec![(endpoint, prior)],
        })
    }

    /// Remove every local entry held by `endpoint`, across all types.
    ///
    /// This is the path taken when the endpoint's owning task dies.
    pub fn untrack_endpoint(&mut self, endpoint: &Endpoint) -> Vec<TypeDiff> {
        let keys: Vec<PresenceKey> = self
            .local
            .keys()
            .filter(|(_, ep)| ep == endpoint)
            .cloned()
            .collect();

        let mut diffs = Vec::with_capacity(keys.len());
        for (service, ep) in keys {
            if let Some(diff) = self.untrack(service, ep) {
                diffs.push(diff);
            }
        }
        diffs
    }

    /// Remove every local entry, emitting their leaves.
    ///
    /// Used during graceful shutdown before the final heartbeat goes out.
    pub fn drain_local(&mut self) -> Vec<TypeDiff> {
        let mut grouped: HashMap<ServiceType, TypeDiff> = HashMap::new();
        for ((service, endpoint), meta) in self.local.drain() {
            grouped
                .entry(service.clone())
                .or_insert_with(|| TypeDiff {
                    service,
                    ..Default::default()
                })
                .leaves
                .push((endpoint, meta));
        }
        grouped.into_values().collect()
    }

    /// A snapshot of the merged local and remote view for one type,
    /// ordered by canonical endpoint bytes for determinism.
    pub fn list(&self, service: &str) -> Vec<(Endpoint, ServiceMeta)> {
        let remote_entries = self.remote.values().flatten();
        let mut entries: Vec<(Endpoint, ServiceMeta)> = self
            .local
            .iter()
            .chain(remote_entries)
            .filter(|((ty, _), _)| ty.as_str() == service)
            .map(|((_, endpoint), meta)| (endpoint.clone(), meta.clone()))
            .collect();

        entries.sort_by_key(|(endpoint, _)| endpoint.canonical_bytes());
        entries
    }

    /// The full enumeration of locally-owned entries, as carried by a
    /// heartbeat.
    pub fn local_entries(&self) -> Vec<(ServiceType, Endpoint, ServiceMeta)> {
        self.local
            .iter()
            .map(|((service, endpoint), meta)| {
                (service.clone(), endpoint.clone(), meta.clone())
            })
            .collect()
    }

    /// Merge a full-state heartbeat received from `from`.
    ///
    /// The sender's prior slice is diffed against the received enumeration
    /// by `(type, endpoint, version)`: an entry replaced in place therefore
    /// shows up as a leave of the old metadata and a join of the new.
    /// Entries claiming any node other than the sender are rejected.
    pub fn apply_heartbeat(
        &mut self,
        from: &NodeId,
        entries: Vec<(ServiceType, Endpoint, ServiceMeta)>,
        now: Duration,
    ) -> HeartbeatOutcome {
        let mut received: PresenceMap = HashMap::with_capacity(entries.len());
        let mut rejected = 0usize;
        for (service, endpoint, meta) in entries {
            if endpoint.node != *from || meta.node != *from {
                rejected += 1;
                continue;
            }
            received.insert((service, endpoint), meta);
        }

        self.last_heard.insert(from.clone(), now);
        let prior = self.remote.remove(from).unwrap_or_default();

        let mut grouped: HashMap<ServiceType, TypeDiff> = HashMap::new();

        for (key, meta) in &received {
            let changed = prior
                .get(key)
                .map(|old| old.version != meta.version)
                .unwrap_or(true);
            if changed {
                diff_for(&mut grouped, &key.0)
                    .joins
                    .push((key.1.clone(), meta.clone()));
            }
        }

        for (key, meta) in &prior {
            let gone = received
                .get(key)
                .map(|new| new.version != meta.version)
                .unwrap_or(true);
            if gone {
                diff_for(&mut grouped, &key.0)
                    .leaves
                    .push((key.1.clone(), meta.clone()));
            }
        }

        self.remote.insert(from.clone(), received);

        HeartbeatOutcome {
            diffs: grouped.into_values().filter(|d| !d.is_empty()).collect(),
            rejected,
        }
    }

    /// Drop every peer not heard from within `horizon`, synthesizing
    /// leaves for all of its entries.
    pub fn expire_silent(
        &mut self,
        now: Duration,
        horizon: Duration,
    ) -> Vec<(NodeId, Vec<TypeDiff>)> {
        let expired: Vec<NodeId> = self
            .last_heard
            .iter()
            .filter(|(_, &heard)| now.saturating_sub(heard) > horizon)
            .map(|(node, _)| node.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for node in expired {
            self.last_heard.remove(&node);
            let entries = self.remote.remove(&node).unwrap_or_default();

            let mut grouped: HashMap<ServiceType, TypeDiff> = HashMap::new();
            for ((service, endpoint), meta) in entries {
                grouped
                    .entry(service.clone())
                    .or_insert_with(|| TypeDiff {
                        service,
                        ..Default::default()
                    })
                    .leaves
                    .push((endpoint, meta));
            }

            out.push((node, grouped.into_values().collect()));
        }
        out
    }
}

fn diff_for<'a>(
    grouped: &'a mut HashMap<ServiceType, TypeDiff>,
    service: &ServiceType,
) -> &'a mut TypeDiff {
    grouped.entry(service.clone()).or_insert_with(|| TypeDiff {
        service: service.clone(),
        ..Default::default()
    })
}
