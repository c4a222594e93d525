use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the registry's gossip and tracking behaviour.
pub struct RegistryStatistics(Arc<RegistryStatisticsInner>);

impl Deref for RegistryStatistics {
    type Target = RegistryStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct RegistryStatisticsInner {
    /// The number of presence entries currently owned by this node.
    pub(crate) num_local_services: Counter,
    /// The number of remote peers this node currently tracks.
    pub(crate) num_known_peers: Counter,
    /// The total number of heartbeats received from peers.
    pub(crate) num_heartbeats_received: Counter,
    /// Payloads dropped because they failed to decode or claimed entries
    /// for a node other than their sender.
    pub(crate) num_malformed_payloads: Counter,
    /// Peers removed after exceeding the liveness horizon.
    pub(crate) num_expired_peers: Counter,
    /// Broadcast attempts the transport rejected.
    pub(crate) num_transport_errors: Counter,
}

impl RegistryStatisticsInner {
    /// The number of presence entries currently owned by this node.
    pub fn num_local_services(&self) -> u64 {
        self.num_local_services.load(Ordering::Relaxed)
    }

    /// The number of remote peers this node currently tracks.
    pub fn num_known_peers(&self) -> u64 {
        self.num_known_peers.load(Ordering::Relaxed)
    }

    /// The total number of heartbeats received from peers.
    pub fn num_heartbeats_received(&self) -> u64 {
        self.num_heartbeats_received.load(Ordering::Relaxed)
    }

    /// Payloads dropped as malformed or defensively rejected.
    pub fn num_malformed_payloads(&self) -> u64 {
        self.num_malformed_payloads.load(Ordering::Relaxed)
    }

    /// Peers removed after exceeding the liveness horizon.
    pub fn num_expired_peers(&self) -> u64 {
        self.num_expired_peers.load(Ordering::Relaxed)
    }

    /// Broadcast attempts the transport rejected.
    pub fn num_transport_errors(&self) -> u64 {
        self.num_transport_errors.load(Ordering::Relaxed)
    }
}
