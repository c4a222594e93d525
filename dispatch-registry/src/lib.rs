//! # Dispatch Registry
//!
//! An eventually-consistent distributed service registry.
//!
//! Every node of a cluster advertises a set of local *service endpoints*
//! under opaque *service types*. Nodes gossip full-state heartbeats over a
//! topic-addressed pub/sub transport, so each node converges on the union
//! of endpoints alive in the cluster and maintains one consistent-hash
//! ring per type. Clients hash an arbitrary key to pick one (or *n*) of
//! those endpoints and deliver a message to it:
//!
//! ```rust
//! use dispatch_pubsub::MemoryNetwork;
//! use dispatch_registry::DispatchBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = MemoryNetwork::default();
//!     let node = DispatchBuilder::new(network.join("node-a")).start();
//!     let registry = node.registry();
//!
//!     // Advertise a local worker for the `uploader` type.
//!     let mailbox = registry.mailbox("worker-1");
//!     registry.add_service("uploader", mailbox.endpoint().clone()).await?;
//!
//!     // Any node of the cluster can now route keys to it.
//!     let endpoint = registry.find_service("uploader", "user-42/avatar.png")?;
//!     assert_eq!(&endpoint, mailbox.endpoint());
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Membership is eventually consistent: a lookup may briefly return a
//! recently-departed endpoint or miss a freshly-joined one, and nothing
//! here survives a process restart. Both are by contract, not accident —
//! the registry is a routing substrate, not a consistent store.

#[macro_use]
extern crate tracing;

mod client;
mod clock;
mod endpoint;
mod error;
mod ring;
mod statistics;
mod tracker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dispatch_pubsub::PubSub;
use tokio::task::JoinHandle;

pub use crate::client::{Delivery, DispatchClient, Mailbox, Responder};
pub use crate::clock::{Clock, ManualClock};
pub use crate::endpoint::{
    Endpoint,
    NodeId,
    ServiceMeta,
    ServiceRef,
    ServiceState,
    ServiceType,
};
pub use crate::error::DispatchError;
pub use crate::ring::{ring_hash, HashRing, RingReader, RouteKey};
pub use crate::statistics::RegistryStatistics;
pub use crate::tracker::{EventKind, ServiceEvent, TypeDiff, PRESENCE_TOPIC};
use crate::ring::RingManagerHandle;
use crate::tracker::{ServiceEvent as Event, TrackerContext, TrackerHandle};

#[derive(Debug, Clone)]
/// Tunables for a registry node. Defaults match a small LAN cluster.
pub struct Config {
    /// Interval between full-state heartbeat broadcasts.
    pub broadcast_period: Duration,
    /// How many broadcast periods a peer may stay silent before its
    /// entries are evicted.
    pub max_silent_periods: u32,
    /// Virtual nodes each endpoint occupies on a ring.
    pub vnodes_per_endpoint: usize,
    /// Deadline applied to calls that do not pass one explicitly.
    pub default_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_period: Duration::from_millis(1500),
            max_silent_periods: 20,
            vnodes_per_endpoint: 128,
            default_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// The silence span after which a peer is considered gone.
    pub fn liveness_horizon(&self) -> Duration {
        self.broadcast_period * self.max_silent_periods
    }
}

/// Builds a registry node on top of a given transport.
pub struct DispatchBuilder {
    transport: Arc<dyn PubSub>,
    config: Config,
    clock: Clock,
}

impl DispatchBuilder {
    /// Create a builder over the node's transport handle.
    pub fn new(transport: impl PubSub) -> Self {
        Self {
            transport: Arc::new(transport),
            config: Config::default(),
            clock: Clock::system(),
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the heartbeat broadcast interval.
    pub fn with_broadcast_period(mut self, period: Duration) -> Self {
        self.config.broadcast_period = period;
        self
    }

    /// Set the peer expiry horizon, in broadcast periods.
    pub fn with_max_silent_periods(mut self, periods: u32) -> Self {
        self.config.max_silent_periods = periods;
        self
    }

    /// Set the ring replication factor.
    pub fn with_vnodes_per_endpoint(mut self, vnodes: usize) -> Self {
        self.config.vnodes_per_endpoint = vnodes;
        self
    }

    /// Set the default call deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Substitute the time source peer liveness is measured against.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Start the node: ring manager, presence tracker and the endpoint
    /// death watch, in that order on top of the provided transport.
    pub fn start(self) -> Dispatch {
        let statistics = RegistryStatistics::default();
        let node = self.transport.node_id().clone();

        let (rings, ring_reader) = ring::start_ring_manager(self.config.vnodes_per_endpoint);

        let tracker = tracker::spawn_tracker(TrackerContext {
            transport: self.transport.clone(),
            clock: self.clock,
            config: self.config.clone(),
            rings: rings.clone(),
            statistics: statistics.clone(),
        });

        let (deaths_tx, deaths_rx) = flume::unbounded();
        let death_watch = tokio::spawn(run_death_watch(deaths_rx, tracker.clone()));

        info!(node_id = %node, "Dispatch node started.");

        Dispatch {
            registry: Registry {
                node,
                transport: self.transport,
                tracker,
                rings: ring_reader,
                config: self.config,
                statistics,
                deaths: deaths_tx,
            },
            rings,
            death_watch,
        }
    }
}

/// Turns observed endpoint terminations into removals.
async fn run_death_watch(deaths: flume::Receiver<Endpoint>, tracker: TrackerHandle) {
    while let Ok(endpoint) = deaths.recv_async().await {
        tracker.untrack_endpoint(endpoint);
    }
}

/// A running registry node.
///
/// Owns the lifecycle of the background tasks; hand out [`Registry`]
/// handles (and [`DispatchClient`]s) for actual use.
pub struct Dispatch {
    registry: Registry,
    rings: RingManagerHandle,
    death_watch: JoinHandle<()>,
}

impl Dispatch {
    #[inline]
    /// The name of this node.
    pub fn node_id(&self) -> &NodeId {
        &self.registry.node
    }

    /// A cheap-clone handle onto the registry's public API.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// A key-routed delivery client backed by this node's ring snapshots.
    pub fn client(&self) -> DispatchClient {
        self.registry.client()
    }

    #[inline]
    /// Live registry metrics.
    pub fn statistics(&self) -> RegistryStatistics {
        self.registry.statistics.clone()
    }

    /// Gracefully leave the cluster.
    ///
    /// Stops accepting owner operations, emits leaves for every local
    /// entry, flushes one final heartbeat so peers converge immediately,
    /// then stops the background tasks in reverse start order.
    pub async fn shutdown(self) {
        let node = self.registry.node.clone();
        self.registry.tracker.shutdown().await;
        self.rings.shutdown().await;
        self.death_watch.abort();
        info!(node_id = %node, "Dispatch node shut down.");
    }
}

#[derive(Clone)]
/// The public API of a registry node. Cheap to clone.
pub struct Registry {
    node: NodeId,
    transport: Arc<dyn PubSub>,
    tracker: TrackerHandle,
    rings: RingReader,
    config: Config,
    statistics: RegistryStatistics,
    deaths: flume::Sender<Endpoint>,
}

impl Registry {
    #[inline]
    /// The name of this node.
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    #[inline]
    /// Live registry metrics.
    pub fn statistics(&self) -> RegistryStatistics {
        self.statistics.clone()
    }

    /// Create a mailbox for a new local endpoint.
    ///
    /// The returned mailbox is the endpoint's delivery point; dropping it
    /// counts as the endpoint terminating and removes any registrations
    /// it still holds.
    pub fn mailbox(&self, handle: impl Into<Bytes>) -> Mailbox {
        let endpoint = Endpoint::new(self.node.clone(), handle);
        Mailbox::new(self.transport.clone(), endpoint, self.deaths.clone())
    }

    /// A key-routed delivery client backed by this node's ring snapshots.
    pub fn client(&self) -> DispatchClient {
        DispatchClient::new(
            self.transport.clone(),
            self.rings.clone(),
            self.config.default_timeout,
        )
    }

    /// Register a local endpoint as an online provider of `service`.
    ///
    /// Re-registering an existing `(service, endpoint)` pair replaces the
    /// entry and returns a fresh token. Endpoints owned by other nodes are
    /// rejected.
    pub async fn add_service(
        &self,
        service: impl Into<ServiceType>,
        endpoint: Endpoint,
    ) -> Result<ServiceRef, DispatchError> {
        self.tracker
            .track(service.into(), endpoint, ServiceState::Online)
            .await
            .map(ServiceRef)
    }

    /// Return a previously disabled endpoint to its type's ring.
    ///
    /// Fails with [`DispatchError::NotRegistered`] without a prior
    /// [`Registry::add_service`].
    pub async fn enable_service(
        &self,
        service: impl Into<ServiceType>,
        endpoint: Endpoint,
    ) -> Result<ServiceRef, DispatchError> {
        self.tracker
            .update(service.into(), endpoint, ServiceState::Online)
            .await
            .map(ServiceRef)
    }

    /// Take an endpoint out of its type's ring while keeping it
    /// advertised.
    ///
    /// Fails with [`DispatchError::NotRegistered`] without a prior
    /// [`Registry::add_service`].
    pub async fn disable_service(
        &self,
        service: impl Into<ServiceType>,
        endpoint: Endpoint,
    ) -> Result<ServiceRef, DispatchError> {
        self.tracker
            .update(service.into(), endpoint, ServiceState::Offline)
            .await
            .map(ServiceRef)
    }

    /// Remove a local endpoint's registration. Idempotent: removing an
    /// endpoint that is not registered succeeds without emitting anything.
    pub async fn remove_service(
        &self,
        service: impl Into<ServiceType>,
        endpoint: Endpoint,
    ) -> Result<(), DispatchError> {
        self.tracker.untrack(service.into(), endpoint).await
    }

    /// Every known endpoint of `service` across the cluster, online and
    /// offline, in canonical order.
    pub async fn get_services(
        &self,
        service: impl Into<ServiceType>,
    ) -> Result<Vec<(Endpoint, ServiceMeta)>, DispatchError> {
        self.tracker.list(service.into()).await
    }

    /// The subset of [`Registry::get_services`] currently online.
    pub async fn get_online_services(
        &self,
        service: impl Into<ServiceType>,
    ) -> Result<Vec<(Endpoint, ServiceMeta)>, DispatchError> {
        let mut services = self.tracker.list(service.into()).await?;
        services.retain(|(_, meta)| meta.is_online());
        Ok(services)
    }

    /// Resolve the online endpoint owning `key` on the type's ring.
    ///
    /// Deterministic for a fixed membership set: every node resolves the
    /// same key to the same endpoint once converged.
    pub fn find_service(
        &self,
        service: &str,
        key: impl RouteKey,
    ) -> Result<Endpoint, DispatchError> {
        self.rings.find_one(service, &key.route_bytes())
    }

    /// Resolve up to `count` distinct online endpoints clockwise from the
    /// key's ring position. Shorter than `count` only when the ring holds
    /// fewer endpoints.
    pub fn find_multi_service(
        &self,
        count: usize,
        service: &str,
        key: impl RouteKey,
    ) -> Vec<Endpoint> {
        self.rings.find_many(service, &key.route_bytes(), count)
    }

    /// Begin observing join/leave events for a service type.
    ///
    /// The watch first replays a join for every endpoint currently online
    /// (so subscribe-after-register still observes the membership) and
    /// then delivers live events; a state flip arrives as a leave of the
    /// old metadata followed by a join carrying the new state.
    pub async fn subscribe(&self, service: &str) -> Result<ServiceWatch, DispatchError> {
        let sub = self.transport.subscribe(service);
        let current = self.tracker.list(ServiceType::new(service)).await?;

        let (tx, rx) = flume::unbounded();
        let mut replayed: HashSet<(Endpoint, u64)> = HashSet::new();
        for (endpoint, meta) in current {
            if meta.is_online() {
                replayed.insert((endpoint.clone(), meta.version));
                let _ = tx.send(Event {
                    kind: EventKind::Join,
                    endpoint,
                    meta,
                });
            }
        }

        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                let event = match serde_json::from_slice::<Event>(&msg.payload) {
                    Ok(event) => event,
                    Err(error) => {
                        warn!(
                            error = %error,
                            topic = %msg.topic,
                            "Dropped malformed membership event.",
                        );
                        continue;
                    },
                };

                // A join already replayed from the snapshot is only
                // delivered once.
                if event.kind == EventKind::Join
                    && !replayed.is_empty()
                    && replayed.remove(&(event.endpoint.clone(), event.meta.version))
                {
                    continue;
                }

                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(ServiceWatch { rx })
    }
}

/// A stream of membership events for one service type.
pub struct ServiceWatch {
    rx: flume::Receiver<ServiceEvent>,
}

impl ServiceWatch {
    /// Waits for the next membership event.
    ///
    /// Returns `None` once the watch has been disconnected from the
    /// transport and all buffered events have been drained.
    pub async fn recv(&self) -> Option<ServiceEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&self) -> Option<ServiceEvent> {
        self.rx.try_recv().ok()
    }
}
