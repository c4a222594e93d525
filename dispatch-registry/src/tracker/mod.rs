mod actor;
mod replica;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub(crate) use self::actor::{spawn_tracker, TrackerContext};
pub use self::replica::{HeartbeatOutcome, Replica, TypeDiff};
use crate::endpoint::{Endpoint, NodeId, ServiceMeta, ServiceState, ServiceType};
use crate::error::DispatchError;

/// The well-known topic presence gossip travels on.
pub const PRESENCE_TOPIC: &str = "dispatch:presence";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Whether an event announces an endpoint entering or leaving a type.
pub enum EventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A membership event published on a service type's topic.
///
/// A state flip (enable/disable) is announced as a leave of the old
/// metadata followed by a join carrying the new state.
pub struct ServiceEvent {
    pub kind: EventKind,
    pub endpoint: Endpoint,
    pub meta: ServiceMeta,
}

#[derive(Debug, Serialize, Deserialize)]
/// One advertised entry inside a heartbeat.
pub(crate) struct WireEntry {
    pub service: ServiceType,
    pub endpoint: Endpoint,
    pub meta: ServiceMeta,
}

#[derive(Debug, Serialize, Deserialize)]
/// A full enumeration of a node's locally-owned entries.
///
/// Heartbeats are idempotent: receiving the same one twice converges to
/// the same replica state, which is what makes the gossip self-healing.
pub(crate) struct Heartbeat {
    pub node: NodeId,
    pub entries: Vec<WireEntry>,
}

pub(crate) enum TrackerOp {
    Track {
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
        tx: oneshot::Sender<Result<u64, DispatchError>>,
    },
    Update {
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
        tx: oneshot::Sender<Result<u64, DispatchError>>,
    },
    Untrack {
        service: ServiceType,
        endpoint: Endpoint,
        tx: oneshot::Sender<()>,
    },
    UntrackEndpoint {
        endpoint: Endpoint,
    },
    List {
        service: ServiceType,
        tx: oneshot::Sender<Vec<(Endpoint, ServiceMeta)>>,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
/// A cheap-clone handle onto the tracker actor.
pub(crate) struct TrackerHandle {
    tx: flume::Sender<TrackerOp>,
}

impl TrackerHandle {
    pub(crate) fn new(tx: flume::Sender<TrackerOp>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        op: TrackerOp,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, DispatchError> {
        self.tx
            .send_async(op)
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    pub(crate) async fn track(
        &self,
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
    ) -> Result<u64, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            TrackerOp::Track {
                service,
                endpoint,
                state,
                tx,
            },
            rx,
        )
        .await?
    }

    pub(crate) async fn update(
        &self,
        service: ServiceType,
        endpoint: Endpoint,
        state: ServiceState,
    ) -> Result<u64, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            TrackerOp::Update {
                service,
                endpoint,
                state,
                tx,
            },
            rx,
        )
        .await?
    }

    pub(crate) async fn untrack(
        &self,
        service: ServiceType,
        endpoint: Endpoint,
    ) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            TrackerOp::Untrack {
                service,
                endpoint,
                tx,
            },
            rx,
        )
        .await
    }

    /// Fire-and-forget removal of every entry owned by `endpoint`.
    pub(crate) fn untrack_endpoint(&self, endpoint: Endpoint) {
        let _ = self.tx.send(TrackerOp::UntrackEndpoint { endpoint });
    }

    pub(crate) async fn list(
        &self,
        service: ServiceType,
    ) -> Result<Vec<(Endpoint, ServiceMeta)>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.request(TrackerOp::List { service, tx }, rx).await
    }

    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send_async(TrackerOp::Shutdown { tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
