//! # Dispatch PubSub
//!
//! The topic-addressed broadcast transport consumed by the dispatch registry.
//!
//! The registry itself is transport-agnostic: anything which can deliver a
//! payload to every subscriber of a topic across the cluster can drive it.
//! This crate defines that contract ([`PubSub`]) and ships [`MemoryNetwork`],
//! an in-process implementation linking any number of nodes within one
//! process, which is what the registry's tests (and single-host deployments)
//! run on.
//!
//! ```rust
//! use dispatch_pubsub::{MemoryNetwork, PubSub};
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = MemoryNetwork::default();
//!     let node_a = network.join("node-a");
//!     let node_b = network.join("node-b");
//!
//!     let sub = node_b.subscribe("my-topic");
//!     node_a.broadcast("my-topic", b"hello".as_ref().into()).unwrap();
//!
//!     let msg = sub.recv().await.unwrap();
//!     assert_eq!(msg.payload.as_ref(), b"hello");
//! }
//! ```

mod memory;

use bytes::Bytes;
use smol_str::SmolStr;

pub use self::memory::{MemoryNetwork, MemoryPubSub};

/// A cluster-unique node name.
pub type NodeId = SmolStr;
/// A topic name messages are addressed to.
pub type Topic = SmolStr;

#[derive(Debug, Clone)]
/// A payload delivered to a topic subscriber.
pub struct Message {
    /// The topic the payload was published on.
    pub topic: Topic,
    /// The raw payload bytes.
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("the transport has been shut down")]
    /// The transport is no longer able to deliver messages.
    Closed,

    #[error("no node named `{0}` is reachable through this transport")]
    /// A direct broadcast targeted a node the transport does not know.
    UnknownNode(NodeId),
}

/// A topic-addressed broadcast transport linking the nodes of a cluster.
///
/// Implementations must be safe for many concurrent publishers and
/// subscribers. Delivery is best-effort: a failed broadcast surfaces as an
/// error to the publisher but consumers of this trait are expected to treat
/// it as transient and retry on their own schedule.
pub trait PubSub: Send + Sync + 'static {
    /// The name of the node this handle publishes from.
    fn node_id(&self) -> &NodeId;

    /// Begin receiving messages published on `topic`.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Deliver `payload` to every subscriber of `topic` on every node of
    /// the cluster, including the publishing node itself.
    fn broadcast(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Deliver `payload` to every subscriber of `topic` on `target` only.
    ///
    /// Used for local-only fan-out where a cluster hop would be wasted.
    fn direct_broadcast(
        &self,
        target: &str,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;
}

/// A stream of messages for a single topic subscription.
pub struct Subscription {
    rx: flume::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(rx: flume::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Waits for the next message on the topic.
    ///
    /// Returns `None` once the transport has shut down and all buffered
    /// messages have been drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.recv_async().await.ok()
    }

    /// Returns the next buffered message without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    #[inline]
    /// The number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
