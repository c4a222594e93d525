use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use smol_str::SmolStr;
use tracing::debug;

use crate::{Message, NodeId, PubSub, Subscription, Topic, TransportError};

#[derive(Default, Clone)]
/// An in-process hub linking any number of node transports.
///
/// Every node joined through the same network sees every other node's
/// broadcasts. Individual nodes can be severed from the hub to simulate a
/// network partition: a severed node keeps delivering to its own local
/// subscribers but exchanges nothing with the rest of the cluster.
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: RwLock<HashMap<NodeId, Arc<NodeBroker>>>,
    severed: RwLock<HashSet<NodeId>>,
}

impl MemoryNetwork {
    /// Attach a new node to the network, returning its transport handle.
    ///
    /// Joining a name that is already attached returns a handle to the
    /// existing node rather than resetting its subscribers.
    pub fn join(&self, node_id: impl Into<NodeId>) -> MemoryPubSub {
        let node_id = node_id.into();
        let broker = {
            let mut nodes = self.inner.nodes.write();
            nodes.entry(node_id.clone()).or_default().clone()
        };

        debug!(node_id = %node_id, "Node attached to in-process network.");

        MemoryPubSub {
            node_id,
            broker,
            network: self.inner.clone(),
        }
    }

    /// Cut a node off from the rest of the network.
    ///
    /// Broadcasts from the severed node no longer reach other nodes and
    /// vice versa; local delivery on the severed node keeps working.
    pub fn sever(&self, node_id: &str) {
        self.inner.severed.write().insert(SmolStr::new(node_id));
    }

    /// Reconnect a previously severed node.
    pub fn restore(&self, node_id: &str) {
        self.inner.severed.write().remove(node_id);
    }

    /// The names of all nodes currently attached.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.nodes.read().keys().cloned().collect()
    }
}

#[derive(Default)]
struct NodeBroker {
    topics: RwLock<HashMap<Topic, Vec<flume::Sender<Message>>>>,
}

impl NodeBroker {
    fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = flume::unbounded();
        self.topics.write().entry(topic).or_default().push(tx);
        Subscription::new(rx)
    }

    /// Delivers to every live subscriber of the topic, pruning any
    /// subscriber whose receiving half has been dropped.
    fn deliver(&self, topic: &str, payload: &Bytes) {
        let mut topics = self.topics.write();
        let Some(senders) = topics.get_mut(topic) else {
            return;
        };

        senders.retain(|tx| {
            tx.send(Message {
                topic: SmolStr::new(topic),
                payload: payload.clone(),
            })
            .is_ok()
        });

        if senders.is_empty() {
            topics.remove(topic);
        }
    }
}

/// A single node's handle onto a [`MemoryNetwork`].
pub struct MemoryPubSub {
    node_id: NodeId,
    broker: Arc<NodeBroker>,
    network: Arc<NetworkInner>,
}

impl MemoryPubSub {
    fn is_severed(&self, node_id: &str) -> bool {
        self.network.severed.read().contains(node_id)
    }
}

impl PubSub for MemoryPubSub {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.broker.subscribe(SmolStr::new(topic))
    }

    fn broadcast(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.is_severed(&self.node_id) {
            // Partitioned away from the hub: the local loopback is all
            // that is left of the cluster from this node's point of view.
            self.broker.deliver(topic, &payload);
            return Ok(());
        }

        let nodes = self.network.nodes.read();
        let severed = self.network.severed.read();
        for (node_id, broker) in nodes.iter() {
            if severed.contains(node_id) {
                continue;
            }
            broker.deliver(topic, &payload);
        }

        Ok(())
    }

    fn direct_broadcast(
        &self,
        target: &str,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let broker = {
            let nodes = self.network.nodes.read();
            nodes
                .get(target)
                .cloned()
                .ok_or_else(|| TransportError::UnknownNode(SmolStr::new(target)))?
        };

        // A partitioned link drops the message on the floor, it is not a
        // delivery error the publisher can act on.
        if target != self.node_id.as_str()
            && (self.is_severed(&self.node_id) || self.is_severed(target))
        {
            return Ok(());
        }

        broker.deliver(topic, &payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_nodes() {
        let network = MemoryNetwork::default();
        let a = network.join("a");
        let b = network.join("b");

        let sub_a = a.subscribe("t");
        let sub_b = b.subscribe("t");

        a.broadcast("t", Bytes::from_static(b"x")).expect("Broadcast.");

        assert_eq!(sub_a.recv().await.unwrap().payload.as_ref(), b"x");
        assert_eq!(sub_b.recv().await.unwrap().payload.as_ref(), b"x");
    }

    #[tokio::test]
    async fn test_direct_broadcast_scoped_to_target() {
        let network = MemoryNetwork::default();
        let a = network.join("a");
        let b = network.join("b");

        let sub_a = a.subscribe("t");
        let sub_b = b.subscribe("t");

        a.direct_broadcast("b", "t", Bytes::from_static(b"x"))
            .expect("Direct broadcast.");

        assert_eq!(sub_b.recv().await.unwrap().payload.as_ref(), b"x");
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_is_an_error() {
        let network = MemoryNetwork::default();
        let a = network.join("a");

        let res = a.direct_broadcast("ghost", "t", Bytes::new());
        assert!(matches!(res, Err(TransportError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_severed_node_is_isolated() {
        let network = MemoryNetwork::default();
        let a = network.join("a");
        let b = network.join("b");

        let sub_a = a.subscribe("t");
        let sub_b = b.subscribe("t");

        network.sever("b");

        a.broadcast("t", Bytes::from_static(b"from-a")).expect("Broadcast.");
        b.broadcast("t", Bytes::from_static(b"from-b")).expect("Broadcast.");

        // Each side only observes its own traffic while the partition holds.
        assert_eq!(sub_a.recv().await.unwrap().payload.as_ref(), b"from-a");
        assert!(sub_a.try_recv().is_none());
        assert_eq!(sub_b.recv().await.unwrap().payload.as_ref(), b"from-b");
        assert!(sub_b.try_recv().is_none());

        network.restore("b");
        a.broadcast("t", Bytes::from_static(b"healed")).expect("Broadcast.");
        assert_eq!(sub_b.recv().await.unwrap().payload.as_ref(), b"healed");
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let network = MemoryNetwork::default();
        let a = network.join("a");

        let sub = a.subscribe("t");
        drop(sub);
        a.broadcast("t", Bytes::from_static(b"x")).expect("Broadcast.");

        let sub2 = a.subscribe("t");
        a.broadcast("t", Bytes::from_static(b"y")).expect("Broadcast.");
        assert_eq!(sub2.recv().await.unwrap().payload.as_ref(), b"y");
    }
}
