use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A cluster-unique node name.
pub type NodeId = SmolStr;

/// An opaque tag partitioning the registry into independent rings.
pub type ServiceType = SmolStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// An addressable worker somewhere in the cluster.
///
/// The registry does not own endpoints, it only advertises them: the
/// `handle` is an opaque node-local identifier the transport layer can use
/// to deliver a message on the owning node.
pub struct Endpoint {
    /// The node the endpoint lives on.
    pub node: NodeId,
    /// Node-local opaque handle, meaningful only to the owning node's
    /// transport.
    pub handle: Bytes,
}

impl Endpoint {
    pub fn new(node: impl Into<NodeId>, handle: impl Into<Bytes>) -> Self {
        Self {
            node: node.into(),
            handle: handle.into(),
        }
    }

    /// The canonical byte serialization of the endpoint.
    ///
    /// Length-prefixed fields concatenated. This is both the ring key input
    /// and the equality/ordering key, so it must never change shape.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let node = self.node.as_bytes();
        let mut buf = Vec::with_capacity(8 + node.len() + self.handle.len());
        buf.extend_from_slice(&(node.len() as u32).to_le_bytes());
        buf.extend_from_slice(node);
        buf.extend_from_slice(&(self.handle.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.handle);
        buf
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.node)?;
        for byte in self.handle.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Whether an advertised endpoint should receive routed traffic.
pub enum ServiceState {
    /// The endpoint is part of its type's ring.
    Online,
    /// The endpoint is advertised but excluded from routing.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Per-presence-entry metadata replicated through gossip.
pub struct ServiceMeta {
    /// The owning node.
    pub node: NodeId,
    /// Routing state of the endpoint.
    pub state: ServiceState,
    /// Monotonic version token minted by the owning node on every write to
    /// the entry. Never decreases for a given `(type, endpoint)` pair.
    pub version: u64,
}

impl ServiceMeta {
    #[inline]
    pub fn is_online(&self) -> bool {
        self.state == ServiceState::Online
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Opaque token returned by a successful registration.
///
/// This is the version minted for the entry; a re-registration of the same
/// `(type, endpoint)` coordinate yields a strictly greater token.
pub struct ServiceRef(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_are_length_prefixed() {
        let ep = Endpoint::new("node-1", b"ab".as_ref());
        let bytes = ep.canonical_bytes();

        assert_eq!(&bytes[0..4], &6u32.to_le_bytes());
        assert_eq!(&bytes[4..10], b"node-1");
        assert_eq!(&bytes[10..14], &2u32.to_le_bytes());
        assert_eq!(&bytes[14..], b"ab");
    }

    #[test]
    fn test_canonical_bytes_distinguish_field_boundaries() {
        // Same concatenation, different split: must not collide.
        let a = Endpoint::new("ab", b"c".as_ref());
        let b = Endpoint::new("a", b"bc".as_ref());
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }
}
