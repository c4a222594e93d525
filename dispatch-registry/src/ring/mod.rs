mod hash_ring;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::sync::oneshot;

pub use self::hash_ring::{ring_hash, HashRing};
use crate::endpoint::{Endpoint, ServiceType};
use crate::error::DispatchError;
use crate::tracker::TypeDiff;

type RingTable = HashMap<ServiceType, Arc<HashRing>>;

/// Something that can position itself on a ring.
///
/// Routing keys are canonically bytes; anything that can borrow itself as
/// bytes routes directly, strings route through their UTF-8 encoding.
pub trait RouteKey {
    fn route_bytes(&self) -> Cow<'_, [u8]>;
}

impl RouteKey for [u8] {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self)
    }
}

impl RouteKey for &[u8] {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self)
    }
}

impl<const N: usize> RouteKey for [u8; N] {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_slice())
    }
}

impl RouteKey for Vec<u8> {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_slice())
    }
}

impl RouteKey for Bytes {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_ref())
    }
}

impl RouteKey for str {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl RouteKey for &str {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl RouteKey for String {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl RouteKey for SmolStr {
    fn route_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

pub(crate) enum RingOp {
    ApplyDiff(TypeDiff, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
/// Write-side handle feeding membership diffs into the ring manager.
pub(crate) struct RingManagerHandle {
    tx: flume::Sender<RingOp>,
}

impl RingManagerHandle {
    /// Applies a diff and waits for the resulting snapshot to be
    /// published, so a lookup issued after this returns observes it.
    pub(crate) async fn apply_diff(&self, diff: TypeDiff) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send_async(RingOp::ApplyDiff(diff, tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send_async(RingOp::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Clone)]
/// Lock-free read access to the current ring snapshots.
///
/// Every diff application publishes a fresh immutable snapshot table, so a
/// reader never observes a half-applied membership change and may resolve
/// keys concurrently with writes.
pub struct RingReader {
    table: Arc<RwLock<Arc<RingTable>>>,
}

impl RingReader {
    fn snapshot(&self) -> Arc<RingTable> {
        self.table.read().clone()
    }

    /// Resolve the endpoint owning `key` on the type's ring.
    pub fn find_one(
        &self,
        service: &str,
        key: &[u8],
    ) -> Result<Endpoint, DispatchError> {
        self.snapshot()
            .get(service)
            .and_then(|ring| ring.find_one(key).cloned())
            .ok_or(DispatchError::NoServiceForKey)
    }

    /// Resolve up to `count` distinct endpoints clockwise from `key`.
    pub fn find_many(
        &self,
        service: &str,
        key: &[u8],
        count: usize,
    ) -> Vec<Endpoint> {
        self.snapshot()
            .get(service)
            .map(|ring| ring.find_many(key, count))
            .unwrap_or_default()
    }

    /// Every online endpoint of the type, in canonical order.
    pub fn get_all(&self, service: &str) -> Vec<Endpoint> {
        self.snapshot()
            .get(service)
            .map(|ring| ring.endpoints().cloned().collect())
            .unwrap_or_default()
    }
}

/// Spawns the ring manager actor.
///
/// The actor is the single writer over the ring set; readers go through the
/// returned [`RingReader`] and never contend with it.
pub(crate) fn start_ring_manager(
    vnodes_per_endpoint: usize,
) -> (RingManagerHandle, RingReader) {
    let (tx, rx) = flume::unbounded();
    let table: Arc<RwLock<Arc<RingTable>>> = Arc::new(RwLock::new(Arc::new(
        RingTable::default(),
    )));

    let reader = RingReader {
        table: table.clone(),
    };

    tokio::spawn(run_ring_manager(rx, table, vnodes_per_endpoint));

    (RingManagerHandle { tx }, reader)
}

async fn run_ring_manager(
    ops: flume::Receiver<RingOp>,
    table: Arc<RwLock<Arc<RingTable>>>,
    vnodes_per_endpoint: usize,
) {
    let mut rings: HashMap<ServiceType, HashRing> = HashMap::new();

    while let Ok(op) = ops.recv_async().await {
        match op {
            RingOp::ApplyDiff(diff, tx) => {
                apply_diff(&mut rings, &diff, vnodes_per_endpoint);
                publish(&table, &rings, &diff.service);
                let _ = tx.send(());
            },
            RingOp::Shutdown(tx) => {
                let _ = tx.send(());
                break;
            },
        }
    }

    debug!("Ring manager has stopped.");
}

/// Applies one type diff to the working ring set.
///
/// Leaves apply before joins. A leave whose endpoint also joins with an
/// online state in the same diff is suppressed so that a replace-in-place
/// keeps the endpoint ringed under its new metadata.
fn apply_diff(
    rings: &mut HashMap<ServiceType, HashRing>,
    diff: &TypeDiff,
    vnodes_per_endpoint: usize,
) {
    let ring = rings
        .entry(diff.service.clone())
        .or_insert_with(|| HashRing::new(vnodes_per_endpoint));

    for (endpoint, _) in &diff.leaves {
        let rejoins_online = diff
            .joins
            .iter()
            .any(|(joined, meta)| joined == endpoint && meta.is_online());
        if !rejoins_online {
            ring.remove(endpoint);
        }
    }

    for (endpoint, meta) in &diff.joins {
        if meta.is_online() {
            ring.insert(endpoint.clone());
        } else {
            ring.remove(endpoint);
        }
    }

    if ring.is_empty() {
        rings.remove(&diff.service);
    }
}

/// Publishes a copy-on-write snapshot of the ring for `service`.
fn publish(
    table: &RwLock<Arc<RingTable>>,
    rings: &HashMap<ServiceType, HashRing>,
    service: &ServiceType,
) {
    let mut next = RingTable::clone(&table.read());
    match rings.get(service) {
        Some(ring) => {
            next.insert(service.clone(), Arc::new(ring.clone()));
        },
        None => {
            next.remove(service);
        },
    }
    *table.write() = Arc::new(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ServiceMeta, ServiceState};

    fn endpoint(n: usize) -> Endpoint {
        Endpoint::new("node-a", format!("worker-{n}").into_bytes())
    }

    fn meta(state: ServiceState, version: u64) -> ServiceMeta {
        ServiceMeta {
            node: "node-a".into(),
            state,
            version,
        }
    }

    fn diff(
        joins: Vec<(Endpoint, ServiceMeta)>,
        leaves: Vec<(Endpoint, ServiceMeta)>,
    ) -> TypeDiff {
        TypeDiff {
            service: "t".into(),
            joins,
            leaves,
        }
    }

    #[test]
    fn test_online_join_enters_the_ring() {
        let mut rings = HashMap::new();
        apply_diff(
            &mut rings,
            &diff(vec![(endpoint(1), meta(ServiceState::Online, 1))], vec![]),
            16,
        );
        assert!(rings.get("t").unwrap().contains(&endpoint(1)));
    }

    #[test]
    fn test_offline_join_is_excluded_from_the_ring() {
        let mut rings = HashMap::new();
        apply_diff(
            &mut rings,
            &diff(vec![(endpoint(1), meta(ServiceState::Online, 1))], vec![]),
            16,
        );
        apply_diff(
            &mut rings,
            &diff(
                vec![(endpoint(1), meta(ServiceState::Offline, 2))],
                vec![(endpoint(1), meta(ServiceState::Online, 1))],
            ),
            16,
        );
        assert!(!rings.contains_key("t"), "Empty rings are collected.");
    }

    #[test]
    fn test_replace_in_place_keeps_the_endpoint_ringed() {
        let mut rings = HashMap::new();
        apply_diff(
            &mut rings,
            &diff(vec![(endpoint(1), meta(ServiceState::Online, 1))], vec![]),
            16,
        );
        // The same endpoint leaves and re-joins online within one diff:
        // the leave must not empty the ring.
        apply_diff(
            &mut rings,
            &diff(
                vec![(endpoint(1), meta(ServiceState::Online, 2))],
                vec![(endpoint(1), meta(ServiceState::Online, 1))],
            ),
            16,
        );
        assert!(rings.get("t").unwrap().contains(&endpoint(1)));
    }

    #[tokio::test]
    async fn test_reader_observes_published_snapshots() {
        let (handle, reader) = start_ring_manager(16);

        assert!(matches!(
            reader.find_one("t", b"k"),
            Err(DispatchError::NoServiceForKey),
        ));

        handle
            .apply_diff(diff(
                vec![(endpoint(1), meta(ServiceState::Online, 1))],
                vec![],
            ))
            .await;

        let resolved = reader.find_one("t", b"k").expect("Resolve endpoint.");
        assert_eq!(resolved, endpoint(1));
        assert_eq!(reader.get_all("t"), vec![endpoint(1)]);
    }
}
