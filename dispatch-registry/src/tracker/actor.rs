use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dispatch_pubsub::{Message, PubSub};
use tokio::time::{interval, MissedTickBehavior};

use super::replica::{Replica, TypeDiff};
use super::{EventKind, Heartbeat, ServiceEvent, TrackerHandle, TrackerOp, WireEntry, PRESENCE_TOPIC};
use crate::clock::Clock;
use crate::statistics::RegistryStatistics;
use crate::Config;

/// Everything the tracker actor needs to run.
pub(crate) struct TrackerContext {
    pub(crate) transport: Arc<dyn PubSub>,
    pub(crate) clock: Clock,
    pub(crate) config: Config,
    pub(crate) rings: crate::ring::RingManagerHandle,
    pub(crate) statistics: RegistryStatistics,
}

/// Spawns the tracker actor, the single writer over this node's presence
/// replica.
///
/// The actor is fail-stop: if it ever dies abnormally the node keeps
/// serving its last published ring snapshots but stops converging, and
/// the watcher makes that loudly visible.
pub(crate) fn spawn_tracker(ctx: TrackerContext) -> TrackerHandle {
    let (tx, rx) = flume::unbounded();
    let task = tokio::spawn(run_tracker(ctx, rx));
    tokio::spawn(async move {
        if let Err(error) = task.await {
            if error.is_panic() {
                error!(
                    error = ?error,
                    "Presence tracker terminated abnormally. \
                    This node will no longer converge with the cluster.",
                );
            }
        }
    });
    TrackerHandle::new(tx)
}

async fn run_tracker(ctx: TrackerContext, ops: flume::Receiver<TrackerOp>) {
    let node = ctx.transport.node_id().clone();
    let gossip = ctx.transport.subscribe(PRESENCE_TOPIC);
    let mut replica = Replica::new(node.clone());

    let mut tick = interval(ctx.config.broadcast_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        node_id = %node,
        broadcast_period = ?ctx.config.broadcast_period,
        max_silent_periods = ctx.config.max_silent_periods,
        "Presence tracker is running.",
    );

    loop {
        tokio::select! {
            op = ops.recv_async() => {
                match op {
                    Ok(TrackerOp::Shutdown { tx }) => {
                        graceful_shutdown(&ctx, &mut replica).await;
                        let _ = tx.send(());
                        break;
                    },
                    Ok(op) => handle_op(&ctx, &mut replica, op).await,
                    Err(_) => {
                        // Every handle is gone; nothing can reach the
                        // tracker any more.
                        debug!(node_id = %node, "Tracker handles dropped. Stopping.");
                        break;
                    },
                }
            },
            msg = gossip.recv() => {
                match msg {
                    Some(msg) => handle_gossip(&ctx, &mut replica, msg).await,
                    None => {
                        debug!(node_id = %node, "Presence subscription closed. Stopping.");
                        break;
                    },
                }
            },
            _ = tick.tick() => {
                broadcast_heartbeat(&ctx, &replica);
                expire_silent_peers(&ctx, &mut replica).await;
            },
        }
    }
}

async fn handle_op(ctx: &TrackerContext, replica: &mut Replica, op: TrackerOp) {
    match op {
        TrackerOp::Track {
            service,
            endpoint,
            state,
            tx,
        } => {
            let result = match replica.track(service, endpoint, state) {
                Ok((version, diff)) => {
                    process_diffs(ctx, [diff]).await;
                    Ok(version)
                },
                Err(error) => Err(error),
            };
            let _ = tx.send(result);
        },
        TrackerOp::Update {
            service,
            endpoint,
            state,
            tx,
        } => {
            let result = match replica.update(service, endpoint, state) {
                Ok((version, diff)) => {
                    // Re-asserting the current state produces no diff.
                    if !diff.is_empty() {
                        process_diffs(ctx, [diff]).await;
                    }
                    Ok(version)
                },
                Err(error) => Err(error),
            };
            let _ = tx.send(result);
        },
        TrackerOp::Untrack {
            service,
            endpoint,
            tx,
        } => {
            if let Some(diff) = replica.untrack(service, endpoint) {
                process_diffs(ctx, [diff]).await;
            }
            let _ = tx.send(());
        },
        TrackerOp::UntrackEndpoint { endpoint } => {
            let diffs = replica.untrack_endpoint(&endpoint);
            if !diffs.is_empty() {
                debug!(
                    node_id = %replica.node(),
                    endpoint = %endpoint,
                    "Endpoint terminated, removing its registrations.",
                );
                process_diffs(ctx, diffs).await;
            }
        },
        TrackerOp::List { service, tx } => {
            let _ = tx.send(replica.list(&service));
        },
        TrackerOp::Shutdown { .. } => unreachable!("Handled by the main loop."),
    }

    ctx.statistics
        .num_local_services
        .store(replica.num_local() as u64, Ordering::Relaxed);
}

async fn handle_gossip(ctx: &TrackerContext, replica: &mut Replica, msg: Message) {
    let heartbeat = match serde_json::from_slice::<Heartbeat>(&msg.payload) {
        Ok(heartbeat) => heartbeat,
        Err(error) => {
            warn!(error = %error, "Dropped malformed presence payload.");
            ctx.statistics
                .num_malformed_payloads
                .fetch_add(1, Ordering::Relaxed);
            return;
        },
    };

    // Our own broadcasts come back through the loopback.
    if &heartbeat.node == replica.node() {
        return;
    }

    ctx.statistics
        .num_heartbeats_received
        .fetch_add(1, Ordering::Relaxed);

    let entries = heartbeat
        .entries
        .into_iter()
        .map(|entry| (entry.service, entry.endpoint, entry.meta))
        .collect();

    let outcome = replica.apply_heartbeat(&heartbeat.node, entries, ctx.clock.now());
    if outcome.rejected > 0 {
        warn!(
            peer_node_id = %heartbeat.node,
            num_rejected = outcome.rejected,
            "Peer advertised entries it does not own. Entries dropped.",
        );
        ctx.statistics
            .num_malformed_payloads
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
    }

    process_diffs(ctx, outcome.diffs).await;
    ctx.statistics
        .num_known_peers
        .store(replica.num_peers() as u64, Ordering::Relaxed);
}

fn broadcast_heartbeat(ctx: &TrackerContext, replica: &Replica) {
    let heartbeat = Heartbeat {
        node: replica.node().clone(),
        entries: replica
            .local_entries()
            .into_iter()
            .map(|(service, endpoint, meta)| WireEntry {
                service,
                endpoint,
                meta,
            })
            .collect(),
    };

    match serde_json::to_vec(&heartbeat) {
        Ok(payload) => {
            if let Err(error) = ctx
                .transport
                .broadcast(PRESENCE_TOPIC, Bytes::from(payload))
            {
                // Non-fatal: the next tick re-broadcasts full state.
                warn!(error = %error, "Failed to broadcast heartbeat.");
                ctx.statistics
                    .num_transport_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
        },
        Err(error) => {
            error!(error = %error, "Failed to encode heartbeat.");
        },
    }
}

async fn expire_silent_peers(ctx: &TrackerContext, replica: &mut Replica) {
    let horizon = ctx.config.liveness_horizon();
    let expired = replica.expire_silent(ctx.clock.now(), horizon);

    for (peer, diffs) in expired {
        info!(
            node_id = %replica.node(),
            peer_node_id = %peer,
            horizon = ?horizon,
            "Peer went silent past the liveness horizon. Evicting its services.",
        );
        ctx.statistics
            .num_expired_peers
            .fetch_add(1, Ordering::Relaxed);
        process_diffs(ctx, diffs).await;
    }

    ctx.statistics
        .num_known_peers
        .store(replica.num_peers() as u64, Ordering::Relaxed);
}

/// Feeds diffs to the ring manager and announces them to local
/// subscribers, leaves before joins.
///
/// The ring application is waited on so that an owner operation returning
/// to its caller (and any event published below) happens-after the new
/// ring snapshot is readable.
async fn process_diffs(ctx: &TrackerContext, diffs: impl IntoIterator<Item = TypeDiff>) {
    for diff in diffs {
        ctx.rings.apply_diff(diff.clone()).await;

        for (endpoint, meta) in diff.leaves {
            publish_event(ctx, &diff.service, EventKind::Leave, endpoint, meta);
        }
        for (endpoint, meta) in diff.joins {
            publish_event(ctx, &diff.service, EventKind::Join, endpoint, meta);
        }
    }
}

fn publish_event(
    ctx: &TrackerContext,
    service: &str,
    kind: EventKind,
    endpoint: crate::endpoint::Endpoint,
    meta: crate::endpoint::ServiceMeta,
) {
    let event = ServiceEvent {
        kind,
        endpoint,
        meta,
    };

    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => Bytes::from(payload),
        Err(error) => {
            error!(error = %error, "Failed to encode membership event.");
            return;
        },
    };

    // Join/leave announcements only fan out to colocated subscribers;
    // remote nodes derive their own from gossip.
    let node = ctx.transport.node_id().clone();
    if let Err(error) = ctx.transport.direct_broadcast(&node, service, payload) {
        warn!(error = %error, topic = %service, "Failed to publish membership event.");
        ctx.statistics
            .num_transport_errors
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Stop accepting owner operations, emit leaves for every local entry,
/// flush one final empty heartbeat, then stop.
async fn graceful_shutdown(ctx: &TrackerContext, replica: &mut Replica) {
    let node = replica.node().clone();
    let diffs = replica.drain_local();
    process_diffs(ctx, diffs).await;
    broadcast_heartbeat(ctx, replica);

    ctx.statistics.num_local_services.store(0, Ordering::Relaxed);
    info!(node_id = %node, "Presence tracker has shut down.");
}
