use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dispatch_pubsub::{PubSub, Subscription, Topic};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::endpoint::{Endpoint, NodeId};
use crate::error::DispatchError;
use crate::ring::{RingReader, RouteKey};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What travels on an endpoint's delivery topic.
enum Envelope {
    Cast {
        payload: Bytes,
    },
    Call {
        correlation: u64,
        reply_node: NodeId,
        reply_topic: Topic,
        payload: Bytes,
    },
    Reply {
        correlation: u64,
        payload: Bytes,
    },
}

/// The delivery topic for an endpoint, derived from its opaque handle.
pub(crate) fn endpoint_topic(endpoint: &Endpoint) -> String {
    format!("dispatch:ep:{}", hex(&endpoint.handle))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// A message delivered to a [`Mailbox`].
pub enum Delivery {
    /// Fire-and-forget payload; nothing to answer.
    Cast(Bytes),
    /// Request payload paired with the responder the reply goes through.
    Call(Bytes, Responder),
}

/// Answers one [`Delivery::Call`].
pub struct Responder {
    transport: Arc<dyn PubSub>,
    reply_node: NodeId,
    reply_topic: Topic,
    correlation: u64,
}

impl Responder {
    /// Send the reply back to the caller.
    ///
    /// Delivery is best-effort: if the caller's node has already gone away
    /// the reply is dropped and the caller times out on its own deadline.
    pub fn reply(self, payload: impl Into<Bytes>) {
        let envelope = Envelope::Reply {
            correlation: self.correlation,
            payload: payload.into(),
        };
        let Ok(encoded) = serde_json::to_vec(&envelope) else {
            return;
        };

        if let Err(error) = self.transport.direct_broadcast(
            &self.reply_node,
            &self.reply_topic,
            Bytes::from(encoded),
        ) {
            warn!(
                error = %error,
                caller_node_id = %self.reply_node,
                "Failed to deliver reply; the caller will time out.",
            );
        }
    }
}

/// The receiving half of a service endpoint.
///
/// A mailbox is this node's delivery point for one endpoint handle:
/// register its [`Mailbox::endpoint`] with the registry and consume
/// deliveries with [`Mailbox::recv`]. Dropping the mailbox reports the
/// endpoint's termination to the registry, which removes any of its
/// remaining registrations.
pub struct Mailbox {
    endpoint: Endpoint,
    sub: Subscription,
    transport: Arc<dyn PubSub>,
    deaths: flume::Sender<Endpoint>,
}

impl Mailbox {
    pub(crate) fn new(
        transport: Arc<dyn PubSub>,
        endpoint: Endpoint,
        deaths: flume::Sender<Endpoint>,
    ) -> Self {
        let sub = transport.subscribe(&endpoint_topic(&endpoint));
        Self {
            endpoint,
            sub,
            transport,
            deaths,
        }
    }

    #[inline]
    /// The cluster-wide identity of this mailbox.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Waits for the next delivery addressed to this endpoint.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            let msg = self.sub.recv().await?;
            match serde_json::from_slice::<Envelope>(&msg.payload) {
                Ok(Envelope::Cast { payload }) => return Some(Delivery::Cast(payload)),
                Ok(Envelope::Call {
                    correlation,
                    reply_node,
                    reply_topic,
                    payload,
                }) => {
                    let responder = Responder {
                        transport: self.transport.clone(),
                        reply_node,
                        reply_topic,
                        correlation,
                    };
                    return Some(Delivery::Call(payload, responder));
                },
                Ok(Envelope::Reply { .. }) => {
                    debug!(endpoint = %self.endpoint, "Ignored stray reply envelope.");
                },
                Err(error) => {
                    warn!(
                        error = %error,
                        endpoint = %self.endpoint,
                        "Dropped malformed delivery payload.",
                    );
                },
            }
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let _ = self.deaths.send(self.endpoint.clone());
    }
}

#[derive(Clone)]
/// Key-routed delivery sugar over the registry.
///
/// Resolution goes through the local ring snapshots, delivery through the
/// transport; neither adds any consistency guarantee beyond what the
/// registry itself provides.
pub struct DispatchClient {
    node: NodeId,
    transport: Arc<dyn PubSub>,
    rings: RingReader,
    default_timeout: Duration,
    reply_topic: Topic,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Bytes>>>>,
    next_correlation: Arc<AtomicU64>,
}

impl DispatchClient {
    pub(crate) fn new(
        transport: Arc<dyn PubSub>,
        rings: RingReader,
        default_timeout: Duration,
    ) -> Self {
        let node = transport.node_id().clone();
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let reply_topic = Topic::from(format!("dispatch:reply:{node}:{client_id}"));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Bytes>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sub = transport.subscribe(&reply_topic);
        tokio::spawn(run_reply_pump(sub, pending.clone()));

        Self {
            node,
            transport,
            rings,
            default_timeout,
            reply_topic,
            pending,
            next_correlation: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    /// The timeout applied when a call does not pass one explicitly.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Resolve the key's endpoint and deliver `msg` fire-and-forget.
    pub fn cast(
        &self,
        service: &str,
        key: impl RouteKey,
        msg: impl Into<Bytes>,
    ) -> Result<Endpoint, DispatchError> {
        let endpoint = self.resolve_one(service, key)?;
        self.cast_endpoint(&endpoint, msg.into());
        Ok(endpoint)
    }

    /// Resolve the key's endpoint, deliver `msg` and await the reply.
    ///
    /// `timeout` defaults to the configured call deadline. No attempt is
    /// made to cancel the remote work when the deadline elapses.
    pub async fn call(
        &self,
        service: &str,
        key: impl RouteKey,
        msg: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, DispatchError> {
        let endpoint = self.resolve_one(service, key)?;
        self.call_endpoint(&endpoint, msg.into(), timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Resolve up to `count` endpoints for the key and fan the cast out to
    /// all of them. Returns the endpoints the message was sent towards.
    pub fn multi_cast(
        &self,
        count: usize,
        service: &str,
        key: impl RouteKey,
        msg: impl Into<Bytes>,
    ) -> Result<Vec<Endpoint>, DispatchError> {
        let endpoints = self.resolve_many(count, service, key)?;
        let payload = msg.into();
        for endpoint in &endpoints {
            self.cast_endpoint(endpoint, payload.clone());
        }
        Ok(endpoints)
    }

    /// Resolve up to `count` endpoints and issue the calls in parallel.
    ///
    /// Returns every endpoint paired with its reply or failure, in the
    /// arbitrary order the calls completed.
    pub async fn multi_call(
        &self,
        count: usize,
        service: &str,
        key: impl RouteKey,
        msg: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Vec<(Endpoint, Result<Bytes, DispatchError>)>, DispatchError> {
        let endpoints = self.resolve_many(count, service, key)?;
        let payload = msg.into();
        let deadline = timeout.unwrap_or(self.default_timeout);

        let mut calls = endpoints
            .into_iter()
            .map(|endpoint| {
                let payload = payload.clone();
                async move {
                    let result = self.call_endpoint(&endpoint, payload, deadline).await;
                    (endpoint, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut results = Vec::with_capacity(calls.len());
        while let Some(outcome) = calls.next().await {
            results.push(outcome);
        }
        Ok(results)
    }

    fn resolve_one(
        &self,
        service: &str,
        key: impl RouteKey,
    ) -> Result<Endpoint, DispatchError> {
        self.rings
            .find_one(service, &key.route_bytes())
            .map_err(|_| DispatchError::ServiceUnavailable)
    }

    fn resolve_many(
        &self,
        count: usize,
        service: &str,
        key: impl RouteKey,
    ) -> Result<Vec<Endpoint>, DispatchError> {
        let endpoints = self.rings.find_many(service, &key.route_bytes(), count);
        if endpoints.is_empty() {
            return Err(DispatchError::ServiceUnavailable);
        }
        Ok(endpoints)
    }

    fn cast_endpoint(&self, endpoint: &Endpoint, payload: Bytes) {
        let envelope = Envelope::Cast { payload };
        let Ok(encoded) = serde_json::to_vec(&envelope) else {
            return;
        };

        if let Err(error) = self.transport.direct_broadcast(
            &endpoint.node,
            &endpoint_topic(endpoint),
            Bytes::from(encoded),
        ) {
            // Fire-and-forget: the registry will converge the departed
            // endpoint out of the ring on its own.
            warn!(
                error = %error,
                endpoint = %endpoint,
                "Failed to deliver cast.",
            );
        }
    }

    async fn call_endpoint(
        &self,
        endpoint: &Endpoint,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<Bytes, DispatchError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation, tx);

        let envelope = Envelope::Call {
            correlation,
            reply_node: self.node.clone(),
            reply_topic: self.reply_topic.clone(),
            payload,
        };
        let Ok(encoded) = serde_json::to_vec(&envelope) else {
            self.pending.lock().remove(&correlation);
            warn!(endpoint = %endpoint, "Failed to encode call envelope.");
            return Err(DispatchError::ServiceUnavailable);
        };

        if let Err(error) = self.transport.direct_broadcast(
            &endpoint.node,
            &endpoint_topic(endpoint),
            Bytes::from(encoded),
        ) {
            self.pending.lock().remove(&correlation);
            warn!(error = %error, endpoint = %endpoint, "Failed to deliver call.");
            return Err(DispatchError::ServiceUnavailable);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => {
                self.pending.lock().remove(&correlation);
                Err(DispatchError::Timeout)
            },
        }
    }
}

async fn run_reply_pump(
    sub: Subscription,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Bytes>>>>,
) {
    while let Some(msg) = sub.recv().await {
        match serde_json::from_slice::<Envelope>(&msg.payload) {
            Ok(Envelope::Reply {
                correlation,
                payload,
            }) => {
                // A missing entry just means the caller already timed out.
                if let Some(tx) = pending.lock().remove(&correlation) {
                    let _ = tx.send(payload);
                }
            },
            Ok(_) => {
                debug!(topic = %msg.topic, "Ignored non-reply envelope on reply topic.");
            },
            Err(error) => {
                warn!(error = %error, "Dropped malformed reply payload.");
            },
        }
    }
}
