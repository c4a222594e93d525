use thiserror::Error;

use crate::endpoint::Endpoint;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("endpoint is not registered with the local tracker for this service type")]
    /// An enable/disable/update was issued for an endpoint this node never
    /// registered (or has since removed).
    NotRegistered,

    #[error("endpoint {0} is not owned by this node")]
    /// Only the owning node may mutate an endpoint's presence entries.
    NotOwned(Endpoint),

    #[error("no online endpoint of the requested type could be resolved for the key")]
    /// The type's ring is absent or empty.
    NoServiceForKey,

    #[error("no endpoint was available to deliver the message to")]
    /// Client-side delivery sugar failed to resolve any endpoint.
    ServiceUnavailable,

    #[error("the call deadline elapsed before a reply arrived")]
    Timeout,

    #[error("the registry has been shut down")]
    /// A component the operation depends on is no longer running.
    Closed,
}
