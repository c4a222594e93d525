//! # Dispatch
//! A distributed service registry with consistent-hash routing for
//! building clustered Rust applications.
//!
//! This is a convenience package which includes the sub-projects within
//! Dispatch, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `dispatch_registry` - The registry itself: presence tracking over gossip,
//!   per-type consistent-hash rings and key-routed delivery sugar.
//! - `dispatch_pubsub` - The topic-addressed pub/sub transport contract the
//!   registry runs on, with an in-process implementation.

#[cfg(feature = "dispatch-pubsub")]
pub use dispatch_pubsub as pubsub;
#[cfg(feature = "dispatch-registry")]
pub use dispatch_registry as registry;
