//! seqsub_broker
//!
//! The broker core: a streaming pub/sub state machine layered on the
//! `seqsub_bus` message bus and the `seqsub_store` persistence contract.
//! Publications get per-channel monotonic sequences and are pushed to
//! subscribers at-least-once, with per-message acks, ack-wait driven
//! redelivery, durable resumption and queue-group load balancing. Client
//! liveness is tracked by heartbeats, duplicate client ids are arbitrated
//! against the existing owner.
//!
//! Modules:
//!
//! - `engine`: the [`Broker`] itself — startup, request dispatch,
//!   duplicate-id handling, heartbeats, recovery, shutdown.
//! - `delivery`: the delivery pipeline and ack timers.
//! - `channel` / `sub` / `clients`: runtime state (channels with their
//!   subscription directories, subscription state, the client registry).
//! - `protocol`: the JSON control and data frames.
//! - `errors`: protocol sentinels and fatal startup errors.

pub mod channel;
pub mod clients;
mod delivery;
pub mod engine;
pub mod errors;
pub mod protocol;
pub mod sub;

pub use engine::{Broker, BrokerOptions, ServerInfo};
pub use errors::{ProtoError, StartError};

#[cfg(test)]
mod tests;
