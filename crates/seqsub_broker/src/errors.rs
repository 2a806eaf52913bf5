//! Broker error types.
//!
//! [`ProtoError`] values travel back to clients verbatim: the `Display`
//! string of each variant is the wire `error` field. They never mutate
//! broker state. [`StartError`] covers fatal startup problems (store
//! configuration, bus subscription failures) and is surfaced by the
//! binary as a process exit.

use seqsub_bus::BusError;
use seqsub_store::StoreError;
use thiserror::Error;

/// Protocol-level errors, returned in-band in response frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("invalid connect request")]
    InvalidConnect,
    #[error("invalid publish request")]
    InvalidPublish,
    #[error("invalid subscribe request")]
    InvalidSubscribe,
    #[error("invalid unsubscribe request")]
    InvalidUnsubscribe,
    #[error("invalid close request")]
    InvalidClose,
    #[error("invalid client id")]
    InvalidClientId,
    #[error("client id already registered")]
    DuplicateClientId,
    #[error("invalid channel")]
    InvalidChannel,
    #[error("maximum number of channels reached")]
    TooManyChannels,
    #[error("maximum number of subscriptions reached")]
    TooManySubs,
    #[error("invalid ack wait time")]
    InvalidAckWait,
    #[error("invalid max inflight value")]
    InvalidMaxInFlight,
    #[error("unknown start sequence")]
    UnknownSequence,
    #[error("unknown start time")]
    UnknownTimeDelta,
    #[error("duplicate durable subscription")]
    DuplicateDurable,
    #[error("unknown subscription")]
    UnknownSubscription,
    #[error("subscription not owned by client")]
    NotOwned,
    #[error("unknown client id")]
    UnknownClient,
    /// Store failure text propagated to the requester.
    #[error("{0}")]
    Store(String),
}

impl From<StoreError> for ProtoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MaxChannels => ProtoError::TooManyChannels,
            StoreError::MaxSubs => ProtoError::TooManySubs,
            other => ProtoError::Store(other.to_string()),
        }
    }
}

/// Fatal errors while bringing the broker up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
}
