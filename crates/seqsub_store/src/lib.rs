//! seqsub_store
//!
//! Persistence for the broker: per-channel message logs keyed by sequence,
//! subscription records with their pending (unacknowledged) sequences, and
//! the client registry. Two backends implement the [`Store`] trait: an
//! in-memory map ([`memory::MemoryStore`]) and a sled-backed file store
//! ([`file::FileStore`]) that survives restarts and reports recovered
//! state.
//!
//! Limits are enforced here, before admission: `max_channels` and
//! `max_subs` reject, `max_msgs` and `max_age` evict oldest messages,
//! `max_payload_bytes` rejects the individual publish.

pub mod file;
pub mod memory;


use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend identifier for the in-memory store.
pub const TYPE_MEMORY: &str = "memory";
/// Backend identifier for the sled file store.
pub const TYPE_FILE: &str = "file";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown store backend {0:?}")]
    UnknownBackend(String),
    #[error("file store requires a directory")]
    MissingDirectory,
    #[error("cluster id mismatch: store has {stored:?}, configured {configured:?}")]
    ClusterIdMismatch { stored: String, configured: String },
    #[error("maximum number of channels reached")]
    MaxChannels,
    #[error("maximum number of subscriptions reached")]
    MaxSubs,
    #[error("message payload exceeds limit of {0} bytes")]
    PayloadTooLarge(usize),
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("storage failure: {0}")]
    Io(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// A message at rest: the broker-assigned sequence, the payload and the
/// publish timestamp in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub channel: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

/// A connected client as persisted for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub hb_inbox: String,
}

/// Persistent view of one subscription. `last_sent` is the delivery
/// cursor; pending sequences are stored separately via
/// [`Store::add_seq_pending`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRecord {
    pub id: u64,
    pub client_id: String,
    pub channel: String,
    pub inbox: String,
    pub ack_inbox: String,
    #[serde(default)]
    pub queue_group: Option<String>,
    #[serde(default)]
    pub durable_name: Option<String>,
    pub ack_wait_secs: i64,
    pub max_in_flight: u32,
    pub last_sent: u64,
}

/// State handed back by [`Store::recover`] after a restart.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub clients: Vec<ClientInfo>,
    pub channels: Vec<RecoveredChannel>,
}

#[derive(Debug)]
pub struct RecoveredChannel {
    pub name: String,
    pub subs: Vec<RecoveredSub>,
}

#[derive(Debug)]
pub struct RecoveredSub {
    pub record: SubRecord,
    /// Sequences that were in flight when the broker went down.
    pub pending: Vec<u64>,
}

/// Per-channel limits, applied by both backends.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub max_channels: usize,
    pub max_subs: usize,
    pub max_msgs: usize,
    pub max_payload_bytes: usize,
    /// Oldest messages beyond this age are evicted on the next append.
    pub max_age: Option<Duration>,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_channels: 100,
            max_subs: 1000,
            max_msgs: 1_000_000,
            max_payload_bytes: 1024 * 1024,
            max_age: None,
        }
    }
}

/// The persistence contract consumed by the broker.
///
/// Channel-name arguments refer to channels previously admitted through
/// `create_channel`; message lookups on unknown channels simply return
/// nothing. Sequences start at 1 per channel and are assigned by
/// `store_msg`.
pub trait Store: Send + Sync {
    /// Backend identifier, `"memory"` or `"file"`.
    fn backend(&self) -> &'static str;

    /// State recovered from a previous run, if the backend persists any.
    fn recover(&self) -> Result<Option<RecoveredState>, StoreError>;

    fn has_channel(&self, channel: &str) -> bool;
    fn channel_count(&self) -> usize;

    /// Admit a channel; idempotent. Fails with [`StoreError::MaxChannels`]
    /// when the channel is new and the limit is reached.
    fn create_channel(&self, channel: &str) -> Result<(), StoreError>;

    /// Append a message, assigning the next sequence. Enforces the payload
    /// size limit and evicts oldest messages past `max_msgs`/`max_age`.
    fn store_msg(
        &self,
        channel: &str,
        payload: &[u8],
        timestamp: i64,
    ) -> Result<StoredMessage, StoreError>;

    fn lookup_msg(&self, channel: &str, seq: u64) -> Result<Option<StoredMessage>, StoreError>;

    /// Smallest stored sequence, or 0 when the log is empty.
    fn first_sequence(&self, channel: &str) -> Result<u64, StoreError>;

    /// Highest assigned sequence, or 0 when nothing was ever stored.
    /// Unlike `first_sequence` this does not move when messages are
    /// evicted.
    fn last_sequence(&self, channel: &str) -> Result<u64, StoreError>;

    /// Sequence of the oldest stored message with `timestamp >= ts`, or 0
    /// when there is none.
    fn sequence_for_timestamp(&self, channel: &str, ts: i64) -> Result<u64, StoreError>;

    /// Persist a subscription record. Fails with [`StoreError::MaxSubs`]
    /// when the channel already carries `max_subs` records.
    fn create_sub(&self, rec: &SubRecord) -> Result<(), StoreError>;

    /// Overwrite the record of an existing subscription (cursor updates,
    /// durable rebinds).
    fn update_sub(&self, rec: &SubRecord) -> Result<(), StoreError>;

    /// Remove a subscription record and all its pending sequences.
    fn delete_sub(&self, channel: &str, sub_id: u64) -> Result<(), StoreError>;

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;
    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;

    fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError>;
    fn delete_client(&self, client_id: &str) -> Result<(), StoreError>;

    /// Flush and release the backend. Idempotent.
    fn close(&self) -> Result<(), StoreError>;
}

/// Open the store selected by `backend`.
///
/// The file backend requires a non-empty `dir` and verifies that the
/// directory was written by the same `cluster_id`; both violations are
/// fatal configuration errors, as is an unknown backend string.
pub fn open_store(
    backend: &str,
    dir: &str,
    cluster_id: &str,
    limits: StoreLimits,
) -> Result<Arc<dyn Store>, StoreError> {
    match backend {
        TYPE_MEMORY => Ok(Arc::new(memory::MemoryStore::new(limits))),
        TYPE_FILE => {
            if dir.is_empty() {
                return Err(StoreError::MissingDirectory);
            }
            Ok(Arc::new(file::FileStore::open(dir, cluster_id, limits)?))
        }
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}
