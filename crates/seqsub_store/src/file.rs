//! File store backend on sled.
//!
//! One database under the configured directory, one tree per concern:
//!
//! - `meta`: the cluster id that owns this directory
//! - `channels`: channel name → highest assigned sequence (big-endian u64)
//! - `msgs:<channel>`: sequence (big-endian u64) → message JSON; the key
//!   encoding keeps scans in sequence order
//! - `clients`: client id → client JSON
//! - `subs`: subscription id (big-endian u64) → record JSON
//! - `pending`: subscription id + sequence (two big-endian u64) → empty
//!
//! The directory is pinned to a cluster id on first open; reopening it
//! under a different id is refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use sled::Tree;
use tracing::debug;

use crate::{
    ClientInfo, RecoveredChannel, RecoveredState, RecoveredSub, Store, StoreError, StoreLimits,
    StoredMessage, SubRecord, TYPE_FILE,
};

const META_CLUSTER_ID: &str = "cluster_id";

pub struct FileStore {
    db: sled::Db,
    limits: StoreLimits,
    channels: Tree,
    clients: Tree,
    subs: Tree,
    pending: Tree,
    /// True when the directory was created by this open, i.e. there is no
    /// previous run to recover.
    fresh: bool,
    closed: AtomicBool,
}

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn pending_key(sub_id: u64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&sub_id.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn decode_seq(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

impl FileStore {
    /// Open (or create) the store under `dir` for `cluster_id`.
    pub fn open(dir: &str, cluster_id: &str, limits: StoreLimits) -> Result<Self, StoreError> {
        let db = sled::open(dir)?;
        let meta = db.open_tree("meta")?;

        let fresh = match meta.get(META_CLUSTER_ID)? {
            Some(stored) => {
                let stored = String::from_utf8_lossy(&stored).to_string();
                if stored != cluster_id {
                    return Err(StoreError::ClusterIdMismatch {
                        stored,
                        configured: cluster_id.to_string(),
                    });
                }
                false
            }
            None => {
                meta.insert(META_CLUSTER_ID, cluster_id.as_bytes())?;
                true
            }
        };

        debug!(dir, cluster_id, fresh, "file store opened");

        Ok(Self {
            channels: db.open_tree("channels")?,
            clients: db.open_tree("clients")?,
            subs: db.open_tree("subs")?,
            pending: db.open_tree("pending")?,
            db,
            limits,
            fresh,
            closed: AtomicBool::new(false),
        })
    }

    fn msgs_tree(&self, channel: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("msgs:{channel}"))?)
    }

    fn channel_last_seq(&self, channel: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.channels.get(channel)?.map(|v| decode_seq(&v)))
    }

    fn sub_count_for_channel(&self, channel: &str) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.subs.iter() {
            let (_, value) = entry?;
            let rec: SubRecord = serde_json::from_slice(&value)?;
            if rec.channel == channel {
                count += 1;
            }
        }
        Ok(count)
    }

    fn pending_for_sub(&self, sub_id: u64) -> Result<Vec<u64>, StoreError> {
        let mut seqs = Vec::new();
        for entry in self.pending.scan_prefix(sub_id.to_be_bytes()) {
            let (key, _) = entry?;
            seqs.push(decode_seq(&key[8..]));
        }
        Ok(seqs)
    }
}

impl Store for FileStore {
    fn backend(&self) -> &'static str {
        TYPE_FILE
    }

    fn recover(&self) -> Result<Option<RecoveredState>, StoreError> {
        if self.fresh {
            return Ok(None);
        }

        let mut state = RecoveredState::default();

        for entry in self.clients.iter() {
            let (_, value) = entry?;
            state.clients.push(serde_json::from_slice(&value)?);
        }

        let mut subs_by_channel: HashMap<String, Vec<RecoveredSub>> = HashMap::new();
        for entry in self.subs.iter() {
            let (_, value) = entry?;
            let record: SubRecord = serde_json::from_slice(&value)?;
            let pending = self.pending_for_sub(record.id)?;
            subs_by_channel
                .entry(record.channel.clone())
                .or_default()
                .push(RecoveredSub { record, pending });
        }

        for entry in self.channels.iter() {
            let (name, _) = entry?;
            let name = String::from_utf8_lossy(&name).to_string();
            let subs = subs_by_channel.remove(&name).unwrap_or_default();
            state.channels.push(RecoveredChannel { name, subs });
        }

        Ok(Some(state))
    }

    fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel).unwrap_or(false)
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn create_channel(&self, channel: &str) -> Result<(), StoreError> {
        if self.channels.contains_key(channel)? {
            return Ok(());
        }
        if self.channels.len() >= self.limits.max_channels {
            return Err(StoreError::MaxChannels);
        }
        self.channels.insert(channel, seq_key(0).to_vec())?;
        Ok(())
    }

    fn store_msg(
        &self,
        channel: &str,
        payload: &[u8],
        timestamp: i64,
    ) -> Result<StoredMessage, StoreError> {
        if payload.len() > self.limits.max_payload_bytes {
            return Err(StoreError::PayloadTooLarge(self.limits.max_payload_bytes));
        }
        let last = self
            .channel_last_seq(channel)?
            .ok_or_else(|| StoreError::UnknownChannel(channel.to_string()))?;

        let msg = StoredMessage {
            channel: channel.to_string(),
            sequence: last + 1,
            payload: payload.to_vec(),
            timestamp,
        };

        let tree = self.msgs_tree(channel)?;
        tree.insert(seq_key(msg.sequence), serde_json::to_vec(&msg)?)?;
        self.channels.insert(channel, seq_key(msg.sequence).to_vec())?;

        while tree.len() > self.limits.max_msgs {
            if tree.pop_min()?.is_none() {
                break;
            }
        }
        if let Some(age) = self.limits.max_age {
            let cutoff = timestamp - age.as_millis() as i64;
            while let Some((key, value)) = tree.first()? {
                let old: StoredMessage = serde_json::from_slice(&value)?;
                if old.timestamp >= cutoff || old.sequence == msg.sequence {
                    break;
                }
                tree.remove(key)?;
            }
        }

        Ok(msg)
    }

    fn lookup_msg(&self, channel: &str, seq: u64) -> Result<Option<StoredMessage>, StoreError> {
        let tree = self.msgs_tree(channel)?;
        match tree.get(seq_key(seq))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn first_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        let tree = self.msgs_tree(channel)?;
        Ok(tree.first()?.map(|(key, _)| decode_seq(&key)).unwrap_or(0))
    }

    fn last_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        Ok(self.channel_last_seq(channel)?.unwrap_or(0))
    }

    fn sequence_for_timestamp(&self, channel: &str, ts: i64) -> Result<u64, StoreError> {
        let tree = self.msgs_tree(channel)?;
        for entry in tree.iter() {
            let (_, value) = entry?;
            let msg: StoredMessage = serde_json::from_slice(&value)?;
            if msg.timestamp >= ts {
                return Ok(msg.sequence);
            }
        }
        Ok(0)
    }

    fn create_sub(&self, rec: &SubRecord) -> Result<(), StoreError> {
        if !self.channels.contains_key(&rec.channel)? {
            return Err(StoreError::UnknownChannel(rec.channel.clone()));
        }
        if !self.subs.contains_key(seq_key(rec.id))?
            && self.sub_count_for_channel(&rec.channel)? >= self.limits.max_subs
        {
            return Err(StoreError::MaxSubs);
        }
        self.subs.insert(seq_key(rec.id), serde_json::to_vec(rec)?)?;
        Ok(())
    }

    fn update_sub(&self, rec: &SubRecord) -> Result<(), StoreError> {
        // only existing records; a deleted subscription stays deleted
        if self.subs.contains_key(seq_key(rec.id))? {
            self.subs.insert(seq_key(rec.id), serde_json::to_vec(rec)?)?;
        }
        Ok(())
    }

    fn delete_sub(&self, _channel: &str, sub_id: u64) -> Result<(), StoreError> {
        self.subs.remove(seq_key(sub_id))?;
        let keys: Vec<_> = self
            .pending
            .scan_prefix(sub_id.to_be_bytes())
            .filter_map(|entry| entry.ok().map(|(key, _)| key))
            .collect();
        for key in keys {
            self.pending.remove(key)?;
        }
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.pending.insert(pending_key(sub_id, seq), Vec::new())?;
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.pending.remove(pending_key(sub_id, seq))?;
        Ok(())
    }

    fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError> {
        self.clients.insert(info.id.as_bytes(), serde_json::to_vec(info)?)?;
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        self.clients.remove(client_id.as_bytes())?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush()?;
        Ok(())
    }
}
