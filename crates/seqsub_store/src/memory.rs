//! In-memory store backend.
//!
//! Everything lives in one mutex-guarded state: per-channel ordered logs
//! (`BTreeMap` keyed by sequence), subscription records per channel,
//! pending sets per subscription and the client table. Nothing survives a
//! restart, so `recover` always reports no state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::{
    ClientInfo, RecoveredState, Store, StoreError, StoreLimits, StoredMessage, SubRecord,
    TYPE_MEMORY,
};

#[derive(Default)]
struct MemChannel {
    msgs: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    subs: HashMap<u64, SubRecord>,
}

#[derive(Default)]
struct MemState {
    channels: HashMap<String, MemChannel>,
    pending: HashMap<u64, BTreeSet<u64>>,
    clients: HashMap<String, ClientInfo>,
}

pub struct MemoryStore {
    limits: StoreLimits,
    state: Mutex<MemState>,
}

impl MemoryStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(MemState::default()),
        }
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        TYPE_MEMORY
    }

    fn recover(&self) -> Result<Option<RecoveredState>, StoreError> {
        Ok(None)
    }

    fn has_channel(&self, channel: &str) -> bool {
        self.state.lock().unwrap().channels.contains_key(channel)
    }

    fn channel_count(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    fn create_channel(&self, channel: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.channels.contains_key(channel) {
            return Ok(());
        }
        if state.channels.len() >= self.limits.max_channels {
            return Err(StoreError::MaxChannels);
        }
        state.channels.insert(channel.to_string(), MemChannel::default());
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
        let mut state = self.state.lock().unwrap();
        let ch = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| StoreError::UnknownChannel(channel.to_string()))?;

        ch.last_seq += 1;
        let msg = StoredMessage {
            channel: channel.to_string(),
            sequence: ch.last_seq,
            payload: payload.to_vec(),
            timestamp,
        };
        ch.msgs.insert(msg.sequence, msg.clone());

        while ch.msgs.len() > self.limits.max_msgs {
            ch.msgs.pop_first();
        }
        if let Some(age) = self.limits.max_age {
            let cutoff = timestamp - age.as_millis() as i64;
            loop {
                let evict = match ch.msgs.first_key_value() {
                    Some((&seq, first)) => first.timestamp < cutoff && seq != msg.sequence,
                    None => false,
                };
                if !evict {
                    break;
                }
                ch.msgs.pop_first();
            }
        }

        Ok(msg)
    }

    fn lookup_msg(&self, channel: &str, seq: u64) -> Result<Option<StoredMessage>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .get(channel)
            .and_then(|ch| ch.msgs.get(&seq).cloned()))
    }

    fn first_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .get(channel)
            .and_then(|ch| ch.msgs.first_key_value().map(|(&seq, _)| seq))
            .unwrap_or(0))
    }

    fn last_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.channels.get(channel).map(|ch| ch.last_seq).unwrap_or(0))
    }

    fn sequence_for_timestamp(&self, channel: &str, ts: i64) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .get(channel)
            .and_then(|ch| {
                ch.msgs
                    .values()
                    .find(|m| m.timestamp >= ts)
                    .map(|m| m.sequence)
            })
            .unwrap_or(0))
    }

    fn create_sub(&self, rec: &SubRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let ch = state
            .channels
            .get_mut(&rec.channel)
            .ok_or_else(|| StoreError::UnknownChannel(rec.channel.clone()))?;
        if !ch.subs.contains_key(&rec.id) && ch.subs.len() >= self.limits.max_subs {
            return Err(StoreError::MaxSubs);
        }
        ch.subs.insert(rec.id, rec.clone());
        Ok(())
    }

    fn update_sub(&self, rec: &SubRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(ch) = state.channels.get_mut(&rec.channel) {
            // only existing records; a deleted subscription stays deleted
            if ch.subs.contains_key(&rec.id) {
                ch.subs.insert(rec.id, rec.clone());
            }
        }
        Ok(())
    }

    fn delete_sub(&self, channel: &str, sub_id: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.subs.remove(&sub_id);
        }
        state.pending.remove(&sub_id);
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.pending.entry(sub_id).or_default().insert(seq);
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let drained = match state.pending.get_mut(&sub_id) {
            Some(set) => {
                set.remove(&seq);
                set.is_empty()
            }
            None => false,
        };
        if drained {
            state.pending.remove(&sub_id);
        }
        Ok(())
    }

    fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.clients.insert(info.id.clone(), info.clone());
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.clients.remove(client_id);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
