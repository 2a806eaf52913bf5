//! Channels and their subscription directories.
//!
//! A channel is a name plus a directory of subscriptions in three indexes:
//! plain subscriptions (attached non-queue subs, durables included while
//! attached), durables by durable key, and queue groups by group key. The
//! message log itself lives in the store; the runtime channel only routes.
//!
//! Queue groups are first-class: they own the shared delivery cursor, the
//! member rotation index and the buffer of sequences waiting to be
//! redelivered after a member left.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use seqsub_store::Store;

use crate::errors::ProtoError;
use crate::sub::Subscription;

pub struct Channel {
    pub name: String,
    directory: Mutex<SubDirectory>,
}

#[derive(Default)]
pub struct SubDirectory {
    pub psubs: Vec<Arc<Subscription>>,
    pub durables: HashMap<String, Arc<Subscription>>,
    pub qsubs: HashMap<String, Arc<QueueState>>,
}

impl Channel {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            directory: Mutex::new(SubDirectory::default()),
        })
    }

    pub(crate) fn directory(&self) -> MutexGuard<'_, SubDirectory> {
        self.directory.lock().unwrap()
    }

    /// Snapshot for publish fan-out: the attached plain/durable subs and
    /// the queue groups.
    pub fn delivery_targets(&self) -> (Vec<Arc<Subscription>>, Vec<Arc<QueueState>>) {
        let dir = self.directory();
        (dir.psubs.clone(), dir.qsubs.values().cloned().collect())
    }

    /// Every subscription known to the directory, deduplicated (attached
    /// durables appear in both `psubs` and `durables`).
    pub fn all_subs(&self) -> Vec<Arc<Subscription>> {
        let dir = self.directory();
        let mut by_id: HashMap<u64, Arc<Subscription>> = HashMap::new();
        for sub in dir.psubs.iter().chain(dir.durables.values()) {
            by_id.insert(sub.id, Arc::clone(sub));
        }
        for qs in dir.qsubs.values() {
            for sub in qs.members() {
                by_id.insert(sub.id, sub);
            }
        }
        by_id.into_values().collect()
    }

    /// Resolve a subscription by its ack inbox, the identity used by
    /// unsubscribe requests.
    pub fn find_by_ack_inbox(&self, ack_inbox: &str) -> Option<Arc<Subscription>> {
        self.all_subs()
            .into_iter()
            .find(|sub| sub.state().ack_inbox == ack_inbox)
    }
}

/// Shared state of one queue group.
pub struct QueueState {
    pub key: String,
    pub channel: String,
    pub durable: bool,
    group: Mutex<QueueGroup>,
}

#[derive(Default)]
pub struct QueueGroup {
    pub members: Vec<Arc<Subscription>>,
    /// Shared delivery cursor; never regresses.
    pub last_sent: u64,
    /// Rotation index for round-robin member selection.
    pub next_member: usize,
    /// Sequences owed a redelivery after a member departed with them in
    /// flight. Drained before the cursor advances.
    pub requeue: BTreeSet<u64>,
}

impl QueueState {
    pub fn new(key: &str, channel: &str, durable: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            channel: channel.to_string(),
            durable,
            group: Mutex::new(QueueGroup::default()),
        })
    }

    pub(crate) fn group(&self) -> MutexGuard<'_, QueueGroup> {
        self.group.lock().unwrap()
    }

    pub fn members(&self) -> Vec<Arc<Subscription>> {
        self.group().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.group().members.len()
    }

    pub fn last_sent(&self) -> u64 {
        self.group().last_sent
    }
}

/// Runtime channel map. Creation goes through the store so the
/// max-channels bound holds; a failed admission leaves no trace.
#[derive(Default)]
pub struct ChannelMap {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str, store: &dyn Store) -> Result<Arc<Channel>, ProtoError> {
        if let Some(channel) = self.get(name) {
            return Ok(channel);
        }
        let mut channels = self.channels.write().unwrap();
        if let Some(channel) = channels.get(name) {
            return Ok(Arc::clone(channel));
        }
        store.create_channel(name)?;
        let channel = Channel::new(name);
        channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Install a channel that already exists in the store (recovery path).
    pub fn insert_recovered(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.write().unwrap();
        let channel = Channel::new(name);
        channels.insert(name.to_string(), Arc::clone(&channel));
        channel
    }

    pub fn list(&self) -> Vec<Arc<Channel>> {
        self.channels.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}
