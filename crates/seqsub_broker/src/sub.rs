//! Subscription state.
//!
//! A [`Subscription`] is the stable identity shared by the channel
//! directory and the client registry (indices over the same object, no
//! pointer cycles back). Everything that changes after creation lives in
//! [`SubState`] behind the per-subscription lock: the delivery cursor, the
//! in-flight map, the ack timer and the bus binding of the ack inbox.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use seqsub_bus::BusSubscription;
use seqsub_store::SubRecord;
use tokio::task::JoinHandle;

use crate::channel::QueueState;

pub struct Subscription {
    pub id: u64,
    pub client_id: String,
    pub channel: String,
    /// Queue group name as requested (without the durable prefix).
    pub queue_group: Option<String>,
    pub durable_name: Option<String>,
    state: Mutex<SubState>,
}

pub struct SubState {
    /// Delivery inbox; rebound for durables on reconnect.
    pub inbox: String,
    pub ack_inbox: String,
    pub ack_wait: Duration,
    pub max_in_flight: usize,
    /// Highest sequence ever sent to this subscription.
    pub last_sent: u64,
    /// Sequence → sent-at millis for everything awaiting an ack.
    pub acks_pending: BTreeMap<u64, i64>,
    /// False while a durable is detached; no delivery happens then.
    pub attached: bool,
    pub ack_timer: Option<JoinHandle<()>>,
    /// Bus binding of the ack inbox; dropping it unsubscribes.
    pub ack_sub: Option<BusSubscription>,
    /// Back-reference to the queue group for cursor advancement on ack.
    pub queue: Option<Weak<QueueState>>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        client_id: String,
        channel: String,
        queue_group: Option<String>,
        durable_name: Option<String>,
        inbox: String,
        ack_inbox: String,
        ack_wait: Duration,
        max_in_flight: usize,
        last_sent: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            client_id,
            channel,
            queue_group,
            durable_name,
            state: Mutex::new(SubState {
                inbox,
                ack_inbox,
                ack_wait,
                max_in_flight,
                last_sent,
                acks_pending: BTreeMap::new(),
                attached: true,
                ack_timer: None,
                ack_sub: None,
                queue: None,
            }),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SubState> {
        self.state.lock().unwrap()
    }

    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    pub fn is_queue(&self) -> bool {
        self.queue_group.is_some()
    }

    /// Key into the channel's durable index; only for non-queue durables.
    pub fn durable_key(&self) -> Option<String> {
        match (&self.durable_name, &self.queue_group) {
            (Some(durable), None) => Some(durable_key(&self.client_id, durable)),
            _ => None,
        }
    }

    /// Key into the channel's queue-group index.
    pub fn queue_key(&self) -> Option<String> {
        self.queue_group
            .as_ref()
            .map(|group| queue_key(self.durable_name.as_deref(), group))
    }

    /// Snapshot for persistence.
    pub fn record(&self) -> SubRecord {
        let state = self.state();
        SubRecord {
            id: self.id,
            client_id: self.client_id.clone(),
            channel: self.channel.clone(),
            inbox: state.inbox.clone(),
            ack_inbox: state.ack_inbox.clone(),
            queue_group: self.queue_group.clone(),
            durable_name: self.durable_name.clone(),
            ack_wait_secs: state.ack_wait.as_secs() as i64,
            max_in_flight: state.max_in_flight as u32,
            last_sent: state.last_sent,
        }
    }
}

/// `client:durable`, unique because `:` is rejected in both parts.
pub fn durable_key(client_id: &str, durable_name: &str) -> String {
    format!("{client_id}:{durable_name}")
}

/// `group` for plain queue groups, `durable:group` for durable ones; a
/// durable queue group is shared across client ids.
pub fn queue_key(durable_name: Option<&str>, group: &str) -> String {
    match durable_name {
        Some(durable) => format!("{durable}:{group}"),
        None => group.to_string(),
    }
}
