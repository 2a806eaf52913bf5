//! The broker engine.
//!
//! [`Broker`] owns the runtime state machine: the client registry, the
//! channel map, the control-subject dispatch, duplicate-client-id
//! arbitration, the heartbeat loop and recovery from the store. Request
//! handlers run on workers owned by the bus and must stay reentrant; the
//! interesting delivery logic lives in the `delivery` module.
//!
//! Lock acquisition order, everywhere: client registry → channel
//! directory → queue state → subscription → client record. The registry
//! lock is never held across a bus or store call.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use seqsub_bus::{Bus, BusError, BusMessage, BusSubscription, MsgHandler};
use seqsub_config::Settings;
use seqsub_store::{ClientInfo, Store};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelMap, QueueState};
use crate::clients::{Client, ClientRegistry};
use crate::errors::{ProtoError, StartError};
use crate::protocol::{
    decode, encode, is_valid_channel, is_valid_client_id, CloseRequest, CloseResponse,
    ConnectRequest, ConnectResponse, PubAck, PubMsg, StartPosition, SubscriptionRequest,
    SubscriptionResponse, UnsubscribeRequest,
};
use crate::sub::{self, Subscription};

/// Tunables of one broker instance. Built from [`Settings`] in the binary
/// or constructed directly in tests.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub cluster_id: String,
    pub discover_prefix: String,
    pub hb_interval: Duration,
    pub hb_timeout: Duration,
    pub max_failed_hbs: u32,
    pub dup_cid_timeout: Duration,
    pub dup_cid_max_checks: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl BrokerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cluster_id: settings.cluster.id.clone(),
            discover_prefix: settings.cluster.discover_prefix.clone(),
            hb_interval: Duration::from_millis(settings.heartbeat.interval_ms),
            hb_timeout: Duration::from_millis(settings.heartbeat.timeout_ms),
            max_failed_hbs: settings.heartbeat.max_failed,
            dup_cid_timeout: Duration::from_millis(settings.clients.dup_cid_timeout_ms),
            dup_cid_max_checks: settings.clients.dup_cid_max_checks,
        }
    }
}

/// The control subjects of one broker instance. The discover subject is
/// well known; the rest carry a per-instance unique suffix and are handed
/// to clients in the connect response.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub cluster_id: String,
    pub discover: String,
    pub publish: String,
    pub subscribe: String,
    pub unsubscribe: String,
    pub close: String,
}

impl ServerInfo {
    fn new(cluster_id: &str, discover_prefix: &str) -> Self {
        // Derived from the cluster id so a restarted broker binds the
        // same subjects and connected clients keep working.
        Self {
            cluster_id: cluster_id.to_string(),
            discover: format!("{discover_prefix}.{cluster_id}"),
            publish: format!("_SEQSUB.pub.{cluster_id}"),
            subscribe: format!("_SEQSUB.sub.{cluster_id}"),
            unsubscribe: format!("_SEQSUB.unsub.{cluster_id}"),
            close: format!("_SEQSUB.close.{cluster_id}"),
        }
    }
}

enum Sweep {
    Plain(Arc<Subscription>),
    Queue(Arc<QueueState>),
    /// Durable rebind: redeliver the preserved in-flight set first.
    Rebind(Arc<Subscription>),
}

enum RemoveMode {
    /// Explicit unsubscribe: destroys durables too.
    Unsubscribe,
    /// Owner went away: durables detach instead of dying.
    ClientClose,
}

pub struct Broker {
    me: Weak<Broker>,
    info: ServerInfo,
    opts: BrokerOptions,
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    clients: ClientRegistry,
    channels: ChannelMap,
    next_sub_id: AtomicU64,
    /// Client ids with a duplicate arbitration in flight; a second
    /// connect for the same id fails immediately.
    dup_cid_checks: Mutex<HashSet<String>>,
    /// Bounds how many arbitrations may probe old clients in parallel.
    dup_cid_slots: Semaphore,
    shutdown: AtomicBool,
    control_subs: Mutex<Vec<BusSubscription>>,
    hb_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Bring a broker up on `bus` backed by `store`: recover persisted
    /// state, bind the control subjects, start the heartbeat loop.
    pub fn start(
        opts: BrokerOptions,
        bus: Arc<dyn Bus>,
        store: Arc<dyn Store>,
    ) -> Result<Arc<Broker>, StartError> {
        let info = ServerInfo::new(&opts.cluster_id, &opts.discover_prefix);
        let dup_cid_slots = Semaphore::new(opts.dup_cid_max_checks);
        let srv = Arc::new_cyclic(|me| Broker {
            me: me.clone(),
            info,
            opts,
            bus,
            store,
            clients: ClientRegistry::new(),
            channels: ChannelMap::new(),
            next_sub_id: AtomicU64::new(0),
            dup_cid_checks: Mutex::new(HashSet::new()),
            dup_cid_slots,
            shutdown: AtomicBool::new(false),
            control_subs: Mutex::new(Vec::new()),
            hb_task: Mutex::new(None),
        });

        srv.recover_state()?;
        srv.subscribe_control_subjects()?;
        srv.start_heartbeat_loop();
        info!(
            cluster_id = %srv.info.cluster_id,
            store = srv.store.backend(),
            "broker started"
        );
        Ok(srv)
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn bus(&self) -> &dyn Bus {
        self.bus.as_ref()
    }

    pub(crate) fn weak(&self) -> Weak<Broker> {
        self.me.clone()
    }

    /// Stop the broker: heartbeats, timers, control subjects, store.
    /// Idempotent; a second call returns immediately.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("broker shutting down");
        if let Some(task) = self.hb_task.lock().unwrap().take() {
            task.abort();
        }
        // wake queued duplicate-id arbitrations so they bail out
        self.dup_cid_slots.close();
        self.control_subs.lock().unwrap().clear();
        for channel in self.channels.list() {
            for sub in channel.all_subs() {
                let mut st = sub.state();
                if let Some(timer) = st.ack_timer.take() {
                    timer.abort();
                }
                st.ack_sub = None;
            }
        }
        if let Err(e) = self.store.close() {
            warn!(%e, "store close failed");
        }
    }

    // ---- wiring -----------------------------------------------------

    fn handler<F, Fut>(&self, f: F) -> MsgHandler
    where
        F: Fn(Arc<Broker>, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = self.me.clone();
        Arc::new(move |msg| {
            let fut: BoxFuture<'static, ()> = match weak.upgrade() {
                Some(srv) if !srv.is_shutdown() => Box::pin(f(srv, msg)),
                _ => Box::pin(async {}),
            };
            fut
        })
    }

    fn subscribe_control_subjects(&self) -> Result<(), StartError> {
        let mut subs = self.control_subs.lock().unwrap();
        subs.push(self.bus.subscribe(
            &self.info.discover,
            self.handler(|srv, msg| async move { srv.process_connect(msg).await }),
        )?);
        subs.push(self.bus.subscribe(
            &format!("{}.>", self.info.publish),
            self.handler(|srv, msg| async move { srv.process_publish(msg) }),
        )?);
        subs.push(self.bus.subscribe(
            &self.info.subscribe,
            self.handler(|srv, msg| async move { srv.process_subscribe(msg) }),
        )?);
        subs.push(self.bus.subscribe(
            &self.info.unsubscribe,
            self.handler(|srv, msg| async move { srv.process_unsubscribe(msg) }),
        )?);
        subs.push(self.bus.subscribe(
            &self.info.close,
            self.handler(|srv, msg| async move { srv.process_close(msg) }),
        )?);
        Ok(())
    }

    pub(crate) fn subscribe_ack_inbox(
        &self,
        sub: &Arc<Subscription>,
    ) -> Result<BusSubscription, BusError> {
        let ack_inbox = sub.state().ack_inbox.clone();
        let weak = self.me.clone();
        let sub = Arc::clone(sub);
        self.bus.subscribe(
            &ack_inbox,
            Arc::new(move |msg| {
                let fut: BoxFuture<'static, ()> = match weak.upgrade() {
                    Some(srv) => {
                        let sub = Arc::clone(&sub);
                        Box::pin(async move { srv.process_ack(&sub, msg) })
                    }
                    None => Box::pin(async {}),
                };
                fut
            }),
        )
    }

    // ---- connect / duplicate client ids -----------------------------

    async fn process_connect(&self, msg: BusMessage) {
        let Some(reply) = msg.reply else { return };
        let req: ConnectRequest = match decode(&msg.payload) {
            Ok(req) => req,
            Err(_) => return self.reply_connect_err(&reply, ProtoError::InvalidConnect),
        };
        if req.client_id.is_empty() || req.heartbeat_inbox.is_empty() {
            return self.reply_connect_err(&reply, ProtoError::InvalidConnect);
        }
        if !is_valid_client_id(&req.client_id) {
            return self.reply_connect_err(&reply, ProtoError::InvalidClientId);
        }

        if self.clients.lookup(&req.client_id).is_none() {
            self.finish_connect(&req, &reply);
            return;
        }

        // The id is live. Arbitrate, unless an arbitration for this very
        // id is already running, which fails the newcomer immediately.
        {
            let mut checks = self.dup_cid_checks.lock().unwrap();
            if !checks.insert(req.client_id.clone()) {
                return self.reply_connect_err(&reply, ProtoError::DuplicateClientId);
            }
        }
        let Some(srv) = self.me.upgrade() else { return };
        tokio::spawn(async move { srv.arbitrate_duplicate(req, reply).await });
    }

    /// Decide between a legitimate duplicate and a silently dead client:
    /// ping the existing client's heartbeat inbox and either reject the
    /// newcomer or take the identity over.
    async fn arbitrate_duplicate(&self, req: ConnectRequest, reply: String) {
        let permit = match self.dup_cid_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // semaphore closed: shutting down
                self.dup_cid_checks.lock().unwrap().remove(&req.client_id);
                return;
            }
        };

        let takeover = match self.clients.lookup(&req.client_id) {
            None => true, // disappeared while we queued
            Some(old) => self
                .bus
                .request(&old.hb_inbox, Vec::new(), self.opts.dup_cid_timeout)
                .await
                .is_err(),
        };

        if takeover {
            info!(client_id = %req.client_id, "existing client unresponsive, replacing it");
            self.close_client(&req.client_id);
            self.finish_connect(&req, &reply);
        } else {
            debug!(client_id = %req.client_id, "duplicate connect rejected, client is alive");
            self.reply_connect_err(&reply, ProtoError::DuplicateClientId);
        }

        drop(permit);
        self.dup_cid_checks.lock().unwrap().remove(&req.client_id);
    }

    fn finish_connect(&self, req: &ConnectRequest, reply: &str) {
        if self.clients.register(&req.client_id, &req.heartbeat_inbox).is_none() {
            return self.reply_connect_err(reply, ProtoError::DuplicateClientId);
        }
        let info = ClientInfo {
            id: req.client_id.clone(),
            hb_inbox: req.heartbeat_inbox.clone(),
        };
        if let Err(e) = self.store.add_client(&info) {
            self.clients.unregister(&req.client_id);
            return self.reply_connect_err(reply, ProtoError::Store(e.to_string()));
        }
        info!(client_id = %req.client_id, "client connected");
        let resp = ConnectResponse {
            pub_prefix: self.info.publish.clone(),
            sub_requests: self.info.subscribe.clone(),
            unsub_requests: self.info.unsubscribe.clone(),
            close_requests: self.info.close.clone(),
            error: String::new(),
        };
        self.bus.publish(reply, encode(&resp));
    }

    fn reply_connect_err(&self, reply: &str, err: ProtoError) {
        let resp = ConnectResponse {
            error: err.to_string(),
            ..ConnectResponse::default()
        };
        self.bus.publish(reply, encode(&resp));
    }

    // ---- publish ----------------------------------------------------

    fn process_publish(&self, msg: BusMessage) {
        let reply = msg.reply.clone();
        let req: PubMsg = match decode(&msg.payload) {
            Ok(req) => req,
            Err(_) => {
                self.reply_pub_ack(reply.as_deref(), "", &ProtoError::InvalidPublish.to_string());
                return;
            }
        };
        match self.do_publish(&req) {
            Ok(channel) => {
                self.reply_pub_ack(reply.as_deref(), &req.guid, "");
                self.deliver_to_channel(&channel);
            }
            Err(e) => self.reply_pub_ack(reply.as_deref(), &req.guid, &e.to_string()),
        }
    }

    fn do_publish(&self, req: &PubMsg) -> Result<Arc<Channel>, ProtoError> {
        if req.channel.is_empty() || req.payload.is_empty() {
            return Err(ProtoError::InvalidPublish);
        }
        if !is_valid_channel(&req.channel) {
            return Err(ProtoError::InvalidChannel);
        }
        let channel = self.channels.get_or_create(&req.channel, self.store.as_ref())?;
        let stored = self
            .store
            .store_msg(&req.channel, &req.payload, Utc::now().timestamp_millis())
            .map_err(|e| ProtoError::Store(e.to_string()))?;
        debug!(channel = %req.channel, seq = stored.sequence, "message stored");
        Ok(channel)
    }

    fn reply_pub_ack(&self, reply: Option<&str>, guid: &str, error: &str) {
        let Some(reply) = reply else { return };
        let ack = PubAck {
            guid: guid.to_string(),
            error: error.to_string(),
        };
        self.bus.publish(reply, encode(&ack));
    }

    // ---- subscribe --------------------------------------------------

    fn process_subscribe(&self, msg: BusMessage) {
        let Some(reply) = msg.reply else { return };
        let req: SubscriptionRequest = match decode(&msg.payload) {
            Ok(req) => req,
            Err(_) => return self.reply_sub(&reply, "", &ProtoError::InvalidSubscribe.to_string()),
        };
        match self.do_subscribe(&req) {
            Ok((ack_inbox, sweep)) => {
                self.reply_sub(&reply, &ack_inbox, "");
                match sweep {
                    Sweep::Plain(sub) => self.send_avail_messages(&sub),
                    Sweep::Queue(qs) => self.queue_send_avail(&qs),
                    Sweep::Rebind(sub) => {
                        self.redeliver_pending(&sub);
                        self.send_avail_messages(&sub);
                    }
                }
            }
            Err(e) => self.reply_sub(&reply, "", &e.to_string()),
        }
    }

    fn reply_sub(&self, reply: &str, ack_inbox: &str, error: &str) {
        let resp = SubscriptionResponse {
            ack_inbox: ack_inbox.to_string(),
            error: error.to_string(),
        };
        self.bus.publish(reply, encode(&resp));
    }

    fn do_subscribe(&self, req: &SubscriptionRequest) -> Result<(String, Sweep), ProtoError> {
        if !is_valid_channel(&req.channel) {
            return Err(ProtoError::InvalidChannel);
        }
        if req.ack_wait_secs <= 0 {
            return Err(ProtoError::InvalidAckWait);
        }
        if req.max_in_flight <= 0 {
            return Err(ProtoError::InvalidMaxInFlight);
        }
        // The channel is created lazily by any subscribe that names it,
        // even one that goes on to fail validation below.
        let channel = self.channels.get_or_create(&req.channel, self.store.as_ref())?;
        let client = self
            .clients
            .lookup(&req.client_id)
            .ok_or(ProtoError::UnknownClient)?;
        // `:` separates the parts of durable and queue-group keys
        if req.durable_name.contains(':') || req.queue_group.contains(':') {
            return Err(ProtoError::InvalidSubscribe);
        }
        if req.inbox.is_empty() {
            return Err(ProtoError::InvalidSubscribe);
        }

        let ack_wait = Duration::from_secs(req.ack_wait_secs as u64);
        let max_in_flight = req.max_in_flight as usize;

        // Durable rebind: same client, same durable name picks the
        // subscription back up where it left off. The requested start
        // position is ignored.
        if !req.durable_name.is_empty() && req.queue_group.is_empty() {
            let key = sub::durable_key(&req.client_id, &req.durable_name);
            let existing = channel.directory().durables.get(&key).cloned();
            if let Some(durable) = existing {
                if durable.state().attached {
                    return Err(ProtoError::DuplicateDurable);
                }
                let ack_inbox = self.bus.new_inbox();
                {
                    let mut st = durable.state();
                    st.inbox = req.inbox.clone();
                    st.ack_inbox = ack_inbox.clone();
                    st.ack_wait = ack_wait;
                    st.max_in_flight = max_in_flight;
                    st.attached = true;
                }
                let guard = self
                    .subscribe_ack_inbox(&durable)
                    .map_err(|e| ProtoError::Store(e.to_string()))?;
                durable.state().ack_sub = Some(guard);
                channel.directory().psubs.push(Arc::clone(&durable));
                client.add_sub(Arc::clone(&durable));
                if let Err(e) = self.store.update_sub(&durable.record()) {
                    warn!(sub = durable.id, %e, "failed to persist durable rebind");
                }
                info!(client_id = %req.client_id, durable = %req.durable_name, "durable resumed");
                return Ok((ack_inbox, Sweep::Rebind(durable)));
            }
        }

        let queue_group = (!req.queue_group.is_empty()).then(|| req.queue_group.clone());
        let durable_name = (!req.durable_name.is_empty()).then(|| req.durable_name.clone());

        // A member joining an existing queue group inherits the shared
        // cursor; only the group founder resolves a start position.
        let group_key = queue_group
            .as_ref()
            .map(|group| sub::queue_key(durable_name.as_deref(), group));
        let existing_qs = group_key
            .as_ref()
            .and_then(|key| channel.directory().qsubs.get(key).cloned());
        let last_sent = match &existing_qs {
            Some(qs) => qs.last_sent(),
            None => self.resolve_start_position(req)?,
        };

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ack_inbox = self.bus.new_inbox();
        let subscription = Subscription::new(
            id,
            req.client_id.clone(),
            req.channel.clone(),
            queue_group,
            durable_name,
            req.inbox.clone(),
            ack_inbox.clone(),
            ack_wait,
            max_in_flight,
            last_sent,
        );
        self.store.create_sub(&subscription.record())?;

        let guard = self
            .subscribe_ack_inbox(&subscription)
            .map_err(|e| ProtoError::Store(e.to_string()))?;
        subscription.state().ack_sub = Some(guard);

        let sweep = if let Some(key) = group_key {
            let qs = {
                let mut dir = channel.directory();
                match dir.qsubs.get(&key) {
                    Some(qs) => Arc::clone(qs),
                    None => {
                        let qs =
                            QueueState::new(&key, &req.channel, subscription.is_durable());
                        qs.group().last_sent = last_sent;
                        dir.qsubs.insert(key.clone(), Arc::clone(&qs));
                        qs
                    }
                }
            };
            qs.group().members.push(Arc::clone(&subscription));
            subscription.state().queue = Some(Arc::downgrade(&qs));
            Sweep::Queue(qs)
        } else {
            let mut dir = channel.directory();
            dir.psubs.push(Arc::clone(&subscription));
            if let Some(key) = subscription.durable_key() {
                dir.durables.insert(key, Arc::clone(&subscription));
            }
            drop(dir);
            Sweep::Plain(Arc::clone(&subscription))
        };
        client.add_sub(Arc::clone(&subscription));
        debug!(
            client_id = %req.client_id,
            channel = %req.channel,
            sub = id,
            "subscription installed"
        );
        Ok((ack_inbox, sweep))
    }

    /// Compute the initial delivery cursor. Strict: a start sequence
    /// outside the stored log and a time delta on an empty channel are
    /// errors.
    fn resolve_start_position(&self, req: &SubscriptionRequest) -> Result<u64, ProtoError> {
        let last = self
            .store
            .last_sequence(&req.channel)
            .map_err(|e| ProtoError::Store(e.to_string()))?;
        match req.start_position {
            StartPosition::NewOnly => Ok(last),
            StartPosition::LastReceived => {
                if last == 0 {
                    Err(ProtoError::UnknownSequence)
                } else {
                    Ok(last - 1)
                }
            }
            StartPosition::First => Ok(0),
            StartPosition::SequenceStart => {
                let first = self
                    .store
                    .first_sequence(&req.channel)
                    .map_err(|e| ProtoError::Store(e.to_string()))?;
                let wanted = req.start_sequence;
                if wanted == 0 || wanted < first || wanted > last {
                    Err(ProtoError::UnknownSequence)
                } else {
                    Ok(wanted - 1)
                }
            }
            StartPosition::TimeDeltaStart => {
                if last == 0 {
                    return Err(ProtoError::UnknownTimeDelta);
                }
                let cutoff = Utc::now().timestamp_millis() - req.start_time_delta_ms;
                let seq = self
                    .store
                    .sequence_for_timestamp(&req.channel, cutoff)
                    .map_err(|e| ProtoError::Store(e.to_string()))?;
                // nothing that recent: start after the current tail
                if seq == 0 {
                    Ok(last)
                } else {
                    Ok(seq - 1)
                }
            }
        }
    }

    // ---- unsubscribe / close ---------------------------------------

    fn process_unsubscribe(&self, msg: BusMessage) {
        let Some(reply) = msg.reply else { return };
        let req: UnsubscribeRequest = match decode(&msg.payload) {
            Ok(req) => req,
            Err(_) => {
                return self.reply_sub(&reply, "", &ProtoError::InvalidUnsubscribe.to_string())
            }
        };
        match self.do_unsubscribe(&req) {
            Ok(()) => self.reply_sub(&reply, "", ""),
            Err(e) => self.reply_sub(&reply, "", &e.to_string()),
        }
    }

    fn do_unsubscribe(&self, req: &UnsubscribeRequest) -> Result<(), ProtoError> {
        if req.client_id.is_empty() || req.channel.is_empty() || req.ack_inbox.is_empty() {
            return Err(ProtoError::InvalidUnsubscribe);
        }
        let client = self
            .clients
            .lookup(&req.client_id)
            .ok_or(ProtoError::UnknownClient)?;
        let channel = self
            .channels
            .get(&req.channel)
            .ok_or(ProtoError::UnknownSubscription)?;
        let sub = channel
            .find_by_ack_inbox(&req.ack_inbox)
            .ok_or(ProtoError::UnknownSubscription)?;
        if sub.client_id != req.client_id {
            return Err(ProtoError::NotOwned);
        }
        client.remove_sub(sub.id);
        self.remove_subscription(&channel, &sub, RemoveMode::Unsubscribe);
        debug!(client_id = %req.client_id, channel = %req.channel, sub = sub.id, "unsubscribed");
        Ok(())
    }

    fn process_close(&self, msg: BusMessage) {
        let Some(reply) = msg.reply else { return };
        let req: CloseRequest = match decode(&msg.payload) {
            Ok(req) => req,
            Err(_) => {
                let resp = CloseResponse {
                    error: ProtoError::InvalidClose.to_string(),
                };
                self.bus.publish(&reply, encode(&resp));
                return;
            }
        };
        let error = if req.client_id.is_empty() {
            ProtoError::InvalidClose.to_string()
        } else if self.close_client(&req.client_id) {
            String::new()
        } else {
            ProtoError::UnknownClient.to_string()
        };
        self.bus.publish(&reply, encode(&CloseResponse { error }));
    }

    /// Remove a client and every subscription it owns. Shared by the
    /// close endpoint, the heartbeat purge and duplicate-id takeover.
    pub fn close_client(&self, client_id: &str) -> bool {
        let Some(client) = self.clients.unregister(client_id) else {
            return false;
        };
        for sub in client.take_subs() {
            if let Some(channel) = self.channels.get(&sub.channel) {
                self.remove_subscription(&channel, &sub, RemoveMode::ClientClose);
            }
        }
        if let Err(e) = self.store.delete_client(client_id) {
            warn!(client_id, %e, "failed to delete client record");
        }
        info!(client_id, "client closed");
        true
    }

    fn remove_subscription(
        &self,
        channel: &Arc<Channel>,
        sub: &Arc<Subscription>,
        mode: RemoveMode,
    ) {
        // Queue members: leave the group and hand the in-flight set back
        // to the remaining members through the distributor.
        if let Some(key) = sub.queue_key() {
            let mut requeue_target = None;
            {
                let mut dir = channel.directory();
                if let Some(qs) = dir.qsubs.get(&key).cloned() {
                    let (seqs, emptied) = {
                        let mut qg = qs.group();
                        qg.members.retain(|member| member.id != sub.id);
                        if qg.next_member >= qg.members.len().max(1) {
                            qg.next_member = 0;
                        }
                        let mut st = sub.state();
                        st.attached = false;
                        if let Some(timer) = st.ack_timer.take() {
                            timer.abort();
                        }
                        st.ack_sub = None;
                        let seqs: Vec<u64> = st.acks_pending.keys().copied().collect();
                        st.acks_pending.clear();
                        (seqs, qg.members.is_empty())
                    };
                    // a durable group outlives a closing last member, a
                    // plain one does not; explicit unsubscribe kills both
                    let destroy =
                        emptied && (!qs.durable || matches!(mode, RemoveMode::Unsubscribe));
                    if destroy {
                        dir.qsubs.remove(&key);
                    } else if !seqs.is_empty() {
                        requeue_target = Some((qs, seqs));
                    }
                }
            }
            let _ = self.store.delete_sub(&sub.channel, sub.id);
            if let Some((qs, seqs)) = requeue_target {
                self.queue_requeue(&qs, seqs);
            }
            return;
        }

        match mode {
            RemoveMode::ClientClose if sub.is_durable() => {
                // Detach: delivery pauses, the cursor and in-flight set
                // survive for the next bind.
                channel.directory().psubs.retain(|s| s.id != sub.id);
                {
                    let mut st = sub.state();
                    st.attached = false;
                    if let Some(timer) = st.ack_timer.take() {
                        timer.abort();
                    }
                    st.ack_sub = None;
                }
                if let Err(e) = self.store.update_sub(&sub.record()) {
                    warn!(sub = sub.id, %e, "failed to persist durable detach");
                }
                debug!(sub = sub.id, "durable detached");
            }
            _ => {
                {
                    let mut dir = channel.directory();
                    dir.psubs.retain(|s| s.id != sub.id);
                    if let Some(key) = sub.durable_key() {
                        dir.durables.remove(&key);
                    }
                }
                {
                    let mut st = sub.state();
                    st.attached = false;
                    if let Some(timer) = st.ack_timer.take() {
                        timer.abort();
                    }
                    st.ack_sub = None;
                }
                let _ = self.store.delete_sub(&sub.channel, sub.id);
            }
        }
    }

    // ---- heartbeats -------------------------------------------------

    fn start_heartbeat_loop(&self) {
        let weak = self.me.clone();
        let interval = self.opts.hb_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(srv) = weak.upgrade() else { return };
                if srv.is_shutdown() {
                    return;
                }
                for client in srv.clients.list() {
                    let srv = Arc::clone(&srv);
                    tokio::spawn(async move { srv.check_client_health(client).await });
                }
            }
        });
        *self.hb_task.lock().unwrap() = Some(handle);
    }

    async fn check_client_health(&self, client: Arc<Client>) {
        if self.is_shutdown() {
            return;
        }
        match self
            .bus
            .request(&client.hb_inbox, Vec::new(), self.opts.hb_timeout)
            .await
        {
            Ok(_) => client.heartbeat_ok(),
            Err(_) => {
                let missed = client.heartbeat_missed();
                if missed >= self.opts.max_failed_hbs {
                    warn!(client_id = %client.id, missed, "purging unresponsive client");
                    self.close_client(&client.id);
                }
            }
        }
    }

    // ---- recovery ---------------------------------------------------

    /// Rebuild runtime state from whatever the store recovered: clients,
    /// channels, subscriptions with their cursors and in-flight sets.
    /// Subscriptions whose owner did not come back are deleted. Ack
    /// timers restart for recovered in-flight sets; nothing else is
    /// redelivered until a timer fires or a publish arrives.
    fn recover_state(&self) -> Result<(), StartError> {
        let Some(state) = self.store.recover()? else {
            return Ok(());
        };
        info!(
            clients = state.clients.len(),
            channels = state.channels.len(),
            "recovering persisted state"
        );
        for client in &state.clients {
            self.clients.register(&client.id, &client.hb_inbox);
        }

        let mut max_sub_id = 0;
        for recovered_channel in state.channels {
            let channel = self.channels.insert_recovered(&recovered_channel.name);
            for recovered in recovered_channel.subs {
                let rec = recovered.record;
                max_sub_id = max_sub_id.max(rec.id);
                let Some(client) = self.clients.lookup(&rec.client_id) else {
                    debug!(
                        sub = rec.id,
                        client_id = %rec.client_id,
                        "dropping recovered subscription of unknown client"
                    );
                    let _ = self.store.delete_sub(&recovered_channel.name, rec.id);
                    continue;
                };

                let subscription = Subscription::new(
                    rec.id,
                    rec.client_id.clone(),
                    rec.channel.clone(),
                    rec.queue_group.clone(),
                    rec.durable_name.clone(),
                    rec.inbox.clone(),
                    rec.ack_inbox.clone(),
                    Duration::from_secs(rec.ack_wait_secs.max(1) as u64),
                    rec.max_in_flight as usize,
                    rec.last_sent,
                );
                {
                    let now = Utc::now().timestamp_millis();
                    let mut st = subscription.state();
                    for seq in &recovered.pending {
                        st.acks_pending.insert(*seq, now);
                    }
                }
                let guard = self.subscribe_ack_inbox(&subscription)?;
                subscription.state().ack_sub = Some(guard);

                if let Some(key) = subscription.queue_key() {
                    let qs = {
                        let mut dir = channel.directory();
                        match dir.qsubs.get(&key) {
                            Some(qs) => Arc::clone(qs),
                            None => {
                                let qs = QueueState::new(
                                    &key,
                                    &recovered_channel.name,
                                    subscription.is_durable(),
                                );
                                dir.qsubs.insert(key.clone(), Arc::clone(&qs));
                                qs
                            }
                        }
                    };
                    {
                        let mut qg = qs.group();
                        qg.members.push(Arc::clone(&subscription));
                        qg.last_sent = qg.last_sent.max(rec.last_sent);
                    }
                    subscription.state().queue = Some(Arc::downgrade(&qs));
                } else {
                    let mut dir = channel.directory();
                    dir.psubs.push(Arc::clone(&subscription));
                    if let Some(key) = subscription.durable_key() {
                        dir.durables.insert(key, Arc::clone(&subscription));
                    }
                }
                client.add_sub(Arc::clone(&subscription));

                let mut st = subscription.state();
                if !st.acks_pending.is_empty() {
                    let wait = st.ack_wait;
                    st.ack_timer = Some(self.spawn_ack_timer(&subscription, wait));
                }
            }
        }
        self.next_sub_id.store(max_sub_id, Ordering::Relaxed);
        Ok(())
    }
}
