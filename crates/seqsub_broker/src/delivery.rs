//! The delivery engine.
//!
//! Owns the contract that every message published to a channel is
//! eventually delivered to every eligible attached subscription until it
//! is acknowledged or the subscription goes away. Payloads for
//! redelivery are always re-read from the store, never cached.
//!
//! Lock order inside this module follows the global rule: channel
//! directory → queue state → subscription. Data frames are published
//! while holding the owning subscription (or queue group) lock, which is
//! what guarantees ascending first-send order per subscription; bus
//! publishes only enqueue and never block.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use seqsub_bus::BusMessage;
use seqsub_store::StoredMessage;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, QueueState};
use crate::engine::Broker;
use crate::protocol::{decode, encode, AckProto, MsgProto};
use crate::sub::Subscription;

fn data_frame(msg: &StoredMessage, redelivered: bool) -> Vec<u8> {
    encode(&MsgProto {
        channel: msg.channel.clone(),
        sequence: msg.sequence,
        payload: msg.payload.clone(),
        timestamp: msg.timestamp,
        redelivered,
    })
}

impl Broker {
    /// Fan a channel's backlog out to everything currently attached.
    /// Called after each publish and after recovery-time rebuilds.
    pub(crate) fn deliver_to_channel(&self, channel: &Arc<Channel>) {
        let (psubs, qstates) = channel.delivery_targets();
        for sub in psubs {
            self.send_avail_messages(&sub);
        }
        for qs in qstates {
            self.queue_send_avail(&qs);
        }
    }

    /// Push stored messages to one subscription until it runs out of
    /// capacity or of backlog. Also the initial sweep after subscribe.
    pub(crate) fn send_avail_messages(&self, sub: &Arc<Subscription>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let next = {
                let st = sub.state();
                if !st.attached || st.acks_pending.len() >= st.max_in_flight {
                    return;
                }
                st.last_sent + 1
            };
            let (first, last) = match (
                self.store().first_sequence(&sub.channel),
                self.store().last_sequence(&sub.channel),
            ) {
                (Ok(first), Ok(last)) => (first, last),
                (Err(e), _) | (_, Err(e)) => {
                    error!(channel = %sub.channel, %e, "store failure during delivery");
                    return;
                }
            };
            if next > last {
                return;
            }
            // Skip over sequences evicted by retention.
            let seq = if first > 0 && next < first { first } else { next };
            match self.store().lookup_msg(&sub.channel, seq) {
                Ok(Some(msg)) => {
                    if !self.send_msg_to_sub(sub, &msg, false) {
                        return;
                    }
                }
                Ok(None) => {
                    let mut st = sub.state();
                    if st.last_sent < seq {
                        st.last_sent = seq;
                    }
                }
                Err(e) => {
                    error!(channel = %sub.channel, seq, %e, "store failure during delivery");
                    return;
                }
            }
        }
    }

    /// Deliver one message to a non-queue subscription. First sends check
    /// eligibility (`seq > last_sent`, capacity) and advance the cursor;
    /// redeliveries only refresh the in-flight entry. Returns false when
    /// the subscription cannot take the message.
    pub(crate) fn send_msg_to_sub(
        &self,
        sub: &Arc<Subscription>,
        msg: &StoredMessage,
        redelivered: bool,
    ) -> bool {
        {
            let mut st = sub.state();
            if !st.attached {
                return false;
            }
            if !redelivered {
                if msg.sequence <= st.last_sent {
                    // another worker delivered this one first
                    return true;
                }
                if st.acks_pending.len() >= st.max_in_flight {
                    return false;
                }
                st.last_sent = msg.sequence;
            }
            st.acks_pending.insert(msg.sequence, Utc::now().timestamp_millis());
            self.bus().publish(&st.inbox, data_frame(msg, redelivered));
            if st.ack_timer.is_none() {
                let wait = st.ack_wait;
                st.ack_timer = Some(self.spawn_ack_timer(sub, wait));
            }
        }
        trace!(channel = %msg.channel, seq = msg.sequence, sub = sub.id, redelivered, "delivered");
        if let Err(e) = self.store().add_seq_pending(sub.id, msg.sequence) {
            warn!(sub = sub.id, seq = msg.sequence, %e, "failed to persist pending sequence");
        }
        if !redelivered {
            // the cursor moved; keep the stored record current so a
            // restart resumes at the right place
            if let Err(e) = self.store().update_sub(&sub.record()) {
                warn!(sub = sub.id, %e, "failed to persist delivery cursor");
            }
        }
        true
    }

    /// Advance a queue group: drain the requeue buffer, then the shared
    /// cursor, handing each message to the next member with capacity.
    /// When no member qualifies the message waits; the cursor never
    /// regresses.
    pub(crate) fn queue_send_avail(&self, qs: &Arc<QueueState>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let mut qg = qs.group();
            if qg.members.is_empty() {
                return;
            }

            let (seq, redelivered) = match qg.requeue.iter().next().copied() {
                Some(seq) => (seq, true),
                None => {
                    let (first, last) = match (
                        self.store().first_sequence(&qs.channel),
                        self.store().last_sequence(&qs.channel),
                    ) {
                        (Ok(first), Ok(last)) => (first, last),
                        (Err(e), _) | (_, Err(e)) => {
                            error!(channel = %qs.channel, %e, "store failure during queue delivery");
                            return;
                        }
                    };
                    let mut next = qg.last_sent + 1;
                    if first > 0 && next < first {
                        qg.last_sent = first - 1;
                        next = first;
                    }
                    if next > last {
                        return;
                    }
                    (next, false)
                }
            };

            let total = qg.members.len();
            let mut picked = None;
            for i in 0..total {
                let idx = (qg.next_member + i) % total;
                let st = qg.members[idx].state();
                if st.attached && st.acks_pending.len() < st.max_in_flight {
                    picked = Some(idx);
                    break;
                }
            }
            let Some(idx) = picked else {
                return;
            };

            let msg = match self.store().lookup_msg(&qs.channel, seq) {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    // evicted by retention; nothing left to hand out
                    if redelivered {
                        qg.requeue.remove(&seq);
                    } else {
                        qg.last_sent = seq;
                    }
                    continue;
                }
                Err(e) => {
                    error!(channel = %qs.channel, seq, %e, "store failure during queue delivery");
                    return;
                }
            };

            let member = Arc::clone(&qg.members[idx]);
            if redelivered {
                qg.requeue.remove(&seq);
            } else {
                qg.last_sent = seq;
            }
            qg.next_member = (idx + 1) % total;

            {
                let mut st = member.state();
                if msg.sequence > st.last_sent {
                    st.last_sent = msg.sequence;
                }
                st.acks_pending.insert(msg.sequence, Utc::now().timestamp_millis());
                self.bus().publish(&st.inbox, data_frame(&msg, redelivered));
                if st.ack_timer.is_none() {
                    let wait = st.ack_wait;
                    st.ack_timer = Some(self.spawn_ack_timer(&member, wait));
                }
            }
            drop(qg);

            trace!(channel = %msg.channel, seq = msg.sequence, member = member.id, redelivered, "queue delivered");
            if let Err(e) = self.store().add_seq_pending(member.id, msg.sequence) {
                warn!(sub = member.id, seq = msg.sequence, %e, "failed to persist pending sequence");
            }
            if let Err(e) = self.store().update_sub(&member.record()) {
                warn!(sub = member.id, %e, "failed to persist delivery cursor");
            }
        }
    }

    /// Hand a departed member's in-flight sequences back to the group.
    pub(crate) fn queue_requeue(&self, qs: &Arc<QueueState>, seqs: Vec<u64>) {
        if !seqs.is_empty() {
            debug!(group = %qs.key, count = seqs.len(), "requeueing in-flight of departed member");
            qs.group().requeue.extend(seqs);
        }
        self.queue_send_avail(qs);
    }

    /// Redeliver a durable's preserved in-flight set after a rebind, in
    /// ascending order and flagged as redelivered.
    pub(crate) fn redeliver_pending(&self, sub: &Arc<Subscription>) {
        let pending: Vec<u64> = sub.state().acks_pending.keys().copied().collect();
        for seq in pending {
            match self.store().lookup_msg(&sub.channel, seq) {
                Ok(Some(msg)) => {
                    self.send_msg_to_sub(sub, &msg, true);
                }
                Ok(None) => {
                    // evicted while detached; count it as settled
                    sub.state().acks_pending.remove(&seq);
                    let _ = self.store().ack_seq_pending(sub.id, seq);
                }
                Err(e) => warn!(sub = sub.id, seq, %e, "store failure during rebind redelivery"),
            }
        }
    }

    /// One ack-timer task per subscription: sleep, sweep, reschedule at
    /// the minimum remaining wait, stop when nothing is in flight.
    pub(crate) fn spawn_ack_timer(&self, sub: &Arc<Subscription>, delay: Duration) -> JoinHandle<()> {
        let weak = self.weak();
        let sub = Arc::clone(sub);
        tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                let Some(srv) = weak.upgrade() else { return };
                if srv.is_shutdown() {
                    return;
                }
                match srv.perform_ack_expiration(&sub) {
                    Some(next) => delay = next,
                    None => return,
                }
            }
        })
    }

    /// Sweep a subscription's in-flight set: everything past its ack-wait
    /// is re-published from the store with redelivered=true and a fresh
    /// sent-at. Returns the delay until the next sweep, or `None` when
    /// the set drained and the timer should die.
    pub(crate) fn perform_ack_expiration(&self, sub: &Arc<Subscription>) -> Option<Duration> {
        let now = Utc::now().timestamp_millis();
        let (expired, wait_ms) = {
            let mut st = sub.state();
            if !st.attached || st.acks_pending.is_empty() {
                st.ack_timer = None;
                return None;
            }
            let wait_ms = st.ack_wait.as_millis() as i64;
            let expired: Vec<u64> = st
                .acks_pending
                .iter()
                .filter(|&(_, &sent)| now - sent >= wait_ms)
                .map(|(&seq, _)| seq)
                .collect();
            (expired, wait_ms)
        };

        for seq in expired {
            match self.store().lookup_msg(&sub.channel, seq) {
                Ok(Some(msg)) => {
                    let mut st = sub.state();
                    if !st.acks_pending.contains_key(&seq) {
                        continue; // acked while we were reading the store
                    }
                    st.acks_pending.insert(seq, Utc::now().timestamp_millis());
                    debug!(channel = %sub.channel, seq, sub = sub.id, "ack-wait expired, redelivering");
                    self.bus().publish(&st.inbox, data_frame(&msg, true));
                }
                Ok(None) => {
                    sub.state().acks_pending.remove(&seq);
                    let _ = self.store().ack_seq_pending(sub.id, seq);
                }
                Err(e) => warn!(sub = sub.id, seq, %e, "store failure during redelivery"),
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut st = sub.state();
        if st.acks_pending.is_empty() {
            st.ack_timer = None;
            return None;
        }
        let next_ms = st
            .acks_pending
            .values()
            .map(|&sent| (sent + wait_ms - now).max(1))
            .min()
            .unwrap_or(wait_ms.max(1));
        Some(Duration::from_millis(next_ms as u64))
    }

    /// Handle an ack arriving on a subscription's ack inbox: drop the
    /// sequence from the in-flight set, stop the timer when it drains,
    /// and pull the next eligible message.
    pub(crate) fn process_ack(&self, sub: &Arc<Subscription>, msg: BusMessage) {
        if self.is_shutdown() {
            return;
        }
        let ack: AckProto = match decode(&msg.payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(sub = sub.id, %e, "dropping unparsable ack");
                return;
            }
        };
        if ack.channel != sub.channel {
            warn!(sub = sub.id, got = %ack.channel, "ack for wrong channel");
            return;
        }

        let (removed, queue) = {
            let mut st = sub.state();
            let removed = st.acks_pending.remove(&ack.sequence).is_some();
            if removed && st.acks_pending.is_empty() {
                if let Some(timer) = st.ack_timer.take() {
                    timer.abort();
                }
            }
            (removed, st.queue.clone())
        };
        if !removed {
            // acks are idempotent; a late duplicate is not an error
            trace!(sub = sub.id, seq = ack.sequence, "ack for sequence not in flight");
            return;
        }
        trace!(sub = sub.id, seq = ack.sequence, "acked");
        if let Err(e) = self.store().ack_seq_pending(sub.id, ack.sequence) {
            warn!(sub = sub.id, seq = ack.sequence, %e, "failed to clear pending sequence");
        }

        match queue.and_then(|weak| weak.upgrade()) {
            Some(qs) => self.queue_send_avail(&qs),
            None => self.send_avail_messages(sub),
        }
    }
}
