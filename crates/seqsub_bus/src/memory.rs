//! In-process bus implementation.
//!
//! A flat registry of subscriptions, each holding an unbounded sender into
//! its own dispatch task. Publishing walks the registry, matches patterns
//! and enqueues a clone of the message; the dispatch task awaits the
//! handler for one message at a time, which preserves per-subscription
//! arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::{subject, Bus, BusError, BusMessage, BusSubscription, MsgHandler};

#[derive(Debug)]
struct SubEntry {
    sid: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    subs: Mutex<Vec<SubEntry>>,
    next_sid: AtomicU64,
}

/// The in-memory [`Bus`].
#[derive(Clone, Debug, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn dispatch(&self, msg: BusMessage) {
        let subs = self.inner.subs.lock().unwrap();
        for entry in subs.iter() {
            if subject::matches(&entry.pattern, &msg.subject) {
                // A dead receiver just means the dispatch task is gone;
                // the entry will be removed by its guard.
                let _ = entry.tx.send(msg.clone());
            }
        }
    }
}

impl Bus for MemoryBus {
    fn publish(&self, subject: &str, payload: Vec<u8>) {
        trace!(subject, len = payload.len(), "publish");
        self.dispatch(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });
    }

    fn publish_with_reply(&self, subject: &str, reply: &str, payload: Vec<u8>) {
        trace!(subject, reply, len = payload.len(), "publish with reply");
        self.dispatch(BusMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        });
    }

    fn subscribe(&self, pattern: &str, handler: MsgHandler) -> Result<BusSubscription, BusError> {
        if !subject::is_valid(pattern) {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }

        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg).await;
            }
        });

        self.inner.subs.lock().unwrap().push(SubEntry {
            sid,
            pattern: pattern.to_string(),
            tx,
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(BusSubscription::new(sid, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subs.lock().unwrap().retain(|e| e.sid != sid);
            }
        }))
    }

    fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<BusMessage, BusError>> {
        let inbox = self.new_inbox();
        let (tx, rx) = oneshot::channel::<BusMessage>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let handler: MsgHandler = Arc::new(move |msg| {
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(msg);
                }
            })
        });

        let sub = match self.subscribe(&inbox, handler) {
            Ok(sub) => sub,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        self.publish_with_reply(subject, &inbox, payload);

        Box::pin(async move {
            // Keep the inbox subscribed until the reply or the deadline.
            let _guard = sub;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(msg)) => Ok(msg),
                Ok(Err(_)) => Err(BusError::Closed),
                Err(_) => Err(BusError::Timeout),
            }
        })
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }
}
