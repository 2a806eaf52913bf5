//! seqsub_bus
//!
//! The message bus the broker runs on top of: subject-based publish,
//! subscribe-with-callback and request/reply. The broker only ever talks to
//! the [`Bus`] trait; [`memory::MemoryBus`] is the in-process
//! implementation used by the binary and by every test.
//!
//! Delivery model: each subscription owns a worker task and receives its
//! messages in arrival order, one at a time. A slow handler therefore only
//! delays its own subscription. Publishing never blocks.

pub mod memory;
pub mod subject;


use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

/// A message as seen by a subscription callback.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Reply subject for request/reply exchanges, if any.
    pub reply: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Subscription callback. Handlers are async; each invocation is awaited
/// before the next message of the same subscription is dispatched.
pub type MsgHandler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request timed out")]
    Timeout,
    #[error("bus is closed")]
    Closed,
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
}

/// The bus contract consumed by the broker.
pub trait Bus: Send + Sync {
    /// Publish a payload on a subject. Fire and forget.
    fn publish(&self, subject: &str, payload: Vec<u8>);

    /// Publish a payload carrying a reply subject.
    fn publish_with_reply(&self, subject: &str, reply: &str, payload: Vec<u8>);

    /// Subscribe `handler` to a subject. The subject may contain the `*`
    /// and `>` wildcards. Dropping the returned guard unsubscribes.
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<BusSubscription, BusError>;

    /// Publish on `subject` and wait up to `timeout` for a reply on a
    /// fresh inbox.
    fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<BusMessage, BusError>>;

    /// A unique inbox subject.
    fn new_inbox(&self) -> String;
}

/// Guard for an active subscription; unsubscribes on drop.
pub struct BusSubscription {
    sid: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    pub fn new(sid: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            sid,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Explicit unsubscribe; equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription").field("sid", &self.sid).finish()
    }
}
