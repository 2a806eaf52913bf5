//! Client registry.
//!
//! Thread-safe map from client id to client record. The registry lock only
//! guards the map itself and is never held across bus or store calls; each
//! record carries its own lock for the subscription list and the
//! failed-heartbeat counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::sub::Subscription;

pub struct Client {
    pub id: String,
    /// Subject the broker pings for liveness.
    pub hb_inbox: String,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    subs: Vec<Arc<Subscription>>,
    failed_hbs: u32,
}

impl Client {
    fn new(id: String, hb_inbox: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            hb_inbox,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn add_sub(&self, sub: Arc<Subscription>) {
        self.state.lock().unwrap().subs.push(sub);
    }

    pub fn remove_sub(&self, sub_id: u64) {
        self.state.lock().unwrap().subs.retain(|s| s.id != sub_id);
    }

    /// Snapshot of the owned subscriptions.
    pub fn subs(&self) -> Vec<Arc<Subscription>> {
        self.state.lock().unwrap().subs.clone()
    }

    /// Drain the owned subscriptions; used when the client goes away.
    pub fn take_subs(&self) -> Vec<Arc<Subscription>> {
        std::mem::take(&mut self.state.lock().unwrap().subs)
    }

    /// A heartbeat reply arrived.
    pub fn heartbeat_ok(&self) {
        self.state.lock().unwrap().failed_hbs = 0;
    }

    /// A heartbeat went unanswered; returns the consecutive-miss count.
    pub fn heartbeat_missed(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.failed_hbs += 1;
        state.failed_hbs
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client. Fails (returns `None`) when the id is taken;
    /// duplicate arbitration happens above this layer.
    pub fn register(&self, id: &str, hb_inbox: &str) -> Option<Arc<Client>> {
        let mut clients = self.clients.write().unwrap();
        if clients.contains_key(id) {
            return None;
        }
        let client = Client::new(id.to_string(), hb_inbox.to_string());
        clients.insert(id.to_string(), Arc::clone(&client));
        Some(client)
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.write().unwrap().remove(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Client>> {
        self.clients.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn get_subs(&self, id: &str) -> Vec<Arc<Subscription>> {
        self.lookup(id).map(|c| c.subs()).unwrap_or_default()
    }
}
