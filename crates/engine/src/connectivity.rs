//! Online/offline state shared by the sync layer and the UI.
//!
//! The platform reachability check is the host's business: it reports edges
//! through [`ConnectivityMonitor::set_online`]. Consumers either register
//! edge callbacks or hold a [`watch::Receiver`].

use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::info;
use tokio::sync::watch;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    BecameOnline,
    BecameOffline,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Edge, Callback)>,
}

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    listeners: Arc<Mutex<Listeners>>,
}

/// Keeps a callback registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.entries.retain(|(id, _, _)| *id != self.id);
        }
    }
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            listeners: Arc::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the current reachability. Callbacks fire only on a real edge,
    /// after the new state is visible to `is_online`.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        let edge = if online {
            info!("connectivity: online");
            Edge::BecameOnline
        } else {
            info!("connectivity: offline");
            Edge::BecameOffline
        };

        // Call outside the lock so a callback may (un)subscribe.
        let callbacks: Vec<Callback> = {
            let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners
                .entries
                .iter()
                .filter(|(_, e, _)| *e == edge)
                .map(|(_, _, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn on_became_online(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(Edge::BecameOnline, Arc::new(callback))
    }

    pub fn on_became_offline(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(Edge::BecameOffline, Arc::new(callback))
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn subscribe(&self, edge: Edge, callback: Callback) -> Subscription {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, edge, callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }
}
