//! Tables shared between the router and every connection task.
//!
//! Each operation takes the lock for the duration of one lookup or update only. Callers never
//! hold a lock across an `.await`.

use super::Route;
use crate::id::MessageId;
use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
    sync::Mutex,
};

/// Live connections keyed by the address of the remote peer. Dropping a handle closes the
/// connection it belongs to.
pub(crate) struct ConnectionTable<H> {
    entries: Mutex<HashMap<SocketAddr, H>>,
}

impl<H> ConnectionTable<H> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a handle unless the address already has one. Returns whether it was inserted; a
    /// rejected handle is dropped.
    pub fn insert(&self, addr: SocketAddr, handle: H) -> bool {
        match self.entries.lock().unwrap().entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<H> {
        self.entries.lock().unwrap().remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.lock().unwrap().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    /// Apply `f` to every entry and collect what it returns.
    pub fn filter_map<T, F>(&self, mut f: F) -> Vec<T>
    where
        F: FnMut(&SocketAddr, &H) -> Option<T>,
    {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(addr, handle)| f(addr, handle))
            .collect()
    }

    /// Take every handle out of the table.
    pub fn drain(&self) -> Vec<(SocketAddr, H)> {
        self.entries.lock().unwrap().drain().collect()
    }
}

/// De-duplication record: the first route each descriptor id was seen on.
///
/// Entries are never updated nor evicted.
pub(crate) struct History {
    routes: Mutex<HashMap<MessageId, Route>>,
}

impl History {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Record the route of an id seen for the first time. Returns `false` if the id is already
    /// known, in which case the existing route is kept.
    pub fn insert(&self, id: MessageId, route: Route) -> bool {
        match self.routes.lock().unwrap().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(route);
                true
            }
        }
    }

    pub fn route(&self, id: &MessageId) -> Option<Route> {
        self.routes.lock().unwrap().get(id).copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.routes.lock().unwrap().len()
    }
}
