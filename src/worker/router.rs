use super::{
    table::{ConnectionTable, History},
    DownloadHandle, Outbound, PeerHandle, Route, SearchResult, Target, Transfer,
};
use crate::{
    id::{IdGenerator, MessageId, ServentId},
    message::{Advance, Body, Hit, Message, NulError, Pong, Query, QueryHit, MAX_HITS},
    share::{saturate, SharedFiles},
};
use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

/// What this servent says about itself in pongs and query hits.
#[derive(Clone, Debug)]
pub(crate) struct LocalInfo {
    pub servent_id: ServentId,
    pub addr: SocketAddrV4,
    pub ttl: u8,
    pub speed: u32,
    pub min_speed: u16,
    pub max_neighbors: usize,
}

/// Decides what happens to every descriptor received from, or originated for, the network.
///
/// The router is shared by all connection tasks. Its tables are internally synchronized, so
/// decisions about different descriptors run concurrently.
pub(crate) struct Router {
    info: LocalInfo,
    ids: IdGenerator,
    shared: Arc<dyn SharedFiles>,
    transfer: Arc<dyn Transfer>,
    neighbors: ConnectionTable<PeerHandle>,
    downloads: ConnectionTable<DownloadHandle>,
    ping_history: History,
    query_history: History,
    results: Mutex<Vec<SearchResult>>,
    hosts: Mutex<Vec<SocketAddr>>,
    pending: mpsc::UnboundedSender<Outbound>,
}

impl Router {
    /// Create a router together with the receiving end of its pending outbound queue. The queue
    /// must be drained with [`Router::dispatch`], see [`Router::run_dispatch`].
    pub fn new(
        info: LocalInfo,
        ids: IdGenerator,
        shared: Arc<dyn SharedFiles>,
        transfer: Arc<dyn Transfer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (pending, pending_rx) = mpsc::unbounded_channel();

        let router = Self {
            info,
            ids,
            shared,
            transfer,
            neighbors: ConnectionTable::new(),
            downloads: ConnectionTable::new(),
            ping_history: History::new(),
            query_history: History::new(),
            results: Mutex::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
            pending,
        };

        (Arc::new(router), pending_rx)
    }

    pub fn info(&self) -> &LocalInfo {
        &self.info
    }

    pub fn shared(&self) -> &Arc<dyn SharedFiles> {
        &self.shared
    }

    pub fn transfer(&self) -> &Arc<dyn Transfer> {
        &self.transfer
    }

    // ------------------------------------------------------------------------//

    /// Handle a descriptor received from the neighbor at `from`.
    pub fn handle_incoming(&self, message: Message, from: SocketAddr) {
        log::trace!("Received {:?} from {}", message, from);

        match &message.body {
            Body::Ping => self.handle_ping(message, from),
            Body::Pong(_) => self.handle_pong(message, from),
            Body::Query(_) => self.handle_query(message, from),
            Body::QueryHit(_) => self.handle_query_hit(message, from),
        }
    }

    fn handle_ping(&self, message: Message, from: SocketAddr) {
        if !self.ping_history.insert(message.id, Route::Peer(from)) {
            log::trace!("Dropping duplicate ping {} from {}", message.id, from);
            return;
        }

        let (file_count, kb_count) = self.shared.stats();
        let pong = Message::local(
            message.id,
            self.info.ttl,
            Body::Pong(Pong {
                port: self.info.addr.port(),
                ip: *self.info.addr.ip(),
                file_count,
                kb_count,
            }),
        );

        self.enqueue(pong, Target::Peer(from));
        self.enqueue(message, Target::AllExcept(Some(from)));
    }

    fn handle_pong(&self, message: Message, from: SocketAddr) {
        match self.ping_history.route(&message.id) {
            Some(Route::Peer(origin)) => self.enqueue(message, Target::Peer(origin)),
            Some(Route::Local) => {
                if let Body::Pong(pong) = &message.body {
                    let host = SocketAddr::from((pong.ip, pong.port));
                    let mut hosts = self.hosts.lock().unwrap();

                    if !hosts.contains(&host) {
                        log::debug!("Discovered host {} via {}", host, from);
                        hosts.push(host);
                    }
                }
            }
            None => log::debug!("Dropping unsolicited pong {} from {}", message.id, from),
        }
    }

    fn handle_query(&self, message: Message, from: SocketAddr) {
        if !self.query_history.insert(message.id, Route::Peer(from)) {
            log::trace!("Dropping duplicate query {} from {}", message.id, from);
            return;
        }

        if let Body::Query(query) = &message.body {
            if let Some(hit) = self.answer(message.id, query) {
                self.enqueue(hit, Target::Peer(from));
            }
        }

        self.enqueue(message, Target::AllExcept(Some(from)));
    }

    fn handle_query_hit(&self, message: Message, from: SocketAddr) {
        match self.query_history.route(&message.id) {
            Some(Route::Peer(origin)) => self.enqueue(message, Target::Peer(origin)),
            Some(Route::Local) => {
                if let Body::QueryHit(hit) = message.body {
                    log::debug!(
                        "Received {} result(s) for query {} from {}",
                        hit.hits.len(),
                        message.id,
                        from
                    );

                    self.results.lock().unwrap().push(SearchResult {
                        query_id: message.id,
                        from,
                        hit,
                    });
                }
            }
            None => log::debug!("Dropping unsolicited query hit {} from {}", message.id, from),
        }
    }

    /// Build the query hit answering `query`, if any shared file matches.
    fn answer(&self, id: MessageId, query: &Query) -> Option<Message> {
        if self.info.speed < u32::from(query.min_speed) {
            return None;
        }

        let hits: Vec<_> = self
            .shared
            .search(query.criteria())
            .into_iter()
            .filter_map(|file| Hit::new(file.index, saturate(file.size), file.name).ok())
            .take(MAX_HITS)
            .collect();

        if hits.is_empty() {
            return None;
        }

        Some(Message::local(
            id,
            self.info.ttl,
            Body::QueryHit(QueryHit {
                port: self.info.addr.port(),
                ip: *self.info.addr.ip(),
                speed: self.info.speed,
                hits,
                servent_id: self.info.servent_id,
            }),
        ))
    }

    // ------------------------------------------------------------------------//

    /// Flood a new ping to every neighbor.
    pub fn ping(&self) -> MessageId {
        let id = self.ids.message_id();
        self.ping_history.insert(id, Route::Local);
        self.enqueue(
            Message::local(id, self.info.ttl, Body::Ping),
            Target::AllExcept(None),
        );
        id
    }

    /// Flood a new query to every neighbor.
    pub fn query(&self, criteria: &str) -> Result<MessageId, NulError> {
        let query = Query::new(self.info.min_speed, criteria)?;
        let id = self.ids.message_id();
        self.query_history.insert(id, Route::Local);
        self.enqueue(
            Message::local(id, self.info.ttl, Body::Query(query)),
            Target::AllExcept(None),
        );
        Ok(id)
    }

    fn enqueue(&self, message: Message, target: Target) {
        if self.pending.send(Outbound { message, target }).is_err() {
            log::debug!("Pending queue closed, dropping outbound message");
        }
    }

    /// Hand one queued descriptor to the writers of its target neighbors.
    ///
    /// Every copy gets its own ttl/hop update.
    pub fn dispatch(&self, outbound: Outbound) {
        let Outbound { message, target } = outbound;

        let writers = self.neighbors.filter_map(|addr, handle| {
            let selected = match target {
                Target::Peer(peer) => *addr == peer,
                Target::AllExcept(except) => Some(*addr) != except,
            };

            selected.then(|| (*addr, handle.clone_sender()))
        });

        if writers.is_empty() {
            log::trace!("No neighbor to send {} to ({:?})", message.id, target);
            return;
        }

        for (addr, writer) in writers {
            match message.advance() {
                Advance::Forward(copy) => {
                    if writer.send(copy).is_err() {
                        log::debug!("Connection to {} is closing, dropping message", addr);
                    }
                }
                Advance::Expired => {
                    log::trace!("Message {} expired, not forwarding to {}", message.id, addr);
                }
            }
        }
    }

    /// Drain the pending queue until every sender is gone.
    pub async fn run_dispatch(self: Arc<Self>, mut pending_rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = pending_rx.recv().await {
            self.dispatch(outbound);
        }
    }

    // ------------------------------------------------------------------------//

    pub fn add_neighbor(&self, addr: SocketAddr, handle: PeerHandle) -> bool {
        let added = self.neighbors.insert(addr, handle);

        if added {
            log::info!("Connected to {}", addr);
        }

        added
    }

    /// Close the connection to a neighbor. Closing an unknown or already closed neighbor does
    /// nothing.
    pub fn remove_neighbor(&self, addr: &SocketAddr) -> bool {
        let removed = self.neighbors.remove(addr).is_some();

        if removed {
            log::info!("Disconnected from {}", addr);
        }

        removed
    }

    pub fn is_neighbor(&self, addr: &SocketAddr) -> bool {
        self.neighbors.contains(addr)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> Vec<SocketAddr> {
        self.neighbors.addrs()
    }

    pub fn add_download(&self, addr: SocketAddr, handle: DownloadHandle) -> bool {
        self.downloads.insert(addr, handle)
    }

    pub fn remove_download(&self, addr: &SocketAddr) -> bool {
        self.downloads.remove(addr).is_some()
    }

    pub fn downloads(&self) -> Vec<SocketAddr> {
        self.downloads.addrs()
    }

    pub fn results(&self) -> Vec<SearchResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn clear_results(&self) {
        self.results.lock().unwrap().clear()
    }

    pub fn hosts(&self) -> Vec<SocketAddr> {
        self.hosts.lock().unwrap().clone()
    }

    /// Close every neighbor connection and every download.
    pub fn shutdown(&self) {
        for (addr, _) in self.neighbors.drain() {
            log::debug!("Closing connection to {}", addr);
        }

        for (addr, _) in self.downloads.drain() {
            log::debug!("Cancelling download from {}", addr);
        }
    }
}

// ----------------------------------------------------------------------------//
