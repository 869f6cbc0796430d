use crate::{
    id::{IdGenerator, MessageId, ServentId},
    message::{NulError, DEFAULT_TTL},
    share::{self, SharedDirectory, SharedFile, SharedFiles},
    worker::{
        connection, listener, transfer, DownloadRequest, HttpTransfer, LocalInfo, Router,
        SearchResult, Transfer,
    },
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, task};

const DEFAULT_PORT: u16 = 6346;
const DEFAULT_SPEED: u32 = 56;
const DEFAULT_MAX_NEIGHBORS: usize = 8;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// A Gnutella v0.4 servent.
///
/// This type is cheaply cloneable where each clone refers to the same underlying servent. The
/// servent keeps running until [`Servent::close`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Servent {
    inner: Arc<Inner>,
}

struct Inner {
    router: Arc<Router>,
    local_addr: SocketAddr,
    connect_timeout: Duration,
    tasks: Mutex<Vec<task::JoinHandle<()>>>,
}

impl Inner {
    fn close(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        self.router.shutdown();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Servent {
    /// Create a new ServentBuilder.
    pub fn builder() -> ServentBuilder {
        ServentBuilder {
            listen_addr: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            advertised_addr: None,
            shared: None,
            transfer: None,
            download_dir: PathBuf::from("."),
            servent_id: None,
            ttl: DEFAULT_TTL,
            min_speed: 0,
            speed: DEFAULT_SPEED,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
        }
    }

    /// Connect to another servent and add it to the neighbors.
    ///
    /// Returns `true` if the peer is a neighbor afterwards, including when it already was one.
    pub async fn connect(&self, addr: SocketAddr) -> bool {
        let router = self.inner.router.clone();

        match connection::connect(router, addr, self.inner.connect_timeout).await {
            Ok(()) => true,
            Err(error) => {
                log::info!("Failed to connect to {}: {}", addr, error);
                false
            }
        }
    }

    /// Send a ping to every neighbor. Pongs answering it show up in [`Servent::hosts`].
    pub fn ping(&self) -> MessageId {
        self.inner.router.ping()
    }

    /// Send a query to every neighbor. Hits answering it show up in [`Servent::results`].
    ///
    /// Fails if the criteria contains a NUL byte, which the wire format can't carry.
    pub fn query(&self, criteria: &str) -> Result<MessageId, NulError> {
        self.inner.router.query(criteria)
    }

    /// Start downloading a file announced in a query hit.
    ///
    /// The transfer runs in the background and is listed in [`Servent::downloads`] until it
    /// finishes. Returns `false` if a download from the same address is already running.
    pub async fn download(
        &self,
        addr: SocketAddr,
        index: u32,
        file_name: &str,
        size: u32,
    ) -> bool {
        transfer::spawn_download(
            self.inner.router.clone(),
            DownloadRequest {
                addr,
                index,
                name: file_name.to_owned(),
                size,
                offset: 0,
            },
        )
    }

    pub fn neighbors(&self) -> Vec<SocketAddr> {
        self.inner.router.neighbors()
    }

    pub fn downloads(&self) -> Vec<SocketAddr> {
        self.inner.router.downloads()
    }

    /// Query hits received for the queries sent by this servent, oldest first.
    pub fn results(&self) -> Vec<SearchResult> {
        self.inner.router.results()
    }

    pub fn clear_results(&self) {
        self.inner.router.clear_results()
    }

    /// Servents discovered by answers to our pings.
    pub fn hosts(&self) -> Vec<SocketAddr> {
        self.inner.router.hosts()
    }

    /// Address the servent accepts connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn servent_id(&self) -> ServentId {
        self.inner.router.info().servent_id
    }

    /// Close the connection to one neighbor. Does nothing if it is not a neighbor.
    pub fn disconnect(&self, addr: &SocketAddr) -> bool {
        self.inner.router.remove_neighbor(addr)
    }

    /// Stop accepting connections and close every neighbor connection and download.
    ///
    /// Messages queued but not yet written may be lost.
    pub fn close(&self) {
        log::info!("Closing servent on {}", self.inner.local_addr);
        self.inner.close();
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a servent.
pub struct ServentBuilder {
    listen_addr: SocketAddr,
    advertised_addr: Option<SocketAddrV4>,
    shared: Option<Arc<dyn SharedFiles>>,
    transfer: Option<Arc<dyn Transfer>>,
    download_dir: PathBuf,
    servent_id: Option<ServentId>,
    ttl: u8,
    min_speed: u16,
    speed: u32,
    max_neighbors: usize,
    connect_timeout: Duration,
    rescan_interval: Duration,
}

impl ServentBuilder {
    /// Address to accept connections on. Defaults to `0.0.0.0:6346`.
    pub fn set_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Address announced in pongs and query hits.
    ///
    /// If this is not supplied, the bound listen address is used.
    pub fn set_advertised_addr(mut self, addr: SocketAddrV4) -> Self {
        self.advertised_addr = Some(addr);
        self
    }

    /// Share the files found in a directory.
    pub fn set_shared_dir(self, path: impl Into<PathBuf>) -> Self {
        self.set_shared_files(SharedDirectory::new(path))
    }

    /// Share files from a custom source.
    pub fn set_shared_files<S>(mut self, shared: S) -> Self
    where
        S: SharedFiles + 'static,
    {
        self.shared = Some(Arc::new(shared));
        self
    }

    /// Directory downloads are written to. Defaults to the working directory.
    pub fn set_download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Perform downloads with a custom transfer instead of [`HttpTransfer`].
    pub fn set_transfer<T>(mut self, transfer: T) -> Self
    where
        T: Transfer + 'static,
    {
        self.transfer = Some(Arc::new(transfer));
        self
    }

    /// Set the id announced in query hits. If not provided, a random id is generated.
    pub fn set_servent_id(mut self, id: ServentId) -> Self {
        self.servent_id = Some(id);
        self
    }

    /// Time to live of the messages this servent originates. Defaults to 7.
    pub fn set_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Minimum speed (kB/s) requested from servents answering our queries.
    pub fn set_min_speed(mut self, min_speed: u16) -> Self {
        self.min_speed = min_speed;
        self
    }

    /// Speed (kB/s) announced in query hits. Queries asking for more are not answered.
    pub fn set_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    /// Maximum number of neighbors accepted from inbound connections. Outbound connections are
    /// not limited.
    pub fn set_max_neighbors(mut self, max_neighbors: usize) -> Self {
        self.max_neighbors = max_neighbors;
        self
    }

    /// Time allowed for the handshake of a connection.
    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How often the shared files are re-read. Defaults to 60 seconds.
    pub fn set_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    /// Bind the listen address and start the servent.
    pub async fn start(self) -> io::Result<Servent> {
        let socket = TcpListener::bind(self.listen_addr).await?;
        let local_addr = socket.local_addr()?;

        let advertised_addr = match (self.advertised_addr, local_addr) {
            (Some(addr), _) => addr,
            (None, SocketAddr::V4(addr)) => addr,
            (None, SocketAddr::V6(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "an IPv4 advertised address is required when listening on IPv6",
                ))
            }
        };

        let ids = IdGenerator::new();
        let info = LocalInfo {
            servent_id: self.servent_id.unwrap_or_else(|| ids.servent_id()),
            addr: advertised_addr,
            ttl: self.ttl,
            speed: self.speed,
            min_speed: self.min_speed,
            max_neighbors: self.max_neighbors,
        };
        let shared = self
            .shared
            .unwrap_or_else(|| Arc::new(Vec::<SharedFile>::new()));
        let transfer = self
            .transfer
            .unwrap_or_else(|| Arc::new(HttpTransfer::new(self.download_dir)));

        share::refresh(shared.clone()).await;

        let (router, pending_rx) = Router::new(info, ids, shared.clone(), transfer);

        let tasks = vec![
            task::spawn(router.clone().run_dispatch(pending_rx)),
            task::spawn(listener::run(socket, router.clone(), self.connect_timeout)),
            task::spawn(share::run_refresh(shared, self.rescan_interval)),
        ];

        log::info!(
            "Servent {} listening on {} (advertised as {})",
            router.info().servent_id,
            local_addr,
            advertised_addr
        );

        Ok(Servent {
            inner: Arc::new(Inner {
                router,
                local_addr,
                connect_timeout: self.connect_timeout,
                tasks: Mutex::new(tasks),
            }),
        })
    }
}
