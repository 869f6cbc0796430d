pub(crate) use self::{
    connection::PeerHandle,
    router::{LocalInfo, Router},
    transfer::DownloadHandle,
};
pub use self::transfer::{DownloadRequest, HttpTransfer, Transfer};
use crate::{id::MessageId, message::Message};
use std::{io, net::SocketAddr};
use thiserror::Error;

pub(crate) mod connection;
pub(crate) mod listener;
mod router;
mod table;
pub(crate) mod transfer;

/// Where a descriptor id was first seen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Route {
    /// This node originated it.
    Local,
    /// It arrived from this neighbor.
    Peer(SocketAddr),
}

/// Neighbors a queued descriptor should go to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Target {
    Peer(SocketAddr),
    /// Every neighbor except the one given, if any.
    AllExcept(Option<SocketAddr>),
}

/// Entry of the pending outbound queue.
#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    pub message: Message,
    pub target: Target,
}

/// Query hit received in answer to one of our queries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchResult {
    /// Id of the query this answers.
    pub query_id: MessageId,
    /// Neighbor that delivered it.
    pub from: SocketAddr,
    pub hit: crate::message::QueryHit,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("timed out")]
    Timeout,
    #[error("handshake rejected")]
    Rejected,
    #[error("socket error")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("unexpected response: {0}")]
    BadResponse(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("malformed HTTP head")]
    Http(#[from] httparse::Error),
    #[error("socket error")]
    Io(#[from] io::Error),
}
