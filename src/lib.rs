//! Implementation of a Gnutella v0.4 servent.

// Supported descriptors: ping, pong, query and query hit. Push descriptors are read off the wire
// and ignored, so firewalled servents cannot be downloaded from.

mod builder;
mod id;
mod message;
mod share;
mod wire;
mod worker;

pub use crate::builder::{Servent, ServentBuilder};
pub use crate::id::{IdGenerator, LengthError, MessageId, ServentId, ID_LEN};
pub use crate::message::{
    Advance, Body, Header, Hit, Kind, Message, NulError, Pong, Query, QueryHit, DEFAULT_TTL,
    HEADER_LEN, LOCAL_HOP, MAX_HITS, MAX_PAYLOAD_LEN,
};
pub use crate::share::{SharedDirectory, SharedFile, SharedFiles};
pub use crate::wire::DecodeError;
pub use crate::worker::{
    ConnectError, DownloadRequest, HttpTransfer, SearchResult, Transfer, TransferError,
};
