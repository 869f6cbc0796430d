//! One task per neighbor: reads descriptors off the socket into the router and writes the
//! descriptors the dispatcher queued for this neighbor.

use super::{ConnectError, Router};
use crate::{
    message::{Header, Message, HEADER_LEN, MAX_PAYLOAD_LEN},
    wire::DecodeError,
};
use futures_util::{
    future::{self, Either},
    pin_mut,
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
    task, time,
};

pub(crate) const CONNECT_REQUEST: &[u8] = b"GNUTELLA CONNECT/0.4\n\n";
pub(crate) const CONNECT_OK: &[u8] = b"GNUTELLA OK\n\n";

/// Router side of a neighbor connection. Dropping it closes the connection.
pub(crate) struct PeerHandle {
    outgoing: mpsc::UnboundedSender<Message>,
    _close: oneshot::Sender<()>,
}

impl PeerHandle {
    pub fn new(outgoing: mpsc::UnboundedSender<Message>, close: oneshot::Sender<()>) -> Self {
        Self {
            outgoing,
            _close: close,
        }
    }

    pub fn clone_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outgoing.clone()
    }
}

#[derive(Debug, Error)]
pub(crate) enum ReadError {
    #[error("malformed message")]
    Malformed(#[from] DecodeError),
    #[error("socket error")]
    Io(#[from] io::Error),
}

/// Open an outbound connection and perform the handshake.
///
/// Connecting to a peer that is already a neighbor succeeds without opening a second
/// connection.
pub(crate) async fn connect(
    router: Arc<Router>,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(), ConnectError> {
    if router.is_neighbor(&addr) {
        return Ok(());
    }

    let handshake = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(CONNECT_REQUEST).await?;

        let mut response = [0u8; CONNECT_OK.len()];
        stream.read_exact(&mut response).await?;

        if response != CONNECT_OK {
            return Err(ConnectError::Rejected);
        }

        Ok::<_, ConnectError>(stream)
    };

    let stream = time::timeout(timeout, handshake)
        .await
        .map_err(|_| ConnectError::Timeout)??;

    let (reader, writer) = stream.into_split();
    establish(router, BufReader::new(reader), writer, addr);

    Ok(())
}

/// Register an established connection as a neighbor and start its task. Returns `false` (and
/// closes the connection) if the peer already is a neighbor.
pub(crate) fn establish(
    router: Arc<Router>,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    addr: SocketAddr,
) -> bool {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();

    if !router.add_neighbor(addr, PeerHandle::new(outgoing_tx, close_tx)) {
        log::debug!("Already connected to {}, dropping new connection", addr);
        return false;
    }

    task::spawn(run(router, addr, reader, writer, outgoing_rx, close_rx));

    true
}

async fn run(
    router: Arc<Router>,
    addr: SocketAddr,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    close_rx: oneshot::Receiver<()>,
) {
    let incoming = handle_incoming(&router, addr, &mut reader);
    pin_mut!(incoming);

    let outgoing = handle_outgoing(addr, &mut writer, &mut outgoing_rx);
    pin_mut!(outgoing);

    // Once the handle is gone the table entry may already belong to a newer connection.
    let closed_by_router = match future::select(future::select(incoming, outgoing), close_rx).await
    {
        Either::Left((Either::Left((Err(error), _)), _)) => {
            log::debug!("Failed to read from {}: {}", addr, error);
            false
        }
        Either::Left((Either::Right((Err(error), _)), _)) => {
            log::debug!("Failed to write to {}: {}", addr, error);
            false
        }
        Either::Left(_) => false,
        Either::Right(_) => true,
    };

    if !closed_by_router {
        router.remove_neighbor(&addr);
    }
}

async fn handle_incoming<R>(router: &Router, addr: SocketAddr, reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message(reader).await {
            Ok(Some(message)) => router.handle_incoming(message, addr),
            Ok(None) => log::trace!("Ignoring unsupported message from {}", addr),
            Err(ReadError::Malformed(error)) => {
                log::warn!("Malformed message from {}: {}", addr, error)
            }
            Err(ReadError::Io(error)) => return Err(error),
        }
    }
}

async fn handle_outgoing(
    addr: SocketAddr,
    writer: &mut OwnedWriteHalf,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> io::Result<()> {
    while let Some(message) = outgoing_rx.recv().await {
        log::trace!("Sending to {} {:?}", addr, message);
        writer.write_all(&message.encode()).await?;
    }

    Ok(())
}

/// Read one frame and decode it.
///
/// The frame boundary comes from the payload length in the header. A frame that fails to decode
/// is consumed entirely, so the next call starts at the following header.
pub(crate) async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = Header::decode(&header)?;

    if header.payload_len > MAX_PAYLOAD_LEN {
        let mut payload = (&mut *reader).take(header.payload_len.into());
        tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        return Err(DecodeError::Oversized(header.payload_len).into());
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Message::decode_payload(header, &payload)?)
}
