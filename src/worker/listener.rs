//! Accepts inbound connections and decides what each one is for.

use super::{
    connection::{self, CONNECT_OK},
    transfer::{self, read_line},
    Router,
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task, time,
};

const CONNECT_LINE: &str = "GNUTELLA CONNECT/0.4";
const GET_PREFIX: &str = "GET /get/";

pub(crate) async fn run(listener: TcpListener, router: Arc<Router>, timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::trace!("Accepted connection from {}", addr);
                task::spawn(handle_accepted(router.clone(), stream, addr, timeout));
            }
            Err(error) => {
                log::warn!("Failed to accept connection: {}", error);
                // Usually out of file descriptors. Give the running connections time to close.
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_accepted(
    router: Arc<Router>,
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let first_line = match time::timeout(timeout, read_line(&mut reader)).await {
        Ok(Ok(line)) => line,
        Ok(Err(error)) => {
            log::debug!("Failed to read request from {}: {}", addr, error);
            return;
        }
        Err(_) => {
            log::debug!("Timed out waiting for request from {}", addr);
            return;
        }
    };

    if first_line == CONNECT_LINE {
        if let Err(error) = time::timeout(timeout, read_line(&mut reader))
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
        {
            log::debug!("Incomplete handshake from {}: {}", addr, error);
            return;
        }

        if router.neighbor_count() >= router.info().max_neighbors {
            log::debug!("Refusing {}, neighbor limit reached", addr);
            return;
        }

        if let Err(error) = writer.write_all(CONNECT_OK).await {
            log::debug!("Failed to answer handshake from {}: {}", addr, error);
            return;
        }

        connection::establish(router, reader, writer, addr);
    } else if first_line.starts_with(GET_PREFIX) {
        let shared = router.shared().clone();

        if let Err(error) =
            transfer::serve_upload(&*shared, &first_line, &mut reader, &mut writer).await
        {
            log::debug!("Upload to {} failed: {}", addr, error);
        }
    } else {
        log::debug!("Closing connection from {}, unknown request {:?}", addr, first_line);
    }
}
