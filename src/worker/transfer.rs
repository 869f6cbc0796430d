//! File transfers over HTTP, as done by Gnutella v0.4 servents.
//!
//! A download is a plain request on a fresh connection to the servent that sent the query hit:
//!
//! ```text
//! GET /get/<index>/<name>/ HTTP/1.0
//! Connection: Keep-Alive
//! Range: bytes=<offset>-
//! ```
//!
//! The name is percent-encoded so that names with spaces still form a valid request line.

use super::{Router, TransferError};
use crate::share::SharedFiles;
use async_trait::async_trait;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::oneshot,
    task,
};

const MAX_LINE_LEN: u64 = 4096;
const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const SERVER_NAME: &str = concat!("gnutella-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadRequest {
    pub addr: SocketAddr,
    pub index: u32,
    pub name: String,
    pub size: u32,
    /// Byte to resume from.
    pub offset: u64,
}

/// Performs the byte transfer of a download.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Download the requested file. Returns the number of bytes received.
    async fn download(&self, request: &DownloadRequest) -> Result<u64, TransferError>;
}

/// Router side of a running download. Dropping it cancels the download.
pub(crate) struct DownloadHandle {
    _close: oneshot::Sender<()>,
}

impl DownloadHandle {
    pub fn new(close: oneshot::Sender<()>) -> Self {
        Self { _close: close }
    }
}

/// Start a download in the background. Returns `false` if a download from the same peer is
/// already running.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_download(router: Arc<Router>, request: DownloadRequest) -> bool {
    let (close_tx, close_rx) = oneshot::channel();

    if !router.add_download(request.addr, DownloadHandle::new(close_tx)) {
        log::debug!("Download from {} already in progress", request.addr);
        return false;
    }

    task::spawn(async move {
        let transfer = router.transfer().clone();

        select! {
            result = transfer.download(&request) => match result {
                Ok(len) => log::info!(
                    "Downloaded {} ({} bytes) from {}",
                    request.name,
                    len,
                    request.addr
                ),
                Err(error) => log::warn!(
                    "Failed to download {} from {}: {}",
                    request.name,
                    request.addr,
                    error
                ),
            },
            _ = close_rx => {
                log::debug!("Download of {} cancelled", request.name);
                return;
            }
        }

        router.remove_download(&request.addr);
    });

    true
}

// ----------------------------------------------------------------------------//

/// Downloads files over HTTP into a directory.
#[derive(Clone, Debug)]
pub struct HttpTransfer {
    dir: PathBuf,
}

impl HttpTransfer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn download(&self, request: &DownloadRequest) -> Result<u64, TransferError> {
        // The name comes from a remote query hit.
        if request.name.chars().any(char::is_control) {
            return Err(TransferError::InvalidName(request.name.clone()));
        }

        let file_name = Path::new(&request.name)
            .file_name()
            .ok_or_else(|| TransferError::InvalidName(request.name.clone()))?;
        let path = self.dir.join(file_name);

        let stream = TcpStream::connect(request.addr).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = io::BufReader::new(reader);

        let head = format!(
            "GET /get/{}/{}/ HTTP/1.0\r\nConnection: Keep-Alive\r\nRange: bytes={}-\r\n\r\n",
            request.index,
            encode_name(&request.name),
            request.offset
        );
        writer.write_all(head.as_bytes()).await?;

        let head = read_head(&mut reader, None).await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        if response.parse(&head)?.is_partial() {
            return Err(TransferError::BadResponse(
                "connection closed inside the response head".to_owned(),
            ));
        }

        // A server ignoring the range sends the whole file with 200.
        let offset = match response.code {
            Some(206) => request.offset,
            Some(200) => 0,
            code => {
                return Err(TransferError::BadResponse(format!(
                    "status {}",
                    code.unwrap_or_default()
                )))
            }
        };
        let content_len = header_value(response.headers, "Content-Length")
            .and_then(|value| value.parse::<u64>().ok());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&path)
            .await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let expected =
            content_len.unwrap_or_else(|| u64::from(request.size).saturating_sub(offset));
        let len = io::copy(&mut (&mut reader).take(expected), &mut file).await?;
        file.flush().await?;

        if len < expected {
            return Err(TransferError::BadResponse(format!(
                "connection closed after {} of {} bytes",
                len, expected
            )));
        }

        Ok(len)
    }
}

// ----------------------------------------------------------------------------//

/// Answer a download request read off an inbound connection. `request_line` is the first line
/// the peer sent, the rest of the request head is still in `reader`.
pub(crate) async fn serve_upload<R, W>(
    shared: &dyn SharedFiles,
    request_line: &str,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, TransferError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head = read_head(reader, Some(request_line)).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let (target, offset) = match request.parse(&head) {
        Ok(status) if status.is_complete() && request.method == Some("GET") => (
            request.path.and_then(parse_get_path),
            header_value(request.headers, "Range")
                .and_then(parse_range_start)
                .unwrap_or(0),
        ),
        _ => {
            log::debug!("Malformed upload request: {}", request_line);
            respond_status(writer, "400 Bad Request").await?;
            return Ok(0);
        }
    };

    let file = target.and_then(|(index, name)| shared.find(index, &name));
    let (file, mut source) = match file {
        Some(file) => match File::open(&file.path).await {
            Ok(source) => (file, source),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                log::debug!("Shared file {} disappeared", file.path.display());
                respond_status(writer, "404 Not Found").await?;
                return Ok(0);
            }
            Err(error) => return Err(error.into()),
        },
        None => {
            log::debug!("Upload request for unknown file: {}", request_line);
            respond_status(writer, "404 Not Found").await?;
            return Ok(0);
        }
    };

    let offset = offset.min(file.size);
    source.seek(io::SeekFrom::Start(offset)).await?;
    let len = file.size - offset;

    let head = format!(
        "HTTP/1.0 200 OK\r\nServer: {}\r\nContent-Type: application/binary\r\nContent-Length: {}\r\n\r\n",
        SERVER_NAME, len
    );
    writer.write_all(head.as_bytes()).await?;

    let sent = io::copy(&mut source.take(len), writer).await?;
    writer.flush().await?;

    log::info!("Uploaded {} ({} bytes)", file.name, sent);

    Ok(sent)
}

async fn respond_status<W>(writer: &mut W, status: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("HTTP/1.0 {}\r\n\r\n", status).as_bytes())
        .await?;
    writer.flush().await
}

/// Split `/get/<index>/<name>/` into index and decoded name.
fn parse_get_path(path: &str) -> Option<(u32, String)> {
    let rest = path.strip_prefix("/get/")?;
    let (index, name) = rest.split_once('/')?;
    let name = name.strip_suffix('/').unwrap_or(name);

    Some((index.parse().ok()?, decode_name(name)?))
}

fn parse_range_start(value: &str) -> Option<u64> {
    let range = value.strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(str::trim)
}

/// Percent-encode everything but unreserved characters.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());

    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }

    encoded
}

fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(decoded).ok()
}

/// Read one CRLF or LF terminated line, without the terminator.
pub(crate) async fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    (&mut *reader).take(MAX_LINE_LEN).read_line(&mut line).await?;

    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_owned())
}

/// Read an HTTP head up to and including the empty line that ends it. `first_line` stands in
/// for a start line the caller already consumed.
async fn read_head<R>(reader: &mut R, first_line: Option<&str>) -> Result<Vec<u8>, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();

    if let Some(line) = first_line {
        head.extend(line.as_bytes());
        head.extend(b"\r\n");
    }

    loop {
        let start = head.len();
        (&mut *reader)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut head)
            .await?;

        match &head[start..] {
            b"" | b"\n" | b"\r\n" => break,
            _ if head.len() > MAX_HEAD_LEN => {
                return Err(TransferError::BadResponse("HTTP head too long".to_owned()))
            }
            _ => (),
        }
    }

    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{share::SharedDirectory, test};
    use std::fs;
    use tokio::net::TcpListener;

    #[test]
    fn parse_get_request_path() {
        assert_eq!(
            parse_get_path("/get/4/my%20song.mp3/"),
            Some((4, "my song.mp3".to_owned()))
        );
        assert_eq!(parse_get_path("/get/0/a.txt"), Some((0, "a.txt".to_owned())));
        assert_eq!(parse_get_path("/index.html"), None);
        assert_eq!(parse_get_path("/get/x/a.txt/"), None);
        assert_eq!(parse_get_path("/get/1/bad%zz/"), None);
    }

    #[test]
    fn encoded_name_has_no_separators() {
        let encoded = encode_name("my song (1)\r\n.mp3");

        assert_eq!(encoded, "my%20song%20%281%29%0D%0A.mp3");
        assert_eq!(
            decode_name(&encoded).as_deref(),
            Some("my song (1)\r\n.mp3")
        );
    }

    #[test]
    fn parse_range_header() {
        assert_eq!(parse_range_start("bytes=100-"), Some(100));
        assert_eq!(parse_range_start("bytes=0-99"), Some(0));
        assert_eq!(parse_range_start("lines=3-"), None);
    }

    #[tokio::test]
    async fn serve_existing_file_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();

        let shared = SharedDirectory::new(dir.path());
        shared.refresh();
        let mut reader = &b"Connection: Keep-Alive\r\nRange: bytes=6-\r\n\r\n"[..];
        let mut response = Vec::new();

        let sent = serve_upload(
            &shared,
            "GET /get/0/hello.txt/ HTTP/1.0",
            &mut reader,
            &mut response,
        )
        .await
        .unwrap();

        let response = String::from_utf8(response).unwrap();
        assert_eq!(sent, 5);
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\nworld"));
    }

    #[tokio::test]
    async fn serve_unknown_file() {
        let shared = test::dummy_shared_files(&[("a.txt", 1)]);
        let mut reader = &b"\r\n"[..];
        let mut response = Vec::new();

        let sent = serve_upload(
            &shared,
            "GET /get/0/b.txt/ HTTP/1.0",
            &mut reader,
            &mut response,
        )
        .await
        .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(response, b"HTTP/1.0 404 Not Found\r\n\r\n");
    }

    #[tokio::test]
    async fn serve_malformed_request() {
        let shared = test::dummy_shared_files(&[("a b.txt", 1)]);
        let mut reader = &b"\r\n"[..];
        let mut response = Vec::new();

        // Unencoded space in the request target.
        let sent = serve_upload(
            &shared,
            "GET /get/0/a b.txt/ HTTP/1.0",
            &mut reader,
            &mut response,
        )
        .await
        .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(response, b"HTTP/1.0 400 Bad Request\r\n\r\n");
    }

    fn request(addr: SocketAddr, name: &str, size: u32, offset: u64) -> DownloadRequest {
        DownloadRequest {
            addr,
            index: 0,
            name: name.to_owned(),
            size,
            offset,
        }
    }

    /// Serve a single connection with a canned response and return the request head it got.
    async fn canned_server(response: &'static [u8]) -> (SocketAddr, task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let head = read_head(&mut io::BufReader::new(reader), None)
                .await
                .unwrap();
            writer.write_all(response).await.unwrap();
            head
        });

        (addr, server)
    }

    #[tokio::test]
    async fn download_rejects_control_characters() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = HttpTransfer::new(dir.path());

        let result = transfer
            .download(&request(
                test::dummy_socket_addr_v4(1),
                "a.mp3\r\nX-Injected: 1",
                1,
                0,
            ))
            .await;

        assert!(matches!(result, Err(TransferError::InvalidName(_))));
    }

    #[tokio::test]
    async fn download_restarts_when_range_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"stale-data").unwrap();
        let (addr, server) =
            canned_server(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;

        let len = HttpTransfer::new(dir.path())
            .download(&request(addr, "f.txt", 5, 3))
            .await
            .unwrap();

        assert_eq!(len, 5);
        assert_eq!(fs::read(dir.path().join("f.txt")).unwrap(), b"hello");

        let head = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(head.starts_with("GET /get/0/f.txt/ HTTP/1.0\r\n"));
        assert!(head.contains("Range: bytes=3-\r\n"));
    }

    #[tokio::test]
    async fn download_resumes_on_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"hel").unwrap();
        let (addr, _server) =
            canned_server(b"HTTP/1.0 206 Partial Content\r\nContent-Length: 2\r\n\r\nlo").await;

        let len = HttpTransfer::new(dir.path())
            .download(&request(addr, "f.txt", 5, 3))
            .await
            .unwrap();

        assert_eq!(len, 2);
        assert_eq!(fs::read(dir.path().join("f.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn download_fails_on_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _server) = canned_server(b"HTTP/1.0 404 Not Found\r\n\r\n").await;

        let result = HttpTransfer::new(dir.path())
            .download(&request(addr, "f.txt", 5, 0))
            .await;

        assert!(matches!(result, Err(TransferError::BadResponse(_))));
        assert!(!dir.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn download_name_with_spaces_from_upload() {
        let shared_dir = tempfile::tempdir().unwrap();
        let download_dir = tempfile::tempdir().unwrap();
        fs::write(shared_dir.path().join("my song.mp3"), b"la la la").unwrap();

        let shared = SharedDirectory::new(shared_dir.path());
        shared.refresh();

        let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = io::BufReader::new(reader);
            let first_line = read_line(&mut reader).await.unwrap();

            serve_upload(&shared, &first_line, &mut reader, &mut writer)
                .await
                .unwrap();
        });

        let len = HttpTransfer::new(download_dir.path())
            .download(&request(addr, "my song.mp3", 8, 0))
            .await
            .unwrap();

        assert_eq!(len, 8);
        assert_eq!(
            fs::read(download_dir.path().join("my song.mp3")).unwrap(),
            b"la la la"
        );
    }
}
