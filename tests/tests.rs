use gnutella::{Servent, ServentBuilder};
use std::{
    fs,
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tempfile::TempDir;
use tokio::time;

#[tokio::test(flavor = "multi_thread")]
async fn connect_and_list_neighbors() {
    let a = start(builder()).await;
    let b = start(builder()).await;

    assert!(a.connect(b.local_addr()).await);
    assert_eq!(a.neighbors(), [b.local_addr()]);
    wait_until(|| b.neighbors().len() == 1).await;

    // Connecting again reuses the existing connection.
    assert!(a.connect(b.local_addr()).await);
    assert_eq!(a.neighbors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_closed_port_fails() {
    let a = start(builder()).await;
    let b = start(builder()).await;
    let addr = b.local_addr();
    b.close();
    drop(b);

    // Give the runtime a moment to drop the listening socket.
    time::sleep(Duration::from_millis(50)).await;

    assert!(!a.connect(addr).await);
    assert!(a.neighbors().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_discovers_hosts_behind_neighbor() {
    let (a, b, c) = chain(builder(), builder(), builder()).await;

    a.ping();

    wait_until(|| a.hosts().len() == 2).await;

    let mut hosts = a.hosts();
    hosts.sort();
    let mut expected = vec![b.local_addr(), c.local_addr()];
    expected.sort();
    assert_eq!(hosts, expected);

    // Pongs are only delivered to the servent that pinged.
    assert!(b.hosts().is_empty());
    assert!(c.hosts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn query_finds_file_behind_neighbor() {
    let shared = temp_dir();
    fs::write(shared.path().join("Hello World.txt"), b"hello gnutella").unwrap();
    fs::write(shared.path().join("other.bin"), b"x").unwrap();

    let (a, _b, c) = chain(builder(), builder(), builder().set_shared_dir(shared.path())).await;

    let query_id = a.query("hello").unwrap();

    wait_until(|| !a.results().is_empty()).await;

    let results = a.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].query_id, query_id);
    assert_eq!(results[0].hit.servent_id, c.servent_id());
    assert_eq!(
        SocketAddr::from((results[0].hit.ip, results[0].hit.port)),
        c.local_addr()
    );
    assert_eq!(results[0].hit.hits.len(), 1);
    assert_eq!(results[0].hit.hits[0].name(), "Hello World.txt");
    assert_eq!(results[0].hit.hits[0].size, 14);

    a.clear_results();
    assert!(a.results().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn query_with_too_high_min_speed_is_not_answered() {
    let shared = temp_dir();
    fs::write(shared.path().join("song.mp3"), b"la").unwrap();

    let a = start(builder().set_min_speed(1000)).await;
    let b = start(builder().set_speed(10).set_shared_dir(shared.path())).await;
    let c = start(builder().set_shared_dir(shared.path())).await;

    assert!(a.connect(b.local_addr()).await);
    assert!(a.connect(c.local_addr()).await);
    wait_until(|| b.neighbors().len() == 1 && c.neighbors().len() == 1).await;

    a.query("song").unwrap();

    // The ping round trip gives the query time to reach both neighbors.
    a.ping();
    wait_until(|| a.hosts().len() == 2).await;
    time::sleep(Duration::from_millis(100)).await;

    assert!(a.results().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn download_file_found_by_query() {
    let shared = temp_dir();
    let downloads = temp_dir();
    let content = b"The quick brown fox jumps over the lazy dog".repeat(1000);
    fs::write(shared.path().join("fox.txt"), &content).unwrap();

    let a = start(builder().set_download_dir(downloads.path())).await;
    let b = start(builder().set_shared_dir(shared.path())).await;

    assert!(a.connect(b.local_addr()).await);
    a.query("fox").unwrap();
    wait_until(|| !a.results().is_empty()).await;

    let result = a.results().remove(0);
    let hit = &result.hit.hits[0];
    let addr = SocketAddr::from((result.hit.ip, result.hit.port));

    assert!(a.download(addr, hit.index, hit.name(), hit.size).await);

    let path = downloads.path().join("fox.txt");
    wait_until(|| a.downloads().is_empty() && fs::read(&path).ok().as_ref() == Some(&content))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn download_of_unknown_file_finishes() {
    let shared = temp_dir();
    let downloads = temp_dir();

    let a = start(builder().set_download_dir(downloads.path())).await;
    let b = start(builder().set_shared_dir(shared.path())).await;

    assert!(a.download(b.local_addr(), 3, "missing.txt", 10).await);
    wait_until(|| a.downloads().is_empty()).await;

    assert!(!downloads.path().join("missing.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn files_added_while_running_are_found() {
    let shared = temp_dir();

    let a = start(builder()).await;
    let b = start(
        builder()
            .set_shared_dir(shared.path())
            .set_rescan_interval(Duration::from_millis(50)),
    )
    .await;
    assert!(a.connect(b.local_addr()).await);

    fs::write(shared.path().join("late.txt"), b"late").unwrap();

    poll(async {
        while a.results().is_empty() {
            a.query("late").unwrap();
            time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    assert_eq!(a.results()[0].hit.hits[0].name(), "late.txt");
}

#[tokio::test(flavor = "multi_thread")]
async fn query_with_nul_is_rejected() {
    let a = start(builder()).await;

    assert!(a.query("a\0b").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_is_idempotent() {
    let a = start(builder()).await;
    let b = start(builder()).await;

    assert!(a.connect(b.local_addr()).await);
    wait_until(|| b.neighbors().len() == 1).await;

    assert!(a.disconnect(&b.local_addr()));
    assert!(!a.disconnect(&b.local_addr()));
    assert!(a.neighbors().is_empty());

    // The other side notices the closed socket.
    wait_until(|| b.neighbors().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_releases_every_neighbor() {
    let hub = start(builder()).await;
    let leaves = [
        start(builder()).await,
        start(builder()).await,
        start(builder()).await,
    ];

    for leaf in &leaves {
        assert!(leaf.connect(hub.local_addr()).await);
    }
    wait_until(|| hub.neighbors().len() == 3).await;

    hub.close();

    assert!(hub.neighbors().is_empty());
    assert!(hub.downloads().is_empty());

    for leaf in &leaves {
        wait_until(|| leaf.neighbors().is_empty()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_neighbors_are_limited() {
    let a = start(builder().set_max_neighbors(1)).await;
    let b = start(builder()).await;
    let c = start(builder()).await;

    assert!(b.connect(a.local_addr()).await);
    wait_until(|| a.neighbors().len() == 1).await;

    assert!(!c.connect(a.local_addr()).await);
    assert_eq!(a.neighbors().len(), 1);
}

fn builder() -> ServentBuilder {
    init_log();

    Servent::builder()
        .set_listen_addr((Ipv4Addr::LOCALHOST, 0).into())
        .set_connect_timeout(Duration::from_secs(5))
}

async fn start(builder: ServentBuilder) -> Servent {
    builder.start().await.unwrap()
}

/// Start three servents connected as `a - b - c`.
async fn chain(
    a: ServentBuilder,
    b: ServentBuilder,
    c: ServentBuilder,
) -> (Servent, Servent, Servent) {
    let a = start(a).await;
    let b = start(b).await;
    let c = start(c).await;

    assert!(a.connect(b.local_addr()).await);
    assert!(c.connect(b.local_addr()).await);
    wait_until(|| b.neighbors().len() == 2).await;

    (a, b, c)
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    poll(async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

async fn poll<F: Future<Output = ()>>(future: F) {
    time::timeout(Duration::from_secs(10), future)
        .await
        .expect("condition not met in time")
}

fn init_log() {
    let _ = pretty_env_logger::try_init();
}

fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}
