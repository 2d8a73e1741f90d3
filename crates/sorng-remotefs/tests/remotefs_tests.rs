use sorng_remotefs::remotefs::backend::memory::MemoryServer;
use sorng_remotefs::remotefs::*;
use std::io;
use std::sync::Arc;

fn p(s: &str) -> RemotePath {
    RemotePath::parse(s).unwrap()
}

fn sample_server() -> MemoryServer {
    let server = MemoryServer::new();
    server.put_file("/data/report.csv", b"id,total\n1,42\n").unwrap();
    server.put_file("/data/notes.txt", b"yaks").unwrap();
    server.put_dir("/data/archive").unwrap();
    server.put_file("/data/archive/2023.csv", b"old").unwrap();
    server.put_dir("/empty").unwrap();
    server
}

fn mount(server: &MemoryServer, host: &str, cache: bool) -> RemoteFsState {
    let mut cfg = EndpointConfig::new(Protocol::Memory, host);
    cfg.cache_directories = cache;
    let endpoint = server.endpoint(cfg).unwrap();
    RemoteFs::mount(endpoint, ConnectionPool::with_max_connections(4))
}

fn names(listing: &[FileStatus]) -> Vec<String> {
    let mut names: Vec<String> = listing.iter().map(|s| s.path.name().to_string()).collect();
    names.sort();
    names
}

async fn read_all(fs: &RemoteFs, path: &str) -> Vec<u8> {
    let mut stream = fs.open(&p(path)).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    stream.close().await.unwrap();
    out
}

// ── Metadata ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cached_listing_served_without_network() {
    let server = sample_server();
    let fs = mount(&server, "cached", true);

    let first = fs.list_status(&p("/data")).await.unwrap();
    assert_eq!(names(&first), vec!["archive", "notes.txt", "report.csv"]);

    let (lists, stats) = (server.list_calls(), server.stat_calls());
    let second = fs.list_status(&p("/data")).await.unwrap();
    assert_eq!(names(&second), names(&first));
    assert_eq!(fs.file_status(&p("/data/notes.txt")).await.unwrap().len, 4);
    assert!(!fs.exists(&p("/data/missing.bin")).await.unwrap());
    assert_eq!((server.list_calls(), server.stat_calls()), (lists, stats));
}

#[tokio::test]
async fn test_uncached_listing_always_asks_server() {
    let server = sample_server();
    let fs = mount(&server, "uncached", false);

    fs.list_status(&p("/data")).await.unwrap();
    let lists = server.list_calls();
    server.put_file("/data/fresh.txt", b"!").unwrap();
    let listing = fs.list_status(&p("/data")).await.unwrap();
    assert_eq!(server.list_calls(), lists + 1);
    assert!(names(&listing).contains(&"fresh.txt".to_string()));
}

#[tokio::test]
async fn test_list_status_of_file_returns_itself() {
    let server = sample_server();
    for cache in [true, false] {
        let fs = mount(&server, &format!("file-list-{}", cache), cache);
        let listing = fs.list_status(&p("/data/report.csv")).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, p("/data/report.csv"));
        assert!(listing[0].is_file());
    }
}

#[tokio::test]
async fn test_missing_path_is_not_found() {
    let server = sample_server();
    let fs = mount(&server, "missing", true);
    let err = fs.file_status(&p("/nowhere/file")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotFound);
    assert_eq!(err.path.as_deref(), Some("/nowhere/file"));
    assert!(!fs.exists(&p("/data/report.csv/inner")).await.unwrap());
}

#[tokio::test]
async fn test_channels_return_to_pool() {
    let server = sample_server();
    let fs = mount(&server, "returns", false);
    for _ in 0..5 {
        fs.file_status(&p("/data/report.csv")).await.unwrap();
    }
    let stats = fs.pool_stats();
    assert_eq!((stats.idle, stats.checked_out), (1, 0));
    assert_eq!(server.sessions_opened(), 1);
}

#[tokio::test]
async fn test_home_directory() {
    let server = sample_server();
    server.set_home("/data").unwrap();
    let fs = mount(&server, "home", false);
    assert_eq!(fs.home_directory().await.unwrap(), p("/data"));
}

// ── Reading ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_and_read() {
    let server = sample_server();
    let fs = mount(&server, "read", true);
    assert_eq!(read_all(&fs, "/data/report.csv").await, b"id,total\n1,42\n");
    let snap = fs.statistics();
    assert_eq!(snap.bytes_read, 14);
    assert_eq!(snap.reconnects, 0);
}

#[tokio::test]
async fn test_read_survives_dropped_data_stream() {
    let server = sample_server();
    let fs = mount(&server, "flaky", false);
    server.fail_next_reads(1, io::ErrorKind::TimedOut);
    assert_eq!(read_all(&fs, "/data/notes.txt").await, b"yaks");
    assert_eq!(fs.statistics().reconnects, 1);
}

#[tokio::test]
async fn test_open_rejects_directories_and_missing_files() {
    let server = sample_server();
    let fs = mount(&server, "open-errors", true);
    let err = fs.open(&p("/data/archive")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::IsDirectory);
    let err = fs.open(&p("/data/ghost.csv")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotFound);
    assert_eq!(fs.pool_stats().checked_out, 0);
}

// ── Writing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_write_close_refreshes_cache() {
    let server = sample_server();
    let fs = mount(&server, "write", true);
    assert!(fs.list_status(&p("/empty")).await.unwrap().is_empty());

    let mut out = fs.create(&p("/empty/new.txt"), false).await.unwrap();
    out.write(b"hello ").await.unwrap();
    out.write(b"world").await.unwrap();
    assert_eq!(out.bytes_written(), 11);
    out.close().await.unwrap();
    out.close().await.unwrap();

    assert_eq!(server.read_file("/empty/new.txt").unwrap(), b"hello world");
    let listing = fs.list_status(&p("/empty")).await.unwrap();
    assert_eq!(names(&listing), vec!["new.txt"]);
    assert_eq!(fs.file_status(&p("/empty/new.txt")).await.unwrap().len, 11);
    assert_eq!(fs.statistics().bytes_written, 11);

    let err = out.write(b"late").await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::StreamClosed);
}

#[tokio::test]
async fn test_create_respects_overwrite_flag() {
    let server = sample_server();
    let fs = mount(&server, "overwrite", true);

    let err = fs.create(&p("/data/notes.txt"), false).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::AlreadyExists);
    let err = fs.create(&p("/data/archive"), true).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::IsDirectory);

    let mut out = fs.create(&p("/data/notes.txt"), true).await.unwrap();
    out.write(b"tak").await.unwrap();
    out.close().await.unwrap();
    assert_eq!(read_all(&fs, "/data/notes.txt").await, b"tak");
}

#[tokio::test]
async fn test_create_makes_parent_directories() {
    let server = sample_server();
    let fs = mount(&server, "parents", true);
    let mut out = fs.create(&p("/new/deep/leaf.bin"), false).await.unwrap();
    out.write(&[1, 2, 3]).await.unwrap();
    out.close().await.unwrap();

    assert!(fs.file_status(&p("/new/deep")).await.unwrap().is_dir());
    assert_eq!(server.read_file("/new/deep/leaf.bin").unwrap(), vec![1, 2, 3]);

    let err = fs.create(&p("/data/notes.txt/child"), false).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotDirectory);
}

// ── Namespace ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mkdirs() {
    let server = sample_server();
    for cache in [true, false] {
        let fs = mount(&server, &format!("mkdirs-{}", cache), cache);
        let dir = format!("/made/{}/a/b", cache);
        fs.mkdirs(&p(&dir)).await.unwrap();
        assert!(server.exists(&dir));
        assert!(fs.file_status(&p(&dir)).await.unwrap().is_dir());
        // Existing directories are fine.
        fs.mkdirs(&p(&dir)).await.unwrap();

        let err = fs.mkdirs(&p("/data/report.csv/sub")).await.unwrap_err();
        assert_eq!(err.kind, FsErrorKind::NotDirectory);
    }
}

#[tokio::test]
async fn test_delete_semantics() {
    let server = sample_server();
    let fs = mount(&server, "delete", true);

    assert!(!fs.delete(&RemotePath::root(), true).await.unwrap());
    assert!(!fs.delete(&p("/data/ghost"), false).await.unwrap());

    let err = fs.delete(&p("/data/archive"), false).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotEmpty);
    assert!(server.exists("/data/archive/2023.csv"));

    assert!(fs.delete(&p("/data/notes.txt"), false).await.unwrap());
    assert!(fs.delete(&p("/empty"), false).await.unwrap());
    assert!(fs.delete(&p("/data/archive"), true).await.unwrap());
    assert!(!server.exists("/data/archive"));
    assert!(!server.exists("/empty"));

    let lists = server.list_calls();
    assert!(!fs.exists(&p("/data/notes.txt")).await.unwrap());
    assert_eq!(server.list_calls(), lists);
    let listing = fs.list_status(&p("/data")).await.unwrap();
    assert_eq!(names(&listing), vec!["report.csv"]);
}

#[tokio::test]
async fn test_rename() {
    let server = sample_server();
    let fs = mount(&server, "rename", true);
    fs.list_status(&p("/data")).await.unwrap();

    fs.rename(&p("/data/notes.txt"), &p("/data/renamed.txt")).await.unwrap();
    assert!(!fs.exists(&p("/data/notes.txt")).await.unwrap());
    assert_eq!(fs.file_status(&p("/data/renamed.txt")).await.unwrap().len, 4);

    // Into an existing directory under the source's name.
    fs.rename(&p("/data/renamed.txt"), &p("/empty")).await.unwrap();
    assert!(server.exists("/empty/renamed.txt"));
    assert_eq!(names(&fs.list_status(&p("/empty")).await.unwrap()), vec!["renamed.txt"]);

    let err = fs.rename(&p("/data/report.csv"), &p("/data/archive/2023.csv")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::AlreadyExists);
    let err = fs.rename(&p("/data/ghost"), &p("/data/x")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotFound);
    let err = fs.rename(&p("/data"), &p("/data/archive")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::Unsupported);
}

#[tokio::test]
async fn test_set_times() {
    let server = sample_server();
    let fs = mount(&server, "times", true);
    let stamp = chrono::DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    fs.set_times(&p("/data/report.csv"), Some(stamp), None).await.unwrap();
    let status = fs.file_status(&p("/data/report.csv")).await.unwrap();
    assert_eq!(status.modified, Some(stamp));

    let err = fs.set_times(&p("/data/ghost"), Some(stamp), None).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::NotFound);
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_is_final_and_idempotent() {
    let server = sample_server();
    let fs = mount(&server, "close", true);
    fs.list_status(&p("/data")).await.unwrap();

    fs.close().await;
    fs.close().await;
    assert!(fs.is_closed());
    assert!(fs.pool_stats().closed);
    assert_eq!(server.live_sessions(), 0);

    let err = fs.file_status(&p("/data")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::Closed);
    let err = fs.open(&p("/data/notes.txt")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::Closed);
}

#[tokio::test]
async fn test_endpoints_share_pool_but_not_trees() {
    let pool = ConnectionPool::with_max_connections(2);
    let alpha = sample_server();
    let beta = MemoryServer::new();
    beta.put_file("/data/only-beta.txt", b"b").unwrap();

    let mut cfg = EndpointConfig::new(Protocol::Memory, "alpha");
    cfg.cache_directories = true;
    let fs_a = RemoteFs::mount(alpha.endpoint(cfg.clone()).unwrap(), pool.clone());
    cfg.host = "beta".into();
    let fs_b = RemoteFs::mount(beta.endpoint(cfg).unwrap(), pool.clone());

    assert_eq!(fs_a.list_status(&p("/data")).await.unwrap().len(), 3);
    assert_eq!(names(&fs_b.list_status(&p("/data")).await.unwrap()), vec!["only-beta.txt"]);

    fs_a.close().await;
    assert!(fs_b.exists(&p("/data/only-beta.txt")).await.unwrap());
    assert!(!pool.stats(fs_b.endpoint()).closed);
}

#[tokio::test]
async fn test_mount_from_json_config() {
    let server = sample_server();
    let cfg = EndpointConfig::from_json(
        r#"{"protocol":"memory","host":"Files.Example.com","cacheDirectories":true,"maxConnections":2}"#,
    )
    .unwrap();
    let endpoint = server.endpoint(cfg).unwrap();
    assert_eq!(endpoint.host(), "files.example.com");
    assert_eq!(endpoint.max_connections(), 2);

    let fs = RemoteFs::mount(endpoint, ConnectionPool::with_max_connections(8));
    assert!(fs.tree().is_caching());
    assert_eq!(fs.pool_stats().max, 2);
    assert_eq!(read_all(&fs, "/data/notes.txt").await, b"yaks");
}

#[tokio::test]
async fn test_refused_connection_surfaces_error() {
    let server = sample_server();
    server.refuse_connections(true);
    let fs = mount(&server, "refused", false);
    let err = fs.list_status(&p("/data")).await.unwrap_err();
    assert_eq!(err.kind, FsErrorKind::ConnectionFailed);
    assert_eq!(fs.pool_stats().checked_out, 0);

    server.refuse_connections(false);
    assert!(fs.exists(&p("/data")).await.unwrap());
}

#[tokio::test]
async fn test_dead_sessions_replaced_transparently() {
    let server = sample_server();
    let fs: Arc<RemoteFs> = mount(&server, "dead", false);
    fs.file_status(&p("/data")).await.unwrap();
    server.drop_all_sessions();
    assert!(fs.exists(&p("/data/notes.txt")).await.unwrap());
    assert_eq!(server.sessions_opened(), 2);
}
