// ABOUTME: Behavioral tests for multi-phase project downloads into a real workspace
// Verifies fan-out/fan-in completion, out-of-order and duplicate replies, timestamps

use super::fixtures::{loopback, ProjectHost};
use busline::bus::MessageBus;
use busline::download::workspace::system_time;
use busline::download::{DownloadError, DownloadState, FsWorkspace, ProjectDownload};
use busline::protocol::{GET_RESOURCE_REQUEST, GET_RESOURCE_RESPONSE};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn download(dyn_bus: Arc<dyn MessageBus>, root: &TempDir) -> ProjectDownload {
    ProjectDownload::new(dyn_bus, Arc::new(FsWorkspace::new(root.path())), "P", "u")
        .with_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_download_materializes_project() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();
    let _host = ProjectHost::new("P")
        .folder("", 100)
        .folder("src", 150)
        .file("src/main.rs", 200, "fn main() {}\n")
        .file("README.md", 300, "# P\n")
        .serve(&bus);

    let outcome = download(dyn_bus, &temp_dir).run().await.unwrap();

    assert_eq!(outcome.files, 2);
    assert_eq!(outcome.folders, 2);

    let main_rs = temp_dir.path().join("P/src/main.rs");
    assert_eq!(fs::read_to_string(&main_rs).unwrap(), "fn main() {}\n");
    assert_eq!(
        fs::metadata(&main_rs).unwrap().modified().unwrap(),
        system_time(200).unwrap()
    );
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("P/README.md")).unwrap(),
        "# P\n"
    );
    assert_eq!(bus.published_of(GET_RESOURCE_REQUEST).len(), 2);
}

#[tokio::test]
async fn test_existing_files_are_overwritten() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("P")).unwrap();
    fs::write(temp_dir.path().join("P/a.txt"), "stale").unwrap();
    let _host = ProjectHost::new("P").file("a.txt", 500, "fresh").serve(&bus);

    download(dyn_bus, &temp_dir).run().await.unwrap();

    assert_eq!(
        fs::read_to_string(temp_dir.path().join("P/a.txt")).unwrap(),
        "fresh"
    );
}

#[tokio::test]
async fn test_out_of_order_and_duplicate_replies_complete_once() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();
    let host = ProjectHost::new("P")
        .folder("", 100)
        .file("a.txt", 1, "a")
        .file("b.txt", 2, "b")
        .file("c.txt", 3, "c")
        .deferred()
        .serve(&bus);

    let session = download(dyn_bus, &temp_dir);
    let monitor = session.monitor();
    let running = tokio::spawn(session.run());

    while host.pending_count() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(monitor.state(), DownloadState::AwaitingFiles);
    assert_eq!(monitor.progress(), (0, 3));

    host.answer_pending(2);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.files, 3);
    assert_eq!(monitor.progress(), (3, 3));
    assert_eq!(monitor.state(), DownloadState::Done);
    assert_eq!(bus.published_of(GET_RESOURCE_RESPONSE).len(), 6);
    for name in ["a", "b", "c"] {
        assert_eq!(
            fs::read_to_string(temp_dir.path().join(format!("P/{name}.txt"))).unwrap(),
            name
        );
    }
}

#[tokio::test]
async fn test_unrequested_file_is_not_counted() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();
    let host = ProjectHost::new("P")
        .file("a.txt", 1, "a")
        .deferred()
        .serve(&bus);

    let session = download(dyn_bus, &temp_dir);
    let callback_id = session.callback_id();
    let monitor = session.monitor();
    let running = tokio::spawn(session.run());

    while host.pending_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    host.send_unrequested(callback_id, "u", "other.txt");
    assert_eq!(monitor.progress(), (0, 1));
    assert!(!temp_dir.path().join("P/other.txt").exists());

    host.answer_pending(1);
    assert_eq!(running.await.unwrap().unwrap().files, 1);
}

#[tokio::test]
async fn test_escaping_path_fails_session() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();
    let _host = ProjectHost::new("P").file("../outside.txt", 1, "x").serve(&bus);

    let result = download(dyn_bus, &temp_dir).run().await;

    assert!(matches!(result, Err(DownloadError::Workspace(_))));
    assert!(!temp_dir.path().join("outside.txt").exists());
    // only the host's two handlers remain
    assert_eq!(bus.handler_count(), 2);
}

#[tokio::test]
async fn test_sessions_for_different_users_do_not_interfere() {
    let (bus, dyn_bus) = loopback();
    let first_root = TempDir::new().unwrap();
    let second_root = TempDir::new().unwrap();
    let _host = ProjectHost::new("P").file("a.txt", 1, "a").serve(&bus);

    let first = ProjectDownload::new(
        Arc::clone(&dyn_bus),
        Arc::new(FsWorkspace::new(first_root.path())),
        "P",
        "alice",
    );
    let second = ProjectDownload::new(
        dyn_bus,
        Arc::new(FsWorkspace::new(second_root.path())),
        "P",
        "bob",
    );
    assert_ne!(first.callback_id(), second.callback_id());

    let (a, b) = tokio::join!(first.run(), second.run());
    assert_eq!(a.unwrap().files, 1);
    assert_eq!(b.unwrap().files, 1);
    assert!(first_root.path().join("P/a.txt").exists());
    assert!(second_root.path().join("P/a.txt").exists());
}

#[tokio::test]
async fn test_download_times_out_without_host() {
    let (bus, dyn_bus) = loopback();
    let temp_dir = TempDir::new().unwrap();

    let result = ProjectDownload::new(dyn_bus, Arc::new(FsWorkspace::new(temp_dir.path())), "P", "u")
        .with_timeout(Duration::from_millis(50))
        .run()
        .await;

    assert!(matches!(result, Err(DownloadError::Timeout { expected: 0, .. })));
    assert_eq!(bus.handler_count(), 0);
}
