mod common;

use common::{fast_config, init_logging, settings, wait_for_event};
use kiln_lib::error::DownloadError;
use kiln_lib::game::{DownloadRequest, DownloadState};
use kiln_lib::notify::{CoreEvent, EventNotifier};
use kiln_lib::runtime::Launcher;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn slow_files(server: &MockServer, names: &[&str]) {
    for name in names {
        Mock::given(method("GET"))
            .and(path(format!("/{}", name)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(format!("contents of {}", name).into_bytes())
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(server)
            .await;
    }
}

fn state_of(tasks: &[kiln_lib::game::DownloadTask], game_id: &str) -> DownloadState {
    tasks
        .iter()
        .find(|t| t.game_id == game_id)
        .map(|t| t.state)
        .unwrap()
}

#[tokio::test]
async fn at_most_max_concurrent_are_active() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    slow_files(&server, &["a.zip", "b.zip", "c.zip"]).await;

    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();

    for id in ["a", "b", "c"] {
        let dest = tmp.path().join(format!("out/{}.zip", id));
        launcher
            .enqueue_download(DownloadRequest::new(
                id,
                format!("{}/{}.zip", server.uri(), id),
                dest,
            ))
            .await
            .unwrap();
    }

    let tasks = launcher.downloads().await;
    assert_eq!(state_of(&tasks, "a"), DownloadState::Active);
    assert_eq!(state_of(&tasks, "b"), DownloadState::Active);
    assert_eq!(state_of(&tasks, "c"), DownloadState::Queued);

    for id in ["a", "b", "c"] {
        let task = launcher.wait_download(id).await.unwrap();
        assert_eq!(task.state, DownloadState::Completed);
        assert_eq!(task.percent, 100);
    }
    let body = std::fs::read_to_string(tmp.path().join("out/c.zip")).unwrap();
    assert_eq!(body, "contents of c.zip");
    assert_eq!(part_files(&tmp.path().join("out")), Vec::<String>::new());
}

fn part_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

#[tokio::test]
async fn cancel_then_enqueue_again_to_same_destination_completes() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    slow_files(&server, &["a.zip"]).await;

    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();
    let dest = tmp.path().join("out/a.zip");
    let request = DownloadRequest::new("a", format!("{}/a.zip", server.uri()), &dest);

    launcher.enqueue_download(request.clone()).await.unwrap();
    assert!(launcher.cancel_download("a").await);
    launcher.enqueue_download(request).await.unwrap();

    let task = launcher.wait_download("a").await.unwrap();
    assert_eq!(task.state, DownloadState::Completed);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "contents of a.zip");
    assert_eq!(part_files(&tmp.path().join("out")), Vec::<String>::new());
}

#[tokio::test]
async fn duplicate_enqueue_is_rejected() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    slow_files(&server, &["a.zip"]).await;

    let launcher = Launcher::builder(settings(tmp.path(), 1))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();
    let request = DownloadRequest::new(
        "a",
        format!("{}/a.zip", server.uri()),
        tmp.path().join("a.zip"),
    );

    launcher.enqueue_download(request.clone()).await.unwrap();
    let err = launcher.enqueue_download(request).await.unwrap_err();
    assert_eq!(err, DownloadError::AlreadyQueued("a".to_string()));
}

#[tokio::test]
async fn canceling_a_queued_download_never_starts_it() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    slow_files(&server, &["a.zip", "b.zip"]).await;

    let launcher = Launcher::builder(settings(tmp.path(), 1))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();
    for id in ["a", "b"] {
        launcher
            .enqueue_download(DownloadRequest::new(
                id,
                format!("{}/{}.zip", server.uri(), id),
                tmp.path().join(format!("{}.zip", id)),
            ))
            .await
            .unwrap();
    }

    assert!(launcher.cancel_download("b").await);
    assert_eq!(
        launcher.wait_download("b").await.unwrap_err(),
        DownloadError::Canceled
    );
    assert_eq!(
        launcher.download("b").await.map(|t| t.state),
        Some(DownloadState::Canceled)
    );

    launcher.wait_download("a").await.unwrap();
    assert!(!tmp.path().join("b.zip").exists());
    assert!(!launcher.cancel_download("b").await);
}

#[tokio::test]
async fn http_failure_marks_task_failed() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (notifier, mut events) = EventNotifier::channel();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .with_notifier(notifier)
        .start()
        .unwrap();
    launcher
        .enqueue_download(DownloadRequest::new(
            "a",
            format!("{}/missing.zip", server.uri()),
            tmp.path().join("a.zip"),
        ))
        .await
        .unwrap();

    let err = launcher.wait_download("a").await.unwrap_err();
    assert!(matches!(err, DownloadError::Http { status: 404, .. }));

    let task = launcher.download("a").await.unwrap();
    assert_eq!(task.state, DownloadState::Failed);
    assert!(task.error.is_some());
    wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::DownloadState { state: DownloadState::Failed, .. })
    })
    .await;

    // A settled record can be cleared and enqueued again
    assert!(launcher.clear_download("a").await);
    assert!(launcher.download("a").await.is_none());
}
