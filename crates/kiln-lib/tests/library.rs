#![cfg(unix)]

mod common;

use common::{fast_config, init_logging, settings, wait_for_event, write_script};
use kiln_lib::error::{DownloadError, LaunchError, UninstallError, UpdateCheckError};
use kiln_lib::game::{DownloadRequest, LaunchRequest, StopOutcome};
use kiln_lib::notify::{CoreEvent, EventNotifier};
use kiln_lib::runtime::Launcher;
use kiln_lib::SettingsStore;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn installed_games_report_size_and_version() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let games = tmp.path().join("games");
    write_script(&games.join("space-miner/space-miner"), "exit 0");
    std::fs::write(games.join("space-miner/assets.pak"), vec![1u8; 4096]).unwrap();
    std::fs::create_dir_all(games.join("tetris")).unwrap();
    std::fs::create_dir_all(games.join(".kiln/staging")).unwrap();

    let store = settings(tmp.path(), 2);
    store.set_installed_version("space-miner", "0.9.1").unwrap();
    let launcher = Launcher::builder(store)
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();

    let installed = launcher.installed_games().await;
    let ids: Vec<&str> = installed.iter().map(|g| g.game_id.as_str()).collect();
    assert_eq!(ids, ["space-miner", "tetris"]);

    let script_len = std::fs::metadata(games.join("space-miner/space-miner"))
        .unwrap()
        .len();
    assert_eq!(installed[0].size_bytes, 4096 + script_len);
    assert_eq!(installed[0].version.as_deref(), Some("0.9.1"));
    assert_eq!(installed[1].size_bytes, 0);

    assert_eq!(launcher.game_size("space-miner").await, Some(4096 + script_len));
    assert_eq!(launcher.game_size("not-installed").await, None);
}

#[tokio::test]
async fn uninstall_waits_for_the_game_to_stop() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let install_dir = tmp.path().join("games/space-miner");
    write_script(&install_dir.join("space-miner"), "exec sleep 30");

    let store = settings(tmp.path(), 2);
    store.set_installed_version("space-miner", "1.0.0").unwrap();
    let (notifier, mut events) = EventNotifier::channel();
    let launcher = Launcher::builder(store.clone())
        .with_config(fast_config(tmp.path()))
        .with_notifier(notifier)
        .start()
        .unwrap();

    launcher
        .launch(LaunchRequest::new("space-miner"))
        .await
        .unwrap();
    assert_eq!(
        launcher.uninstall("space-miner").await,
        Err(UninstallError::Running("space-miner".to_string()))
    );
    assert!(install_dir.exists());

    let outcome = tokio::time::timeout(Duration::from_secs(10), launcher.stop("space-miner"))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);

    launcher.uninstall("space-miner").await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::GameUninstalled { game_id } if game_id == "space-miner")
    })
    .await;
    assert!(!install_dir.exists());
    assert!(store.installed_version("space-miner").is_none());
    assert!(launcher.installed_games().await.is_empty());

    let err = launcher
        .launch(LaunchRequest::new("space-miner"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::NoExecutable { .. }));
}

#[tokio::test]
async fn path_like_game_ids_are_refused_everywhere() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();

    let err = launcher
        .launch(LaunchRequest::new("../outside"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::InvalidGameId(_)));

    let request = DownloadRequest::new("a/b", "http://localhost/a.zip", tmp.path().join("a.zip"));
    assert_eq!(
        launcher.enqueue_download(request).await.unwrap_err(),
        DownloadError::InvalidGameId("a/b".to_string())
    );

    assert_eq!(
        launcher.run_update("..").await.unwrap_err(),
        UpdateCheckError::InvalidGameId("..".to_string())
    );
    assert_eq!(
        launcher.uninstall("..").await,
        Err(UninstallError::InvalidGameId("..".to_string()))
    );
    assert!(tmp.path().exists());
}
