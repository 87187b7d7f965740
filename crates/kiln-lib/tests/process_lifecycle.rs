#![cfg(unix)]

mod common;

use common::{drain_events, fast_config, init_logging, settings, wait_for_event, write_script};
use kiln_lib::error::LaunchError;
use kiln_lib::game::launcher::registry::load_records;
use kiln_lib::game::launcher::{LaunchRequest, ProcessOrigin};
use kiln_lib::game::StopOutcome;
use kiln_lib::notify::{CoreEvent, EventNotifier};
use kiln_lib::runtime::Launcher;
use std::time::Duration;
use tempfile::TempDir;

fn stopped(game_id: &str) -> impl Fn(&CoreEvent) -> bool + '_ {
    move |e: &CoreEvent| matches!(e, CoreEvent::GameStopped { game_id: id } if id == game_id)
}

#[tokio::test]
async fn launch_then_stop_gracefully() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    write_script(&tmp.path().join("games/space-miner/space-miner"), "exec sleep 30");

    let (notifier, mut events) = EventNotifier::channel();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .with_notifier(notifier)
        .start()
        .unwrap();

    let game = launcher
        .launch(LaunchRequest::new("space-miner"))
        .await
        .unwrap();
    assert_eq!(game.origin, ProcessOrigin::Spawned);
    assert!(launcher.is_running("space-miner").await);
    assert!(launcher.playtime("space-miner").await.in_session);

    let records = load_records(&tmp.path().join("running_processes.json")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pid, game.pid);

    // A second launch while running is refused
    let err = launcher
        .launch(LaunchRequest::new("space-miner"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::AlreadyRunning(_)));

    let outcome = tokio::time::timeout(Duration::from_secs(10), launcher.stop("space-miner"))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);
    assert!(!launcher.is_running("space-miner").await);
    assert!(!launcher.playtime("space-miner").await.in_session);
    assert!(load_records(&tmp.path().join("running_processes.json"))
        .unwrap()
        .is_empty());

    wait_for_event(&mut events, stopped("space-miner")).await;
    // Give a late exit report the chance to show up as a duplicate
    tokio::time::sleep(Duration::from_millis(400)).await;
    let extra = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::GameStopped { .. }))
        .count();
    assert_eq!(extra, 0);

    assert_eq!(
        launcher.stop("space-miner").await,
        StopOutcome::NotRunning
    );
}

#[tokio::test]
async fn stubborn_game_is_force_killed() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    write_script(
        &tmp.path().join("games/stubborn/stubborn"),
        "trap '' TERM\nsleep 30",
    );

    let (notifier, mut events) = EventNotifier::channel();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .with_notifier(notifier)
        .start()
        .unwrap();

    launcher.launch(LaunchRequest::new("stubborn")).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), launcher.stop("stubborn"))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);
    assert!(launcher.running_games().await.is_empty());
    wait_for_event(&mut events, stopped("stubborn")).await;
}

#[tokio::test]
async fn game_that_exits_on_its_own_is_cleaned_up() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    write_script(&tmp.path().join("games/quick/quick"), "exit 3");

    let (notifier, mut events) = EventNotifier::channel();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .with_notifier(notifier)
        .start()
        .unwrap();

    launcher.launch(LaunchRequest::new("quick")).await.unwrap();
    wait_for_event(&mut events, stopped("quick")).await;
    assert!(!launcher.is_running("quick").await);
}

#[tokio::test]
async fn missing_executable_is_reported() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();

    let err = launcher
        .launch(LaunchRequest::new("ghost").with_executable(tmp.path().join("nope")))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::InvalidExecutable(_)));
    assert!(!launcher.is_running("ghost").await);
}

#[tokio::test]
async fn shutdown_stops_games_and_rejects_new_work() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    write_script(&tmp.path().join("games/g1/g1"), "exec sleep 30");

    let launcher = Launcher::builder(settings(tmp.path(), 2))
        .with_config(fast_config(tmp.path()))
        .start()
        .unwrap();
    launcher.launch(LaunchRequest::new("g1")).await.unwrap();

    assert!(matches!(
        launcher.request_close().await,
        kiln_lib::game::CloseDecision::Blocked { running: 1 }
    ));

    tokio::time::timeout(Duration::from_secs(10), launcher.shutdown())
        .await
        .unwrap();

    let err = launcher.launch(LaunchRequest::new("g1")).await.unwrap_err();
    assert!(matches!(err, LaunchError::Unavailable));
}
