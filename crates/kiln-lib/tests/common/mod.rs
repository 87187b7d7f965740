#![allow(dead_code)]

use kiln_lib::notify::{CoreEvent, UiMessage};
use kiln_lib::settings::{JsonSettingsStore, LauncherSettings};
use kiln_lib::LauncherConfig;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use zip::write::FileOptions;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings file in `root` with games installed under `root/games`
pub fn settings(root: &Path, max_concurrent_downloads: usize) -> Arc<JsonSettingsStore> {
    let settings = LauncherSettings {
        max_concurrent_downloads,
        install_root: root.join("games"),
        ..LauncherSettings::default()
    };
    Arc::new(JsonSettingsStore::with_settings(
        root.join("settings.json"),
        settings,
    ))
}

/// Short timeouts, state file inside `root`
pub fn fast_config(root: &Path) -> LauncherConfig {
    let mut config = LauncherConfig::default()
        .with_state_file(Some(root.join("running_processes.json")))
        .with_watchdog_timeout(Duration::from_millis(200));
    config.adopted_poll_interval = Duration::from_millis(100);
    config.progress_interval = Duration::from_millis(10);
    config
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let f = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(f);
    for (name, body) in entries.iter().copied() {
        zip.start_file::<&str, ()>(name, FileOptions::default())
            .unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap();
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Wait for the first event matching `pred`, skipping everything else
pub async fn wait_for_event<F>(rx: &mut UnboundedReceiver<UiMessage>, mut pred: F) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(UiMessage::Event(event)) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("notifier channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything received so far, without waiting
pub fn drain_events(rx: &mut UnboundedReceiver<UiMessage>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let UiMessage::Event(event) = message {
            events.push(event);
        }
    }
    events
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
