//! Config hot reload.
//!
//! A notify watcher on the directory holding the config file forwards
//! relevant events into a tokio channel. The reload task waits for the
//! burst to settle, then loads and fully validates the file before it
//! replaces the live config. Anything that fails is logged and the running
//! config stays in place.
//!
//! The directory is watched rather than the file so editors that save by
//! writing a temp file and renaming it over the original are still seen.

use crate::config::Config;
use crate::policy::PolicyEngine;
use crate::state::SharedConfig;
use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Starts watching `path` and returns the reload task.
///
/// Fails only if the watcher cannot be created or the directory cannot be
/// watched. The task ends when `cancel` fires.
pub fn spawn_config_reloader(
    path: PathBuf,
    shared: SharedConfig,
    policy: Arc<dyn PolicyEngine>,
    debounce: Duration,
    cancel: CancellationToken,
) -> notify::Result<JoinHandle<()>> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name: Option<OsString> = path.file_name().map(OsStr::to_os_string);
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if touches_config(&event, file_name.as_deref()) {
                // receiver gone means the reloader has stopped
                let _ = tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "config watcher error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    info!(
        path = %path.display(),
        debounce = %humantime::format_duration(debounce),
        "watching config for changes"
    );

    Ok(tokio::spawn(async move {
        // dropping the watcher stops the OS watch
        let _watcher = watcher;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = rx.recv() => {
                    if ev.is_none() {
                        break;
                    }
                }
            }

            // collapse a burst of writes into a single reload
            while let Ok(Some(())) = tokio::time::timeout(debounce, rx.recv()).await {}
            if cancel.is_cancelled() {
                break;
            }

            reload(&path, &shared, policy.as_ref()).await;
        }

        debug!("config reloader stopped");
    }))
}

async fn reload(path: &Path, shared: &SharedConfig, policy: &dyn PolicyEngine) {
    match Config::load(path, policy).await {
        Ok(cfg) => {
            info!(
                sources = cfg.nut_servers.len(),
                targets = cfg.target_count(),
                "config reloaded"
            );
            shared.publish(cfg);
        }
        Err(e) => warn!(error = %e, "config reload rejected, keeping previous config"),
    }
}

/// Content or name changes to the config file itself.
fn touches_config(event: &Event, file_name: Option<&OsStr>) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    );
    if !relevant {
        return false;
    }
    match file_name {
        Some(name) => event.paths.iter().any(|p| p.file_name() == Some(name)),
        None => true,
    }
}
