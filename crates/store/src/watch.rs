//! Filesystem watcher. Bursts of change events collapse into one rescan
//! request after a debounce window; the tree itself never hears from the
//! watcher directly.

use std::path::PathBuf;
use std::time::Duration;

use common::{BackendRequest, LibraryEvent};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::info;

/// Starts watching `root`. The returned watcher must be kept alive for
/// events to keep flowing.
pub fn spawn(
    root: PathBuf,
    debounce: Duration,
    backend: mpsc::Sender<BackendRequest>,
    events: mpsc::Sender<LibraryEvent>,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(
        "Watching {} for changes (debounce {}s)",
        root.display(),
        debounce.as_secs()
    );

    tokio::spawn(async move {
        if events.send(LibraryEvent::WatcherInitialised).await.is_err() {
            return;
        }
        watch_loop(rx, backend, debounce).await;
    });

    Ok(watcher)
}

async fn watch_loop(
    mut rx: UnboundedReceiver<Event>,
    backend: mpsc::Sender<BackendRequest>,
    debounce: Duration,
) {
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    if backend.send(BackendRequest::Rescan).await.is_err() {
                        return;
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !is_relevant_event(&event) {
                                continue;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
