//! Background worker owning all store access. Requests arrive on a bounded
//! channel; scan results flow to the controller as ordered library events.

use common::{BackendRequest, LibraryEvent, QueryError};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{info, warn};

use crate::Store;

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Spawns the worker. It signals readiness, performs one initial scan, then
/// serves queries and rescan requests until the request channel closes.
pub fn spawn(store: Store, events: mpsc::Sender<LibraryEvent>) -> mpsc::Sender<BackendRequest> {
    let (tx, mut rx) = mpsc::channel::<BackendRequest>(REQUEST_QUEUE_DEPTH);

    tokio::spawn(async move {
        if events.send(LibraryEvent::BackendInitialised).await.is_err() {
            return;
        }
        rescan(&store, &events).await;

        while let Some(request) = rx.recv().await {
            match request {
                BackendRequest::RunQuery { query, reply } => {
                    let store = store.clone();
                    let joined =
                        task::spawn_blocking(move || store.run_query(&query)).await;
                    let result = match joined {
                        Ok(Ok(rows)) => Ok(rows),
                        Ok(Err(err)) => Err(QueryError::new(err.to_string())),
                        Err(err) => Err(QueryError::new(format!("query task failed: {}", err))),
                    };
                    let _ = reply.send(result);
                }
                BackendRequest::Rescan => rescan(&store, &events).await,
            }
        }
    });

    tx
}

async fn rescan(store: &Store, events: &mpsc::Sender<LibraryEvent>) {
    let scan_store = store.clone();
    match task::spawn_blocking(move || scan_store.rescan()).await {
        Ok(Ok(outcome)) => {
            info!(
                "Scan complete: {} discovered, {} removed, {} total",
                outcome.discovered.len(),
                outcome.deleted.len(),
                outcome.total
            );
            if !outcome.deleted.is_empty() {
                let _ = events
                    .send(LibraryEvent::SongsDeleted(outcome.deleted))
                    .await;
            }
            if !outcome.discovered.is_empty() {
                let _ = events
                    .send(LibraryEvent::SongsDiscovered(outcome.discovered))
                    .await;
            }
        }
        Ok(Err(err)) => warn!("Rescan failed: {}", err),
        Err(err) => warn!("Rescan join error: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{GroupBy, LibraryQuery, QueryOptions};
    use std::fs;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn worker_scans_then_signals_readiness_and_serves_queries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        fs::create_dir_all(root.join("A/First")).unwrap();
        fs::write(root.join("A/First/01 One.mp3"), b"junk").unwrap();

        let store = Store::open(root.clone(), &dir.path().join("index.redb")).unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let requests = spawn(store, event_tx);

        // The worker signals ready first, then the initial scan reports.
        let first = event_rx.recv().await.unwrap();
        assert!(matches!(first, LibraryEvent::BackendInitialised));
        let second = event_rx.recv().await.unwrap();
        assert!(matches!(second, LibraryEvent::SongsDiscovered(ref songs) if songs.len() == 1));

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(BackendRequest::RunQuery {
                query: LibraryQuery {
                    level: GroupBy::None,
                    predicates: Vec::new(),
                    options: QueryOptions::default(),
                },
                reply: reply_tx,
            })
            .await
            .unwrap();
        let rows = reply_rx.await.unwrap().unwrap();
        assert_eq!(rows.len(), 1);

        // A rescan request picks up files added after the initial scan.
        fs::write(root.join("A/First/02 Two.mp3"), b"junk").unwrap();
        requests.send(BackendRequest::Rescan).await.unwrap();
        let third = event_rx.recv().await.unwrap();
        assert!(matches!(third, LibraryEvent::SongsDiscovered(ref songs) if songs.len() == 1));
    }
}
