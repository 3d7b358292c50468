use tokio::sync::oneshot;

use crate::query::{LibraryQuery, QueryError, QueryRow};
use crate::{Song, SongId};

/// Messages background workers deliver to the tree's controller task.
/// Ordering per sender is preserved by the channel; handlers run to
/// completion before the next message is dequeued.
#[derive(Debug)]
pub enum LibraryEvent {
    BackendInitialised,
    WatcherInitialised,
    SongsDiscovered(Vec<Song>),
    SongsDeleted(Vec<SongId>),
}

/// Requests sent to the store worker.
#[derive(Debug)]
pub enum BackendRequest {
    RunQuery {
        query: LibraryQuery,
        reply: oneshot::Sender<Result<Vec<QueryRow>, QueryError>>,
    },
    Rescan,
}
