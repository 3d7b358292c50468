//! The synchronization controller: one task owns all tree mutation, fed by
//! ordered messages from the background workers and from consumers.

use std::sync::Arc;

use common::{BackendRequest, Grouping, LibraryEvent, QueryError, QueryRow};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::node::NodeId;
use crate::tree::{LibraryModel, ModelEvent};

const MAILBOX_DEPTH: usize = 256;

/// Creates the ordered event channel the background workers deliver into.
/// The receiver goes to [`Library::spawn`]; sender clones go to the workers.
pub fn event_channel() -> (mpsc::Sender<LibraryEvent>, mpsc::Receiver<LibraryEvent>) {
    mpsc::channel(MAILBOX_DEPTH)
}

enum Command {
    SetGrouping(Grouping),
    SetFilterText(String),
    SetFilterAge(i64),
    Populate(NodeId),
    QueryFinished {
        node: NodeId,
        result: Result<Vec<QueryRow>, QueryError>,
    },
}

/// Handle to a running library. Mutation goes through the controller task;
/// reads take the model's read lock directly.
#[derive(Clone)]
pub struct Library {
    model: Arc<RwLock<LibraryModel>>,
    commands: mpsc::Sender<Command>,
    backend: mpsc::Sender<BackendRequest>,
}

impl Library {
    pub fn spawn(
        grouping: Grouping,
        backend: mpsc::Sender<BackendRequest>,
        events: mpsc::Receiver<LibraryEvent>,
    ) -> Library {
        let model = Arc::new(RwLock::new(LibraryModel::new(grouping)));
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_DEPTH);

        let controller = Controller {
            model: Arc::clone(&model),
            commands: command_tx.clone(),
            backend: backend.clone(),
            waiting_for_workers: 2,
        };
        tokio::spawn(controller.run(events, command_rx));

        Library {
            model,
            commands: command_tx,
            backend,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ModelEvent> {
        self.model.write().subscribe()
    }

    /// Shared model for read access (children, node data, child songs).
    pub fn model(&self) -> Arc<RwLock<LibraryModel>> {
        Arc::clone(&self.model)
    }

    pub async fn set_grouping(&self, grouping: Grouping) {
        let _ = self.commands.send(Command::SetGrouping(grouping)).await;
    }

    pub async fn set_filter_text(&self, text: String) {
        let _ = self.commands.send(Command::SetFilterText(text)).await;
    }

    pub async fn set_filter_age(&self, max_age_secs: i64) {
        let _ = self.commands.send(Command::SetFilterAge(max_age_secs)).await;
    }

    pub async fn populate(&self, node: NodeId) {
        let _ = self.commands.send(Command::Populate(node)).await;
    }

    pub async fn rescan(&self) {
        let _ = self.backend.send(BackendRequest::Rescan).await;
    }
}

struct Controller {
    model: Arc<RwLock<LibraryModel>>,
    commands: mpsc::Sender<Command>,
    backend: mpsc::Sender<BackendRequest>,
    waiting_for_workers: u8,
}

impl Controller {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<LibraryEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    // Every event sender is gone, so the workers are too;
                    // the controller winds down with them.
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }
    }

    fn handle_event(&mut self, event: LibraryEvent) {
        match event {
            LibraryEvent::BackendInitialised | LibraryEvent::WatcherInitialised => {
                if self.waiting_for_workers > 0 {
                    self.waiting_for_workers -= 1;
                    if self.waiting_for_workers == 0 {
                        let mut model = self.model.write();
                        model.reset();
                        model.emit_ready();
                    }
                }
            }
            LibraryEvent::SongsDiscovered(songs) => {
                self.model.write().songs_discovered(&songs);
            }
            LibraryEvent::SongsDeleted(ids) => {
                self.model.write().songs_deleted(&ids);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetGrouping(grouping) => self.model.write().set_grouping(grouping),
            Command::SetFilterText(text) => self.model.write().set_filter_text(&text),
            Command::SetFilterAge(age) => self.model.write().set_filter_age(age),
            Command::Populate(node) => self.start_populate(node).await,
            Command::QueryFinished { node, result } => match result {
                Ok(rows) => self.model.write().apply_populate(node, &rows),
                Err(err) => {
                    warn!("populate query failed: {}", err);
                    let mut model = self.model.write();
                    model.abort_populate(node);
                    model.emit_error(err.to_string());
                }
            },
        }
    }

    /// Marks the node populating and hands the scoped query to the store
    /// worker. The reply comes back through the command mailbox, so deletes
    /// queued in between are applied first and a reply for a since-pruned
    /// node is dropped by the model.
    async fn start_populate(&mut self, node: NodeId) {
        let query = match self.model.write().begin_populate(node) {
            Some(query) => query,
            None => return,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .backend
            .send(BackendRequest::RunQuery {
                query,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            warn!("backend worker is gone; populate aborted");
            let mut model = self.model.write();
            model.abort_populate(node);
            model.emit_error("backend unavailable".to_string());
            return;
        }

        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(QueryError::new("backend dropped the query")),
            };
            let _ = commands.send(Command::QueryFinished { node, result }).await;
        });
    }
}
