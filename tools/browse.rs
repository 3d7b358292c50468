use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{GroupBy, Grouping, QueryError};
use model::{event_channel, Library, LibraryModel, ModelEvent, NodeId};
use store::Store;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut watch = false;
    let mut positional = Vec::new();
    for arg in env::args().skip(1) {
        if arg == "--watch" {
            watch = true;
        } else {
            positional.push(arg);
        }
    }

    let mut args = positional.into_iter();
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/library.redb".to_string());
    let grouping = match args.next() {
        Some(spec) => parse_grouping(&spec)?,
        None => Grouping::default(),
    };

    let store = Store::open(PathBuf::from(&music_root), Path::new(&index_path))?;

    if watch {
        return run_watching(store, PathBuf::from(&music_root), grouping).await;
    }

    let outcome = store.rescan()?;
    println!(
        "Indexed {} songs ({} new, {} removed)",
        outcome.total,
        outcome.discovered.len(),
        outcome.deleted.len()
    );

    let mut model = LibraryModel::new(grouping);
    expand_all(&mut model, &store)?;
    print_tree(&model, model.root(), 0);
    Ok(())
}

/// Full stack: store worker + filesystem watcher + controller task. The
/// tree reprints whenever the collection settles after a change.
async fn run_watching(
    store: Store,
    root: PathBuf,
    grouping: Grouping,
) -> Result<(), Box<dyn std::error::Error>> {
    let (event_tx, event_rx) = event_channel();
    let backend = store::worker::spawn(store, event_tx.clone());
    let _watcher = store::watch::spawn(root, Duration::from_secs(2), backend.clone(), event_tx)?;
    let library = Library::spawn(grouping, backend, event_rx);
    let mut events = library.subscribe();

    while let Some(event) = events.recv().await {
        match event {
            ModelEvent::Ready
            | ModelEvent::Reset
            | ModelEvent::ChildrenPopulated { .. }
            | ModelEvent::TotalSongCountUpdated(_) => {
                let pending = {
                    let model = library.model();
                    let guard = model.read();
                    let mut out = Vec::new();
                    collect_expandable(&guard, guard.root(), &mut out);
                    out
                };
                if pending.is_empty() {
                    let model = library.model();
                    let guard = model.read();
                    println!("==== {} songs", guard.known_song_count());
                    print_tree(&guard, guard.root(), 0);
                } else {
                    for id in pending {
                        library.populate(id).await;
                    }
                }
            }
            ModelEvent::Error(message) => warn!("Backend error: {}", message),
            _ => {}
        }
    }
    Ok(())
}

/// Parses "1,2,0"-style grouping specs using the persisted GroupBy codes.
fn parse_grouping(spec: &str) -> Result<Grouping, String> {
    let mut levels = [GroupBy::None; 3];
    for (index, part) in spec.split(',').take(3).enumerate() {
        let code: i32 = part
            .trim()
            .parse()
            .map_err(|_| format!("bad grouping code: {}", part))?;
        levels[index] =
            GroupBy::from_code(code).ok_or_else(|| format!("unknown grouping code: {}", code))?;
    }
    Ok(Grouping::new(levels[0], levels[1], levels[2]))
}

fn expand_all(model: &mut LibraryModel, store: &Store) -> Result<(), QueryError> {
    loop {
        let mut pending = Vec::new();
        collect_expandable(model, model.root(), &mut pending);
        if pending.is_empty() {
            return Ok(());
        }
        for id in pending {
            model.populate_with(id, |query| {
                store
                    .run_query(query)
                    .map_err(|err| QueryError::new(err.to_string()))
            })?;
        }
    }
}

fn collect_expandable(model: &LibraryModel, id: NodeId, out: &mut Vec<NodeId>) {
    if model.can_fetch_more(id) {
        out.push(id);
    }
    for child in model.children(id) {
        collect_expandable(model, child, out);
    }
}

fn print_tree(model: &LibraryModel, id: NodeId, depth: usize) {
    for child in model.children(id) {
        if let Some(node) = model.node(child) {
            println!("{}{}", "  ".repeat(depth), node.display);
        }
        print_tree(model, child, depth + 1);
    }
}
