//! The grouped index tree: per-level lookup maps, the grouping engine that
//! realizes key paths as nodes, lazy population, and pruning.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{
    level_key, matches_options, GroupBy, Grouping, LibraryQuery, Predicate, QueryError,
    QueryOptions, QueryRow, Song, SongId, KEY_SEP, VARIOUS_KEY,
};
use tokio::sync::mpsc;

use crate::node::{Node, NodeArena, NodeId, NodeKind, PopulateState};
use crate::sort;

/// Notifications to tree consumers. Bulk population emits one
/// `ChildrenPopulated` per node instead of per-row insert events.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    Reset,
    Ready,
    GroupingChanged(Grouping),
    NodesInserted { parent: NodeId, nodes: Vec<NodeId> },
    NodesAboutToBeRemoved { parent: NodeId, nodes: Vec<NodeId> },
    ChildrenPopulated { node: NodeId },
    TotalSongCountUpdated(usize),
    Error(String),
}

/// Role-keyed data for one node, for display and drag payloads.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub display: String,
    pub sort_key: String,
    pub is_divider: bool,
    pub is_container: bool,
    pub group_key: Option<String>,
    pub artist: Option<String>,
    pub song_id: Option<SongId>,
    pub draggable: bool,
}

pub struct LibraryModel {
    arena: NodeArena,
    root: NodeId,
    grouping: Grouping,
    options: QueryOptions,

    // Keyed on the song's database id.
    song_nodes: HashMap<SongId, NodeId>,
    // Songs routed to a not-yet-populated container; the value is that
    // container. Cleared when the container populates or the song is
    // deleted again.
    shadow_songs: HashMap<SongId, NodeId>,
    // Keyed on whatever the key is for that level - artist, album, year.
    container_nodes: [HashMap<String, NodeId>; 3],
    // Keyed on a letter, a decade, or a catch-all bucket.
    divider_nodes: HashMap<String, NodeId>,
    // Only applies when the first level is Artist.
    compilation_artist: Option<NodeId>,

    observers: Vec<mpsc::UnboundedSender<ModelEvent>>,
}

impl LibraryModel {
    pub fn new(grouping: Grouping) -> Self {
        let mut arena = NodeArena::new();
        let root = arena.insert(Node {
            parent: None,
            children: Vec::new(),
            display: String::new(),
            sort_key: String::new(),
            state: PopulateState::Unpopulated,
            shadow: 0,
            counted: false,
            kind: NodeKind::Root,
        });
        Self {
            arena,
            root,
            grouping,
            options: QueryOptions::default(),
            song_nodes: HashMap::new(),
            shadow_songs: HashMap::new(),
            container_nodes: [HashMap::new(), HashMap::new(), HashMap::new()],
            divider_nodes: HashMap::new(),
            compilation_artist: None,
            observers: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ModelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    fn emit(&mut self, event: ModelEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn emit_ready(&mut self) {
        self.emit(ModelEvent::Ready);
    }

    pub(crate) fn emit_error(&mut self, message: String) {
        self.emit(ModelEvent::Error(message));
    }

    /// Tears down everything below the root and clears the lookup maps.
    /// One `Reset` notification; never an interleaved removal sequence.
    pub fn reset(&mut self) {
        let children = match self.arena.get(self.root) {
            Some(root) => root.children.clone(),
            None => return,
        };
        for child in children {
            self.remove_subtree(child);
        }
        self.song_nodes.clear();
        self.shadow_songs.clear();
        for map in &mut self.container_nodes {
            map.clear();
        }
        self.divider_nodes.clear();
        self.compilation_artist = None;
        if let Some(root) = self.arena.get_mut(self.root) {
            root.children.clear();
            root.state = PopulateState::Unpopulated;
            root.shadow = 0;
            root.counted = false;
        }
        self.emit(ModelEvent::Reset);
    }

    pub fn set_grouping(&mut self, grouping: Grouping) {
        if grouping == self.grouping {
            return;
        }
        self.grouping = grouping;
        self.reset();
        self.emit(ModelEvent::GroupingChanged(grouping));
    }

    pub fn set_filter_text(&mut self, text: &str) {
        if self.options.filter_text == text {
            return;
        }
        self.options.filter_text = text.to_string();
        self.reset();
    }

    pub fn set_filter_age(&mut self, max_age_secs: i64) {
        if self.options.max_age_secs == max_age_secs {
            return;
        }
        self.options.max_age_secs = max_age_secs;
        self.reset();
    }

    // ---- incremental updates -------------------------------------------

    pub fn songs_discovered(&mut self, songs: &[Song]) {
        let now = now_secs();
        for song in songs {
            self.insert_song(song, true, now);
        }
        let count = self.known_song_count();
        self.emit(ModelEvent::TotalSongCountUpdated(count));
    }

    pub fn songs_deleted(&mut self, ids: &[SongId]) {
        for &song_id in ids {
            if let Some(node) = self.song_nodes.remove(&song_id) {
                let parent = match self.arena.get(node).and_then(|n| n.parent) {
                    Some(parent) => parent,
                    None => continue,
                };
                self.emit(ModelEvent::NodesAboutToBeRemoved {
                    parent,
                    nodes: vec![node],
                });
                self.detach_child(parent, node);
                self.arena.remove(node);
                self.prune_upwards(parent);
            } else if let Some(container) = self.shadow_songs.remove(&song_id) {
                if let Some(node) = self.arena.get_mut(container) {
                    node.shadow = node.shadow.saturating_sub(1);
                }
                self.prune_upwards(container);
            }
            // Anything else is a duplicate delete notification; ignore it.
        }
        let count = self.known_song_count();
        self.emit(ModelEvent::TotalSongCountUpdated(count));
    }

    /// Inserts one song, creating or reusing the container (and divider)
    /// path its key maps to. Descent stops at the first container that has
    /// not been populated yet: its eventual population query will pick the
    /// song up, so only a shadow entry is recorded there.
    fn insert_song(&mut self, song: &Song, announce: bool, now: i64) {
        if !matches_options(song, &self.options, now) {
            return;
        }
        if self.song_nodes.contains_key(&song.id) || self.shadow_songs.contains_key(&song.id) {
            return;
        }

        let row = QueryRow::from_song(song);
        let mut parent = self.root;
        for level in 0..3 {
            let group = self.grouping[level];
            if group == GroupBy::None {
                break;
            }
            parent = self.container_for(level, group, &row, announce, parent, true);
            if self.populate_state(parent) != PopulateState::Populated {
                self.add_shadow(song.id, parent);
                return;
            }
        }
        if self.populate_state(parent) != PopulateState::Populated {
            // Flat grouping with an unpopulated root.
            self.add_shadow(song.id, parent);
            return;
        }
        self.create_song_node(parent, song, announce);
    }

    fn add_shadow(&mut self, song_id: SongId, container: NodeId) {
        self.shadow_songs.insert(song_id, container);
        if let Some(node) = self.arena.get_mut(container) {
            node.shadow += 1;
        }
    }

    fn populate_state(&self, id: NodeId) -> PopulateState {
        self.arena
            .get(id)
            .map(|node| node.state)
            .unwrap_or(PopulateState::Unpopulated)
    }

    // ---- grouping engine -----------------------------------------------

    fn container_for(
        &mut self,
        level: usize,
        group: GroupBy,
        row: &QueryRow,
        announce: bool,
        parent: NodeId,
        counted: bool,
    ) -> NodeId {
        if level == 0 && group == GroupBy::Artist && row.compilation {
            return self.compilation_artist_node(announce, counted);
        }
        let key = level_key(group, row, level);
        let path = self.path_key(parent, &key);
        if let Some(&existing) = self.container_nodes[level].get(&path) {
            return existing;
        }
        self.create_container(level, group, key, path, row, announce, parent, counted)
    }

    /// Full key path of a child container: the parent container's path plus
    /// this level's key. Root and divider parents contribute nothing.
    fn path_key(&self, parent: NodeId, key: &str) -> String {
        match self.arena.get(parent).map(|node| &node.kind) {
            Some(NodeKind::Container { path, .. }) => format!("{}{}{}", path, KEY_SEP, key),
            Some(NodeKind::CompilationArtist) => format!("{}{}{}", VARIOUS_KEY, KEY_SEP, key),
            _ => key.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_container(
        &mut self,
        level: usize,
        group: GroupBy,
        key: String,
        path: String,
        row: &QueryRow,
        announce: bool,
        parent: NodeId,
        counted: bool,
    ) -> NodeId {
        let (display, sort_key) = container_strings(group, row);

        // Dividers only exist at the first tree level.
        let mut attach_parent = parent;
        if level == 0 {
            if let Some(divider_key) = sort::divider_key(group, &sort_key, row.year) {
                attach_parent = self.divider_for(group, &divider_key, announce, parent);
            }
        }

        let id = self.arena.insert(Node {
            parent: None,
            children: Vec::new(),
            display,
            sort_key,
            state: PopulateState::Unpopulated,
            shadow: 0,
            counted,
            kind: NodeKind::Container {
                group,
                level,
                key,
                path: path.clone(),
            },
        });
        self.attach_child(attach_parent, id);
        self.container_nodes[level].insert(path, id);
        if announce {
            self.emit(ModelEvent::NodesInserted {
                parent: attach_parent,
                nodes: vec![id],
            });
        }
        id
    }

    fn divider_for(&mut self, group: GroupBy, key: &str, announce: bool, parent: NodeId) -> NodeId {
        if let Some(&existing) = self.divider_nodes.get(key) {
            return existing;
        }
        let id = self.arena.insert(Node {
            parent: None,
            children: Vec::new(),
            display: sort::divider_display_text(group, key),
            sort_key: sort::divider_sort_key(key),
            state: PopulateState::Populated,
            shadow: 0,
            counted: true,
            kind: NodeKind::Divider {
                key: key.to_string(),
            },
        });
        self.attach_child(parent, id);
        self.divider_nodes.insert(key.to_string(), id);
        if announce {
            self.emit(ModelEvent::NodesInserted {
                parent,
                nodes: vec![id],
            });
        }
        id
    }

    fn compilation_artist_node(&mut self, announce: bool, counted: bool) -> NodeId {
        if let Some(existing) = self.compilation_artist {
            if self.arena.contains(existing) {
                return existing;
            }
        }
        let id = self.arena.insert(Node {
            parent: None,
            children: Vec::new(),
            display: "Various Artists".to_string(),
            // Leading space: orders before every divider and container.
            sort_key: " various artists".to_string(),
            state: PopulateState::Unpopulated,
            shadow: 0,
            counted,
            kind: NodeKind::CompilationArtist,
        });
        self.attach_child(self.root, id);
        self.compilation_artist = Some(id);
        if announce {
            self.emit(ModelEvent::NodesInserted {
                parent: self.root,
                nodes: vec![id],
            });
        }
        id
    }

    fn create_song_node(&mut self, parent: NodeId, song: &Song, announce: bool) -> NodeId {
        let id = self.arena.insert(Node {
            parent: None,
            children: Vec::new(),
            display: sort::text_or_unknown(&song.title),
            sort_key: sort::sort_text_for_song(song.track, &song.title),
            state: PopulateState::Populated,
            shadow: 0,
            counted: true,
            kind: NodeKind::Song { song: song.clone() },
        });
        self.attach_child(parent, id);
        self.song_nodes.insert(song.id, id);
        if announce {
            self.emit(ModelEvent::NodesInserted {
                parent,
                nodes: vec![id],
            });
        }
        id
    }

    // ---- lazy population ------------------------------------------------

    pub fn can_fetch_more(&self, id: NodeId) -> bool {
        match self.arena.get(id) {
            Some(node) => {
                node.state == PopulateState::Unpopulated
                    && matches!(
                        node.kind,
                        NodeKind::Root | NodeKind::Container { .. } | NodeKind::CompilationArtist
                    )
            }
            None => false,
        }
    }

    /// Starts populating a node. Returns the backend query to run, or
    /// `None` when the node is gone, already populated, or mid-flight.
    pub fn begin_populate(&mut self, id: NodeId) -> Option<LibraryQuery> {
        if !self.can_fetch_more(id) {
            return None;
        }
        let query = self.build_populate_query(id)?;
        if let Some(node) = self.arena.get_mut(id) {
            node.state = PopulateState::Populating;
        }
        Some(query)
    }

    /// Attaches the rows of a finished populate query. A reply for a node
    /// that was pruned mid-flight is dropped; a container whose query came
    /// back empty is conceptually empty and is removed.
    pub fn apply_populate(&mut self, id: NodeId, rows: &[QueryRow]) {
        let state = match self.arena.get(id) {
            Some(node) => node.state,
            None => {
                tracing::debug!("dropping stale populate reply");
                return;
            }
        };
        if state == PopulateState::Populated {
            return;
        }

        // The rows reflect everything the backend holds under this node,
        // including songs that were only shadow entries so far.
        let shadowed: Vec<SongId> = self
            .shadow_songs
            .iter()
            .filter(|(_, &container)| container == id)
            .map(|(&song_id, _)| song_id)
            .collect();
        for song_id in shadowed {
            self.shadow_songs.remove(&song_id);
        }
        if let Some(node) = self.arena.get_mut(id) {
            node.shadow = 0;
        }

        if let Some((level, group)) = self.child_level(id) {
            for row in rows {
                self.item_from_row(level, group, row, id);
            }
        }
        if let Some(node) = self.arena.get_mut(id) {
            node.state = PopulateState::Populated;
            node.counted = true;
        }

        if rows.is_empty() && id != self.root {
            self.prune_upwards(id);
            return;
        }
        self.emit(ModelEvent::ChildrenPopulated { node: id });
    }

    /// Backend error path: the node stays retryable.
    pub fn abort_populate(&mut self, id: NodeId) {
        if let Some(node) = self.arena.get_mut(id) {
            if node.state == PopulateState::Populating {
                node.state = PopulateState::Unpopulated;
            }
        }
    }

    /// Runs the full populate cycle against a synchronous backend closure.
    pub fn populate_with<F>(&mut self, id: NodeId, mut run: F) -> Result<(), QueryError>
    where
        F: FnMut(&LibraryQuery) -> Result<Vec<QueryRow>, QueryError>,
    {
        let query = match self.begin_populate(id) {
            Some(query) => query,
            None => return Ok(()),
        };
        match run(&query) {
            Ok(rows) => {
                self.apply_populate(id, &rows);
                Ok(())
            }
            Err(err) => {
                self.abort_populate(id);
                Err(err)
            }
        }
    }

    /// One row of a populate query: a child container, or a song leaf when
    /// this is the last level. Must agree field-for-field with
    /// `insert_song` for the same underlying data.
    fn item_from_row(
        &mut self,
        level: usize,
        group: GroupBy,
        row: &QueryRow,
        parent: NodeId,
    ) -> Option<NodeId> {
        if group == GroupBy::None {
            let song = row.song.as_ref()?;
            if let Some(&existing) = self.song_nodes.get(&song.id) {
                return Some(existing);
            }
            return Some(self.create_song_node(parent, song, false));
        }
        Some(self.container_for(level, group, row, false, parent, false))
    }

    /// Level index and dimension of a node's children.
    fn child_level(&self, id: NodeId) -> Option<(usize, GroupBy)> {
        let node = self.arena.get(id)?;
        let level = match &node.kind {
            NodeKind::Root => 0,
            NodeKind::CompilationArtist => 1,
            NodeKind::Container { level, .. } => level + 1,
            _ => return None,
        };
        let group = if level >= 3 {
            GroupBy::None
        } else {
            self.grouping.level(level)
        };
        Some((level, group))
    }

    /// Builds the scoped query for a node's children: the column set for
    /// the child level plus one equality predicate per ancestor container.
    fn build_populate_query(&self, id: NodeId) -> Option<LibraryQuery> {
        let (_, group) = self.child_level(id)?;

        let mut predicates = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.arena.get(current)?;
            match &node.kind {
                NodeKind::Container {
                    group, level, key, ..
                } => {
                    predicates.push(Predicate::Field {
                        group: *group,
                        key: key.clone(),
                        exclude_compilations: *level == 0 && *group == GroupBy::Artist,
                    });
                }
                NodeKind::CompilationArtist => predicates.push(Predicate::Compilations),
                _ => {}
            }
            cursor = node.parent;
        }
        predicates.reverse();

        Some(LibraryQuery {
            level: group,
            predicates,
            options: self.options.clone(),
        })
    }

    // ---- pruning ---------------------------------------------------------

    /// Walks up from a node removing everything that became childless.
    /// Stops at the first node that still has content, and never removes
    /// the root.
    fn prune_upwards(&mut self, mut id: NodeId) {
        while id != self.root {
            let (prunable, parent) = match self.arena.get(id) {
                Some(node) => (node_prunable(node), node.parent),
                None => return,
            };
            if !prunable {
                return;
            }
            let parent = match parent {
                Some(parent) => parent,
                None => return,
            };
            self.emit(ModelEvent::NodesAboutToBeRemoved {
                parent,
                nodes: vec![id],
            });
            self.detach_child(parent, id);
            self.unregister(id);
            self.arena.remove(id);
            id = parent;
        }
    }

    fn unregister(&mut self, id: NodeId) {
        let kind = match self.arena.get(id) {
            Some(node) => node.kind.clone(),
            None => return,
        };
        match kind {
            NodeKind::Container { level, path, .. } => {
                self.container_nodes[level].remove(&path);
            }
            NodeKind::Divider { key } => {
                self.divider_nodes.remove(&key);
            }
            NodeKind::CompilationArtist => {
                self.compilation_artist = None;
            }
            NodeKind::Song { song } => {
                self.song_nodes.remove(&song.id);
            }
            NodeKind::Root => {}
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.arena.remove(id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    fn attach_child(&mut self, parent: NodeId, child: NodeId) {
        let sort_key = match self.arena.get(child) {
            Some(node) => node.sort_key.clone(),
            None => return,
        };
        let index = match self.arena.get(parent) {
            Some(parent_node) => parent_node.children.partition_point(|&sibling| {
                match self.arena.get(sibling) {
                    Some(node) => (node.sort_key.as_str(), sibling) <= (sort_key.as_str(), child),
                    None => false,
                }
            }),
            None => return,
        };
        if let Some(parent_node) = self.arena.get_mut(parent) {
            parent_node.children.insert(index, child);
        }
        if let Some(child_node) = self.arena.get_mut(child) {
            child_node.parent = Some(parent);
        }
    }

    fn detach_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(parent_node) = self.arena.get_mut(parent) {
            parent_node.children.retain(|&sibling| sibling != child);
        }
    }

    // ---- consumer surface ------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.arena
            .get(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.arena.get(id)?;
        let (group_key, artist, song_id) = match &node.kind {
            NodeKind::Container { group, key, .. } => {
                let artist = if *group == GroupBy::Artist {
                    Some(node.display.clone())
                } else {
                    None
                };
                (Some(key.clone()), artist, None)
            }
            NodeKind::CompilationArtist => (None, Some(node.display.clone()), None),
            NodeKind::Song { song } => (None, Some(song.artist.clone()), Some(song.id)),
            _ => (None, None, None),
        };
        let draggable = match &node.kind {
            NodeKind::Song { .. } => true,
            NodeKind::Container { .. } | NodeKind::CompilationArtist => {
                node.state == PopulateState::Populated
            }
            _ => false,
        };
        Some(NodeInfo {
            display: node.display.clone(),
            sort_key: node.sort_key.clone(),
            is_divider: matches!(node.kind, NodeKind::Divider { .. }),
            is_container: node.is_container(),
            group_key,
            artist,
            song_id,
            draggable,
        })
    }

    /// Depth-first collection of every materialized song beneath a node,
    /// in tree order. Used for drag payloads and playback enqueue.
    pub fn child_songs(&self, id: NodeId) -> Vec<Song> {
        let mut out = Vec::new();
        self.collect_songs(id, &mut out);
        out
    }

    fn collect_songs(&self, id: NodeId, out: &mut Vec<Song>) {
        let node = match self.arena.get(id) {
            Some(node) => node,
            None => return,
        };
        if let NodeKind::Song { song } = &node.kind {
            out.push(song.clone());
            return;
        }
        for &child in &node.children {
            self.collect_songs(child, out);
        }
    }

    pub fn known_song_count(&self) -> usize {
        self.song_nodes.len() + self.shadow_songs.len()
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }
}

fn node_prunable(node: &Node) -> bool {
    if !node.children.is_empty() || node.shadow > 0 {
        return false;
    }
    match node.kind {
        NodeKind::Root | NodeKind::Song { .. } => false,
        NodeKind::Divider { .. } => true,
        NodeKind::Container { .. } | NodeKind::CompilationArtist => {
            // A container created by bulk population may still hold backend
            // songs this model has never seen; only its own populate (or a
            // reset) may remove it.
            node.counted || node.state == PopulateState::Populated
        }
    }
}

fn container_strings(group: GroupBy, row: &QueryRow) -> (String, String) {
    match group {
        GroupBy::Artist => (
            sort::text_or_unknown(&row.artist),
            sort::sort_text_for_artist(&row.artist),
        ),
        GroupBy::Album => (
            sort::text_or_unknown(&row.album),
            sort_or_unknown(&row.album),
        ),
        GroupBy::YearAlbum => (
            sort::pretty_year_album(row.year, &row.album),
            format!(
                "{} {}",
                sort::sort_text_for_year(row.year),
                sort::sort_text(&row.album)
            ),
        ),
        GroupBy::Year => {
            let display = if row.year <= 0 {
                "Unknown".to_string()
            } else {
                row.year.to_string()
            };
            (display, sort::sort_text_for_year(row.year))
        }
        GroupBy::Composer => (
            sort::text_or_unknown(&row.composer),
            sort_or_unknown(&row.composer),
        ),
        GroupBy::Genre => (
            sort::text_or_unknown(&row.genre),
            sort_or_unknown(&row.genre),
        ),
        GroupBy::None => (String::new(), String::new()),
    }
}

fn sort_or_unknown(text: &str) -> String {
    let key = sort::sort_text(text);
    if key.is_empty() {
        sort::UNKNOWN_SORT.to_string()
    } else {
        key
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::run_query_over;

    const NOW: i64 = 1_000_000;

    fn song(id: u64, artist: &str, album: &str, title: &str) -> Song {
        Song {
            id: SongId(id),
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            album_artist: String::new(),
            composer: String::new(),
            genre: String::new(),
            year: 0,
            track: 0,
            relpath: format!("{}/{}/{}.mp3", artist, album, title),
            compilation: false,
            mtime: NOW - 60,
        }
    }

    fn grouping(first: GroupBy, second: GroupBy, third: GroupBy) -> Grouping {
        Grouping::new(first, second, third)
    }

    /// Expands every expandable node against an in-memory backend.
    fn expand_all(model: &mut LibraryModel, songs: &[Song]) {
        loop {
            let mut pending = Vec::new();
            collect_expandable(model, model.root(), &mut pending);
            if pending.is_empty() {
                break;
            }
            for id in pending {
                model
                    .populate_with(id, |query| Ok(run_query_over(songs.iter(), query, NOW)))
                    .unwrap();
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

    /// Structural fingerprint: display text plus recursively fingerprinted
    /// children, independent of node identity.
    fn shape(model: &LibraryModel, id: NodeId) -> String {
        let node = model.node(id).unwrap();
        let tag = match &node.kind {
            NodeKind::Root => "root".to_string(),
            NodeKind::Divider { key } => format!("div:{}", key),
            NodeKind::Container { key, .. } => format!("grp:{}", key),
            NodeKind::CompilationArtist => "various".to_string(),
            NodeKind::Song { song } => format!("song:{}", song.id.0),
        };
        let children: Vec<String> = node
            .children
            .iter()
            .map(|&child| shape(model, child))
            .collect();
        format!("{}[{}]", tag, children.join(","))
    }

    fn find_by_display(model: &LibraryModel, display: &str) -> Option<NodeId> {
        fn walk(model: &LibraryModel, id: NodeId, display: &str) -> Option<NodeId> {
            if model.node(id)?.display == display {
                return Some(id);
            }
            for child in model.children(id) {
                if let Some(found) = walk(model, child, display) {
                    return Some(found);
                }
            }
            None
        }
        walk(model, model.root(), display)
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);
        let before = shape(&model, model.root());

        model.songs_discovered(&songs);
        model.songs_discovered(&songs);

        assert_eq!(shape(&model, model.root()), before);
        assert_eq!(model.known_song_count(), 1);
    }

    #[test]
    fn delete_reverses_insert_on_unpopulated_tree() {
        let songs = vec![
            song(1, "The Beatles", "Abbey Road", "Come Together"),
            song(2, "The Beatles", "Revolver", "Taxman"),
            song(3, "Miles Davis", "Kind of Blue", "So What"),
        ];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        let empty = shape(&model, model.root());

        model.songs_discovered(&songs);
        assert_ne!(shape(&model, model.root()), empty);

        let ids: Vec<SongId> = songs.iter().map(|s| s.id).collect();
        model.songs_deleted(&ids);

        assert_eq!(shape(&model, model.root()), empty);
        assert_eq!(model.known_song_count(), 0);
        assert_eq!(model.node_count(), 1);
    }

    #[test]
    fn delete_reverses_insert_on_expanded_tree() {
        let existing = vec![song(1, "Miles Davis", "Kind of Blue", "So What")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &existing);
        let before = shape(&model, model.root());

        let fresh = vec![
            song(10, "Nina Simone", "Pastel Blues", "Sinnerman"),
            song(11, "Nina Simone", "Pastel Blues", "Ain't No Use"),
        ];
        model.songs_discovered(&fresh);
        assert_ne!(shape(&model, model.root()), before);

        model.songs_deleted(&[SongId(10), SongId(11)]);
        assert_eq!(shape(&model, model.root()), before);
    }

    #[test]
    fn deleting_unknown_id_is_a_silent_noop() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);
        let before = shape(&model, model.root());

        model.songs_deleted(&[SongId(999)]);
        model.songs_deleted(&[SongId(1)]);
        // Duplicate delete of the same id.
        model.songs_deleted(&[SongId(1)]);

        assert_ne!(shape(&model, model.root()), before);
        assert_eq!(model.known_song_count(), 0);
    }

    #[test]
    fn prune_propagates_through_empty_ancestors() {
        let songs = vec![
            song(1, "The Beatles", "Abbey Road", "Come Together"),
            song(2, "The Beatles", "Revolver", "Taxman"),
            song(3, "Miles Davis", "Kind of Blue", "So What"),
        ];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        // Last song of one album: the album goes, the artist stays.
        model.songs_deleted(&[SongId(2)]);
        assert!(find_by_display(&model, "Revolver").is_none());
        assert!(find_by_display(&model, "The Beatles").is_some());

        // Last song of the artist: artist and its "B" divider go too.
        model.songs_deleted(&[SongId(1)]);
        assert!(find_by_display(&model, "The Beatles").is_none());
        assert!(find_by_display(&model, "B").is_none());
        assert!(find_by_display(&model, "Miles Davis").is_some());
        assert!(find_by_display(&model, "M").is_some());
    }

    #[test]
    fn same_album_title_under_different_artists_stays_distinct() {
        let songs = vec![
            song(1, "Foo", "Greatest Hits", "One"),
            song(2, "Bar", "Greatest Hits", "Two"),
        ];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        let foo = find_by_display(&model, "Foo").unwrap();
        let bar = find_by_display(&model, "Bar").unwrap();
        assert_eq!(model.children(foo).len(), 1);
        assert_eq!(model.children(bar).len(), 1);

        let foo_songs = model.child_songs(foo);
        assert_eq!(foo_songs.len(), 1);
        assert_eq!(foo_songs[0].id, SongId(1));
        let bar_songs = model.child_songs(bar);
        assert_eq!(bar_songs.len(), 1);
        assert_eq!(bar_songs[0].id, SongId(2));
    }

    #[test]
    fn query_and_song_paths_build_isomorphic_trees() {
        let mut songs = vec![
            song(1, "The Beatles", "Abbey Road", "Come Together"),
            song(2, "The Beatles", "Revolver", "Taxman"),
            song(3, "Miles Davis", "Kind of Blue", "So What"),
            song(4, "", "Unknown Sessions", "Untitled"),
        ];
        songs[3].artist = String::new();
        let mut compilation = song(5, "Someone", "Now That's Music", "Filler");
        compilation.compilation = true;
        songs.push(compilation);

        for first in [GroupBy::Artist, GroupBy::Genre, GroupBy::Year] {
            let g = grouping(first, GroupBy::Album, GroupBy::None);

            // Bulk path: everything arrives through populate queries.
            let mut bulk = LibraryModel::new(g);
            expand_all(&mut bulk, &songs);

            // Incremental path: discovery first, expansion afterwards.
            let mut incremental = LibraryModel::new(g);
            incremental.songs_discovered(&songs);
            expand_all(&mut incremental, &songs);

            assert_eq!(
                shape(&bulk, bulk.root()),
                shape(&incremental, incremental.root()),
                "grouping {:?}",
                first
            );
        }
    }

    #[test]
    fn compilations_route_to_the_various_artists_node() {
        let mut comp_a = song(1, "Foo", "Now Vol 1", "One");
        comp_a.compilation = true;
        let mut comp_b = song(2, "Bar", "Now Vol 1", "Two");
        comp_b.compilation = true;
        let solo = song(3, "Foo", "Solo Album", "Three");
        let songs = vec![comp_a, comp_b, solo];

        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        let various = find_by_display(&model, "Various Artists").expect("various node");
        let various_songs = model.child_songs(various);
        assert_eq!(various_songs.len(), 2);
        assert!(various_songs.iter().all(|s| s.compilation));

        let foo = find_by_display(&model, "Foo").expect("Foo container");
        let foo_songs = model.child_songs(foo);
        assert_eq!(foo_songs.len(), 1);
        assert_eq!(foo_songs[0].id, SongId(3));

        // The various node sorts before dividers and containers.
        let first_child = model.children(model.root())[0];
        assert_eq!(first_child, various);
    }

    #[test]
    fn various_artists_node_prunes_when_last_compilation_leaves() {
        let mut comp = song(1, "Foo", "Now Vol 1", "One");
        comp.compilation = true;
        let songs = vec![comp];

        let mut model =
            LibraryModel::new(grouping(GroupBy::Artist, GroupBy::None, GroupBy::None));
        expand_all(&mut model, &songs);
        assert!(find_by_display(&model, "Various Artists").is_some());

        model.songs_deleted(&[SongId(1)]);
        assert!(find_by_display(&model, "Various Artists").is_none());
    }

    #[test]
    fn empty_fields_bucket_under_unknown() {
        let mut anon = song(1, "", "", "Mystery Track");
        anon.artist = String::new();
        let songs = vec![anon];

        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        let unknown = find_by_display(&model, "Unknown").expect("unknown container");
        let info = model.node_info(unknown).unwrap();
        assert!(info.is_container);
        assert_eq!(model.child_songs(unknown).len(), 1);

        // Non-alphabetic sort keys land in the catch-all divider.
        assert!(find_by_display(&model, "Other").is_some());
    }

    #[test]
    fn artists_with_and_without_articles_sort_adjacently() {
        let songs = vec![
            song(1, "The Who", "Tommy", "Overture"),
            song(2, "Who", "Who Again", "Intro"),
            song(3, "Aerosmith", "Rocks", "Back in the Saddle"),
        ];
        let mut model =
            LibraryModel::new(grouping(GroupBy::Artist, GroupBy::None, GroupBy::None));
        expand_all(&mut model, &songs);

        let w_divider = find_by_display(&model, "W").expect("W divider");
        let names: Vec<String> = model
            .children(w_divider)
            .iter()
            .map(|&id| model.node(id).unwrap().display.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"The Who".to_string()));
        assert!(names.contains(&"Who".to_string()));
    }

    #[test]
    fn unknown_year_sorts_after_known_years() {
        let mut y1969 = song(1, "A", "Old", "One");
        y1969.year = 1969;
        let mut y2001 = song(2, "B", "New", "Two");
        y2001.year = 2001;
        let unknown = song(3, "C", "Undated", "Three");

        let mut model = LibraryModel::new(grouping(GroupBy::Year, GroupBy::None, GroupBy::None));
        expand_all(&mut model, &[y1969, y2001, unknown]);

        let dividers: Vec<String> = model
            .children(model.root())
            .iter()
            .map(|&id| model.node(id).unwrap().display.clone())
            .collect();
        assert_eq!(dividers, vec!["1960", "2000", "Unknown"]);

        let unknown_divider = find_by_display(&model, "Unknown").unwrap();
        let years: Vec<String> = model
            .children(unknown_divider)
            .iter()
            .map(|&id| model.node(id).unwrap().display.clone())
            .collect();
        assert_eq!(years, vec!["Unknown"]);
    }

    #[test]
    fn year_album_containers_use_pretty_labels() {
        let mut dated = song(1, "A", "Abbey Road", "One");
        dated.year = 1969;
        let undated = song(2, "A", "Bootleg", "Two");

        let mut model =
            LibraryModel::new(grouping(GroupBy::YearAlbum, GroupBy::None, GroupBy::None));
        expand_all(&mut model, &[dated, undated]);

        assert!(find_by_display(&model, "1969 - Abbey Road").is_some());
        assert!(find_by_display(&model, "Bootleg").is_some());
    }

    #[test]
    fn regrouping_rebuilds_like_a_fresh_model() {
        let songs = vec![
            song(1, "The Beatles", "Abbey Road", "Come Together"),
            song(2, "Miles Davis", "Kind of Blue", "So What"),
        ];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        let new_grouping = grouping(GroupBy::Album, GroupBy::None, GroupBy::None);
        model.set_grouping(new_grouping);
        assert_eq!(model.grouping(), new_grouping);
        assert!(model.can_fetch_more(model.root()));
        expand_all(&mut model, &songs);

        let mut fresh = LibraryModel::new(new_grouping);
        expand_all(&mut fresh, &songs);
        assert_eq!(shape(&model, model.root()), shape(&fresh, fresh.root()));
    }

    #[test]
    fn setting_the_same_grouping_is_a_noop() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let g = grouping(GroupBy::Artist, GroupBy::Album, GroupBy::None);
        let mut model = LibraryModel::new(g);
        expand_all(&mut model, &songs);
        let before = shape(&model, model.root());

        model.set_grouping(g);
        assert_eq!(shape(&model, model.root()), before);
        assert!(!model.can_fetch_more(model.root()));
    }

    #[test]
    fn filter_change_resets_and_gates_inserts() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);
        assert_eq!(model.known_song_count(), 1);

        model.set_filter_text("davis");
        assert_eq!(model.options().filter_text, "davis");
        assert_eq!(model.known_song_count(), 0);
        assert!(model.can_fetch_more(model.root()));

        // Discovered songs that miss the filter are skipped outright.
        model.songs_discovered(&songs);
        assert_eq!(model.known_song_count(), 0);

        let matching = vec![song(2, "Miles Davis", "Kind of Blue", "So What")];
        model.songs_discovered(&matching);
        assert_eq!(model.known_song_count(), 1);

        // The age filter gates inserts the same way; the fixture mtimes
        // are ancient relative to the wall clock.
        model.set_filter_text("");
        model.set_filter_age(3600);
        model.songs_discovered(&matching);
        assert_eq!(model.known_song_count(), 0);

        let mut recent = song(3, "Herbie Hancock", "Head Hunters", "Chameleon");
        recent.mtime = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        model.songs_discovered(&[recent]);
        assert_eq!(model.known_song_count(), 1);
    }

    #[test]
    fn populate_failure_leaves_the_node_retryable() {
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        let root = model.root();
        let result = model.populate_with(root, |_| Err(QueryError::new("backend down")));
        assert!(result.is_err());
        assert!(model.can_fetch_more(root));

        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        model
            .populate_with(root, |query| Ok(run_query_over(songs.iter(), query, NOW)))
            .unwrap();
        assert!(!model.can_fetch_more(root));
        assert_eq!(model.children(root).len(), 1);
    }

    #[test]
    fn stale_populate_reply_is_dropped_after_reset() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        model
            .populate_with(model.root(), |query| {
                Ok(run_query_over(songs.iter(), query, NOW))
            })
            .unwrap();
        let beatles = find_by_display(&model, "The Beatles").unwrap();

        let query = model.begin_populate(beatles).expect("query");
        let rows = run_query_over(songs.iter(), &query, NOW);

        model.reset();
        model.apply_populate(beatles, &rows);

        assert!(model.node(beatles).is_none());
        assert_eq!(model.node_count(), 1);
    }

    #[test]
    fn empty_populate_result_removes_the_container() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        model
            .populate_with(model.root(), |query| {
                Ok(run_query_over(songs.iter(), query, NOW))
            })
            .unwrap();
        let beatles = find_by_display(&model, "The Beatles").unwrap();

        // The backend lost the songs while the node sat unpopulated.
        model
            .populate_with(beatles, |_| Ok(Vec::new()))
            .unwrap();

        assert!(model.node(beatles).is_none());
        assert!(find_by_display(&model, "B").is_none());
    }

    #[test]
    fn flat_grouping_parks_songs_directly_under_root() {
        let songs = vec![
            song(1, "The Beatles", "Abbey Road", "Come Together"),
            song(2, "Miles Davis", "Kind of Blue", "So What"),
        ];
        let mut model =
            LibraryModel::new(grouping(GroupBy::None, GroupBy::None, GroupBy::None));
        expand_all(&mut model, &songs);

        let children = model.children(model.root());
        assert_eq!(children.len(), 2);
        assert!(children
            .iter()
            .all(|&id| model.node(id).unwrap().song().is_some()));

        model.songs_deleted(&[SongId(1), SongId(2)]);
        assert!(model.children(model.root()).is_empty());
    }

    #[test]
    fn drag_flags_follow_populate_state() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        model
            .populate_with(model.root(), |query| {
                Ok(run_query_over(songs.iter(), query, NOW))
            })
            .unwrap();

        let beatles = find_by_display(&model, "The Beatles").unwrap();
        assert!(!model.node_info(beatles).unwrap().draggable);

        model
            .populate_with(beatles, |query| {
                Ok(run_query_over(songs.iter(), query, NOW))
            })
            .unwrap();
        assert!(model.node_info(beatles).unwrap().draggable);

        let divider = find_by_display(&model, "B").unwrap();
        assert!(!model.node_info(divider).unwrap().draggable);
    }

    #[test]
    fn removal_events_precede_the_mutation() {
        let songs = vec![song(1, "The Beatles", "Abbey Road", "Come Together")];
        let mut model = LibraryModel::new(grouping(
            GroupBy::Artist,
            GroupBy::Album,
            GroupBy::None,
        ));
        expand_all(&mut model, &songs);

        let mut events = model.subscribe();
        model.songs_deleted(&[SongId(1)]);

        let mut removals = 0;
        while let Ok(event) = events.try_recv() {
            if let ModelEvent::NodesAboutToBeRemoved { .. } = event {
                removals += 1;
            }
        }
        // Song, album container, artist container, divider.
        assert_eq!(removals, 4);
    }
}
