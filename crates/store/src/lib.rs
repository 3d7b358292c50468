use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{run_query_over, stable_song_id, LibraryQuery, QueryRow, Song, SongId};
use metadata::{read_tags, TagInfo};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use tracing::{info, warn};
use walkdir::WalkDir;

pub mod watch;
pub mod worker;

const INDEX_VERSION: u32 = 1;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SONGS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("songs");

const META_VERSION_KEY: &str = "version";

/// Persistent song table under a music root. Queries run against the
/// persisted records; scans diff the filesystem against the table and
/// report what appeared and what went away.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    db: Arc<Database>,
}

/// Result of one scan: what changed, plus the total after the scan.
#[derive(Clone, Debug, Default)]
pub struct ScanOutcome {
    pub discovered: Vec<Song>,
    pub deleted: Vec<SongId>,
    pub total: usize,
}

impl Store {
    /// Opens (or creates) the index database. A version mismatch clears
    /// the song table so the next scan rebuilds it.
    pub fn open(root: PathBuf, db_path: &Path) -> Result<Self, StoreError> {
        let db = open_or_create_db(db_path)?;
        let store = Self {
            root,
            db: Arc::new(db),
        };

        match store.read_version()? {
            Some(version) if version == INDEX_VERSION => {
                info!("Loaded index from {:?}", db_path);
            }
            Some(version) => {
                warn!("Index version mismatch ({}); clearing", version);
                store.clear()?;
            }
            None => {
                store.clear()?;
            }
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the music root and diffs it against the persisted table.
    /// New and changed files surface as discoveries; a changed file also
    /// surfaces a deletion of its previous record first.
    pub fn rescan(&self) -> Result<ScanOutcome, StoreError> {
        let on_disk = scan_files(&self.root);

        let mut existing: HashMap<SongId, Song> = HashMap::new();
        for song in self.songs()? {
            existing.insert(song.id, song);
        }

        let mut outcome = ScanOutcome::default();
        let mut seen: Vec<SongId> = Vec::new();
        for song in on_disk {
            seen.push(song.id);
            match existing.get(&song.id) {
                Some(previous) if *previous == song => {}
                Some(_) => {
                    outcome.deleted.push(song.id);
                    outcome.discovered.push(song);
                }
                None => outcome.discovered.push(song),
            }
        }
        let seen: std::collections::HashSet<SongId> = seen.into_iter().collect();
        for id in existing.keys() {
            if !seen.contains(id) {
                outcome.deleted.push(*id);
            }
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut songs_table = write_txn.open_table(SONGS_TABLE)?;
            for id in &outcome.deleted {
                songs_table.remove(id.0)?;
            }
            for song in &outcome.discovered {
                let bytes = bincode::serialize(song)?;
                songs_table.insert(song.id.0, bytes.as_slice())?;
            }
            outcome.total = songs_table.len()? as usize;

            let mut meta_table = write_txn.open_table(META_TABLE)?;
            let version_bytes = bincode::serialize(&INDEX_VERSION)?;
            meta_table.insert(META_VERSION_KEY, version_bytes.as_slice())?;
        }
        write_txn.commit()?;

        Ok(outcome)
    }

    /// Answers one backend query against the persisted records.
    pub fn run_query(&self, query: &LibraryQuery) -> Result<Vec<QueryRow>, StoreError> {
        let songs = self.songs()?;
        Ok(run_query_over(songs.iter(), query, now_secs()))
    }

    pub fn songs(&self) -> Result<Vec<Song>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(SONGS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut songs = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let song: Song = bincode::deserialize(entry.1.value())?;
            songs.push(song);
        }
        Ok(songs)
    }

    pub fn song_count(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(SONGS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(table.len()? as usize)
    }

    fn read_version(&self) -> Result<Option<u32>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(META_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let version = match table.get(META_VERSION_KEY)? {
            Some(value) => Some(bincode::deserialize(value.value())?),
            None => None,
        };
        Ok(version)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        match write_txn.delete_table(SONGS_TABLE) {
            Ok(_) => {}
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(err) => return Err(err.into()),
        }
        {
            let mut meta_table = write_txn.open_table(META_TABLE)?;
            let version_bytes = bincode::serialize(&INDEX_VERSION)?;
            meta_table.insert(META_VERSION_KEY, version_bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn scan_files(root: &Path) -> Vec<Song> {
    let mut songs = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_audio_file(path) {
            continue;
        }
        let relpath = match relpath_from(root, path) {
            Some(rel) => rel,
            None => continue,
        };
        // Unreadable tags never drop a file from the index; it is indexed
        // with whatever fields are left.
        let tag = match read_tags(path) {
            Ok(tag) => tag,
            Err(err) => {
                warn!("Failed to read tags for {:?}: {}", path, err);
                TagInfo::default()
            }
        };
        songs.push(song_from_tag(path, relpath, tag));
    }
    songs.sort_by(|a, b| a.relpath.cmp(&b.relpath));
    songs
}

fn song_from_tag(path: &Path, relpath: String, tag: TagInfo) -> Song {
    let mtime = fs::metadata(path)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .map(|time| {
            time.duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0))
                .as_secs() as i64
        })
        .unwrap_or(0);

    Song {
        id: stable_song_id(&relpath),
        title: tag.title.unwrap_or_else(|| file_stem(path)),
        artist: tag.artist.unwrap_or_default(),
        album: tag.album.unwrap_or_default(),
        album_artist: tag.album_artist.unwrap_or_default(),
        composer: tag.composer.unwrap_or_default(),
        genre: tag.genre.unwrap_or_default(),
        year: tag.year.unwrap_or(0),
        track: tag.track_no.unwrap_or(0),
        relpath,
        compilation: tag.compilation,
        mtime,
    }
}

fn is_audio_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            matches!(ext.as_str(), "mp3" | "flac")
        }
        None => false,
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}
