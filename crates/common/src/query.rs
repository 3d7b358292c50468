use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{GroupBy, Song};

/// Separates components inside composite group keys.
pub const KEY_SEP: char = '\x1f';

/// Group key of the synthetic various-artists bucket. Starts with the key
/// separator so it can never collide with a case-folded artist name.
pub const VARIOUS_KEY: &str = "\u{1f}various";

pub fn casefold(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Free-text and recency filters applied to every query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub filter_text: String,
    /// Maximum age in seconds; negative disables the filter.
    pub max_age_secs: i64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            filter_text: String::new(),
            max_age_secs: -1,
        }
    }
}

/// Equality constraint contributed by one ancestor container.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Field {
        group: GroupBy,
        key: String,
        /// Set for first-level artist containers, whose compilation songs
        /// live under the various-artists bucket instead.
        exclude_compilations: bool,
    },
    /// The various-artists bucket: matches compilation songs only.
    Compilations,
}

/// One backend query: distinct group rows for `level`, or matching songs
/// when `level` is `GroupBy::None`. The level index in the tree equals
/// `predicates.len()` since every ancestor container adds exactly one
/// predicate.
#[derive(Clone, Debug)]
pub struct LibraryQuery {
    pub level: GroupBy,
    pub predicates: Vec<Predicate>,
    pub options: QueryOptions,
}

impl LibraryQuery {
    pub fn level_index(&self) -> usize {
        self.predicates.len()
    }
}

/// One query result row. Group queries fill the metadata fields only; song
/// queries also carry the full record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRow {
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub composer: String,
    pub genre: String,
    pub year: i32,
    pub compilation: bool,
    pub song: Option<Song>,
}

impl QueryRow {
    pub fn from_song(song: &Song) -> Self {
        Self {
            artist: song.artist.clone(),
            album: song.album.clone(),
            album_artist: song.album_artist.clone(),
            composer: song.composer.clone(),
            genre: song.genre.clone(),
            year: song.year,
            compilation: song.compilation,
            song: None,
        }
    }

    pub fn with_song(song: &Song) -> Self {
        let mut row = Self::from_song(song);
        row.song = Some(song.clone());
        row
    }
}

#[derive(Debug)]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query error: {}", self.message)
    }
}

impl std::error::Error for QueryError {}

fn clamp_year(year: i32) -> i32 {
    year.clamp(0, 9999)
}

/// Group key for one dimension, ignoring compilation routing.
fn field_key(group: GroupBy, row: &QueryRow) -> String {
    match group {
        GroupBy::None => String::new(),
        GroupBy::Artist => casefold(&row.artist),
        GroupBy::Album => casefold(&row.album),
        GroupBy::YearAlbum => format!(
            "{:04}{}{}",
            clamp_year(row.year),
            KEY_SEP,
            casefold(&row.album)
        ),
        GroupBy::Year => format!("{:04}", clamp_year(row.year)),
        GroupBy::Composer => casefold(&row.composer),
        GroupBy::Genre => casefold(&row.genre),
    }
}

/// Group key a song maps to at one tree level. Compilation songs collapse
/// into the various-artists bucket at the first level of Artist grouping.
pub fn level_key(group: GroupBy, row: &QueryRow, level_index: usize) -> String {
    if level_index == 0 && group == GroupBy::Artist && row.compilation {
        return VARIOUS_KEY.to_string();
    }
    field_key(group, row)
}

pub fn matches_options(song: &Song, options: &QueryOptions, now_secs: i64) -> bool {
    if options.max_age_secs >= 0 && song.mtime < now_secs - options.max_age_secs {
        return false;
    }
    let filter = options.filter_text.trim();
    if filter.is_empty() {
        return true;
    }
    let needle = filter.to_lowercase();
    [
        &song.title,
        &song.artist,
        &song.album,
        &song.album_artist,
        &song.composer,
        &song.genre,
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(&needle))
}

fn matches_predicate(song: &Song, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Compilations => song.compilation,
        Predicate::Field {
            group,
            key,
            exclude_compilations,
        } => {
            if *exclude_compilations && song.compilation {
                return false;
            }
            field_key(*group, &QueryRow::from_song(song)) == *key
        }
    }
}

/// Reference evaluation of a `LibraryQuery` over a set of songs. The store
/// feeds its persisted records through this; tests feed plain vectors.
pub fn run_query_over<'a, I>(songs: I, query: &LibraryQuery, now_secs: i64) -> Vec<QueryRow>
where
    I: IntoIterator<Item = &'a Song>,
{
    let level_index = query.level_index();
    let mut songs_out = Vec::new();
    let mut groups: BTreeMap<String, QueryRow> = BTreeMap::new();

    for song in songs {
        if !matches_options(song, &query.options, now_secs) {
            continue;
        }
        if !query
            .predicates
            .iter()
            .all(|predicate| matches_predicate(song, predicate))
        {
            continue;
        }

        if query.level == GroupBy::None {
            songs_out.push(QueryRow::with_song(song));
        } else {
            let key = level_key(query.level, &QueryRow::from_song(song), level_index);
            groups
                .entry(key)
                .or_insert_with(|| QueryRow::from_song(song));
        }
    }

    if query.level == GroupBy::None {
        songs_out
    } else {
        groups.into_values().collect()
    }
}
