use serde::{Deserialize, Serialize};

pub mod events;
pub mod query;

pub use events::{BackendRequest, LibraryEvent};
pub use query::{
    casefold, level_key, matches_options, run_query_over, LibraryQuery, Predicate, QueryError,
    QueryOptions, QueryRow, KEY_SEP, VARIOUS_KEY,
};

/// Stable store-assigned identifier for one song.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SongId(pub u64);

impl std::fmt::Display for SongId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable metadata for one media item. An update is modeled as
/// remove-old + insert-new; nothing mutates a `Song` in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: SongId,
    pub title: String,
    pub artist: String,
    pub album: String,
    #[serde(default)]
    pub album_artist: String,
    #[serde(default)]
    pub composer: String,
    #[serde(default)]
    pub genre: String,
    /// 0 = unknown.
    pub year: i32,
    /// 0 = unknown.
    pub track: u32,
    pub relpath: String,
    #[serde(default)]
    pub compilation: bool,
    /// Unix seconds; drives the recency filter.
    pub mtime: i64,
}

/// Grouping dimensions. The numeric codes are persisted in saved
/// configuration - don't change them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum GroupBy {
    None = 0,
    Artist = 1,
    Album = 2,
    YearAlbum = 3,
    Year = 4,
    Composer = 5,
    Genre = 6,
}

impl GroupBy {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(GroupBy::None),
            1 => Some(GroupBy::Artist),
            2 => Some(GroupBy::Album),
            3 => Some(GroupBy::YearAlbum),
            4 => Some(GroupBy::Year),
            5 => Some(GroupBy::Composer),
            6 => Some(GroupBy::Genre),
            _ => None,
        }
    }
}

impl From<GroupBy> for i32 {
    fn from(group: GroupBy) -> Self {
        group.code()
    }
}

impl TryFrom<i32> for GroupBy {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        GroupBy::from_code(code).ok_or_else(|| format!("unknown GroupBy code: {}", code))
    }
}

/// The active tree shape: up to three nested grouping dimensions.
/// `None` at a position means "stop nesting here".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub first: GroupBy,
    pub second: GroupBy,
    pub third: GroupBy,
}

impl Grouping {
    pub fn new(first: GroupBy, second: GroupBy, third: GroupBy) -> Self {
        Self {
            first,
            second,
            third,
        }
    }

    pub fn level(&self, index: usize) -> GroupBy {
        match index {
            0 => self.first,
            1 => self.second,
            _ => self.third,
        }
    }
}

impl Default for Grouping {
    fn default() -> Self {
        Self::new(GroupBy::Artist, GroupBy::Album, GroupBy::None)
    }
}

impl std::ops::Index<usize> for Grouping {
    type Output = GroupBy;

    fn index(&self, index: usize) -> &GroupBy {
        match index {
            0 => &self.first,
            1 => &self.second,
            2 => &self.third,
            _ => panic!("grouping index out of range: {}", index),
        }
    }
}

/// Derives the store-assigned numeric id from a song's relative path.
/// Stable across rescans as long as the file does not move.
pub fn stable_song_id(relpath: &str) -> SongId {
    let hash = blake3::hash(relpath.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    SongId(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::{stable_song_id, GroupBy, Grouping};

    #[test]
    fn stable_song_id_is_deterministic() {
        let first = stable_song_id("Artist/Album/01 Track.mp3");
        let second = stable_song_id("Artist/Album/01 Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_song_id("Artist/Album/02 Track.mp3"));
    }

    #[test]
    fn group_by_codes_are_stable() {
        assert_eq!(GroupBy::None.code(), 0);
        assert_eq!(GroupBy::Artist.code(), 1);
        assert_eq!(GroupBy::Album.code(), 2);
        assert_eq!(GroupBy::YearAlbum.code(), 3);
        assert_eq!(GroupBy::Year.code(), 4);
        assert_eq!(GroupBy::Composer.code(), 5);
        assert_eq!(GroupBy::Genre.code(), 6);
        for code in 0..=6 {
            assert_eq!(GroupBy::from_code(code).unwrap().code(), code);
        }
        assert!(GroupBy::from_code(7).is_none());
    }

    #[test]
    fn grouping_indexes_all_levels() {
        let grouping = Grouping::new(GroupBy::Genre, GroupBy::Year, GroupBy::Album);
        assert_eq!(grouping[0], GroupBy::Genre);
        assert_eq!(grouping[1], GroupBy::Year);
        assert_eq!(grouping[2], GroupBy::Album);
        assert_eq!(grouping.level(1), GroupBy::Year);
    }
}
