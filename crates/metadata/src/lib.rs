use std::path::Path;

use lofty::error::LoftyError;
use lofty::prelude::{ItemKey, TaggedFileExt};

#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub composer: Option<String>,
    pub genre: Option<String>,
    pub track_no: Option<u32>,
    pub year: Option<i32>,
    pub compilation: bool,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;

    let mut info = TagInfo::default();

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        info.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        let album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        let track_artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
        info.artist = track_artist.or_else(|| album_artist.clone());
        info.album_artist = album_artist;
        info.composer = tag.get_string(&ItemKey::Composer).map(|v| v.to_string());
        info.genre = tag.get_string(&ItemKey::Genre).map(|v| v.to_string());
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u32);
        info.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
        info.compilation = tag
            .get_string(&ItemKey::FlagCompilation)
            .map(is_truthy)
            .unwrap_or(false);
    }

    Ok(info)
}

fn parse_u32(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn is_truthy(text: &str) -> bool {
    matches!(text.trim(), "1" | "true" | "True" | "TRUE" | "yes")
}

#[cfg(test)]
mod tests {
    use super::{is_truthy, parse_u32, parse_year};

    #[test]
    fn track_numbers_drop_the_total_suffix() {
        assert_eq!(parse_u32("3/12"), Some(3));
        assert_eq!(parse_u32(" 7 "), Some(7));
        assert_eq!(parse_u32("abc"), None);
    }

    #[test]
    fn years_take_the_first_four_digit_run() {
        assert_eq!(parse_year("1969"), Some(1969));
        assert_eq!(parse_year("1969-09-26"), Some(1969));
        assert_eq!(parse_year("no date"), None);
    }

    #[test]
    fn compilation_flags_accept_common_spellings() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(!is_truthy("0"));
    }
}
