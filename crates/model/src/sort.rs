//! Sort-key and divider-key computation. Pure functions; the tree never
//! stores raw text in an ordering-sensitive place without passing it
//! through here first.

use common::GroupBy;

/// Sorts after every printable string. Used for unknown artists and
/// unknown years, which belong at the end of their siblings.
pub const UNKNOWN_SORT: &str = "\u{10ffff}";

const ARTICLES: &[&str] = &["the ", "a ", "an "];

/// Lower-cases, folds common diacritics, strips punctuation and collapses
/// whitespace.
pub fn sort_text(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            'œ' | 'Œ' => folded.push_str("oe"),
            'æ' | 'Æ' => folded.push_str("ae"),
            _ => folded.push(fold_char(ch)),
        }
    }

    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for ch in folded.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Artist ordering additionally ignores a leading English article, so
/// "The Beatles" sorts under "beatles".
pub fn sort_text_for_artist(artist: &str) -> String {
    let mut key = sort_text(artist);
    for article in ARTICLES {
        if key.starts_with(article) {
            key = key[article.len()..].to_string();
            break;
        }
    }
    if key.is_empty() {
        UNKNOWN_SORT.to_string()
    } else {
        key
    }
}

/// Zero-pads known years so lexicographic order equals numeric order.
/// Year 0 (unknown) sorts after every known year.
pub fn sort_text_for_year(year: i32) -> String {
    if year <= 0 {
        UNKNOWN_SORT.to_string()
    } else {
        format!("{:04}", year.min(9999))
    }
}

/// Songs order by track number, then normalized title.
pub fn sort_text_for_song(track: u32, title: &str) -> String {
    format!("{:04} {}", track.min(9999), sort_text(title))
}

/// Empty or whitespace-only values render as a fixed label, never as an
/// empty string.
pub fn text_or_unknown(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn pretty_year_album(year: i32, album: &str) -> String {
    if year <= 0 {
        text_or_unknown(album)
    } else {
        format!("{} - {}", year, text_or_unknown(album))
    }
}

/// Divider bucket for a container, or `None` for dimensions that do not
/// use dividers. Artist buckets by first letter; Year and YearAlbum bucket
/// by decade.
pub fn divider_key(group: GroupBy, sort_key: &str, year: i32) -> Option<String> {
    match group {
        GroupBy::Artist => Some(letter_bucket(sort_key)),
        GroupBy::Year | GroupBy::YearAlbum => Some(decade_bucket(year)),
        _ => None,
    }
}

pub fn divider_display_text(group: GroupBy, key: &str) -> String {
    match group {
        GroupBy::Artist => match key {
            "0" => "0-9".to_string(),
            "other" => "Other".to_string(),
            _ => key.to_uppercase(),
        },
        GroupBy::Year | GroupBy::YearAlbum => {
            if key == "unknown" {
                "Unknown".to_string()
            } else {
                key.trim_start_matches('0').to_string()
            }
        }
        _ => key.to_string(),
    }
}

/// Ordering key for a divider among its siblings; the catch-all buckets
/// sort last.
pub fn divider_sort_key(key: &str) -> String {
    if key == "other" || key == "unknown" {
        UNKNOWN_SORT.to_string()
    } else {
        key.to_string()
    }
}

fn letter_bucket(sort_key: &str) -> String {
    match sort_key.chars().next() {
        Some(ch) if ch.is_ascii_digit() => "0".to_string(),
        Some(ch) if ch.is_ascii_alphabetic() => ch.to_string(),
        _ => "other".to_string(),
    }
}

fn decade_bucket(year: i32) -> String {
    if year <= 0 {
        "unknown".to_string()
    } else {
        format!("{:04}", (year.min(9999) / 10) * 10)
    }
}

fn fold_char(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' | 'À' | 'Á' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'a',
        'ç' | 'Ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => 'i',
        'ñ' | 'Ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' | 'Ò' | 'Ó' | 'Ô' | 'Ö' | 'Õ' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => 'u',
        'ý' | 'ÿ' | 'Ý' => 'y',
        _ => ch,
    }
}
