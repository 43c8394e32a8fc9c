//! Release-name parsing for library layout.
//!
//! Torrent names carry quality and codec noise; these parsers extract the
//! clean title, year, and episode coordinates used to place output files in
//! the layout the library managers expect.

use once_cell::sync::Lazy;
use regex::Regex;

static QUALITY_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(1080p|720p|2160p|4K|UHD|BluRay|WEBRip|WEB-DL|REMUX|HDTV).*$")
        .expect("valid pattern")
});
static CODEC_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(x264|x265|HEVC|H\.264|H\.265).*$").expect("valid pattern"));
static BRACKETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]").expect("valid pattern"));
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid pattern"));
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[._]").expect("valid pattern"));
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid pattern"));
static TRAILING_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\-()]+$").expect("valid pattern"));

static EPISODE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)^(.+?)[ ._]+S(\d{1,2})[ ._]?E(\d{1,2})").expect("valid pattern"),
        Regex::new(r"(?i)^(.+?)[ ._]+(\d{1,2})x(\d{2})").expect("valid pattern"),
        Regex::new(r"(?i)^(.+?)[ ._]+Season[ ._]*(\d+).*?Episode[ ._]*(\d+)")
            .expect("valid pattern"),
    ]
});

/// Extract a movie title and release year from a torrent name.
///
/// The year must fall in `[1900, 2099]`; dots and underscores normalise to
/// spaces, and quality/codec suffixes are trimmed.
#[must_use]
pub fn parse_movie_name(torrent_name: &str) -> (String, Option<String>) {
    let mut name = torrent_name.to_string();
    name = QUALITY_NOISE.replace(&name, "").into_owned();
    name = CODEC_NOISE.replace(&name, "").into_owned();
    name = BRACKETS.replace_all(&name, "").into_owned();

    let year = YEAR
        .captures(&name)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string());
    if let Some(year) = &year {
        name = name.replace(year, "");
    }

    let mut title = SEPARATORS.replace_all(&name, " ").into_owned();
    title = MULTI_SPACE.replace_all(&title, " ").trim().to_string();
    title = TRAILING_PUNCT.replace(&title, "").trim().to_string();

    (title, year)
}

/// Extract show name, season, and episode from a torrent name; `None` when
/// the name does not look like a TV episode.
#[must_use]
pub fn parse_tv_episode(torrent_name: &str) -> Option<(String, u32, u32)> {
    for pattern in EPISODE_PATTERNS.iter() {
        let Some(captures) = pattern.captures(torrent_name) else {
            continue;
        };
        let season: u32 = captures.get(2)?.as_str().parse().ok()?;
        let episode: u32 = captures.get(3)?.as_str().parse().ok()?;

        let raw_show = captures.get(1)?.as_str();
        let mut show = SEPARATORS.replace_all(raw_show, " ").into_owned();
        show = MULTI_SPACE.replace_all(&show, " ").trim().to_string();
        if show.is_empty() {
            return None;
        }
        return Some((show, season, episode));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movie_names_with_dots_and_quality_noise() {
        assert_eq!(
            parse_movie_name("Good.Will.Hunting.1997.1080p.BluRay.x264"),
            ("Good Will Hunting".to_string(), Some("1997".to_string()))
        );
        assert_eq!(
            parse_movie_name("Kung Fu Panda 2008 UHD"),
            ("Kung Fu Panda".to_string(), Some("2008".to_string()))
        );
    }

    #[test]
    fn movie_names_without_year() {
        let (title, year) = parse_movie_name("Some Obscure Film REMUX");
        assert_eq!(title, "Some Obscure Film");
        assert!(year.is_none());
    }

    #[test]
    fn bracketed_release_groups_are_stripped() {
        let (title, year) = parse_movie_name("[GroupTag] Spirited Away 2001 1080p");
        assert_eq!(title, "Spirited Away");
        assert_eq!(year.as_deref(), Some("2001"));
    }

    #[test]
    fn years_outside_range_are_not_years() {
        let (title, year) = parse_movie_name("Cyber City 2199");
        assert_eq!(title, "Cyber City 2199");
        assert!(year.is_none());
    }

    #[test]
    fn tv_episode_standard_format() {
        assert_eq!(
            parse_tv_episode("The Office US S09E22 1080p"),
            Some(("The Office US".to_string(), 9, 22))
        );
        assert_eq!(
            parse_tv_episode("Jujutsu.Kaisen.S03E04.1080p.WEBRip"),
            Some(("Jujutsu Kaisen".to_string(), 3, 4))
        );
    }

    #[test]
    fn tv_episode_alternate_formats() {
        assert_eq!(
            parse_tv_episode("Archer 7x04 HDTV"),
            Some(("Archer".to_string(), 7, 4))
        );
        assert_eq!(
            parse_tv_episode("Show Name Season 2 Episode 11"),
            Some(("Show Name".to_string(), 2, 11))
        );
    }

    #[test]
    fn movies_are_not_tv_episodes() {
        assert!(parse_tv_episode("Good.Will.Hunting.1997.1080p").is_none());
        assert!(parse_tv_episode("Random string").is_none());
    }
}
