//! Release-name and payload-file heuristics shared by the search, download
//! and recovery workers.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Resolution;

/// Extensions accepted when selecting the main video file.
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "ts", "mov", "wmv", "flv"];

/// Minimum size for a file to qualify as the main video (100 MiB).
pub const MIN_MAIN_VIDEO_BYTES: u64 = 100 * 1_024 * 1_024;

/// Significant-word overlap required for recovery to adopt a torrent.
pub const RECOVERY_MATCH_THRESHOLD: f64 = 0.8;

static EPISODE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)s(\d{1,2})[ ._-]*e(\d{1,3})").expect("episode marker pattern")
});

static RESOLUTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(2160p|4k|1080p|720p|480p)\b").expect("resolution pattern"));

/// A parsed `SxxEyy` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeMarker {
    /// Season number.
    pub season: i32,
    /// Episode number.
    pub episode: i32,
}

/// Every `SxxEyy` marker found in a release or file name, tolerant of
/// `.`/`_`/`-`/space separators between the season and episode parts.
#[must_use]
pub fn episode_markers(name: &str) -> Vec<EpisodeMarker> {
    EPISODE_MARKER
        .captures_iter(name)
        .filter_map(|captures| {
            let season = captures.get(1)?.as_str().parse().ok()?;
            let episode = captures.get(2)?.as_str().parse().ok()?;
            Some(EpisodeMarker { season, episode })
        })
        .collect()
}

/// Whether `name` carries a marker for exactly the given season/episode.
#[must_use]
pub fn matches_episode(name: &str, season: i32, episode: i32) -> bool {
    episode_markers(name)
        .iter()
        .any(|marker| marker.season == season && marker.episode == episode)
}

/// Classify a TV release title as a season pack.
///
/// Titles with no episode marker (plain season releases) or with five or more
/// markers (multi-episode bundles) are treated as packs; one to four markers
/// mean individual-episode releases.
#[must_use]
pub fn is_season_pack(title: &str) -> bool {
    let markers = episode_markers(title).len();
    markers == 0 || markers >= 5
}

/// Resolution advertised in a release title, when recognisable.
#[must_use]
pub fn detect_resolution(title: &str) -> Option<Resolution> {
    let capture = RESOLUTION_MARKER.captures(title)?;
    match capture.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "2160p" | "4k" => Some(Resolution::Uhd2160),
        "1080p" => Some(Resolution::Hd1080),
        "720p" => Some(Resolution::Hd720),
        "480p" => Some(Resolution::Sd480),
        _ => None,
    }
}

/// Whether the file extension is in the accepted video set.
#[must_use]
pub fn is_video_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Select the main video file from a torrent payload: the largest file with a
/// whitelisted extension, at least [`MIN_MAIN_VIDEO_BYTES`] large, excluding
/// samples.
#[must_use]
pub fn select_main_video<'a, F>(
    files: &'a [crate::adapters::TorrentFileEntry],
    is_sample: F,
) -> Option<&'a crate::adapters::TorrentFileEntry>
where
    F: Fn(&str) -> bool,
{
    files
        .iter()
        .filter(|file| is_video_file(&file.name))
        .filter(|file| file.size_bytes >= MIN_MAIN_VIDEO_BYTES)
        .filter(|file| !is_sample(&file.name))
        .max_by_key(|file| file.size_bytes)
}

/// Locate the file for a specific episode inside a season-pack payload.
#[must_use]
pub fn find_episode_file<'a, F>(
    files: &'a [crate::adapters::TorrentFileEntry],
    season: i32,
    episode: i32,
    is_sample: F,
) -> Option<&'a crate::adapters::TorrentFileEntry>
where
    F: Fn(&str) -> bool,
{
    files
        .iter()
        .filter(|file| is_video_file(&file.name))
        .filter(|file| !is_sample(&file.name))
        .filter(|file| matches_episode(&file.name, season, episode))
        .max_by_key(|file| file.size_bytes)
}

/// Lowercase a name and collapse every non-alphanumeric run into one space.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_owned()
}

/// Significant words (length ≥ 3) of a normalised name.
#[must_use]
pub fn significant_words(name: &str) -> Vec<String> {
    normalize_name(name)
        .split(' ')
        .filter(|word| word.len() >= 3)
        .map(str::to_owned)
        .collect()
}

/// Share of the release's significant words also present in the candidate
/// torrent name. Returns 0 when the release has no significant words.
#[must_use]
pub fn name_similarity(release_title: &str, torrent_name: &str) -> f64 {
    let release_words = significant_words(release_title);
    if release_words.is_empty() {
        return 0.0;
    }
    let torrent_words: std::collections::HashSet<String> =
        significant_words(torrent_name).into_iter().collect();
    let shared = release_words
        .iter()
        .filter(|word| torrent_words.contains(*word))
        .count();
    #[allow(clippy::cast_precision_loss)]
    {
        shared as f64 / release_words.len() as f64
    }
}

/// Derive a codec label from an encoder name (e.g. `hevc-nvenc-01` → `hevc`).
#[must_use]
pub fn codec_from_encoder(encoder_name: &str) -> Option<String> {
    let lower = encoder_name.to_ascii_lowercase();
    if lower.contains("hevc") || lower.contains("x265") || lower.contains("h265") {
        Some("hevc".to_owned())
    } else if lower.contains("av1") {
        Some("av1".to_owned())
    } else if lower.contains("x264") || lower.contains("h264") || lower.contains("avc") {
        Some("h264".to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::TorrentFileEntry;

    fn file(name: &str, size_bytes: u64) -> TorrentFileEntry {
        TorrentFileEntry {
            name: name.to_owned(),
            size_bytes,
        }
    }

    #[test]
    fn episode_markers_tolerate_separators() {
        assert!(matches_episode("Show.S01E03.1080p.mkv", 1, 3));
        assert!(matches_episode("Show S01 E03", 1, 3));
        assert!(matches_episode("show.s01_e03.mkv", 1, 3));
        assert!(matches_episode("Show.S1E3.mkv", 1, 3));
        assert!(!matches_episode("Show.S01E04.mkv", 1, 3));
        assert!(!matches_episode("Show.1080p.mkv", 1, 3));
    }

    #[test]
    fn season_pack_classification() {
        assert!(is_season_pack("Show.S01.1080p.WEB-DL"));
        assert!(is_season_pack(
            "Show.S01E01.S01E02.S01E03.S01E04.S01E05.Bundle"
        ));
        assert!(!is_season_pack("Show.S01E03.1080p.WEB-DL"));
    }

    #[test]
    fn resolution_detection() {
        assert_eq!(detect_resolution("Movie.2160p.UHD"), Some(Resolution::Uhd2160));
        assert_eq!(detect_resolution("Movie 4K HDR"), Some(Resolution::Uhd2160));
        assert_eq!(detect_resolution("Movie.1080p.BluRay"), Some(Resolution::Hd1080));
        assert_eq!(detect_resolution("Movie.720p"), Some(Resolution::Hd720));
        assert_eq!(detect_resolution("Movie.DVDRip"), None);
    }

    #[test]
    fn main_video_selection_prefers_largest_non_sample() {
        let files = vec![
            file("Movie.2010.1080p/sample/sample.mkv", 200 * 1_024 * 1_024),
            file("Movie.2010.1080p/movie.mkv", 2 * 1_024 * 1_024 * 1_024),
            file("Movie.2010.1080p/extras.mp4", 150 * 1_024 * 1_024),
            file("Movie.2010.1080p/cover.jpg", 500 * 1_024),
            file("Movie.2010.1080p/tiny.mkv", 50 * 1_024 * 1_024),
        ];
        let selected = select_main_video(&files, |name| name.contains("sample"));
        assert_eq!(
            selected.map(|f| f.name.as_str()),
            Some("Movie.2010.1080p/movie.mkv")
        );
    }

    #[test]
    fn episode_file_lookup_inside_pack() {
        let files = vec![
            file("Show.S01/Show.S01E01.mkv", 900 * 1_024 * 1_024),
            file("Show.S01/Show.S01E03.mkv", 910 * 1_024 * 1_024),
            file("Show.S01/Show.S01E03.sample.mkv", 200 * 1_024 * 1_024),
        ];
        let found = find_episode_file(&files, 1, 3, |name| name.contains("sample"));
        assert_eq!(
            found.map(|f| f.name.as_str()),
            Some("Show.S01/Show.S01E03.mkv")
        );
        assert!(find_episode_file(&files, 2, 1, |_| false).is_none());
    }

    #[test]
    fn normalisation_and_similarity() {
        assert_eq!(normalize_name("Show.S01.1080p-GROUP"), "show s01 1080p group");
        let score = name_similarity(
            "Show.S01.1080p.WEB-DL.GROUP",
            "show s01 1080p web dl group extra",
        );
        assert!((score - 1.0).abs() < f64::EPSILON);

        let partial = name_similarity("Alpha Beta Gamma Delta", "alpha beta");
        assert!((partial - 0.5).abs() < f64::EPSILON);
        assert!(partial < RECOVERY_MATCH_THRESHOLD);
    }

    #[test]
    fn codec_derivation_from_encoder_names() {
        assert_eq!(codec_from_encoder("hevc-nvenc-01"), Some("hevc".to_owned()));
        assert_eq!(codec_from_encoder("X265-POOL-2"), Some("hevc".to_owned()));
        assert_eq!(codec_from_encoder("av1-svt"), Some("av1".to_owned()));
        assert_eq!(codec_from_encoder("x264-cpu"), Some("h264".to_owned()));
        assert_eq!(codec_from_encoder("mystery"), None);
    }
}
