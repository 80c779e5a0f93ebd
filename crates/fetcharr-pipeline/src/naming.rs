//! Delivery path construction.
//!
//! Final artifacts land under a server's library root following a fixed
//! convention:
//!
//! - Movie: `<root>/<Title> (<Year>)/<Title> (<Year>) <Quality> <Codec>.<ext>`
//! - TV: `<root>/<Series>/Season <NN>/<Series> - S<NN>E<NN> <Quality> <Codec>.<ext>`

use std::path::{Path, PathBuf};

use crate::model::Resolution;

/// Strip characters that are unsafe in library path components.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            _ => c,
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn quality_codec_suffix(quality: Option<Resolution>, codec: Option<&str>) -> String {
    let mut suffix = String::new();
    if let Some(quality) = quality {
        suffix.push(' ');
        suffix.push_str(quality.as_str());
    }
    if let Some(codec) = codec {
        suffix.push(' ');
        suffix.push_str(codec);
    }
    suffix
}

/// Destination path for a movie artifact.
#[must_use]
pub fn movie_path(
    root: &Path,
    title: &str,
    year: Option<i32>,
    quality: Option<Resolution>,
    codec: Option<&str>,
    extension: &str,
) -> PathBuf {
    let title = sanitize_component(title);
    let base = year.map_or_else(|| title.clone(), |year| format!("{title} ({year})"));
    let file = format!(
        "{base}{}.{extension}",
        quality_codec_suffix(quality, codec)
    );
    root.join(&base).join(file)
}

/// Destination path for an episode artifact.
#[must_use]
pub fn episode_path(
    root: &Path,
    series: &str,
    season: i32,
    episode: i32,
    quality: Option<Resolution>,
    codec: Option<&str>,
    extension: &str,
) -> PathBuf {
    let series = sanitize_component(series);
    let file = format!(
        "{series} - S{season:02}E{episode:02}{}.{extension}",
        quality_codec_suffix(quality, codec)
    );
    root.join(&series)
        .join(format!("Season {season:02}"))
        .join(file)
}

/// Deterministic encoder output file name for an item.
///
/// Retries re-use the same slot, so a crashed encode never produces orphans.
#[must_use]
pub fn encoded_file_name(item_id: uuid::Uuid) -> String {
    format!("encoded_{item_id}.mkv")
}

/// Temporary encoder output path paired with [`encoded_file_name`].
#[must_use]
pub fn encoded_temp_name(item_id: uuid::Uuid) -> String {
    format!("encoded_{item_id}.tmp.mkv")
}
