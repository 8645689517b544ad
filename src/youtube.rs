use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::error::PlayerError;
use crate::models::Track;

const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

const VIDEO_HOSTS: [&str; 6] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
    "youtu.be",
];

/// Path prefixes that carry the video id as the next segment.
const ID_PATHS: [&str; 4] = ["shorts", "embed", "v", "live"];

/// Subset of `yt-dlp -j` output we care about.
#[derive(Deserialize)]
struct VideoInfo {
    title: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

/// Extracts the 11 character video id from a link, if it is one.
pub fn video_id(input: &str) -> Option<String> {
    let url = Url::parse(input.trim()).ok()?;

    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?;
    if !VIDEO_HOSTS.contains(&host) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    let id: Option<String> = if host == "youtu.be" {
        segments.next().map(str::to_string)
    } else if let Some((_, id)) = url.query_pairs().find(|(key, _)| key == "v") {
        Some(id.into_owned())
    } else {
        match segments.next() {
            Some(kind) if ID_PATHS.contains(&kind) => segments.next().map(str::to_string),
            _ => None,
        }
    };
    let id = id?;

    let well_formed = id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    well_formed.then_some(id)
}

pub fn is_video_url(input: &str) -> bool {
    video_id(input).is_some()
}

/// Looks up a single video with yt-dlp.
pub async fn fetch_track(url: &str, requested_by: &str) -> Result<Track, PlayerError> {
    debug!("Fetching metadata for {url}");

    let output = Command::new("yt-dlp")
        .args(["-j", "--no-playlist", "--no-warnings", url])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PlayerError::metadata(format!("yt-dlp failed to start: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlayerError::metadata(stderr.trim()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    track_from_json(&stdout, url, requested_by).map_err(PlayerError::metadata)
}

fn track_from_json(json: &str, url: &str, requested_by: &str) -> Result<Track, serde_json::Error> {
    let info: VideoInfo = serde_json::from_str(json)?;

    let thumbnail = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().next().map(|t| t.url))
        .unwrap_or_default();

    let duration_secs = info
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map_or(0, |d| d.round() as u64);

    Ok(Track {
        title: info.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
        url: info.webpage_url.unwrap_or_else(|| url.to_string()),
        duration_secs,
        thumbnail,
        requested_by: requested_by.to_string(),
    })
}
