//! Library scanner for yt-dlp style download folders.
//!
//! The media root holds one folder per channel. Inside a channel folder every
//! video sits next to its sidecars, all sharing the video's stem:
//!
//! ```text
//! <root>/<channel>/<stem>.mp4
//! <root>/<channel>/<stem>.info.json
//! <root>/<channel>/<stem>.en.vtt
//! <root>/<channel>/<stem>.jpg
//! ```
//!
//! A scan never fails. Anything that cannot be read is treated as absent and
//! the video or channel falls back to filename-derived defaults.

use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::WalkDir;

/// Suffix that replaces a video's extension to locate its metadata sidecar.
pub const METADATA_SUFFIX: &str = "info.json";

/// Sentinel used for upload dates and durations we could not derive.
pub const UNKNOWN: &str = "Unknown";

pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &["webm", "mp4", "mkv", "avi"];
pub const DEFAULT_SUBTITLE_EXTENSIONS: &[&str] = &["vtt", "srt"];
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "png", "webp"];
pub const DEFAULT_SUBTITLE_LANGUAGES: &[&str] = &["en"];
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[".channel_assets", "node_modules", ".git"];

/// Knobs that decide which files take part in a scan.
///
/// Extensions are stored lowercase and without the leading dot. Order matters
/// for subtitles and thumbnails: when several sidecars match, the one found
/// for the extension listed last wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub video_extensions: Vec<String>,
    pub subtitle_extensions: Vec<String>,
    pub image_extensions: Vec<String>,
    pub subtitle_languages: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            video_extensions: to_owned_list(DEFAULT_VIDEO_EXTENSIONS),
            subtitle_extensions: to_owned_list(DEFAULT_SUBTITLE_EXTENSIONS),
            image_extensions: to_owned_list(DEFAULT_IMAGE_EXTENSIONS),
            subtitle_languages: to_owned_list(DEFAULT_SUBTITLE_LANGUAGES),
            excluded_dirs: to_owned_list(DEFAULT_EXCLUDED_DIRS),
        }
    }
}

impl ScanConfig {
    fn is_excluded(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|dir| dir == name)
    }

    fn is_video(&self, name: &str) -> bool {
        lowercase_extension(name)
            .is_some_and(|ext| self.video_extensions.iter().any(|known| *known == ext))
    }

    fn is_image(&self, name: &str) -> bool {
        lowercase_extension(name)
            .is_some_and(|ext| self.image_extensions.iter().any(|known| *known == ext))
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// One creator folder directly under the media root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub folder: String,
    pub avatar: Option<String>,
    pub videos: Vec<Video>,
}

impl Channel {
    pub fn video(&self, id: &str) -> Option<&Video> {
        self.videos.iter().find(|video| video.id == id)
    }
}

/// A single playable file plus whatever its sidecars told us about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub title: String,
    pub file: String,
    pub subtitle: Option<String>,
    pub thumbnail: Option<String>,
    pub upload_date: String,
    pub duration: String,
    pub description: String,
    pub view_count: u64,
}

/// Fields lifted out of an `.info.json` sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VideoInfo {
    title: String,
    upload_date: String,
    duration: String,
    description: String,
    view_count: u64,
}

impl VideoInfo {
    fn defaults(stem: &str) -> Self {
        Self {
            title: display_name(stem),
            upload_date: UNKNOWN.to_string(),
            duration: UNKNOWN.to_string(),
            description: String::new(),
            view_count: 0,
        }
    }

    /// Every field falls back on its own, so a sidecar with only a title still
    /// yields a usable record.
    fn from_sidecar(stem: &str, info: &Map<String, Value>) -> Self {
        let title = info
            .get("title")
            .and_then(Value::as_str)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| display_name(stem));
        let upload_date = info.get("upload_date").and_then(|value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        let duration = info.get("duration").and_then(|value| match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        });
        let description = info
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let view_count = info
            .get("view_count")
            .and_then(|value| {
                value.as_u64().or_else(|| {
                    value
                        .as_f64()
                        .filter(|count| count.is_finite() && *count >= 0.0)
                        .map(|count| count as u64)
                })
            })
            .unwrap_or(0);

        Self {
            title,
            upload_date: format_date(upload_date.as_deref()),
            duration: format_duration(duration),
            description,
            view_count,
        }
    }
}

/// Walks `root` and returns every channel folder that holds at least one video.
///
/// Channels come back in directory-listing order (file names sorted
/// byte-wise). A missing or unreadable root yields an empty list.
pub fn scan(root: &Path, config: &ScanConfig) -> Vec<Channel> {
    let started = Instant::now();
    if !root.exists() {
        tracing::warn!(root = %root.display(), "media root does not exist");
        return Vec::new();
    }
    let Some(entries) = list_dir(root) else {
        tracing::warn!(root = %root.display(), "media root could not be listed");
        return Vec::new();
    };

    let mut channels = Vec::new();
    for entry in entries {
        if config.is_excluded(&entry.name) || !entry.is_dir {
            continue;
        }
        let channel = scan_channel(&entry.path, &entry.name, config);
        if channel.videos.is_empty() {
            tracing::debug!(folder = %entry.name, "skipping folder without videos");
            continue;
        }
        channels.push(channel);
    }

    let videos: usize = channels.iter().map(|channel| channel.videos.len()).sum();
    tracing::info!(
        root = %root.display(),
        channels = channels.len(),
        videos,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "library scan finished"
    );
    channels
}

fn scan_channel(dir: &Path, folder: &str, config: &ScanConfig) -> Channel {
    // A folder we cannot list simply has nothing in it.
    let entries = list_dir(dir).unwrap_or_else(|| {
        tracing::warn!(folder, "channel folder could not be listed");
        Vec::new()
    });
    let names: HashSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();

    let mut videos = Vec::new();
    for entry in &entries {
        if !entry.is_file || !config.is_video(&entry.name) {
            continue;
        }
        let stem = file_stem(&entry.name);
        let info = read_video_info(&dir.join(format!("{stem}.{METADATA_SUFFIX}")), stem);
        videos.push(Video {
            id: stem.to_string(),
            title: info.title,
            file: entry.name.clone(),
            subtitle: find_subtitle(stem, &names, config),
            thumbnail: find_thumbnail(stem, &names, config),
            upload_date: info.upload_date,
            duration: info.duration,
            description: info.description,
            view_count: info.view_count,
        });
    }

    // Plain string order on purpose: "Unknown" lands among the real dates.
    videos.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));

    Channel {
        id: channel_id(folder),
        name: display_name(folder),
        folder: folder.to_string(),
        avatar: find_avatar(&entries, folder, config),
        videos,
    }
}

fn read_video_info(path: &Path, stem: &str) -> VideoInfo {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %err, "unreadable metadata sidecar");
            }
            return VideoInfo::defaults(stem);
        }
    };
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(info)) => VideoInfo::from_sidecar(stem, &info),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "metadata sidecar is not a JSON object");
            VideoInfo::defaults(stem)
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "malformed metadata sidecar");
            VideoInfo::defaults(stem)
        }
    }
}

fn find_subtitle(stem: &str, names: &HashSet<&str>, config: &ScanConfig) -> Option<String> {
    let mut found = None;
    for ext in &config.subtitle_extensions {
        for lang in &config.subtitle_languages {
            let candidate = format!("{stem}.{lang}.{ext}");
            if names.contains(candidate.as_str()) {
                found = Some(candidate);
            }
        }
    }
    found
}

fn find_thumbnail(stem: &str, names: &HashSet<&str>, config: &ScanConfig) -> Option<String> {
    let mut found = None;
    for ext in &config.image_extensions {
        let candidate = format!("{stem}.{ext}");
        if names.contains(candidate.as_str()) {
            found = Some(candidate);
        }
    }
    found
}

fn find_avatar(entries: &[ListedEntry], folder: &str, config: &ScanConfig) -> Option<String> {
    let needle = folder.to_lowercase();
    entries
        .iter()
        .find(|entry| {
            entry.is_file
                && config.is_image(&entry.name)
                && entry.name.to_lowercase().contains(&needle)
        })
        .map(|entry| entry.name.clone())
}

struct ListedEntry {
    name: String,
    path: PathBuf,
    is_dir: bool,
    is_file: bool,
}

/// Lists the immediate children of `dir`, sorted by file name, following
/// symlinks. Returns `None` when the directory itself cannot be read.
fn list_dir(dir: &Path) -> Option<Vec<ListedEntry>> {
    let mut listed = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                tracing::debug!(dir = %dir.display(), error = %err, "cannot list directory");
                return None;
            }
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str() else {
            tracing::debug!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };
        let file_type = entry.file_type();
        listed.push(ListedEntry {
            name: name.to_string(),
            path: entry.path().to_path_buf(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        });
    }
    Some(listed)
}

fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

fn lowercase_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
}

/// Lowercases a folder name and collapses every whitespace run into `_`.
pub fn channel_id(folder: &str) -> String {
    let mut id = String::with_capacity(folder.len());
    let mut in_whitespace = false;
    for c in folder.to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                id.push('_');
            }
            in_whitespace = true;
        } else {
            id.push(c);
            in_whitespace = false;
        }
    }
    id
}

/// Human readable form of a file or folder name.
pub fn display_name(raw: &str) -> String {
    raw.replace('_', " ")
}

/// Rewrites a yt-dlp `YYYYMMDD` code as `YYYY-MM-DD`.
pub fn format_date(code: Option<&str>) -> String {
    let Some(code) = code else {
        return UNKNOWN.to_string();
    };
    let chars: Vec<char> = code.chars().collect();
    if chars.len() != 8 {
        return UNKNOWN.to_string();
    }
    let year: String = chars[..4].iter().collect();
    let month: String = chars[4..6].iter().collect();
    let day: String = chars[6..].iter().collect();
    format!("{year}-{month}-{day}")
}

/// Formats seconds as `H:MM:SS`, or `M:SS` below one hour.
pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|value| value.is_finite() && *value > 0.0) else {
        return UNKNOWN.to_string();
    };
    let total = seconds.floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
