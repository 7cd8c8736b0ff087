//! Small JSON-file store for the state the frontend keeps across sessions:
//! watch history, the log of deleted videos and playback positions.
//!
//! Entries for history and the deleted log are kept as opaque JSON objects so
//! the frontend can evolve their shape freely; the store only relies on the
//! `videoId` key for de-duplication.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const USER_DATA_FILE: &str = "user_data.json";
pub const HISTORY_LIMIT: usize = 50;

/// Positions closer than this to the start are not worth resuming.
pub const RESUME_MIN_SECONDS: f64 = 5.0;
/// Positions this close to the end count as "finished".
pub const RESUME_END_MARGIN_SECONDS: f64 = 10.0;
pub const RESUME_END_FRACTION: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackPosition {
    pub seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct UserData {
    #[serde(default)]
    history: Vec<Value>,
    #[serde(default)]
    deleted: Vec<Value>,
    #[serde(default)]
    positions: BTreeMap<String, PlaybackPosition>,
}

pub struct UserDataStore {
    path: PathBuf,
    current: RwLock<UserData>,
}

impl UserDataStore {
    /// Loads `user_data.json` from `data_dir`. A missing file starts empty; a
    /// corrupt one is logged and ignored (it is overwritten on the next save).
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(USER_DATA_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "ignoring corrupt user data");
                UserData::default()
            }),
            Err(_) => UserData::default(),
        };

        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn history(&self) -> Vec<Value> {
        self.current.read().history.clone()
    }

    /// Replaces the watch history. Newest entries come first; repeated video
    /// ids keep their first occurrence and the list is capped.
    pub fn replace_history(&self, entries: Vec<Value>) -> Result<Vec<Value>> {
        let mut history = dedupe_by_video_id(entries);
        history.truncate(HISTORY_LIMIT);
        self.update(|data| data.history = history.clone())?;
        Ok(history)
    }

    pub fn deleted(&self) -> Vec<Value> {
        self.current.read().deleted.clone()
    }

    pub fn replace_deleted(&self, entries: Vec<Value>) -> Result<Vec<Value>> {
        let deleted = dedupe_by_video_id(entries);
        self.update(|data| data.deleted = deleted.clone())?;
        Ok(deleted)
    }

    pub fn position(&self, folder: &str, video_id: &str) -> Option<PlaybackPosition> {
        self.current
            .read()
            .positions
            .get(&position_key(folder, video_id))
            .cloned()
    }

    pub fn save_position(
        &self,
        folder: &str,
        video_id: &str,
        seconds: f64,
        duration: Option<f64>,
    ) -> Result<PlaybackPosition> {
        let position = PlaybackPosition {
            seconds: if seconds.is_finite() { seconds.max(0.0) } else { 0.0 },
            duration: duration.filter(|value| value.is_finite() && *value > 0.0),
            updated_at: Utc::now(),
        };
        let key = position_key(folder, video_id);
        self.update(|data| {
            data.positions.insert(key, position.clone());
        })?;
        Ok(position)
    }

    /// Drops the saved playback position of a deleted video.
    pub fn forget_position(&self, folder: &str, video_id: &str) -> Result<()> {
        let key = position_key(folder, video_id);
        if !self.current.read().positions.contains_key(&key) {
            return Ok(());
        }
        self.update(|data| {
            data.positions.remove(&key);
        })
    }

    fn update(&self, apply: impl FnOnce(&mut UserData)) -> Result<()> {
        let mut current = self.current.write();
        let mut next = current.clone();
        apply(&mut next);
        write_json_atomic(&self.path, &next)?;
        *current = next;
        Ok(())
    }
}

fn position_key(folder: &str, video_id: &str) -> String {
    format!("{folder}/{video_id}")
}

fn dedupe_by_video_id(entries: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| match entry.get("videoId").and_then(Value::as_str) {
            Some(id) => seen.insert(id.to_string()),
            None => true,
        })
        .collect()
}

/// Where playback should start given a saved position.
///
/// Short positions and positions at the very end restart from zero.
pub fn resume_position(seconds: f64, duration: Option<f64>) -> f64 {
    if !seconds.is_finite() || seconds < RESUME_MIN_SECONDS {
        return 0.0;
    }
    if let Some(duration) = duration.filter(|value| value.is_finite() && *value > 0.0)
        && (seconds >= duration - RESUME_END_MARGIN_SECONDS
            || seconds >= duration * RESUME_END_FRACTION)
    {
        return 0.0;
    }
    seconds
}

/// Writes through a temporary sibling so readers never see a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
