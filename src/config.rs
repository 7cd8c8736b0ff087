use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::scanner::{
    DEFAULT_EXCLUDED_DIRS, DEFAULT_IMAGE_EXTENSIONS, DEFAULT_SUBTITLE_EXTENSIONS,
    DEFAULT_SUBTITLE_LANGUAGES, DEFAULT_VIDEO_EXTENSIONS, ScanConfig,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_LOCALTUBE_PORT: u16 = 3001;
pub const DEFAULT_LOCALTUBE_HOST: &str = "127.0.0.1";
/// Library location relative to `$HOME` when `MEDIA_ROOT` is not set.
pub const DEFAULT_MEDIA_SUBDIR: &str = "Dump/Media/youtube";
/// User data lives inside an excluded folder so it never shows up as a channel.
pub const DEFAULT_DATA_SUBDIR: &str = ".channel_assets/localtube";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub www_root: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub port: u16,
    pub host: String,
    pub watch: bool,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub watch: Option<bool>,
    pub env_path: Option<PathBuf>,
}

/// Resolves the runtime configuration. Precedence per key: explicit override,
/// then process environment, then the `.env` file, then the built-in default.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let media_root = overrides
        .media_root
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .or_else(|| env_lookup("HOME").map(|home| Path::new(&home).join(DEFAULT_MEDIA_SUBDIR)))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set and HOME unavailable"))?;
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from));
    let data_dir = overrides
        .data_dir
        .or_else(|| lookup_value("DATA_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| media_root.join(DEFAULT_DATA_SUBDIR));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("LOCALTUBE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_LOCALTUBE_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("LOCALTUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOCALTUBE_HOST.to_string());
    let watch = overrides
        .watch
        .or_else(|| {
            lookup_value("LOCALTUBE_WATCH", file_vars, &env_lookup)
                .and_then(|value| parse_flag(&value))
        })
        .unwrap_or(true);
    let scan = build_scan_config(file_vars, &env_lookup);

    Ok(RuntimeConfig {
        media_root,
        www_root,
        data_dir,
        port,
        host,
        watch,
        scan,
    })
}

fn build_scan_config(
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> ScanConfig {
    ScanConfig {
        video_extensions: scan_list(
            "VIDEO_EXTENSIONS",
            DEFAULT_VIDEO_EXTENSIONS,
            normalize_extension,
            file_vars,
            env_lookup,
        ),
        subtitle_extensions: scan_list(
            "SUBTITLE_EXTENSIONS",
            DEFAULT_SUBTITLE_EXTENSIONS,
            normalize_extension,
            file_vars,
            env_lookup,
        ),
        image_extensions: scan_list(
            "THUMBNAIL_EXTENSIONS",
            DEFAULT_IMAGE_EXTENSIONS,
            normalize_extension,
            file_vars,
            env_lookup,
        ),
        subtitle_languages: scan_list(
            "SUBTITLE_LANGUAGES",
            DEFAULT_SUBTITLE_LANGUAGES,
            normalize_name,
            file_vars,
            env_lookup,
        ),
        excluded_dirs: scan_list(
            "EXCLUDED_DIRS",
            DEFAULT_EXCLUDED_DIRS,
            normalize_name,
            file_vars,
            env_lookup,
        ),
    }
}

/// An unset or blank list keeps the defaults.
fn scan_list(
    key: &str,
    defaults: &[&str],
    normalize: fn(&str) -> String,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    lookup_value(key, file_vars, env_lookup)
        .map(|value| parse_list(&value, normalize))
        .filter(|values| !values.is_empty())
        .unwrap_or_else(|| defaults.iter().map(|value| normalize(value)).collect())
}

/// Splits a comma separated list, trimming entries and dropping blanks.
pub fn parse_list(value: &str, normalize: fn(&str) -> String) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(normalize)
        .filter(|item| !item.is_empty())
        .collect()
}

fn normalize_name(value: &str) -> String {
    value.trim().to_string()
}

/// `.MP4` and `mp4` both become `mp4`.
pub fn normalize_extension(value: &str) -> String {
    value.trim().trim_start_matches('.').to_lowercase()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
