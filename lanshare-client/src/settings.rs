use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use lanshare_core::Locale;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// `settings.json` is expected to be tiny; anything larger is treated as corrupt.
pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;

pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedSettings {
    #[serde(default)]
    pub language: Option<Locale>,
}

impl SavedSettings {
    pub fn locale(&self) -> Locale {
        self.language.unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum SettingsLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SettingsSaveError {
    #[error("create dir failed: {0}")]
    CreateDir(#[source] io::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn settings_path() -> PathBuf {
    let dir = std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|base| base.join("lanshare")))
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join("settings.json")
}

pub fn load_settings_from_path(path: &Path) -> Result<SavedSettings, SettingsLoadError> {
    let meta = fs::metadata(path).map_err(SettingsLoadError::Metadata)?;
    if meta.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsLoadError::TooLarge {
            size: meta.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(SettingsLoadError::Read)?;
    serde_json::from_str(&data).map_err(SettingsLoadError::Parse)
}

/// Falls back to defaults (Chinese UI) when nothing usable is stored.
pub fn load_settings() -> SavedSettings {
    let path = settings_path();
    load_settings_from_path(&path).unwrap_or_else(|err| {
        debug!(path = %path.display(), "using default settings: {err}");
        SavedSettings::default()
    })
}

pub fn save_settings_to_path(path: &Path, settings: &SavedSettings) -> Result<(), SettingsSaveError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(SettingsSaveError::CreateDir)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(settings).map_err(SettingsSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(SettingsSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(SettingsSaveError::Rename)
}

pub fn save_settings_with_retry(
    path: &Path,
    settings: &SavedSettings,
) -> Result<(), SettingsSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_settings_to_path(path, settings) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!(attempt, "settings save failed, retrying: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
