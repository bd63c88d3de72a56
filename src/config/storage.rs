//! Settings file on disk
//!
//! `~/.oxide-session/settings.json`. A missing file means defaults; an
//! unreadable one is moved aside so the next save starts clean.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::settings::{SessionSettings, SETTINGS_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Could not locate the home directory")]
    NoHomeDir,

    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// `~/.oxide-session`
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".oxide-session"))
        .ok_or(StorageError::NoHomeDir)
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    config_dir().map(|dir| dir.join("settings.json"))
}

/// Reads and writes one settings file
#[derive(Debug, Clone)]
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Storage at the default location
    pub fn open_default() -> Result<Self, StorageError> {
        settings_file().map(Self::at)
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file is missing or
    /// corrupt. Only a file written by a newer version is an error.
    pub async fn load(&self) -> Result<SessionSettings, StorageError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                return Ok(SessionSettings::default());
            }
            Err(e) => return Err(e.into()),
        };

        match parse(&raw) {
            Ok(settings) => Ok(settings),
            Err(e @ StorageError::UnsupportedVersion { .. }) => Err(e),
            Err(e) => {
                warn!("Settings file {} unreadable: {}", self.path.display(), e);
                match self.quarantine().await {
                    Ok(moved) => warn!("Moved broken settings to {}", moved.display()),
                    Err(move_err) => error!("Could not move broken settings aside: {}", move_err),
                }
                Ok(SessionSettings::default())
            }
        }
    }

    /// Write through a temp file and rename over the target
    pub async fn save(&self, settings: &SessionSettings) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_vec_pretty(settings)?;
        let staging = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
        }
        fs::rename(&staging, &self.path).await?;

        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }

    /// Rename the current file to `settings.json.corrupt-<timestamp>`
    async fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let target = self.path.with_extension(format!("json.corrupt-{}", stamp));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }
}

fn parse(raw: &[u8]) -> Result<SessionSettings, StorageError> {
    let settings: SessionSettings = serde_json::from_slice(raw)?;
    if settings.version > SETTINGS_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: settings.version,
            supported: SETTINGS_VERSION,
        });
    }
    Ok(settings.sanitized())
}
