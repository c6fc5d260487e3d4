//! Best-effort shared file of default target selections.
//!
//! Several bridge processes may read and write the same file. Writers
//! replace it atomically; readers trust their cached copy only while the
//! file's modification time has not advanced.

use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDefaults {
    #[serde(default)]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub last_bundle_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum DefaultsError {
    #[error("failed to write defaults file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode defaults: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct DefaultsStore {
    path: PathBuf,
    cached: TargetDefaults,
    loaded_mtime: Option<SystemTime>,
}

impl DefaultsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: TargetDefaults::default(),
            loaded_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The defaults as of the file's latest modification.
    pub fn current(&mut self) -> &TargetDefaults {
        self.refresh();
        &self.cached
    }

    /// Records the most recent target selection.
    pub fn record(&mut self, pid: u32, bundle_id: Option<&str>) -> Result<(), DefaultsError> {
        self.refresh();
        let updated = TargetDefaults {
            last_pid: Some(pid),
            last_bundle_id: bundle_id.map(str::to_string),
            updated_at: Some(Utc::now()),
        };
        let data = serde_json::to_vec_pretty(&updated)?;
        self.write_atomically(&data)
            .map_err(|source| DefaultsError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.loaded_mtime = modified(&self.path).ok();
        self.cached = updated;
        debug!(path = %self.path.display(), pid, "recorded target defaults");
        Ok(())
    }

    fn refresh(&mut self) {
        let mtime = match modified(&self.path) {
            Ok(mtime) => mtime,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.cached = TargetDefaults::default();
                self.loaded_mtime = None;
                return;
            }
            Err(err) => {
                warn!(path = %self.path.display(), "failed to stat defaults file: {err}");
                return;
            }
        };
        if self.loaded_mtime.is_some_and(|loaded| mtime <= loaded) {
            return;
        }

        self.cached = match fs::read(&self.path) {
            Ok(data) if data.is_empty() => TargetDefaults::default(),
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), "ignoring malformed defaults file: {err}");
                TargetDefaults::default()
            }),
            Err(err) => {
                warn!(path = %self.path.display(), "failed to read defaults file: {err}");
                TargetDefaults::default()
            }
        };
        self.loaded_mtime = Some(mtime);
    }

    fn write_atomically(&self, data: &[u8]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}
