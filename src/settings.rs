//! Small key/value settings that survive restarts.
//!
//! The mesh adapter remembers the last port its gateway answered on and reads its
//! frame-logging verbosity from here. Each adapter gets its own namespace; the
//! file store keeps one flat JSON object per namespace and rewrites it atomically.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub const KEY_PORT: &str = "port";
pub const KEY_LOG: &str = "log";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SettingsStore: Send {
    fn value(&self, key: &str) -> Option<String>;
    fn set_value(&mut self, key: &str, value: &str) -> Result<(), SettingsError>;

    fn value_or(&self, key: &str, default: &str) -> String {
        self.value(key).unwrap_or_else(|| default.to_string())
    }
}

/// Per-frame logging verbosity stored under [`KEY_LOG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Debug,
    Info,
    Quiet,
}

impl Verbosity {
    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Verbosity::Debug,
            "info" => Verbosity::Info,
            _ => Verbosity::Quiet,
        }
    }

    pub fn from_store(store: &dyn SettingsStore) -> Self {
        Self::parse(&store.value_or(KEY_LOG, "info"))
    }
}

#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileSettings {
    /// Open `<dir>/<namespace>.json`; a missing file starts empty.
    pub fn open<P: AsRef<Path>>(dir: P, namespace: &str) -> Result<Self, SettingsError> {
        let path = dir.as_ref().join(format!("{}.json", namespace));
        let values = match fs::read_to_string(&path) {
            Ok(content) => {
                // Guard against leading NULs left by an interrupted write
                let cleaned = content.trim_start_matches('\0');
                if cleaned.trim().is_empty() {
                    BTreeMap::new()
                } else {
                    serde_json::from_str(cleaned)?
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(&self.values)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let base = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("settings.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        };
        fs::rename(&tmp_path, &self.path)?;
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        if self.values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }
}

/// Volatile store; clones share the same map so tests can observe writes.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        if let Ok(mut v) = self.values.lock() {
            v.insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl SettingsStore for MemorySettings {
    fn value(&self, key: &str) -> Option<String> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn set_value(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        if let Ok(mut v) = self.values.lock() {
            v.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settings_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = FileSettings::open(dir.path(), "mesh").unwrap();
        assert_eq!(s.value(KEY_PORT), None);
        s.set_value(KEY_PORT, "/dev/ttyUSB1").unwrap();
        let reopened = FileSettings::open(dir.path(), "mesh").unwrap();
        assert_eq!(reopened.value(KEY_PORT).as_deref(), Some("/dev/ttyUSB1"));
        assert!(reopened.path().ends_with("mesh.json"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mesh.json"), "{not json").unwrap();
        assert!(matches!(
            FileSettings::open(dir.path(), "mesh"),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn verbosity_defaults_to_info() {
        let s = MemorySettings::new();
        assert_eq!(Verbosity::from_store(&s), Verbosity::Info);
        let s = s.with(KEY_LOG, "debug");
        assert_eq!(Verbosity::from_store(&s), Verbosity::Debug);
        assert_eq!(Verbosity::parse("warning"), Verbosity::Quiet);
    }

    #[test]
    fn verbosity_names_are_exact() {
        assert_eq!(Verbosity::parse("DEBUG"), Verbosity::Quiet);
        assert_eq!(Verbosity::parse(" info"), Verbosity::Quiet);
        assert_eq!(Verbosity::parse("info"), Verbosity::Info);
    }
}
