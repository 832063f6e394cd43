use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub const DEFAULT_STORE_NAME: &str = "store.redb";

/// Where the store lives and how it is kept open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// File name of the store inside `dir`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory holding the store file; empty means the working directory.
    #[serde(default)]
    pub dir: PathBuf,
    /// Keep the store open between operations.
    #[serde(default)]
    pub batch_mode: bool,
    /// Buckets created when the store is opened.
    #[serde(default)]
    pub buckets: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            dir: PathBuf::new(),
            batch_mode: false,
            buckets: vec![],
        }
    }
}

fn default_name() -> String {
    DEFAULT_STORE_NAME.to_string()
}

impl StoreOptions {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn bucket(mut self, name: impl Into<String>) -> Self {
        self.buckets.push(name.into());
        self
    }

    pub fn batch_mode(mut self, on: bool) -> Self {
        self.batch_mode = on;
        self
    }

    /// Read options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|source| VaultError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"buckets": ["article"]}"#).unwrap();
        let options = StoreOptions::load(&path).unwrap();
        assert_eq!(options.name, DEFAULT_STORE_NAME);
        assert_eq!(options.dir, PathBuf::new());
        assert!(!options.batch_mode);
        assert_eq!(options.buckets, vec!["article".to_string()]);
        assert_eq!(options.full_path(), PathBuf::from(DEFAULT_STORE_NAME));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = StoreOptions::load(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn builder_style_setters() {
        let options = StoreOptions::new("test.dat", "data")
            .bucket("a")
            .bucket("b")
            .batch_mode(true);
        assert_eq!(options.full_path(), Path::new("data").join("test.dat"));
        assert_eq!(options.buckets, vec!["a", "b"]);
        assert!(options.batch_mode);
    }
}
