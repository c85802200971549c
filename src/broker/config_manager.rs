//! Shared persistence code path for the four broker-side metadata
//! documents (section 4.11 / 6): `topics.json`, `subscriptionGroup.json`,
//! `consumerOffset.json`, `delayOffset.json`. Each manager owns its table
//! behind one reader-writer lock (per the Open Questions guidance to use a
//! single lock per table rather than several narrow ones) and implements
//! [`ConfigManager`] so one `persist`/`load` routine serves all four.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Encode/decode + where-on-disk for one persisted document. Implementors
/// hold their table behind an internal `RwLock` and only need to describe
/// how to turn the locked-read view into `Self::Persisted` and back.
pub trait ConfigManager {
    type Persisted: Serialize + DeserializeOwned;

    fn config_file_path(&self) -> PathBuf;

    fn encode(&self) -> Self::Persisted;

    fn decode(&self, persisted: Self::Persisted);

    /// Atomically replaces the document on disk: write to `<path>.tmp`,
    /// `fsync`, `rename` over the target (section 3/6: "write-temp-then-
    /// rename"). Never leaves a half-written file at the real path.
    fn persist(&self) -> io::Result<()> {
        let path = self.config_file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&path);
        let json = serde_json::to_string_pretty(&self.encode())?;
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Loads the document if present; a missing file is not an error (a
    /// fresh broker has no prior metadata).
    fn load(&self) -> io::Result<bool> {
        let path = self.config_file_path();
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&path)?;
        let persisted: Self::Persisted = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.decode(persisted);
        Ok(true)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::data_version::DataVersion;
    use serde_derive::{Deserialize, Serialize};
    use std::sync::RwLock;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize)]
    struct Doc {
        data_version: DataVersion,
        value: String,
    }

    struct Dummy {
        path: PathBuf,
        value: RwLock<String>,
        version: RwLock<DataVersion>,
    }

    impl ConfigManager for Dummy {
        type Persisted = Doc;

        fn config_file_path(&self) -> PathBuf {
            self.path.clone()
        }

        fn encode(&self) -> Doc {
            Doc {
                data_version: *self.version.read().unwrap(),
                value: self.value.read().unwrap().clone(),
            }
        }

        fn decode(&self, persisted: Doc) {
            *self.value.write().unwrap() = persisted.value;
            *self.version.write().unwrap() = persisted.data_version;
        }
    }

    #[test]
    fn persist_then_load_round_trips_and_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("doc.json");
        let a = Dummy {
            path: path.clone(),
            value: RwLock::new("hello".into()),
            version: RwLock::new(DataVersion::new(42)),
        };
        a.persist().unwrap();
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());

        let b = Dummy {
            path,
            value: RwLock::new(String::new()),
            version: RwLock::new(DataVersion::default()),
        };
        assert!(b.load().unwrap());
        assert_eq!(*b.value.read().unwrap(), "hello");
        assert_eq!(*b.version.read().unwrap(), DataVersion::new(42));
    }

    #[test]
    fn load_of_missing_file_returns_false_without_error() {
        let dir = tempdir().unwrap();
        let d = Dummy {
            path: dir.path().join("nope.json"),
            value: RwLock::new(String::new()),
            version: RwLock::new(DataVersion::default()),
        };
        assert!(!d.load().unwrap());
    }
}
