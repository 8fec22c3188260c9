use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CacheStore;
use crate::error::{Result, SdkError};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn entry_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.lock().get(key).map(|b| b.len() as u64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    key: String,
    file: String,
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

/// Directory-backed store: one file per entry plus a manifest kept in
/// insertion order.
///
/// Layout: `<root>/<namespace>/manifest.json` and `<root>/<namespace>/<sha256(key)>.bin`.
pub struct DiskStore {
    dir: PathBuf,
    manifest: Mutex<Option<Manifest>>,
}

impl DiskStore {
    pub fn open(root: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let dir = root.as_ref().join(namespace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            manifest: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{name}.bin")
    }

    fn load_manifest(&self) -> Result<Manifest> {
        match fs::read(self.dir.join(MANIFEST_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| SdkError::Cache(format!("unreadable cache manifest: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(SdkError::Cache(format!("cannot read cache manifest: {e}"))),
        }
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let raw = serde_json::to_vec_pretty(manifest)?;
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(tmp, self.dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn with_manifest<T>(&self, f: impl FnOnce(&mut Manifest) -> Result<T>) -> Result<T> {
        let mut guard = self.manifest.lock();
        if guard.is_none() {
            *guard = Some(self.load_manifest()?);
        }
        match guard.as_mut() {
            Some(manifest) => f(manifest),
            None => Err(SdkError::Cache("cache manifest unavailable".into())),
        }
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let file = self.with_manifest(|m| {
            Ok(m.entries.iter().find(|e| e.key == key).map(|e| e.file.clone()))
        })?;
        let Some(file) = file else {
            return Ok(None);
        };
        match fs::read(self.dir.join(&file)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SdkError::Cache(format!("cannot read cached {key}: {e}"))),
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.with_manifest(|m| {
            let file = Self::file_name(key);
            fs::write(self.dir.join(&file), bytes)?;
            m.entries.retain(|e| e.key != key);
            m.entries.push(ManifestEntry {
                key: key.to_string(),
                file,
                size: bytes.len() as u64,
            });
            self.save_manifest(m)
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_manifest(|m| {
            let Some(pos) = m.entries.iter().position(|e| e.key == key) else {
                return Ok(());
            };
            let entry = m.entries.remove(pos);
            match fs::remove_file(self.dir.join(&entry.file)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.save_manifest(m)
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.with_manifest(|m| Ok(m.entries.iter().map(|e| e.key.clone()).collect()))
    }

    fn entry_size(&self, key: &str) -> Result<Option<u64>> {
        self.with_manifest(|m| Ok(m.entries.iter().find(|e| e.key == key).map(|e| e.size)))
    }
}
