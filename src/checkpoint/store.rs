// src/checkpoint/store.rs
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tokio::fs;

/// Durable record store the checkpoint writer serialises into, one record per section.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn write(&self, section: &str, value: Vec<u8>) -> Result<()>;
    /// `Ok(None)` when the section was never written.
    async fn read(&self, section: &str) -> Result<Option<Vec<u8>>>;
}

/// One `<section>.json` file per section under `dir`, replaced via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, section: &str) -> PathBuf {
        self.dir.join(format!("{section}.json"))
    }
}

#[async_trait::async_trait]
impl DurableStore for FileStore {
    async fn write(&self, section: &str, value: Vec<u8>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state dir {}", self.dir.display()))?;
        let path = self.path(section);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    async fn read(&self, section: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(section);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

// --- Test helper ---
/// In-memory store that can be told to fail writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, section: &str) -> Option<Vec<u8>> {
        self.records
            .lock()
            .expect("memory store mutex poisoned")
            .get(section)
            .cloned()
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryStore {
    async fn write(&self, section: &str, value: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated write failure for {section}"));
        }
        self.records
            .lock()
            .expect("memory store mutex poisoned")
            .insert(section.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, section: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(section))
    }
}
