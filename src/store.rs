//! Durable per-target watermarks.

use crate::error::StoreError;
use crate::follows::UserId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub type Watermarks = BTreeMap<UserId, UserId>;

/// Target id → id of the newest followed account already processed.
///
/// Only the monitor writes; `set` must be durable before it returns.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Load the persisted map. Called once at startup.
    async fn load_all(&mut self) -> Result<Watermarks, StoreError>;

    async fn get(&self, target: &UserId) -> Result<Option<UserId>, StoreError>;

    async fn set(&mut self, target: &UserId, id: &UserId) -> Result<(), StoreError>;
}

/// Keeps watermarks in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Watermarks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Watermarks) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn load_all(&mut self) -> Result<Watermarks, StoreError> {
        Ok(self.entries.clone())
    }

    async fn get(&self, target: &UserId) -> Result<Option<UserId>, StoreError> {
        Ok(self.entries.get(target).cloned())
    }

    async fn set(&mut self, target: &UserId, id: &UserId) -> Result<(), StoreError> {
        self.entries.insert(target.clone(), id.clone());
        Ok(())
    }
}

/// Watermarks kept in a pretty-printed JSON object on disk.
///
/// Reads are served from memory after [`WatermarkStore::load_all`]. Every
/// `set` rewrites the whole file through a temp file and a rename, so a crash
/// leaves either the old or the new map, never a torn one.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Watermarks,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Watermarks::new(),
        }
    }

    /// Create the store and load whatever is on disk.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(path);
        store.load_all().await?;
        Ok(store)
    }

    /// Directory holding the state file and its temp sibling.
    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn write_atomic(&self, entries: &Watermarks) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let parent = self.parent_dir();
        fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).await.map_err(|e| self.io_err(e))?;
        file.write_all(&json).await.map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        // The rename is only durable once the directory entry is on disk.
        #[cfg(unix)]
        fs::File::open(parent)
            .await
            .map_err(|e| self.io_err(e))?
            .sync_all()
            .await
            .map_err(|e| self.io_err(e))?;
        debug!("wrote {} watermarks to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for JsonFileStore {
    async fn load_all(&mut self) -> Result<Watermarks, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state file at {}, starting empty", self.path.display());
                self.entries.clear();
                return Ok(Watermarks::new());
            }
            Err(e) => return Err(self.io_err(e)),
        };

        let entries: Watermarks = if bytes.iter().all(u8::is_ascii_whitespace) {
            Watermarks::new()
        } else {
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?
        };

        self.entries = entries.clone();
        Ok(entries)
    }

    async fn get(&self, target: &UserId) -> Result<Option<UserId>, StoreError> {
        Ok(self.entries.get(target).cloned())
    }

    async fn set(&mut self, target: &UserId, id: &UserId) -> Result<(), StoreError> {
        let mut next = self.entries.clone();
        next.insert(target.clone(), id.clone());
        self.write_atomic(&next).await?;
        self.entries = next;
        Ok(())
    }
}

/// Open the state file for a monitor run.
///
/// A dry run reads the file once and keeps every later write in memory, so
/// the real watermarks stay where they were.
pub async fn open_for_run(path: &Path, dry_run: bool) -> Result<Box<dyn WatermarkStore>, StoreError> {
    let mut file = JsonFileStore::new(path);
    if !dry_run {
        return Ok(Box::new(file));
    }
    let watermarks = file.load_all().await?;
    debug!(
        "dry run: {} watermarks from {} kept in memory",
        watermarks.len(),
        path.display()
    );
    Ok(Box::new(MemoryStore::with_entries(watermarks)))
}
