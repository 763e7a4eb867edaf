use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use bytes::Bytes;

/// In-memory footprint budget of payload bytes before eviction kicks in.
pub const DEFAULT_MAX_MEMORY: usize = 50 * 1024 * 1024;

#[derive(Default)]
struct Memory {
    values: HashMap<String, Bytes>,
    /// Keys in the order they were written. Eviction pops from the front;
    /// stale entries for re-written or deleted keys are skipped.
    insertion_order: VecDeque<String>,
    /// Sum of cached payload lengths.
    footprint: usize,
}

impl Memory {
    fn insert(&mut self, key: &str, data: Bytes) {
        if let Some(old) = self.values.insert(key.to_string(), data.clone()) {
            self.footprint -= old.len();
        }
        self.footprint += data.len();
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.values.remove(key) {
            self.footprint -= old.len();
        }
    }

    fn evict_to(&mut self, budget: usize) {
        while self.footprint > budget {
            // Keys loaded back from disk on a get are not re-recorded in the
            // order list, so fall back to an arbitrary cached key.
            let key = match self.insertion_order.pop_front() {
                Some(k) => k,
                None => match self.values.keys().next() {
                    Some(k) => k.clone(),
                    None => break,
                },
            };
            self.remove(&key);
        }
    }
}

/// The bucket's storage: every key lives as one file under `dir`, and a
/// bounded in-memory cache fronts reads. Writes go to memory and disk before
/// they are acknowledged; eviction only ever drops the memory copy.
pub struct BucketStore {
    dir: PathBuf,
    max_memory: usize,
    memory: Mutex<Memory>,
}

impl BucketStore {
    pub fn new(dir: impl Into<PathBuf>, max_memory: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        Ok(Self {
            dir,
            max_memory,
            memory: Mutex::new(Memory::default()),
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Returns the value for `key`, consulting memory first and falling back
    /// to the disk mirror. A disk hit is cached for subsequent reads.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(data) = self.memory.lock().unwrap().values.get(key) {
            return Ok(Some(data.clone()));
        }

        let data = match tokio::fs::read(self.file_path(key)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading key {key}"))
            },
        };

        let mut memory = self.memory.lock().unwrap();
        memory.insert(key, data.clone());
        memory.evict_to(self.max_memory);

        Ok(Some(data))
    }

    /// Stores `data` under `key` in memory and on disk. Returns only once
    /// the disk copy is durable; the caller acknowledges after this. The
    /// eviction sweep runs in the same critical section that records the
    /// insertion.
    pub async fn set(&self, key: &str, data: Bytes) -> Result<()> {
        self.memory.lock().unwrap().insert(key, data.clone());

        let path = self.file_path(key);
        if let Some(parent) = path.parent() {
            if parent != Path::new("") && parent != self.dir {
                tokio::fs::create_dir_all(parent).await.with_context(
                    || format!("creating {}", parent.display()),
                )?;
            }
        }
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing key {key}"))?;

        let mut memory = self.memory.lock().unwrap();
        memory.insertion_order.push_back(key.to_string());
        memory.evict_to(self.max_memory);

        Ok(())
    }

    /// Removes `key` from memory and disk. Absent keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.memory.lock().unwrap().remove(key);

        match tokio::fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting key {key}")),
        }
    }

    /// Current cached payload bytes.
    pub fn footprint(&self) -> usize {
        self.memory.lock().unwrap().footprint
    }

    /// Whether `key` is currently held in memory (as opposed to disk only).
    pub fn cached(&self, key: &str) -> bool {
        self.memory.lock().unwrap().values.contains_key(key)
    }
}
