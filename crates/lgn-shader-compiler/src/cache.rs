//! On-disk shader cache.
//!
//! Keyed by `(feature-version-uid, content-hash)`. Inserts accumulate
//! until a threshold queues an asynchronous flush; the flush thread
//! serializes a snapshot copy so the hot path never blocks on disk. The
//! threshold grows by a configured factor after every flush, so a long
//! session converges to rare, large writes.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{combine_hash, content_hash};

const CACHE_MAGIC: u64 = 0x6c67_6e73_6863_6163;

fn layer_version() -> u64 {
    content_hash(env!("CARGO_PKG_VERSION").as_bytes())
}

#[derive(Clone)]
struct CacheEntry {
    flags: u32,
    blob: Vec<u8>,
}

#[derive(Clone, Default)]
struct CacheData {
    entries: HashMap<u64, CacheEntry>,
    /// Serialized shader-location registry, carried opaquely.
    location_registry: Vec<u8>,
}

struct CacheInner {
    data: CacheData,
    pending_entries: u32,
    threshold: u32,
    growth_factor: f32,
    auto_serialize_path: Option<PathBuf>,
}

struct FlushSignal {
    queued: Mutex<bool>,
    condvar: Condvar,
    exit: AtomicBool,
}

/// The shader cache.
pub struct ShaderCache {
    inner: Arc<Mutex<CacheInner>>,
    signal: Arc<FlushSignal>,
    flush_thread: Option<JoinHandle<()>>,
}

impl ShaderCache {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(CacheInner {
            data: CacheData::default(),
            pending_entries: 0,
            threshold: 32,
            growth_factor: 1.5,
            auto_serialize_path: None,
        }));

        let signal = Arc::new(FlushSignal {
            queued: Mutex::new(false),
            condvar: Condvar::new(),
            exit: AtomicBool::new(false),
        });

        let flush_thread = {
            let inner = Arc::clone(&inner);
            let signal = Arc::clone(&signal);
            std::thread::Builder::new()
                .name("shader-cache-flush".to_string())
                .spawn(move || flush_entry(&inner, &signal))
                .expect("flush thread spawn")
        };

        Self {
            inner,
            signal,
            flush_thread: Some(flush_thread),
        }
    }

    /// Configure automatic serialization.
    pub fn set_auto_serialization(&self, path: &Path, threshold: u32, growth_factor: f32) {
        let mut inner = self.inner.lock().unwrap();
        inner.auto_serialize_path = Some(path.to_path_buf());
        inner.threshold = threshold.max(1);
        inner.growth_factor = growth_factor.max(1.0);
    }

    /// Compose the cache key of a shader at a feature version.
    pub fn cache_key(feature_version_uid: u64, source: &[u8]) -> u64 {
        let mut key = 0u64;
        combine_hash(&mut key, feature_version_uid);
        combine_hash(&mut key, content_hash(source));
        key
    }

    /// Look a compiled blob up.
    pub fn query(&self, feature_version_uid: u64, source: &[u8]) -> Option<Vec<u8>> {
        let key = Self::cache_key(feature_version_uid, source);
        self.inner
            .lock()
            .unwrap()
            .data
            .entries
            .get(&key)
            .map(|entry| entry.blob.clone())
    }

    /// Insert a compiled blob, queueing a flush when the pending count
    /// crosses the threshold.
    pub fn insert(&self, feature_version_uid: u64, source: &[u8], flags: u32, compiled: &[u8]) {
        let key = Self::cache_key(feature_version_uid, source);

        let needs_flush = {
            let mut inner = self.inner.lock().unwrap();
            inner.data.entries.insert(
                key,
                CacheEntry {
                    flags,
                    blob: compiled.to_vec(),
                },
            );

            inner.pending_entries += 1;
            inner.auto_serialize_path.is_some() && inner.pending_entries >= inner.threshold
        };

        if needs_flush {
            self.queue_flush();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().data.entries.len()
    }

    pub fn set_location_registry(&self, blob: Vec<u8>) {
        self.inner.lock().unwrap().data.location_registry = blob;
    }

    pub fn location_registry(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.location_registry.clone()
    }

    /// Synchronous serialization to `path`.
    ///
    /// # Errors
    ///
    /// Propagates file IO failures.
    pub fn serialize(&self, path: &Path) -> std::io::Result<()> {
        let data = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_entries = 0;
            inner.data.clone()
        };
        serialize_internal(&data, path)
    }

    /// Load a serialized cache, merging under pre-existing entries. A
    /// magic or version mismatch discards the file.
    ///
    /// # Errors
    ///
    /// Propagates file IO failures; mismatches are not errors.
    pub fn deserialize(&self, path: &Path) -> std::io::Result<()> {
        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        };

        let magic = file.read_u64::<LittleEndian>()?;
        if magic != CACHE_MAGIC {
            log::warn!("shader cache corrupted, discarding");
            return Ok(());
        }

        let version = file.read_u64::<LittleEndian>()?;
        if version != layer_version() {
            log::warn!("shader cache version mismatch, discarding");
            return Ok(());
        }

        let entry_count = file.read_u64::<LittleEndian>()?;

        let mut inner = self.inner.lock().unwrap();
        for _ in 0..entry_count {
            let key = file.read_u64::<LittleEndian>()?;
            let blob_size = file.read_u64::<LittleEndian>()? as usize;
            let flags = file.read_u32::<LittleEndian>()?;

            let mut blob = vec![0u8; blob_size];
            file.read_exact(&mut blob)?;

            // Pre-existing entries take priority.
            inner
                .data
                .entries
                .entry(key)
                .or_insert(CacheEntry { flags, blob });
        }

        let mut location_registry = Vec::new();
        file.read_to_end(&mut location_registry)?;
        if !location_registry.is_empty() {
            inner.data.location_registry = location_registry;
        }

        log::info!(
            "deserialized shader cache from {} ({} entries)",
            path.display(),
            entry_count
        );
        Ok(())
    }

    fn queue_flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_entries == 0 {
            return;
        }

        // Grow the threshold so flushes thin out over a session.
        inner.threshold = ((inner.threshold as f32) * inner.growth_factor) as u32;
        inner.pending_entries = 0;
        drop(inner);

        let mut queued = self.signal.queued.lock().unwrap();
        *queued = true;
        self.signal.condvar.notify_one();
    }
}

impl Default for ShaderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShaderCache {
    fn drop(&mut self) {
        self.signal.exit.store(true, Ordering::Release);
        self.signal.condvar.notify_all();
        if let Some(thread) = self.flush_thread.take() {
            let _ = thread.join();
        }
    }
}

fn flush_entry(inner: &Mutex<CacheInner>, signal: &FlushSignal) {
    loop {
        {
            let mut queued = signal.queued.lock().unwrap();
            while !*queued {
                if signal.exit.load(Ordering::Acquire) {
                    return;
                }
                queued = signal.condvar.wait(queued).unwrap();
            }
            *queued = false;
        }

        if signal.exit.load(Ordering::Acquire) {
            return;
        }

        // Snapshot copy; serialization happens lock free.
        let (data, path) = {
            let inner = inner.lock().unwrap();
            match &inner.auto_serialize_path {
                Some(path) => (inner.data.clone(), path.clone()),
                None => continue,
            }
        };

        if let Err(error) = serialize_internal(&data, &path) {
            log::error!("shader cache flush failed: {}", error);
        }
    }
}

fn serialize_internal(data: &CacheData, path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;

    file.write_u64::<LittleEndian>(CACHE_MAGIC)?;
    file.write_u64::<LittleEndian>(layer_version())?;
    file.write_u64::<LittleEndian>(data.entries.len() as u64)?;

    for (key, entry) in &data.entries {
        file.write_u64::<LittleEndian>(*key)?;
        file.write_u64::<LittleEndian>(entry.blob.len() as u64)?;
        file.write_u32::<LittleEndian>(entry.flags)?;
        file.write_all(&entry.blob)?;
    }

    file.write_all(&data.location_registry)?;

    log::info!(
        "serialized shader cache to {} ({} entries)",
        path.display(),
        data.entries.len()
    );
    Ok(())
}
