use lru::LruCache;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

pub const BYTES_PER_PIXEL: usize = 4;

/// Canonical path of an image file, used as the cache and dedup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PreviewKey(PathBuf);

impl PreviewKey {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        // Files that vanished keep their given path so the decoder can report NotFound
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self(canonical)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for PreviewKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Decoded RGBA8 pixels ready for upload to a texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewImage {
    pixels: image::RgbaImage,
}

impl PreviewImage {
    pub fn new(pixels: image::RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    pub fn as_rgba(&self) -> &image::RgbaImage {
        &self.pixels
    }

    pub fn byte_size(&self) -> usize {
        self.width() as usize * self.height() as usize * BYTES_PER_PIXEL
    }
}

impl From<image::DynamicImage> for PreviewImage {
    fn from(img: image::DynamicImage) -> Self {
        Self::new(img.into_rgba8())
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: PreviewKey,
    pub image: Arc<PreviewImage>,
    pub byte_size: usize,
    pub last_access: Instant,
    pub inserted_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MIB: f64 = 1024.0 * 1024.0;
        write!(
            f,
            "{} cached, {:.1} / {:.0} MiB",
            self.entries,
            self.total_bytes as f64 / MIB,
            self.max_bytes as f64 / MIB
        )
    }
}

struct CacheState {
    // Iteration order of the LruCache is the LRU order, most recent first
    entries: LruCache<PreviewKey, CacheEntry>,
    total_bytes: usize,
}

impl CacheState {
    fn remove(&mut self, key: &PreviewKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_bytes -= entry.byte_size;
        Some(entry)
    }
}

/// Preview cache bounded by the decoded footprint of its images.
///
/// The mapping and its recency order live behind one lock, so every
/// mutation (hit promotion, insert, eviction, sweep) keeps them consistent.
pub struct PreviewCache {
    state: RwLock<CacheState>,
    max_bytes: usize,
}

impl PreviewCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Looks up `key`, promoting it to most recently used on a hit.
    pub fn get(&self, key: &PreviewKey) -> Option<CacheEntry> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entry = state.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.clone())
    }

    pub fn contains(&self, key: &PreviewKey) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains(key)
    }

    /// Inserts `image` under `key` and returns the keys evicted to make room.
    ///
    /// An image larger than the whole budget is still stored; it simply
    /// ends up as the only entry.
    pub fn put(&self, key: PreviewKey, image: Arc<PreviewImage>) -> Vec<PreviewKey> {
        let byte_size = image.byte_size();
        let now = Instant::now();
        let mut evicted = Vec::new();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.remove(&key);

        while state.total_bytes + byte_size > self.max_bytes {
            match state.entries.pop_lru() {
                Some((old_key, old)) => {
                    state.total_bytes -= old.byte_size;
                    debug!("Evicted preview {} ({} bytes)", old_key, old.byte_size);
                    evicted.push(old_key);
                }
                None => break,
            }
        }

        if byte_size > self.max_bytes {
            debug!(
                "Preview {} ({} bytes) exceeds the cache budget of {} bytes on its own",
                key, byte_size, self.max_bytes
            );
        }

        state.entries.put(
            key.clone(),
            CacheEntry {
                key,
                image,
                byte_size,
                last_access: now,
                inserted_at: now,
            },
        );
        state.total_bytes += byte_size;
        evicted
    }

    pub fn remove(&self, key: &PreviewKey) -> Option<CacheEntry> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Drops entries inserted more than `max_age` ago, regardless of use.
    pub fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(Instant::now(), max_age)
    }

    pub fn sweep_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<PreviewKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.inserted_at) > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }

        if !expired.is_empty() {
            debug!("Swept {} expired previews", expired.len());
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.total_bytes = 0;
    }

    /// Keys from most to least recently used.
    pub fn lru_order(&self) -> Vec<PreviewKey> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.max_bytes,
        }
    }
}
