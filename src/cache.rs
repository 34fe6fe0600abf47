//! Two-tier tile cache: per-stylesheet maps with a shared LRU list and
//! disk spillover for low-zoom tiles.
//!
//! One mutex covers the maps and the LRU order. Disk reads and eviction
//! writes happen under the lock; evictions to disk are rare next to
//! in-memory hits.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::strings::CachedString;
use crate::tile::{MetaIdentifier, Tile, TileIdentifier};

/// Transparent 256x256 PNG used when no default tile file is configured
/// or the configured one cannot be read.
static BUILTIN_DEFAULT_TILE: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x06, 0x00, 0x00, 0x00, 0x5c,
    0x72, 0xa8, 0x66, 0x00, 0x00, 0x01, 0x15, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0xed, 0xc1,
    0x31, 0x01, 0x00, 0x00, 0x00, 0xc2, 0xa0, 0xf5, 0x4f, 0xed, 0x6b, 0x08, 0xa0, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x03, 0x01, 0x3c, 0x00,
    0x01, 0xd8, 0x29, 0x43, 0x04, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42,
    0x60, 0x82,
];

type StyleCache = HashMap<TileIdentifier, Arc<Tile>>;

struct CacheInner {
    per_style: HashMap<CachedString, StyleCache>,
    /// Back = most recently used, front = eviction candidate.
    lru: VecDeque<TileIdentifier>,
}

/// The in-memory tile store with disk spillover.
pub struct TileCache {
    capacity: usize,
    keep_zoom: u8,
    cache_path: PathBuf,
    default_tile: Bytes,
    inner: Mutex<CacheInner>,
}

impl TileCache {
    pub fn new(config: &ServerConfig) -> Self {
        let default_tile = match &config.default_tile_path {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    warn!(
                        "could not read default tile {}: {err}; using built-in",
                        path.display()
                    );
                    Bytes::from_static(BUILTIN_DEFAULT_TILE)
                }
            },
            None => Bytes::from_static(BUILTIN_DEFAULT_TILE),
        };

        Self {
            capacity: config.cache_size.max(1),
            keep_zoom: config.cache_keep_tile,
            cache_path: config.cache_path.clone(),
            default_tile,
            inner: Mutex::new(CacheInner {
                per_style: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    fn tile_path(&self, tid: &TileIdentifier) -> PathBuf {
        self.cache_path
            .join(tid.stylesheet().as_str())
            .join(tid.cache_file_name())
    }

    /// Fetch the shared tile for `tid`, creating an unrendered one on a
    /// miss. Low-zoom misses try the disk spillover first. May evict.
    pub fn get(&self, tid: &TileIdentifier) -> Arc<Tile> {
        let mut inner = self.inner.lock();

        if !inner.per_style.contains_key(tid.stylesheet()) {
            inner
                .per_style
                .insert(tid.stylesheet().clone(), HashMap::new());
            let dir = self.cache_path.join(tid.stylesheet().as_str());
            if let Err(err) = std::fs::create_dir_all(&dir) {
                debug!("could not create cache dir {}: {err}", dir.display());
            }
        }

        let cached = inner
            .per_style
            .get(tid.stylesheet())
            .and_then(|cache| cache.get(tid))
            .map(Arc::clone);

        let tile = if let Some(tile) = cached {
            // refresh LRU position
            if let Some(index) = inner.lru.iter().position(|t| t == tid) {
                inner.lru.remove(index);
            }
            inner.lru.push_back(tid.clone());
            tile
        } else {
            let tile = Arc::new(Tile::new(tid.clone()));
            if tid.zoom() <= self.keep_zoom {
                let path = self.tile_path(tid);
                match std::fs::read(&path) {
                    Ok(bytes) => tile.set_image(Bytes::from(bytes)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => debug!("cache read {} failed: {err}", path.display()),
                }
            }
            inner
                .per_style
                .get_mut(tid.stylesheet())
                .expect("style cache just ensured")
                .insert(tid.clone(), Arc::clone(&tile));
            inner.lru.push_back(tid.clone());
            tile
        };

        while inner.lru.len() > self.capacity {
            let victim = match inner.lru.pop_front() {
                Some(victim) => victim,
                None => break,
            };
            let evicted = inner
                .per_style
                .get_mut(victim.stylesheet())
                .and_then(|cache| cache.remove(&victim));
            if let Some(evicted) = evicted {
                if victim.zoom() <= self.keep_zoom {
                    if let Some(image) = evicted.image() {
                        let path = self.tile_path(&victim);
                        if let Err(err) = std::fs::write(&path, &image) {
                            warn!("cache write {} failed: {err}", path.display());
                        }
                    }
                }
                debug!("evicted {victim}");
            }
        }

        tile
    }

    /// Persist a freshly rendered low-zoom tile right away instead of
    /// waiting for its eviction, so prerendered zoom levels survive a
    /// restart. Best-effort like the eviction write.
    pub fn persist(&self, tile: &Tile) {
        let tid = tile.id();
        if tid.zoom() > self.keep_zoom || tid.is_empty_sentinel() {
            return;
        }
        if let Some(image) = tile.image() {
            let path = self.tile_path(tid);
            if let Err(err) = std::fs::write(&path, &image) {
                warn!("cache write {} failed: {err}", path.display());
            }
        }
    }

    /// Whether every tile of `meta` is present and rendered.
    ///
    /// Read-only: no LRU refresh, no disk probe. Used to drop redundant
    /// prerender submissions.
    pub fn all_rendered(&self, meta: &MetaIdentifier) -> bool {
        let inner = self.inner.lock();
        let style_cache = match inner.per_style.get(meta.stylesheet()) {
            Some(cache) => cache,
            None => return false,
        };
        meta.tiles()
            .iter()
            .all(|tid| style_cache.get(tid).is_some_and(|t| t.is_rendered()))
    }

    /// Drop every entry of a stylesheet and remove its cache directory.
    ///
    /// Directory removal is best-effort: the stylesheet may have raced a
    /// spillover write, so a vanished or half-written directory only
    /// warns.
    pub fn delete_tiles(&self, style: &CachedString) {
        let mut inner = self.inner.lock();
        inner.per_style.remove(style);
        inner.lru.retain(|tid| tid.stylesheet() != style);
        drop(inner);

        let dir = self.cache_path.join(style.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not delete cache dir {}: {err}", dir.display()),
        }
    }

    /// The image served whenever a request cannot be answered properly.
    pub fn default_tile(&self) -> Bytes {
        self.default_tile.clone()
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.inner.lock().lru.len()
    }
}
