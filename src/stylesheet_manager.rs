//! The live stylesheet directory.
//!
//! Keeps the compiled form of every `*.mapcss` file in the style source
//! directory, plus the built-in fallback that guarantees the server
//! never has zero stylesheets. A filesystem watcher feeds a single
//! consumer thread, so create/modify/delete sequences for one path are
//! processed in order: modified or deleted stylesheets drop their cached
//! tiles, and freshly installed ones queue a zoom-0 prerender.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::{error, info, warn};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use crate::cache::TileCache;
use crate::config::ServerConfig;
use crate::error::{TileError, TileResult};
use crate::mapcss::load_stylesheet;
use crate::request::RequestManager;
use crate::strings::StringTable;
use crate::stylesheet::Stylesheet;
use crate::tile::{MetaIdentifier, TileFormat, TileIdentifier, FALLBACK_STYLE};

struct WatcherState {
    // kept alive for the watch; dropping it ends the event stream
    _watcher: notify::RecommendedWatcher,
    thread: JoinHandle<()>,
}

/// Loads, watches and serves compiled stylesheets.
pub struct StylesheetManager {
    strings: Arc<StringTable>,
    style_source: PathBuf,
    default_style: String,
    parse_timeout_ms: u64,
    sheets: RwLock<HashMap<String, Arc<Stylesheet>>>,
    watcher: Mutex<Option<WatcherState>>,
}

/// The stylesheet key of a directory entry: the file stem of a
/// non-hidden `*.mapcss` file, `None` for anything else.
fn style_key(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "mapcss" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

impl StylesheetManager {
    pub fn new(config: &ServerConfig, strings: Arc<StringTable>) -> Arc<Self> {
        let mut sheets = HashMap::new();
        sheets.insert(
            FALLBACK_STYLE.to_string(),
            Arc::new(Stylesheet::fallback(&strings)),
        );
        Arc::new(Self {
            strings,
            style_source: config.style_source.clone(),
            default_style: config.default_style.clone(),
            parse_timeout_ms: config.parse_timeout_ms,
            sheets: RwLock::new(sheets),
            watcher: Mutex::new(None),
        })
    }

    pub fn has_style(&self, key: &str) -> bool {
        self.sheets.read().contains_key(key)
    }

    /// The compiled stylesheet for `key`, the configured default if the
    /// key is unknown, or the built-in fallback.
    pub fn get(&self, key: &str) -> Arc<Stylesheet> {
        let sheets = self.sheets.read();
        if let Some(sheet) = sheets.get(key) {
            return Arc::clone(sheet);
        }
        if let Some(sheet) = sheets.get(&self.default_style) {
            return Arc::clone(sheet);
        }
        Arc::clone(
            sheets
                .get(FALLBACK_STYLE)
                .expect("fallback stylesheet is installed at construction"),
        )
    }

    pub fn style_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sheets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Parse and install one stylesheet; on success queue its zoom-0
    /// prerender. Parse failures keep whatever was loaded before.
    pub(crate) fn load_and_install(&self, key: &str, rm: Option<&RequestManager>) {
        let file = self.style_source.join(format!("{key}.mapcss"));
        match load_stylesheet(&file, &self.strings, self.parse_timeout_ms) {
            Ok(sheet) => {
                info!("stylesheet [{key}] loaded");
                self.sheets
                    .write()
                    .insert(key.to_string(), Arc::new(sheet));
                if let Some(rm) = rm {
                    if let Ok(origin) = TileIdentifier::new(
                        0,
                        0,
                        0,
                        self.strings.intern(key),
                        TileFormat::Png,
                    ) {
                        rm.submit_prerender(MetaIdentifier::from_tile(&origin));
                    }
                }
            }
            Err(TileError::Parse(diag)) => {
                error!("parsing of \"{}\" failed:", diag.file);
                error!("in line {} column {}:", diag.line, diag.column);
                error!("'{}'", diag.line_content);
                error!(
                    "{}^-here (expected {})",
                    " ".repeat(diag.column.saturating_sub(1) as usize),
                    diag.expected
                );
            }
            Err(TileError::ParseTimeout { path, timeout_ms }) => {
                error!(
                    "parsing of {} took more than {timeout_ms} ms and was canceled",
                    path.display()
                );
            }
            Err(err) => warn!("stylesheet [{key}] not loaded: {err}"),
        }
    }

    /// Drop a stylesheet and everything cached for it.
    pub(crate) fn remove(&self, key: &str, cache: &TileCache) {
        cache.delete_tiles(&self.strings.intern(key));
        self.sheets.write().remove(key);
        info!("stylesheet [{key}] dropped from stylesheet and tile cache");
    }

    /// Load every stylesheet currently in the source directory. Nested
    /// directories are not scanned.
    pub fn scan(&self, rm: Option<&RequestManager>) -> TileResult<()> {
        for entry in std::fs::read_dir(&self.style_source)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(key) = style_key(&entry.path()) {
                self.load_and_install(&key, rm);
            }
        }
        Ok(())
    }

    /// Scan the directory, then watch it for stylesheet changes.
    pub fn start_watching(
        self: &Arc<Self>,
        cache: &Arc<TileCache>,
        rm: &Arc<RequestManager>,
    ) -> TileResult<()> {
        self.scan(Some(rm.as_ref()))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| {
                let _ = tx.send(event);
            },
        )
        .map_err(|e| TileError::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&self.style_source, RecursiveMode::NonRecursive)
            .map_err(|e| TileError::Io(std::io::Error::other(e)))?;

        let manager = Arc::clone(self);
        let cache = Arc::clone(cache);
        let rm: Weak<RequestManager> = Arc::downgrade(rm);
        let thread = std::thread::Builder::new()
            .name("stylesheet-watch".into())
            .spawn(move || {
                // channel closes when the watcher is dropped on stop
                while let Ok(event) = rx.recv() {
                    match event {
                        Ok(event) => manager.handle_event(event, &cache, &rm),
                        Err(err) => warn!("stylesheet watcher error: {err}"),
                    }
                }
            })?;

        *self.watcher.lock() = Some(WatcherState {
            _watcher: watcher,
            thread,
        });
        Ok(())
    }

    fn handle_event(
        &self,
        event: notify::Event,
        cache: &Arc<TileCache>,
        rm: &Weak<RequestManager>,
    ) {
        use notify::EventKind;

        for path in &event.paths {
            let key = match style_key(path) {
                Some(key) => key,
                None => continue,
            };
            let rm = rm.upgrade();
            match &event.kind {
                EventKind::Create(_) => {
                    info!("stylesheet [{key}] added");
                    self.load_and_install(&key, rm.as_deref());
                }
                EventKind::Modify(_) => {
                    // a rename away also surfaces as a modify event
                    if path.exists() {
                        info!("stylesheet [{key}] modified");
                        self.remove(&key, cache);
                        self.load_and_install(&key, rm.as_deref());
                    } else {
                        info!("stylesheet [{key}] removed");
                        self.remove(&key, cache);
                    }
                }
                EventKind::Remove(_) => {
                    info!("stylesheet [{key}] removed");
                    self.remove(&key, cache);
                }
                _ => {}
            }
        }
    }

    /// Stop the directory watcher and join its thread.
    pub fn stop_watching(&self) {
        if let Some(state) = self.watcher.lock().take() {
            drop(state._watcher);
            let _ = state.thread.join();
        }
    }
}

impl Drop for StylesheetManager {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestServer;
    use std::fs;
    use std::time::{Duration, Instant};

    const VALID: &str = "way[highway] { width: 3; color: #102030; }";
    const ALSO_VALID: &str = "way[highway] { width: 9; }";
    const BROKEN: &str = "way[highway { width: 3; }";

    #[test]
    fn test_style_key_filtering() {
        assert_eq!(style_key(Path::new("a/roads.mapcss")).unwrap(), "roads");
        assert!(style_key(Path::new("a/.hidden.mapcss")).is_none());
        assert!(style_key(Path::new("a/readme.txt")).is_none());
        assert!(style_key(Path::new("a/roads.mapcss.bak")).is_none());
    }

    #[test]
    fn test_get_resolution_chain() {
        let server = TestServer::with_road();
        let manager = &server.styles;

        // nothing loaded: everything resolves to the fallback
        let fallback = manager.get("unknown");
        assert_eq!(fallback.path(), Path::new(".fallback"));

        // a default stylesheet takes over for unknown keys
        fs::write(server.style_dir().join("default.mapcss"), VALID).unwrap();
        manager.load_and_install("default", None);
        assert!(manager.has_style("default"));
        let resolved = manager.get("unknown");
        assert!(resolved.path().ends_with("default.mapcss"));

        // a directly known key wins
        fs::write(server.style_dir().join("roads.mapcss"), ALSO_VALID).unwrap();
        manager.load_and_install("roads", None);
        assert!(manager.get("roads").path().ends_with("roads.mapcss"));
    }

    #[test]
    fn test_scan_loads_only_visible_mapcss() {
        let server = TestServer::with_road();
        fs::write(server.style_dir().join("one.mapcss"), VALID).unwrap();
        fs::write(server.style_dir().join("two.mapcss"), ALSO_VALID).unwrap();
        fs::write(server.style_dir().join(".hidden.mapcss"), VALID).unwrap();
        fs::write(server.style_dir().join("notes.txt"), "hi").unwrap();
        fs::create_dir(server.style_dir().join("nested")).unwrap();
        fs::write(server.style_dir().join("nested/three.mapcss"), VALID).unwrap();

        server.styles.scan(None).unwrap();
        assert_eq!(
            server.styles.style_names(),
            vec![FALLBACK_STYLE.to_string(), "one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn test_parse_error_keeps_previous_sheet() {
        let server = TestServer::with_road();
        fs::write(server.style_dir().join("roads.mapcss"), VALID).unwrap();
        server.styles.load_and_install("roads", None);
        let before = server.styles.get("roads");

        fs::write(server.style_dir().join("roads.mapcss"), BROKEN).unwrap();
        server.styles.load_and_install("roads", None);
        let after = server.styles.get("roads");
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_remove_drops_cache_directory() {
        let server = TestServer::with_road();
        fs::write(server.style_dir().join("roads.mapcss"), VALID).unwrap();
        server.styles.load_and_install("roads", None);

        // populate the cache, spilling a rendered tile to disk
        let tid = TileIdentifier::new(
            0,
            0,
            0,
            server.strings.intern("roads"),
            TileFormat::Png,
        )
        .unwrap();
        server
            .cache
            .get(&tid)
            .set_image(bytes::Bytes::from_static(b"img"));
        assert!(server.config.cache_path.join("roads").exists());

        server.styles.remove("roads", &server.cache);
        assert!(!server.styles.has_style("roads"));
        assert!(!server.config.cache_path.join("roads").exists());
    }

    #[test]
    fn test_watcher_lifecycle() {
        let server = TestServer::with_road();
        let rm = crate::request::RequestManager::new(server.job_context(), &server.config);
        server
            .styles
            .start_watching(&server.cache, &rm)
            .unwrap();

        // created stylesheet appears
        fs::write(server.style_dir().join("live.mapcss"), VALID).unwrap();
        wait_for(|| server.styles.has_style("live"));

        // prerender of its zoom-0 meta was queued and eventually renders
        let origin = TileIdentifier::new(
            0,
            0,
            0,
            server.strings.intern("live"),
            TileFormat::Png,
        )
        .unwrap();
        let meta = MetaIdentifier::from_tile(&origin);
        wait_for(|| server.cache.all_rendered(&meta));

        // modified stylesheet replaces the compiled form
        let before = server.styles.get("live");
        fs::write(server.style_dir().join("live.mapcss"), ALSO_VALID).unwrap();
        wait_for(|| !Arc::ptr_eq(&before, &server.styles.get("live")));

        // let the re-triggered prerender cascade drain before deleting,
        // so no straggler job recreates the cache directory
        let sub = MetaIdentifier::from_tile(
            &TileIdentifier::new(0, 0, 1, server.strings.intern("live"), TileFormat::Png).unwrap(),
        );
        wait_for(|| server.cache.all_rendered(&meta) && server.cache.all_rendered(&sub));

        // deleted stylesheet disappears along with its cache directory
        fs::remove_file(server.style_dir().join("live.mapcss")).unwrap();
        wait_for(|| !server.styles.has_style("live"));
        wait_for(|| !server.config.cache_path.join("live").exists());

        server.styles.stop_watching();
        rm.stop();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}
