//! tileserv: the request pipeline and tile production core of a MapCSS
//! map tile server.
//!
//! Given an OSM-derived dataset and a directory of MapCSS stylesheets,
//! this crate serves rendered raster (PNG) or vector (SVG) tiles in the
//! web-mercator slippy-map scheme, and prerenders tiles up to a
//! configured zoom. It provides:
//! - an admission-controlled job queue over a plain worker pool, with
//!   meta-tile work units and in-flight coalescing
//! - a two-tier tile cache (in-memory LRU plus disk spillover)
//! - a hot-reloading stylesheet directory with cache invalidation
//! - the MapCSS match/evaluate engine turning a stylesheet and a
//!   geographic query into per-object render styles
//! - meta-canvas render orchestration with label placement and tile
//!   slicing
//!
//! The HTTP wire, CLI and logging backends are the embedding binary's
//! business; it talks to the core through [`TileServer`].
//!
//! ```no_run
//! use tileserv::{ServerConfig, TileServer};
//!
//! let config = ServerConfig::default();
//! let server = TileServer::open(config, std::path::Path::new("region.json")).unwrap();
//! server.start().unwrap();
//!
//! let (tx, rx) = crossbeam_channel::bounded::<tileserv::TileResponse>(1);
//! server.handle_request("/default/12/2048/1360.png", Box::new(tx)).unwrap();
//! let response = rx.recv().unwrap();
//! # let _ = response;
//! ```

pub mod cache;
pub mod canvas;
pub mod color;
pub mod config;
pub mod error;
pub mod eval;
pub mod geodata;
pub mod geom;
pub mod job;
pub mod labels;
pub mod mapcss;
pub mod renderer;
pub mod request;
pub mod rule;
pub mod strings;
pub mod style;
pub mod stylesheet;
pub mod stylesheet_manager;
pub mod tile;
#[cfg(test)]
pub(crate) mod test_utils;

use std::path::Path;
use std::sync::Arc;

pub use crate::cache::TileCache;
pub use crate::config::ServerConfig;
pub use crate::error::{ParseDiagnostics, TileError, TileResult};
pub use crate::geodata::Geodata;
pub use crate::job::JobContext;
pub use crate::renderer::Renderer;
pub use crate::request::{ReplyStatus, RequestManager, TileResponse, TileSink};
pub use crate::strings::{CachedString, StringTable};
pub use crate::stylesheet_manager::StylesheetManager;
pub use crate::tile::{MetaIdentifier, Tile, TileFormat, TileIdentifier};

/// The assembled core: every component behind one handle.
///
/// Construction wires the components in dependency order (strings,
/// geodata, cache, stylesheet manager, renderer, request manager) and
/// the embedding front end drives it with URLs and reply sinks.
pub struct TileServer {
    config: ServerConfig,
    strings: Arc<StringTable>,
    geodata: Arc<Geodata>,
    cache: Arc<TileCache>,
    styles: Arc<StylesheetManager>,
    renderer: Arc<Renderer>,
    request_manager: Arc<RequestManager>,
}

impl TileServer {
    /// Wire a server over an already loaded dataset.
    pub fn new(
        config: ServerConfig,
        strings: Arc<StringTable>,
        geodata: Arc<Geodata>,
    ) -> Arc<Self> {
        let cache = Arc::new(TileCache::new(&config));
        let styles = StylesheetManager::new(&config, Arc::clone(&strings));
        let renderer = Arc::new(Renderer::new(Arc::clone(&geodata)));
        let request_manager = RequestManager::new(
            JobContext {
                geodata: Arc::clone(&geodata),
                cache: Arc::clone(&cache),
                styles: Arc::clone(&styles),
                renderer: Arc::clone(&renderer),
                strings: Arc::clone(&strings),
            },
            &config,
        );

        Arc::new(Self {
            config,
            strings,
            geodata,
            cache,
            styles,
            renderer,
            request_manager,
        })
    }

    /// Load the dataset from `geodata_path`, then wire a server.
    pub fn open(config: ServerConfig, geodata_path: &Path) -> TileResult<Arc<Self>> {
        let strings = Arc::new(StringTable::new());
        let geodata = Geodata::load(geodata_path, &strings)?;
        Ok(Self::new(config, strings, geodata))
    }

    /// Load all stylesheets and start watching the style directory.
    /// Freshly loaded stylesheets queue their prerender cascade.
    pub fn start(&self) -> TileResult<()> {
        self.styles
            .start_watching(&self.cache, &self.request_manager)
    }

    /// Parse a request URL into a tile identifier.
    ///
    /// Errors map to HTTP statuses in the front end: `BadRequest` → 400,
    /// `UnsupportedFormat` → 501.
    pub fn tile_identifier(&self, url: &str) -> TileResult<TileIdentifier> {
        TileIdentifier::from_url(
            url,
            |style| self.styles.has_style(style),
            &self.config.default_style,
            &self.strings,
        )
    }

    /// Parse and admit one tile request. The sink receives exactly one
    /// [`TileResponse`] once the tile is available (or refused).
    pub fn handle_request(&self, url: &str, sink: Box<dyn TileSink>) -> TileResult<()> {
        let tid = self.tile_identifier(url)?;
        self.request_manager.submit_user(tid, sink);
        Ok(())
    }

    pub fn submit_prerender(&self, mid: MetaIdentifier) {
        self.request_manager.submit_prerender(mid);
    }

    /// Stop the stylesheet watcher and the worker pool. Running jobs
    /// finish; queued jobs are dropped.
    pub fn stop(&self) {
        self.styles.stop_watching();
        self.request_manager.stop();
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn styles(&self) -> &Arc<StylesheetManager> {
        &self.styles
    }

    pub fn geodata(&self) -> &Arc<Geodata> {
        &self.geodata
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn request_manager(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::road_world;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        server: Arc<TileServer>,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("cache");
        let style_source = temp.path().join("styles");
        std::fs::create_dir_all(&cache_path).unwrap();
        std::fs::create_dir_all(&style_source).unwrap();
        std::fs::write(
            style_source.join("default.mapcss"),
            "canvas { fill-color: #efefd0; }\nway[highway] { width: 2; color: #555555; }\n",
        )
        .unwrap();

        let config = ServerConfig {
            num_threads: 2,
            cache_path,
            style_source,
            prerender_level: 0,
            ..ServerConfig::default()
        };
        let strings = Arc::new(StringTable::new());
        let geodata = Arc::new(road_world(&strings));
        let server = TileServer::new(config, strings, geodata);
        server.styles().scan(None).unwrap();
        Harness {
            _temp: temp,
            server,
        }
    }

    fn request(server: &TileServer, url: &str) -> TileResponse {
        let (tx, rx) = crossbeam_channel::bounded(1);
        server.handle_request(url, Box::new(tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(30)).expect("no reply")
    }

    #[test]
    fn test_cold_png_at_zoom_zero() {
        let h = harness();
        let response = request(&h.server, "/default/0/0/0.png");
        assert_eq!(response.status, ReplyStatus::Ok);
        assert_eq!(response.format.content_type(), "image/png");
        let body = response.image.unwrap();
        assert!(body.starts_with(&[0x89, b'P', b'N', b'G']));

        // tile is now in the memory cache and persisted on disk
        let tid = h.server.tile_identifier("/default/0/0/0.png").unwrap();
        assert!(h.server.cache().get(&tid).is_rendered());
        let on_disk = h.server.config().cache_path.join("default/0-0-0.png");
        assert_eq!(std::fs::read(on_disk).unwrap(), body);
        h.server.stop();
    }

    #[test]
    fn test_svg_request() {
        let h = harness();
        let response = request(&h.server, "/default/1/0/0.svg");
        assert_eq!(response.status, ReplyStatus::Ok);
        assert_eq!(response.format.content_type(), "image/svg+xml");
        let body = String::from_utf8(response.image.unwrap().to_vec()).unwrap();
        assert!(body.starts_with("<svg"));
        h.server.stop();
    }

    #[test]
    fn test_unsupported_format_is_not_implemented() {
        let h = harness();
        let err = h
            .server
            .handle_request("/default/12/2048/1360.jpg", Box::new(drop_sink()))
            .unwrap_err();
        assert!(matches!(err, TileError::UnsupportedFormat(_)));
        h.server.stop();
    }

    #[test]
    fn test_malformed_urls_are_bad_requests() {
        let h = harness();
        for url in ["/default/99/0/0.png", "/default/3/-1/0.png", "/short.png"] {
            let err = h
                .server
                .handle_request(url, Box::new(drop_sink()))
                .unwrap_err();
            assert!(matches!(err, TileError::BadRequest(_)), "{url}");
        }
        h.server.stop();
    }

    #[test]
    fn test_unknown_style_substitutes_default() {
        let h = harness();
        let tid = h.server.tile_identifier("/no-such-style/3/1/1.png").unwrap();
        assert_eq!(tid.stylesheet().as_str(), "default");
        h.server.stop();
    }

    #[test]
    fn test_empty_region_serves_canvas_render() {
        let h = harness();
        // the dataset lives in the north-west; this tile is far away
        let response = request(&h.server, "/default/13/8000/6000.png");
        assert_eq!(response.status, ReplyStatus::Ok);
        let empty_body = response.image.unwrap();

        // another data-free tile shares the same canvas-only image
        let response = request(&h.server, "/default/13/8100/6100.png");
        assert_eq!(response.image.unwrap(), empty_body);
        h.server.stop();
    }

    #[test]
    fn test_repeated_request_hits_cache() {
        let h = harness();
        let first = request(&h.server, "/default/1/0/0.png");
        let jobs_after_first = h.server.request_manager().jobs_processed();
        let second = request(&h.server, "/default/1/0/0.png");
        assert_eq!(first.image.unwrap(), second.image.unwrap());
        // the second request still runs a job, but it short-circuits on
        // the cache; eviction never changes re-fetched content
        assert!(h.server.request_manager().jobs_processed() >= jobs_after_first);
        h.server.stop();
    }

    fn drop_sink() -> impl TileSink {
        struct Null;
        impl TileSink for Null {
            fn deliver(self: Box<Self>, _response: TileResponse) {}
        }
        Null
    }
}
