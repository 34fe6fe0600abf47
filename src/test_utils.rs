//! Shared test fixtures.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::cache::TileCache;
use crate::config::ServerConfig;
use crate::geodata::{Geodata, GeodataBuilder, NodeId, RelId, WayId};
use crate::geom::{FixedPoint, MERC_SIZE};
use crate::job::JobContext;
use crate::renderer::Renderer;
use crate::strings::{StringTable, Tags};
use crate::stylesheet_manager::StylesheetManager;
use crate::tile::{TileFormat, TileIdentifier};

/// A fully wired core over a small in-memory dataset and temp
/// directories for cache and stylesheets.
pub struct TestServer {
    pub temp: TempDir,
    pub config: ServerConfig,
    pub strings: Arc<StringTable>,
    pub geodata: Arc<Geodata>,
    pub cache: Arc<TileCache>,
    pub styles: Arc<StylesheetManager>,
    pub renderer: Arc<Renderer>,
}

/// A diagonal road, a forest polygon and a boundary relation in the
/// north-west quadrant of the map.
pub fn road_world(strings: &StringTable) -> Geodata {
    let mut builder = GeodataBuilder::new();
    let q = MERC_SIZE / 8;
    builder.add_node_tagged(NodeId(1), FixedPoint::new(q, q), Tags::new());
    builder.add_node_tagged(NodeId(2), FixedPoint::new(q * 2, q * 2), Tags::new());
    builder.add_node_tagged(
        NodeId(3),
        FixedPoint::new(q, q * 2),
        Tags::from_pairs([("amenity", "cafe"), ("name", "Corner")], strings),
    );
    builder.add_way_tagged(
        WayId(10),
        vec![NodeId(1), NodeId(2)],
        Tags::from_pairs([("highway", "primary"), ("name", "Long Road")], strings),
    );
    builder.add_way_tagged(
        WayId(11),
        vec![NodeId(1), NodeId(2), NodeId(3), NodeId(1)],
        Tags::from_pairs([("landuse", "forest")], strings),
    );
    builder.add_relation_tagged(
        RelId(20),
        vec![],
        vec![],
        vec![WayId(11)],
        vec!["outer".into()],
        Tags::from_pairs([("boundary", "administrative")], strings),
    );
    builder.build()
}

impl TestServer {
    pub fn with_road() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let cache_path = temp.path().join("cache");
        let style_source = temp.path().join("styles");
        std::fs::create_dir_all(&cache_path).unwrap();
        std::fs::create_dir_all(&style_source).unwrap();

        let config = ServerConfig {
            num_threads: 2,
            max_queue_size: 64,
            cache_size: 256,
            cache_keep_tile: 12,
            cache_path,
            prerender_level: 1,
            parse_timeout_ms: 2_000,
            style_source,
            default_style: "default".into(),
            default_tile_path: None,
        };

        let strings = Arc::new(StringTable::new());
        let geodata = Arc::new(road_world(&strings));
        let cache = Arc::new(TileCache::new(&config));
        let styles = StylesheetManager::new(&config, Arc::clone(&strings));
        let renderer = Arc::new(Renderer::new(Arc::clone(&geodata)));

        Self {
            temp,
            config,
            strings,
            geodata,
            cache,
            styles,
            renderer,
        }
    }

    pub fn job_context(&self) -> JobContext {
        JobContext {
            geodata: Arc::clone(&self.geodata),
            cache: Arc::clone(&self.cache),
            styles: Arc::clone(&self.styles),
            renderer: Arc::clone(&self.renderer),
            strings: Arc::clone(&self.strings),
        }
    }

    pub fn tid(&self, x: u32, y: u32, zoom: u8) -> TileIdentifier {
        TileIdentifier::new(x, y, zoom, self.strings.intern("default"), TileFormat::Png)
            .expect("valid test tile")
    }

    pub fn style_dir(&self) -> &Path {
        &self.config.style_source
    }
}
