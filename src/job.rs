//! The meta-tile unit of work.
//!
//! A job renders one meta-tile: probe the cache for every member tile,
//! short-circuit data-free regions to a shared empty tile, otherwise
//! query, match and render, then slice the result back into the member
//! tiles. Delivery answers every reply attached while the job was in
//! flight, each exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use crate::cache::TileCache;
use crate::error::TileResult;
use crate::geodata::Geodata;
use crate::renderer::{meta_render_rect, Renderer};
use crate::request::{TileResponse, TileSink};
use crate::strings::StringTable;
use crate::stylesheet_manager::StylesheetManager;
use crate::tile::{MetaIdentifier, Tile, TileFormat, TileIdentifier};

/// Shared handles a job needs to run.
pub struct JobContext {
    pub geodata: Arc<Geodata>,
    pub cache: Arc<TileCache>,
    pub styles: Arc<StylesheetManager>,
    pub renderer: Arc<Renderer>,
    pub strings: Arc<StringTable>,
}

/// What a processed job hands to delivery.
pub enum JobOutcome {
    /// Every member tile, rendered.
    Tiles(Vec<Arc<Tile>>),
    /// The region had no data; one empty tile answers everyone.
    Empty(Arc<Tile>),
}

/// The result a job settled on, kept so replies attached after delivery
/// (the job stays in the in-flight index until it is delivered) are
/// answered immediately instead of being lost.
#[derive(Clone)]
enum Settled {
    Tiles(Vec<Arc<Tile>>),
    Empty(Arc<Tile>),
    Failed(Bytes),
}

impl Settled {
    fn from_outcome(outcome: &JobOutcome) -> Self {
        match outcome {
            JobOutcome::Tiles(tiles) => Settled::Tiles(tiles.clone()),
            JobOutcome::Empty(tile) => Settled::Empty(Arc::clone(tile)),
        }
    }

    fn response_for(&self, tid: &TileIdentifier, format: TileFormat) -> TileResponse {
        match self {
            Settled::Tiles(tiles) => match tiles.iter().find(|tile| tile.id() == tid) {
                Some(tile) => TileResponse::ok(tile.image(), format),
                None => TileResponse::internal_error(None, format),
            },
            Settled::Empty(tile) => TileResponse::ok(tile.image(), format),
            Settled::Failed(default) => {
                TileResponse::internal_error(Some(default.clone()), format)
            }
        }
    }
}

enum SinkState {
    Pending(HashMap<TileIdentifier, Vec<Box<dyn TileSink>>>),
    Settled(Settled),
}

/// One queued render unit covering a meta-tile.
pub struct Job {
    mid: MetaIdentifier,
    prerender: bool,
    sinks: Mutex<SinkState>,
}

impl Job {
    pub fn new(mid: MetaIdentifier, prerender: bool) -> Self {
        Self {
            mid,
            prerender,
            sinks: Mutex::new(SinkState::Pending(HashMap::new())),
        }
    }

    pub fn mid(&self) -> &MetaIdentifier {
        &self.mid
    }

    pub fn is_prerender(&self) -> bool {
        self.prerender
    }

    /// Attach a reply to one of this job's tiles. A reply attached after
    /// the job already delivered is answered from the settled result on
    /// the spot.
    pub fn attach(&self, tid: TileIdentifier, sink: Box<dyn TileSink>) {
        let mut state = self.sinks.lock();
        match &mut *state {
            SinkState::Pending(map) => {
                map.entry(tid).or_default().push(sink);
            }
            SinkState::Settled(settled) => {
                let response = settled.response_for(&tid, self.mid.format());
                drop(state);
                sink.deliver(response);
            }
        }
    }

    /// Produce the meta-tile's member tiles.
    pub fn process(&self, ctx: &JobContext) -> TileResult<JobOutcome> {
        let tiles: Vec<Arc<Tile>> = self.mid.tiles().iter().map(|tid| ctx.cache.get(tid)).collect();
        if tiles.iter().all(|tile| tile.is_rendered()) {
            debug!("{} fully cached", self.mid);
            return Ok(JobOutcome::Tiles(tiles));
        }

        let rect = meta_render_rect(&self.mid);
        let stylesheet = ctx.styles.get(self.mid.stylesheet().as_str());

        if !ctx.geodata.contains_data(&rect) {
            let empty_tid =
                TileIdentifier::empty_tile(self.mid.stylesheet().clone(), self.mid.format());
            let tile = ctx.cache.get(&empty_tid);
            if !tile.is_rendered() {
                let attrs = stylesheet.match_all(
                    &[],
                    &[],
                    &[],
                    self.mid.zoom(),
                    &ctx.geodata,
                    &ctx.strings,
                );
                let image = ctx.renderer.render_empty(&attrs, self.mid.format())?;
                tile.set_image(image);
            }
            return Ok(JobOutcome::Empty(tile));
        }

        let node_ids = ctx.geodata.nodes_in(&rect);
        let way_ids = ctx.geodata.ways_in(&rect);
        let rel_ids = ctx.geodata.relations_in(&rect);

        let attrs = stylesheet.match_all(
            &node_ids,
            &way_ids,
            &rel_ids,
            self.mid.zoom(),
            &ctx.geodata,
            &ctx.strings,
        );

        let rendered = ctx.renderer.render_meta(&attrs, &self.mid)?;
        let by_id: HashMap<&TileIdentifier, &Arc<Tile>> =
            tiles.iter().map(|tile| (tile.id(), tile)).collect();
        for (tid, image) in rendered {
            if let Some(tile) = by_id.get(&tid) {
                tile.set_image(image);
            }
        }
        for tile in &tiles {
            ctx.cache.persist(tile);
        }

        Ok(JobOutcome::Tiles(tiles))
    }

    /// Answer every attached reply from the outcome.
    pub fn deliver(&self, outcome: &JobOutcome) {
        self.settle(Settled::from_outcome(outcome));
    }

    /// Answer every attached reply with an internal error and the
    /// default tile.
    pub fn deliver_error(&self, default_tile: Bytes) {
        self.settle(Settled::Failed(default_tile));
    }

    /// Record the result and drain the pending replies. Each reply is
    /// answered exactly once: either here, or in `attach` for replies
    /// arriving after settlement.
    fn settle(&self, settled: Settled) {
        let pending = {
            let mut state = self.sinks.lock();
            match std::mem::replace(&mut *state, SinkState::Settled(settled.clone())) {
                SinkState::Pending(map) => map,
                SinkState::Settled(previous) => {
                    // settled twice; keep the first result
                    *state = SinkState::Settled(previous);
                    HashMap::new()
                }
            }
        };
        for (tid, replies) in pending {
            let response = settled.response_for(&tid, self.mid.format());
            for sink in replies {
                sink.deliver(response.clone());
            }
        }
    }
}
