//! Read-only geodata store and its query interface.
//!
//! The offline importer persists nodes, ways and relations as JSON; the
//! server loads the file once at startup and only queries it afterwards.
//! Queries are bounding-box scans behind a narrow interface, so a spatial
//! index can replace them without touching any caller.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::TileResult;
use crate::geom::{FixedPoint, FixedRect};
use crate::strings::{StringTable, Tags};

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

typed_id!(NodeId);
typed_id!(WayId);
typed_id!(RelId);

/// A tagged point.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub pos: FixedPoint,
    pub tags: Tags,
}

/// An ordered list of nodes with tags.
#[derive(Debug, Clone)]
pub struct Way {
    pub id: WayId,
    pub nodes: Vec<NodeId>,
    pub tags: Tags,
}

impl Way {
    /// A way is an area iff its first and last node coincide.
    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 2 && self.nodes.first() == self.nodes.last()
    }
}

/// A relation over nodes and ways, with per-member roles.
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: RelId,
    pub nodes: Vec<NodeId>,
    pub node_roles: Vec<String>,
    pub ways: Vec<WayId>,
    pub way_roles: Vec<String>,
    pub tags: Tags,
}

/// The preloaded dataset.
///
/// Way and relation bounding boxes are precomputed at build time so rect
/// queries do not touch member geometry.
pub struct Geodata {
    nodes: HashMap<NodeId, Node>,
    ways: HashMap<WayId, Way>,
    relations: HashMap<RelId, Relation>,
    way_bounds: HashMap<WayId, FixedRect>,
    relation_bounds: HashMap<RelId, FixedRect>,
    bounds: Option<FixedRect>,
}

impl Geodata {
    pub fn empty() -> Self {
        GeodataBuilder::new().build()
    }

    /// All nodes whose point lies in `rect`.
    pub fn nodes_in(&self, rect: &FixedRect) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| rect.contains_point(n.pos))
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All ways whose bounding box intersects `rect`.
    pub fn ways_in(&self, rect: &FixedRect) -> Vec<WayId> {
        let mut ids: Vec<WayId> = self
            .way_bounds
            .iter()
            .filter(|(_, b)| rect.intersects(b))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All relations whose bounding box intersects `rect`.
    pub fn relations_in(&self, rect: &FixedRect) -> Vec<RelId> {
        let mut ids: Vec<RelId> = self
            .relation_bounds
            .iter()
            .filter(|(_, b)| rect.intersects(b))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Cheap predicate used to short-circuit empty tiles.
    pub fn contains_data(&self, rect: &FixedRect) -> bool {
        match &self.bounds {
            Some(bounds) => bounds.intersects(rect),
            None => false,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn way(&self, id: WayId) -> Option<&Way> {
        self.ways.get(&id)
    }

    pub fn relation(&self, id: RelId) -> Option<&Relation> {
        self.relations.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Load the importer's JSON output.
    pub fn load(path: &Path, strings: &StringTable) -> TileResult<Arc<Self>> {
        let content = std::fs::read_to_string(path)?;
        let file: GeodataFile = serde_json::from_str(&content)?;

        let mut builder = GeodataBuilder::new();
        for n in file.nodes {
            builder.add_node_tagged(
                NodeId(n.id),
                FixedPoint::new(n.x, n.y),
                tags_from(&n.tags, strings),
            );
        }
        for w in file.ways {
            builder.add_way_tagged(
                WayId(w.id),
                w.nodes.into_iter().map(NodeId).collect(),
                tags_from(&w.tags, strings),
            );
        }
        for r in file.relations {
            builder.add_relation_tagged(
                RelId(r.id),
                r.nodes.into_iter().map(NodeId).collect(),
                r.node_roles,
                r.ways.into_iter().map(WayId).collect(),
                r.way_roles,
                tags_from(&r.tags, strings),
            );
        }
        Ok(Arc::new(builder.build()))
    }
}

fn tags_from(raw: &HashMap<String, String>, strings: &StringTable) -> Tags {
    let mut tags = Tags::new();
    for (k, v) in raw {
        tags.insert(strings.intern(k), strings.intern(v));
    }
    tags
}

#[derive(Deserialize)]
struct RawNode {
    id: u64,
    x: i64,
    y: i64,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawWay {
    id: u64,
    nodes: Vec<u64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawRelation {
    id: u64,
    #[serde(default)]
    nodes: Vec<u64>,
    #[serde(default)]
    node_roles: Vec<String>,
    #[serde(default)]
    ways: Vec<u64>,
    #[serde(default)]
    way_roles: Vec<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct GeodataFile {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    ways: Vec<RawWay>,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

/// Incremental construction of a `Geodata` set.
pub struct GeodataBuilder {
    nodes: HashMap<NodeId, Node>,
    ways: HashMap<WayId, Way>,
    relations: HashMap<RelId, Relation>,
}

impl GeodataBuilder {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            ways: HashMap::new(),
            relations: HashMap::new(),
        }
    }

    pub fn add_node_tagged(&mut self, id: NodeId, pos: FixedPoint, tags: Tags) -> &mut Self {
        self.nodes.insert(id, Node { id, pos, tags });
        self
    }

    pub fn add_way_tagged(&mut self, id: WayId, nodes: Vec<NodeId>, tags: Tags) -> &mut Self {
        self.ways.insert(id, Way { id, nodes, tags });
        self
    }

    pub fn add_relation_tagged(
        &mut self,
        id: RelId,
        nodes: Vec<NodeId>,
        node_roles: Vec<String>,
        ways: Vec<WayId>,
        way_roles: Vec<String>,
        tags: Tags,
    ) -> &mut Self {
        self.relations.insert(
            id,
            Relation {
                id,
                nodes,
                node_roles,
                ways,
                way_roles,
                tags,
            },
        );
        self
    }

    pub fn build(self) -> Geodata {
        let mut way_bounds = HashMap::with_capacity(self.ways.len());
        for way in self.ways.values() {
            let points: Vec<FixedPoint> = way
                .nodes
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| n.pos)
                .collect();
            if !points.is_empty() {
                way_bounds.insert(way.id, FixedRect::enclosing(&points));
            }
        }

        let mut relation_bounds = HashMap::with_capacity(self.relations.len());
        for rel in self.relations.values() {
            let mut points: Vec<FixedPoint> = rel
                .nodes
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| n.pos)
                .collect();
            for way_id in &rel.ways {
                if let Some(b) = way_bounds.get(way_id) {
                    points.push(FixedPoint::new(b.min_x, b.min_y));
                    points.push(FixedPoint::new(b.max_x, b.max_y));
                }
            }
            if !points.is_empty() {
                relation_bounds.insert(rel.id, FixedRect::enclosing(&points));
            }
        }

        let mut all: Vec<FixedPoint> = self.nodes.values().map(|n| n.pos).collect();
        for b in way_bounds.values() {
            all.push(FixedPoint::new(b.min_x, b.min_y));
            all.push(FixedPoint::new(b.max_x, b.max_y));
        }
        let bounds = if all.is_empty() {
            None
        } else {
            Some(FixedRect::enclosing(&all))
        };

        Geodata {
            nodes: self.nodes,
            ways: self.ways,
            relations: self.relations,
            way_bounds,
            relation_bounds,
            bounds,
        }
    }
}

impl Default for GeodataBuilder {
    fn default() -> Self {
        Self::new()
    }
}
