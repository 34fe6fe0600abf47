//! Meta-tile render orchestration.
//!
//! Decides what gets painted where: objects sorted by `(z_index, id)`,
//! five logical layers per OSM layer, compositing at each OSM layer
//! boundary, label and shield placement after all object painting, and
//! finally slicing the meta canvas into per-tile images. What a stroke
//! or glyph looks like is the canvas backend's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::canvas::{canvas_for, Layer, RenderCanvas, StrokeStyle, TextSpec, TILE_SIZE};
use crate::color::Color;
use crate::error::TileResult;
use crate::geodata::{Geodata, Node, NodeId, RelId, Way, WayId};
use crate::geom::{tile_to_mercator, FixedRect, FloatPoint, FloatRect};
use crate::labels::{place_labels, place_shields, Label, PlacementBounds, Shield, TextStyle};
use crate::style::{RenderAttributes, Style, TextPosition};
use crate::tile::{MetaIdentifier, TileFormat, TileIdentifier};

/// Fraction of one tile width overdrawn on every side of the meta canvas
/// so geometry crossing tile edges renders identically in neighbours.
pub const META_OVERLAP: f64 = 0.25;

/// Overlap border in pixels.
pub const META_BORDER: f64 = TILE_SIZE as f64 * META_OVERLAP;

/// Mercator rect a meta-tile render covers, overlap border included.
pub fn meta_render_rect(mid: &MetaIdentifier) -> FixedRect {
    let nw = tile_to_mercator(mid.x(), mid.y(), mid.zoom());
    let se = tile_to_mercator(mid.x() + mid.width(), mid.y() + mid.height(), mid.zoom());
    let rect = FixedRect::from_points(nw, se);
    let border_x = (rect.width() as f64 / mid.width() as f64 * META_OVERLAP) as i64;
    let border_y = (rect.height() as f64 / mid.height() as f64 * META_OVERLAP) as i64;
    rect.grow(border_x, border_y)
}

/// Mercator → canvas pixel projection for one meta render.
struct Projection {
    origin_x: f64,
    origin_y: f64,
    scale_x: f64,
    scale_y: f64,
}

impl Projection {
    fn for_meta(mid: &MetaIdentifier) -> Self {
        let nw = tile_to_mercator(mid.x(), mid.y(), mid.zoom());
        let se = tile_to_mercator(mid.x() + mid.width(), mid.y() + mid.height(), mid.zoom());
        let rect = FixedRect::from_points(nw, se);
        let width_px = mid.width() as f64 * TILE_SIZE as f64;
        let height_px = mid.height() as f64 * TILE_SIZE as f64;
        Self {
            origin_x: rect.min_x as f64,
            origin_y: rect.min_y as f64,
            scale_x: width_px / rect.width() as f64,
            scale_y: height_px / rect.height() as f64,
        }
    }

    fn project(&self, x: i64, y: i64) -> FloatPoint {
        FloatPoint::new(
            (x as f64 - self.origin_x) * self.scale_x + META_BORDER,
            (y as f64 - self.origin_y) * self.scale_y + META_BORDER,
        )
    }
}

/// Ids of one z-index bucket, painted relations first, then ways, then
/// nodes, each in id order.
#[derive(Default)]
struct Bucket {
    relations: Vec<RelId>,
    ways: Vec<WayId>,
    nodes: Vec<NodeId>,
}

fn text_style_of(style: &Style) -> TextStyle {
    TextStyle {
        font_family: style.font_family.clone(),
        font_size: style.font_size,
        text_color: style.text_color,
        halo_color: style.text_halo_color,
        halo_radius: style.text_halo_radius,
    }
}

fn circle_points(center: FloatPoint, radius: f64) -> Vec<FloatPoint> {
    (0..16)
        .map(|i| {
            let angle = i as f64 / 16.0 * std::f64::consts::TAU;
            FloatPoint::new(
                center.x + radius * angle.cos(),
                center.y + radius * angle.sin(),
            )
        })
        .collect()
}

/// The renderer. Holds the dataset for member geometry lookups; all
/// per-pass state lives on the stack of `render_meta`.
pub struct Renderer {
    geodata: Arc<Geodata>,
}

struct Pass<'a> {
    projection: Projection,
    labels: Vec<Label>,
    shields: Vec<Shield>,
    canvas: &'a mut dyn RenderCanvas,
}

impl Renderer {
    pub fn new(geodata: Arc<Geodata>) -> Self {
        Self { geodata }
    }

    /// Paint a meta-tile and slice it into per-tile encoded images.
    pub fn render_meta(
        &self,
        attrs: &RenderAttributes,
        mid: &MetaIdentifier,
    ) -> TileResult<Vec<(TileIdentifier, Bytes)>> {
        let mut canvas = canvas_for(mid.format());
        self.paint_meta(attrs, mid, canvas.as_mut())?;

        let mut tiles = Vec::with_capacity((mid.width() * mid.height()) as usize);
        for tid in mid.tiles() {
            let px = META_BORDER as u32 + (tid.x() - mid.x()) * TILE_SIZE;
            let py = META_BORDER as u32 + (tid.y() - mid.y()) * TILE_SIZE;
            let image = canvas.encode_region(px, py, TILE_SIZE)?;
            tiles.push((tid, image));
        }
        Ok(tiles)
    }

    /// Background-only render used for data-free regions.
    pub fn render_empty(&self, attrs: &RenderAttributes, format: TileFormat) -> TileResult<Bytes> {
        let mut canvas = canvas_for(format);
        canvas.begin(TILE_SIZE, TILE_SIZE, attrs.canvas_style().fill_color);
        canvas.composite();
        canvas.encode_region(0, 0, TILE_SIZE)
    }

    /// Object painting, label placement and compositing, without slicing.
    pub(crate) fn paint_meta(
        &self,
        attrs: &RenderAttributes,
        mid: &MetaIdentifier,
        canvas: &mut dyn RenderCanvas,
    ) -> TileResult<()> {
        let width_px = mid.width() * TILE_SIZE + 2 * META_BORDER as u32;
        let height_px = mid.height() * TILE_SIZE + 2 * META_BORDER as u32;
        canvas.begin(width_px, height_px, attrs.canvas_style().fill_color);

        let mut pass = Pass {
            projection: Projection::for_meta(mid),
            labels: Vec::new(),
            shields: Vec::new(),
            canvas,
        };

        // bucket all styled objects by z-index, ids sorted for
        // deterministic paint order
        let mut buckets: BTreeMap<i32, Bucket> = BTreeMap::new();
        let mut relations: Vec<RelId> = attrs.relation_ids().collect();
        relations.sort_unstable();
        for id in relations {
            if let Some(style) = attrs.relation_style(id) {
                buckets.entry(style.z_index).or_default().relations.push(id);
            }
        }
        let mut ways: Vec<WayId> = attrs.way_ids().collect();
        ways.sort_unstable();
        for id in ways {
            if let Some(style) = attrs.way_style(id) {
                buckets.entry(style.z_index).or_default().ways.push(id);
            }
        }
        let mut nodes: Vec<NodeId> = attrs.node_ids().collect();
        nodes.sort_unstable();
        for id in nodes {
            if let Some(style) = attrs.node_style(id) {
                buckets.entry(style.z_index).or_default().nodes.push(id);
            }
        }

        // osm layer = z_index / 100; composite when crossing a boundary
        // so higher layers paint strictly above lower ones
        let mut current_layer: Option<i32> = None;
        for (z_index, bucket) in &buckets {
            let osm_layer = z_index / 100;
            if let Some(layer) = current_layer {
                if layer != osm_layer {
                    pass.canvas.composite();
                }
            }
            current_layer = Some(osm_layer);

            for id in &bucket.relations {
                if let (Some(style), Some(relation)) =
                    (attrs.relation_style(*id), self.geodata.relation(*id))
                {
                    let rings: Vec<Vec<FloatPoint>> = relation
                        .ways
                        .iter()
                        .filter_map(|way_id| self.geodata.way(*way_id))
                        .filter(|way| way.is_closed())
                        .map(|way| self.way_points(way, &pass.projection))
                        .filter(|ring| ring.len() >= 3)
                        .collect();
                    if !rings.is_empty() && style.fill_color.is_visible() {
                        pass.canvas
                            .draw_polygon(Layer::Fill, &rings, style.fill_color);
                    }
                }
            }

            for id in &bucket.ways {
                if let (Some(style), Some(way)) = (attrs.way_style(*id), self.geodata.way(*id)) {
                    self.paint_way(way, style, &mut pass);
                }
            }

            for id in &bucket.nodes {
                if let (Some(style), Some(node)) = (attrs.node_style(*id), self.geodata.node(*id))
                {
                    self.paint_node(node, style, &mut pass);
                }
            }
        }

        // place and draw annotations above everything painted so far
        let arena = PlacementBounds::new(
            FloatRect::new(0.0, 0.0, width_px as f64, height_px as f64),
            META_BORDER,
        );
        let shields = place_shields(std::mem::take(&mut pass.shields), &arena);
        for shield in &shields {
            Self::paint_shield_plate(shield, pass.canvas);
        }
        for shield in &shields {
            pass.canvas.draw_text(
                Layer::Labels,
                &TextSpec {
                    text: &shield.text,
                    origin: shield.origin,
                    style: &shield.style,
                },
            );
        }
        let labels = place_labels(std::mem::take(&mut pass.labels), &arena);
        for label in &labels {
            pass.canvas.draw_text(
                Layer::Labels,
                &TextSpec {
                    text: &label.text,
                    origin: label.origin,
                    style: &label.style,
                },
            );
        }

        pass.canvas.composite();
        Ok(())
    }

    fn way_points(&self, way: &Way, projection: &Projection) -> Vec<FloatPoint> {
        way.nodes
            .iter()
            .filter_map(|id| self.geodata.node(*id))
            .map(|node| projection.project(node.pos.x, node.pos.y))
            .collect()
    }

    fn paint_way(&self, way: &Way, style: &Style, pass: &mut Pass<'_>) {
        let points = self.way_points(way, &pass.projection);
        if points.len() < 2 {
            return;
        }

        if way.is_closed() && style.fill_color.is_visible() {
            pass.canvas
                .draw_polygon(Layer::Fill, &[points.clone()], style.fill_color);
        }

        if style.casing_width > 0.0 && style.casing_color.is_visible() {
            pass.canvas.draw_line(
                Layer::Casing,
                &points,
                &StrokeStyle {
                    width: style.width + 2.0 * style.casing_width,
                    color: style.casing_color,
                    dashes: style.casing_dashes.clone(),
                    cap: style.casing_linecap,
                    join: style.casing_linejoin,
                },
            );
        }

        if style.width > 0.0 && style.color.is_visible() {
            pass.canvas.draw_line(
                Layer::Stroke,
                &points,
                &StrokeStyle {
                    width: style.width,
                    color: style.color,
                    dashes: style.dashes.clone(),
                    cap: style.linecap,
                    join: style.linejoin,
                },
            );
        }

        let owner = FloatRect {
            min_x: points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min),
            min_y: points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min),
            max_x: points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max),
            max_y: points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max),
        };
        let anchor = match style.text_position {
            TextPosition::Line => points[points.len() / 2],
            TextPosition::Center => FloatPoint::new(
                (owner.min_x + owner.max_x) / 2.0,
                (owner.min_y + owner.max_y) / 2.0,
            ),
        };
        self.emit_annotations(style, anchor, owner, pass);
    }

    fn paint_node(&self, node: &Node, style: &Style, pass: &mut Pass<'_>) {
        let center = pass.projection.project(node.pos.x, node.pos.y);

        if style.casing_width > 0.0 && style.casing_color.is_visible() {
            pass.canvas.draw_polygon(
                Layer::Casing,
                &[circle_points(center, style.width + style.casing_width)],
                style.casing_color,
            );
        }
        if style.width > 0.0 && style.color.is_visible() {
            pass.canvas.draw_polygon(
                Layer::Stroke,
                &[circle_points(center, style.width)],
                style.color,
            );
        }
        if !style.icon_image.is_empty() {
            let w = if style.icon_width > 0.0 {
                style.icon_width
            } else {
                16.0
            };
            let h = if style.icon_height > 0.0 {
                style.icon_height
            } else {
                w
            };
            pass.canvas.paint_icon(
                Layer::Icons,
                &style.icon_image,
                FloatRect::around(center, w, h),
                style.icon_opacity,
            );
        }

        let owner = FloatRect::around(center, style.width.max(8.0), style.width.max(8.0));
        self.emit_annotations(style, center, owner, pass);
    }

    /// Queue the label and shield candidates an object's style asks for.
    fn emit_annotations(
        &self,
        style: &Style,
        anchor: FloatPoint,
        owner: FloatRect,
        pass: &mut Pass<'_>,
    ) {
        if !style.text.is_empty() && style.font_size > 0.0 {
            let (width, height) = pass.canvas.measure_text(&style.text, style.font_size);
            let anchor = FloatPoint::new(anchor.x, anchor.y + style.text_offset);
            let bounds = FloatRect::around(anchor, width, height);
            pass.labels.push(Label {
                text: style.text.clone(),
                bounds,
                origin: FloatPoint::new(bounds.min_x, bounds.max_y),
                owner,
                style: text_style_of(style),
            });
        }

        if !style.shield_text.is_empty() && style.font_size > 0.0 {
            let (width, height) = pass.canvas.measure_text(&style.shield_text, style.font_size);
            let bounds = FloatRect::around(anchor, width, height);
            let border = (style.shield_frame_width / 2.0 + style.shield_casing_width).ceil() + 2.0;
            pass.shields.push(Shield {
                text: style.shield_text.clone(),
                bounds,
                origin: FloatPoint::new(bounds.min_x, bounds.max_y),
                plate: bounds.grow(border, border),
                style: text_style_of(style),
                shield_color: style.shield_color,
                frame_color: style.shield_frame_color,
                frame_width: style.shield_frame_width,
                casing_color: style.shield_casing_color,
                casing_width: style.shield_casing_width,
                shape: style.shield_shape,
            });
        }
    }

    /// The plate behind a shield's text: casing, background, frame.
    fn paint_shield_plate(shield: &Shield, canvas: &mut dyn RenderCanvas) {
        let plate = shield.plate;
        let ring = vec![
            FloatPoint::new(plate.min_x, plate.min_y),
            FloatPoint::new(plate.max_x, plate.min_y),
            FloatPoint::new(plate.max_x, plate.max_y),
            FloatPoint::new(plate.min_x, plate.max_y),
            FloatPoint::new(plate.min_x, plate.min_y),
        ];

        if shield.casing_width > 0.0 && shield.casing_color.is_visible() {
            canvas.draw_line(
                Layer::Labels,
                &ring,
                &StrokeStyle {
                    width: shield.frame_width + 2.0 * shield.casing_width,
                    color: shield.casing_color,
                    dashes: Vec::new(),
                    cap: crate::style::LineCap::Butt,
                    join: crate::style::LineJoin::Round,
                },
            );
        }
        canvas.draw_polygon(Layer::Labels, &[ring.clone()], shield.shield_color);
        if shield.frame_width > 0.0 && shield.frame_color.is_visible() {
            canvas.draw_line(
                Layer::Labels,
                &ring,
                &StrokeStyle {
                    width: shield.frame_width,
                    color: shield.frame_color,
                    dashes: Vec::new(),
                    cap: crate::style::LineCap::Butt,
                    join: crate::style::LineJoin::Round,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::{StringTable, Tags};
    use crate::stylesheet::Stylesheet;
    use crate::geodata::GeodataBuilder;
    use crate::geom::FixedPoint;
    use crate::tile::TileFormat;

    /// Canvas that records the call sequence instead of painting.
    #[derive(Default)]
    struct RecordingCanvas {
        pub calls: Vec<String>,
    }

    impl RenderCanvas for RecordingCanvas {
        fn begin(&mut self, width: u32, height: u32, _background: Color) {
            self.calls.push(format!("begin {width}x{height}"));
        }

        fn draw_line(&mut self, _layer: Layer, _points: &[FloatPoint], stroke: &StrokeStyle) {
            self.calls.push(format!("line w{}", stroke.width));
        }

        fn draw_polygon(&mut self, _layer: Layer, _rings: &[Vec<FloatPoint>], _color: Color) {
            self.calls.push("polygon".into());
        }

        fn paint_icon(&mut self, _layer: Layer, path: &str, _rect: FloatRect, _opacity: f64) {
            self.calls.push(format!("icon {path}"));
        }

        fn draw_text(&mut self, _layer: Layer, spec: &TextSpec<'_>) {
            self.calls.push(format!("text {}", spec.text));
        }

        fn composite(&mut self) {
            self.calls.push("composite".into());
        }

        fn encode_region(&self, x: u32, y: u32, _size: u32) -> TileResult<Bytes> {
            Ok(Bytes::from(format!("slice {x},{y}")))
        }
    }

    fn world() -> (StringTable, Arc<Geodata>) {
        let strings = StringTable::new();
        let mut builder = GeodataBuilder::new();
        // a diagonal road across the whole zoom-0 tile
        let a = crate::geom::MERC_SIZE / 4;
        let b = crate::geom::MERC_SIZE / 2;
        builder.add_node_tagged(NodeId(1), FixedPoint::new(a, a), Tags::new());
        builder.add_node_tagged(NodeId(2), FixedPoint::new(b, b), Tags::new());
        builder.add_way_tagged(
            WayId(1),
            vec![NodeId(1), NodeId(2)],
            Tags::from_pairs([("highway", "primary")], &strings),
        );
        (strings, Arc::new(builder.build()))
    }

    fn meta_at_zero(strings: &StringTable, format: TileFormat) -> MetaIdentifier {
        let tid = TileIdentifier::new(0, 0, 1, strings.intern("default"), format).unwrap();
        MetaIdentifier::from_tile(&tid)
    }

    fn matched(
        strings: &StringTable,
        geodata: &Geodata,
        zoom: u8,
    ) -> RenderAttributes {
        let sheet = Stylesheet::fallback(strings);
        sheet.match_all(&[], &[WayId(1)], &[], zoom, geodata, strings)
    }

    #[test]
    fn test_render_meta_produces_all_tiles() {
        let (strings, geodata) = world();
        let renderer = Renderer::new(Arc::clone(&geodata));
        let mid = meta_at_zero(&strings, TileFormat::Png);
        let attrs = matched(&strings, &geodata, 1);

        let tiles = renderer.render_meta(&attrs, &mid).unwrap();
        assert_eq!(tiles.len(), 4);
        for (tid, bytes) in &tiles {
            assert!(mid.contains(tid));
            assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
        }
        // all four tiles are distinct identifiers
        let mut ids: Vec<_> = tiles.iter().map(|(tid, _)| tid.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_render_meta_svg() {
        let (strings, geodata) = world();
        let renderer = Renderer::new(Arc::clone(&geodata));
        let mid = meta_at_zero(&strings, TileFormat::Svg);
        let attrs = matched(&strings, &geodata, 1);

        let tiles = renderer.render_meta(&attrs, &mid).unwrap();
        assert_eq!(tiles.len(), 4);
        let svg = String::from_utf8(tiles[0].1.to_vec()).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("polyline"));
    }

    #[test]
    fn test_paint_order_follows_z_index() {
        let strings = StringTable::new();
        // two ways on different osm layers (z 10 vs z 110)
        let mut builder = GeodataBuilder::new();
        let a = crate::geom::MERC_SIZE / 4;
        builder.add_node_tagged(NodeId(1), FixedPoint::new(a, a), Tags::new());
        builder.add_node_tagged(NodeId(2), FixedPoint::new(a * 2, a * 2), Tags::new());
        builder.add_way_tagged(WayId(1), vec![NodeId(1), NodeId(2)], Tags::new());
        builder.add_way_tagged(WayId(2), vec![NodeId(1), NodeId(2)], Tags::new());
        let geodata = Arc::new(builder.build());
        let renderer = Renderer::new(Arc::clone(&geodata));
        let mid = meta_at_zero(&strings, TileFormat::Png);

        let mut attrs = RenderAttributes::new();
        {
            let style = attrs.way_style_mut(WayId(1));
            style.width = 5.0;
            style.z_index = 10;
        }
        {
            let style = attrs.way_style_mut(WayId(2));
            style.width = 2.0;
            style.z_index = 110;
        }

        let mut canvas = RecordingCanvas::default();
        renderer.paint_meta(&attrs, &mid, &mut canvas).unwrap();

        let w5 = canvas.calls.iter().position(|c| c == "line w5").unwrap();
        let w2 = canvas.calls.iter().position(|c| c == "line w2").unwrap();
        let boundary = canvas
            .calls
            .iter()
            .position(|c| c == "composite")
            .unwrap();
        assert!(w5 < boundary && boundary < w2, "{:?}", canvas.calls);
    }

    #[test]
    fn test_casing_under_stroke() {
        let (strings, geodata) = world();
        let renderer = Renderer::new(Arc::clone(&geodata));
        let mid = meta_at_zero(&strings, TileFormat::Png);

        let mut attrs = RenderAttributes::new();
        {
            let style = attrs.way_style_mut(WayId(1));
            style.width = 4.0;
            style.casing_width = 1.0;
            style.casing_color = Color::BLACK;
        }
        let mut canvas = RecordingCanvas::default();
        renderer.paint_meta(&attrs, &mid, &mut canvas).unwrap();
        // casing stroke is widened by twice the casing width
        assert!(canvas.calls.contains(&"line w6".to_string()));
        assert!(canvas.calls.contains(&"line w4".to_string()));
    }

    #[test]
    fn test_labels_drawn_after_objects() {
        let (strings, geodata) = world();
        let renderer = Renderer::new(Arc::clone(&geodata));
        let mid = meta_at_zero(&strings, TileFormat::Png);

        let mut attrs = RenderAttributes::new();
        {
            let style = attrs.way_style_mut(WayId(1));
            style.width = 2.0;
            style.text = "Main Street".into();
        }
        let mut canvas = RecordingCanvas::default();
        renderer.paint_meta(&attrs, &mid, &mut canvas).unwrap();

        let line = canvas.calls.iter().position(|c| c.starts_with("line")).unwrap();
        let text = canvas
            .calls
            .iter()
            .position(|c| c == "text Main Street")
            .unwrap();
        assert!(line < text);
    }

    #[test]
    fn test_render_empty_is_canvas_only() {
        let (strings, geodata) = world();
        let renderer = Renderer::new(Arc::clone(&geodata));
        let sheet = Stylesheet::fallback(&strings);
        let attrs = sheet.match_all(&[], &[], &[], 0, &geodata, &strings);

        let bytes = renderer.render_empty(&attrs, TileFormat::Png).unwrap();
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));

        let svg = renderer.render_empty(&attrs, TileFormat::Svg).unwrap();
        let svg = String::from_utf8(svg.to_vec()).unwrap();
        assert!(svg.contains("rect"));
        assert!(!svg.contains("polyline"));
    }

    #[test]
    fn test_meta_render_rect_includes_overlap() {
        let strings = StringTable::new();
        let mid = meta_at_zero(&strings, TileFormat::Png);
        let rect = meta_render_rect(&mid);
        let plain = FixedRect::from_points(
            tile_to_mercator(0, 0, 1),
            tile_to_mercator(2, 2, 1),
        );
        assert!(rect.min_x < plain.min_x);
        assert!(rect.max_x > plain.max_x);
    }
}
