//! Render canvases and the drawing-primitive seam.
//!
//! The renderer only orchestrates: it decides what to draw, on which of
//! the five logical layers, and in what order. The `RenderCanvas` trait
//! is the seam to an actual 2D backend. Two implementations ship here: a
//! tiny-skia raster canvas encoding PNG, and an SVG element writer.
//! Glyph rasterization is a backend concern; the raster canvas measures
//! text deterministically and paints halo and baseline marks, while the
//! SVG canvas emits real `<text>` elements.

use bytes::Bytes;
use log::debug;
use tiny_skia::{
    FillRule, IntRect, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, StrokeDash, Transform,
};

use crate::color::Color;
use crate::error::{TileError, TileResult};
use crate::geom::{FloatPoint, FloatRect};
use crate::labels::TextStyle;
use crate::style::{LineCap, LineJoin};
use crate::tile::TileFormat;

/// Edge length of a served tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// The five logical painting layers, composited in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Fill = 0,
    Casing = 1,
    Stroke = 2,
    Icons = 3,
    Labels = 4,
}

pub const LAYER_COUNT: usize = 5;

/// Stroke parameters for line drawing.
#[derive(Debug, Clone)]
pub struct StrokeStyle {
    pub width: f64,
    pub color: Color,
    pub dashes: Vec<f64>,
    pub cap: LineCap,
    pub join: LineJoin,
}

/// One text drawing request.
pub struct TextSpec<'a> {
    pub text: &'a str,
    pub origin: FloatPoint,
    pub style: &'a TextStyle,
}

/// Drawing surface for one meta-tile render pass.
///
/// Coordinates are canvas pixels. `composite` flattens the upper layers
/// onto the fill layer and clears them; `encode_region` cuts one tile
/// out of the fill layer and encodes it.
pub trait RenderCanvas: Send {
    fn begin(&mut self, width: u32, height: u32, background: Color);
    fn draw_line(&mut self, layer: Layer, points: &[FloatPoint], stroke: &StrokeStyle);
    fn draw_polygon(&mut self, layer: Layer, rings: &[Vec<FloatPoint>], color: Color);
    fn paint_icon(&mut self, layer: Layer, path: &str, rect: FloatRect, opacity: f64);
    fn draw_text(&mut self, layer: Layer, spec: &TextSpec<'_>);
    fn composite(&mut self);
    fn encode_region(&self, x: u32, y: u32, size: u32) -> TileResult<Bytes>;

    /// Text extents `(width, height)` for the given size. Deterministic
    /// across backends so label placement does not depend on the output
    /// format.
    fn measure_text(&self, text: &str, font_size: f64) -> (f64, f64) {
        (
            text.chars().count() as f64 * font_size * 0.6,
            font_size * 1.2,
        )
    }
}

/// Canvas for the requested output format.
pub fn canvas_for(format: TileFormat) -> Box<dyn RenderCanvas> {
    match format {
        TileFormat::Png => Box::new(SkiaCanvas::new()),
        TileFormat::Svg => Box::new(SvgCanvas::new()),
    }
}

// ---- raster backend -----------------------------------------------------

fn skia_color(c: Color) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        c.r.clamp(0.0, 1.0) as f32,
        c.g.clamp(0.0, 1.0) as f32,
        c.b.clamp(0.0, 1.0) as f32,
        c.a.clamp(0.0, 1.0) as f32,
    )
    .unwrap_or(tiny_skia::Color::TRANSPARENT)
}

fn skia_stroke(style: &StrokeStyle) -> Stroke {
    let mut dashes: Vec<f32> = style.dashes.iter().map(|d| *d as f32).collect();
    if dashes.len() % 2 == 1 {
        // dash arrays repeat; an odd count doubles up
        dashes.extend_from_slice(&dashes.clone());
    }
    Stroke {
        width: style.width.max(0.1) as f32,
        line_cap: match style.cap {
            LineCap::Butt => tiny_skia::LineCap::Butt,
            LineCap::Round => tiny_skia::LineCap::Round,
            LineCap::Square => tiny_skia::LineCap::Square,
        },
        line_join: match style.join {
            LineJoin::Miter => tiny_skia::LineJoin::Miter,
            LineJoin::Round => tiny_skia::LineJoin::Round,
            LineJoin::Bevel => tiny_skia::LineJoin::Bevel,
        },
        dash: if dashes.is_empty() {
            None
        } else {
            StrokeDash::new(dashes, 0.0)
        },
        ..Stroke::default()
    }
}

fn build_polyline(points: &[FloatPoint]) -> Option<tiny_skia::Path> {
    let mut builder = PathBuilder::new();
    let first = points.first()?;
    builder.move_to(first.x as f32, first.y as f32);
    for p in &points[1..] {
        builder.line_to(p.x as f32, p.y as f32);
    }
    builder.finish()
}

fn build_rings(rings: &[Vec<FloatPoint>]) -> Option<tiny_skia::Path> {
    let mut builder = PathBuilder::new();
    for ring in rings {
        let first = match ring.first() {
            Some(first) => first,
            None => continue,
        };
        builder.move_to(first.x as f32, first.y as f32);
        for p in &ring[1..] {
            builder.line_to(p.x as f32, p.y as f32);
        }
        builder.close();
    }
    builder.finish()
}

/// Raster canvas over tiny-skia pixmaps, one per logical layer.
pub struct SkiaCanvas {
    layers: Vec<Pixmap>,
}

impl SkiaCanvas {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    fn layer(&mut self, layer: Layer) -> Option<&mut Pixmap> {
        self.layers.get_mut(layer as usize)
    }

    fn solid_paint(color: Color) -> Paint<'static> {
        let mut paint = Paint::default();
        paint.set_color(skia_color(color));
        paint.anti_alias = true;
        paint
    }

    fn fill_rect(&mut self, layer: Layer, rect: FloatRect, color: Color) {
        let path = build_rings(&[vec![
            FloatPoint::new(rect.min_x, rect.min_y),
            FloatPoint::new(rect.max_x, rect.min_y),
            FloatPoint::new(rect.max_x, rect.max_y),
            FloatPoint::new(rect.min_x, rect.max_y),
        ]]);
        if let (Some(path), Some(pixmap)) = (path, self.layer(layer)) {
            pixmap.fill_path(
                &path,
                &Self::solid_paint(color),
                FillRule::Winding,
                Transform::identity(),
                None,
            );
        }
    }
}

impl Default for SkiaCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderCanvas for SkiaCanvas {
    fn begin(&mut self, width: u32, height: u32, background: Color) {
        self.layers.clear();
        for index in 0..LAYER_COUNT {
            let mut pixmap = match Pixmap::new(width, height) {
                Some(pixmap) => pixmap,
                None => continue,
            };
            if index == Layer::Fill as usize {
                pixmap.fill(skia_color(background));
            }
            self.layers.push(pixmap);
        }
    }

    fn draw_line(&mut self, layer: Layer, points: &[FloatPoint], stroke: &StrokeStyle) {
        if points.len() < 2 || !stroke.color.is_visible() || stroke.width <= 0.0 {
            return;
        }
        let paint = Self::solid_paint(stroke.color);
        let skia = skia_stroke(stroke);
        if let (Some(path), Some(pixmap)) = (build_polyline(points), self.layer(layer)) {
            pixmap.stroke_path(&path, &paint, &skia, Transform::identity(), None);
        }
    }

    fn draw_polygon(&mut self, layer: Layer, rings: &[Vec<FloatPoint>], color: Color) {
        if !color.is_visible() {
            return;
        }
        let paint = Self::solid_paint(color);
        if let (Some(path), Some(pixmap)) = (build_rings(rings), self.layer(layer)) {
            pixmap.fill_path(&path, &paint, FillRule::EvenOdd, Transform::identity(), None);
        }
    }

    fn paint_icon(&mut self, layer: Layer, path: &str, rect: FloatRect, opacity: f64) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("icon {path} not drawn: {err}");
                return;
            }
        };
        let icon = match Pixmap::decode_png(&bytes) {
            Ok(icon) => icon,
            Err(err) => {
                debug!("icon {path} not decodable: {err}");
                return;
            }
        };
        let sx = rect.width() / icon.width() as f64;
        let sy = rect.height() / icon.height() as f64;
        let transform = Transform::from_row(
            sx as f32,
            0.0,
            0.0,
            sy as f32,
            rect.min_x as f32,
            rect.min_y as f32,
        );
        let paint = PixmapPaint {
            opacity: opacity.clamp(0.0, 1.0) as f32,
            ..PixmapPaint::default()
        };
        if let Some(pixmap) = self.layer(layer) {
            pixmap.draw_pixmap(0, 0, icon.as_ref(), &paint, transform, None);
        }
    }

    fn draw_text(&mut self, layer: Layer, spec: &TextSpec<'_>) {
        // glyph output belongs to a full text backend; mark halo and
        // baseline so raster output reflects placement
        let (width, height) = self.measure_text(spec.text, spec.style.font_size);
        let bounds = FloatRect::new(
            spec.origin.x,
            spec.origin.y - height,
            spec.origin.x + width,
            spec.origin.y,
        );
        if spec.style.halo_radius > 0.0 && spec.style.halo_color.is_visible() {
            let halo = bounds.grow(spec.style.halo_radius, spec.style.halo_radius);
            self.fill_rect(layer, halo, spec.style.halo_color);
        }
        let baseline = FloatRect::new(bounds.min_x, bounds.max_y - 1.5, bounds.max_x, bounds.max_y);
        self.fill_rect(layer, baseline, spec.style.text_color);
    }

    fn composite(&mut self) {
        let (base, rest) = match self.layers.split_first_mut() {
            Some(split) => split,
            None => return,
        };
        for layer in rest.iter_mut() {
            base.draw_pixmap(
                0,
                0,
                layer.as_ref(),
                &PixmapPaint::default(),
                Transform::identity(),
                None,
            );
            layer.fill(tiny_skia::Color::TRANSPARENT);
        }
    }

    fn encode_region(&self, x: u32, y: u32, size: u32) -> TileResult<Bytes> {
        let base = self
            .layers
            .first()
            .ok_or_else(|| TileError::Render("canvas was never initialized".into()))?;
        let rect = IntRect::from_xywh(x as i32, y as i32, size, size)
            .ok_or_else(|| TileError::Render("invalid slice rectangle".into()))?;
        let region = base
            .clone_rect(rect)
            .ok_or_else(|| TileError::Render("slice outside the canvas".into()))?;
        let png = region
            .encode_png()
            .map_err(|e| TileError::Render(format!("png encoding failed: {e}")))?;
        Ok(Bytes::from(png))
    }
}

// ---- svg backend --------------------------------------------------------

fn css_color(c: Color) -> String {
    format!(
        "#{:02x}{:02x}{:02x}",
        (c.r.clamp(0.0, 1.0) * 255.0).round() as u8,
        (c.g.clamp(0.0, 1.0) * 255.0).round() as u8,
        (c.b.clamp(0.0, 1.0) * 255.0).round() as u8
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn fmt_coord(v: f64) -> String {
    format!("{:.2}", v)
}

/// Vector canvas collecting SVG elements per layer.
pub struct SvgCanvas {
    layers: Vec<Vec<String>>,
    base: Vec<String>,
    width: u32,
    height: u32,
}

impl SvgCanvas {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            base: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    fn push(&mut self, layer: Layer, element: String) {
        if let Some(elements) = self.layers.get_mut(layer as usize) {
            elements.push(element);
        }
    }

    fn points_attr(points: &[FloatPoint]) -> String {
        points
            .iter()
            .map(|p| format!("{},{}", fmt_coord(p.x), fmt_coord(p.y)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for SvgCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderCanvas for SvgCanvas {
    fn begin(&mut self, width: u32, height: u32, background: Color) {
        self.width = width;
        self.height = height;
        self.layers = vec![Vec::new(); LAYER_COUNT];
        self.base = vec![format!(
            "<rect x=\"0\" y=\"0\" width=\"{width}\" height=\"{height}\" fill=\"{}\" fill-opacity=\"{:.3}\"/>",
            css_color(background),
            background.a
        )];
    }

    fn draw_line(&mut self, layer: Layer, points: &[FloatPoint], stroke: &StrokeStyle) {
        if points.len() < 2 || !stroke.color.is_visible() || stroke.width <= 0.0 {
            return;
        }
        let mut attrs = format!(
            "points=\"{}\" fill=\"none\" stroke=\"{}\" stroke-width=\"{:.2}\"",
            Self::points_attr(points),
            css_color(stroke.color),
            stroke.width
        );
        if stroke.color.a < 1.0 {
            attrs.push_str(&format!(" stroke-opacity=\"{:.3}\"", stroke.color.a));
        }
        if !stroke.dashes.is_empty() {
            let dashes = stroke
                .dashes
                .iter()
                .map(|d| format!("{d:.2}"))
                .collect::<Vec<_>>()
                .join(",");
            attrs.push_str(&format!(" stroke-dasharray=\"{dashes}\""));
        }
        match stroke.cap {
            LineCap::Butt => {}
            LineCap::Round => attrs.push_str(" stroke-linecap=\"round\""),
            LineCap::Square => attrs.push_str(" stroke-linecap=\"square\""),
        }
        match stroke.join {
            LineJoin::Miter => {}
            LineJoin::Round => attrs.push_str(" stroke-linejoin=\"round\""),
            LineJoin::Bevel => attrs.push_str(" stroke-linejoin=\"bevel\""),
        }
        self.push(layer, format!("<polyline {attrs}/>"));
    }

    fn draw_polygon(&mut self, layer: Layer, rings: &[Vec<FloatPoint>], color: Color) {
        if !color.is_visible() {
            return;
        }
        let mut d = String::new();
        for ring in rings {
            let mut iter = ring.iter();
            let first = match iter.next() {
                Some(first) => first,
                None => continue,
            };
            d.push_str(&format!("M{} {}", fmt_coord(first.x), fmt_coord(first.y)));
            for p in iter {
                d.push_str(&format!(" L{} {}", fmt_coord(p.x), fmt_coord(p.y)));
            }
            d.push_str(" Z ");
        }
        if d.is_empty() {
            return;
        }
        let mut attrs = format!(
            "d=\"{}\" fill=\"{}\" fill-rule=\"evenodd\"",
            d.trim_end(),
            css_color(color)
        );
        if color.a < 1.0 {
            attrs.push_str(&format!(" fill-opacity=\"{:.3}\"", color.a));
        }
        self.push(layer, format!("<path {attrs}/>"));
    }

    fn paint_icon(&mut self, layer: Layer, path: &str, rect: FloatRect, opacity: f64) {
        self.push(
            layer,
            format!(
                "<image href=\"{}\" x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\" opacity=\"{:.3}\"/>",
                xml_escape(path),
                fmt_coord(rect.min_x),
                fmt_coord(rect.min_y),
                fmt_coord(rect.width()),
                fmt_coord(rect.height()),
                opacity.clamp(0.0, 1.0)
            ),
        );
    }

    fn draw_text(&mut self, layer: Layer, spec: &TextSpec<'_>) {
        let style = spec.style;
        let common = format!(
            "x=\"{}\" y=\"{}\" font-family=\"{}\" font-size=\"{:.1}\"",
            fmt_coord(spec.origin.x),
            fmt_coord(spec.origin.y),
            xml_escape(&style.font_family),
            style.font_size
        );
        if style.halo_radius > 0.0 && style.halo_color.is_visible() {
            self.push(
                layer,
                format!(
                    "<text {common} fill=\"none\" stroke=\"{}\" stroke-width=\"{:.2}\">{}</text>",
                    css_color(style.halo_color),
                    style.halo_radius * 2.0,
                    xml_escape(spec.text)
                ),
            );
        }
        self.push(
            layer,
            format!(
                "<text {common} fill=\"{}\">{}</text>",
                css_color(style.text_color),
                xml_escape(spec.text)
            ),
        );
    }

    fn composite(&mut self) {
        for elements in self.layers.iter_mut() {
            self.base.append(elements);
        }
    }

    fn encode_region(&self, x: u32, y: u32, size: u32) -> TileResult<Bytes> {
        let mut svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{size}\" height=\"{size}\" \
             viewBox=\"{x} {y} {size} {size}\">\n"
        );
        for element in &self.base {
            svg.push_str(element);
            svg.push('\n');
        }
        svg.push_str("</svg>\n");
        Ok(Bytes::from(svg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(width: f64, color: Color) -> StrokeStyle {
        StrokeStyle {
            width,
            color,
            dashes: Vec::new(),
            cap: LineCap::Butt,
            join: LineJoin::Miter,
        }
    }

    #[test]
    fn test_skia_encode_produces_png() {
        let mut canvas = SkiaCanvas::new();
        canvas.begin(512, 512, Color::WHITE);
        canvas.draw_line(
            Layer::Stroke,
            &[FloatPoint::new(0.0, 0.0), FloatPoint::new(512.0, 512.0)],
            &stroke(3.0, Color::BLACK),
        );
        canvas.composite();
        let bytes = canvas.encode_region(0, 0, 256).unwrap();
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn test_skia_slice_regions_differ() {
        let mut canvas = SkiaCanvas::new();
        canvas.begin(512, 512, Color::WHITE);
        // paint only the left half
        canvas.draw_polygon(
            Layer::Fill,
            &[vec![
                FloatPoint::new(0.0, 0.0),
                FloatPoint::new(256.0, 0.0),
                FloatPoint::new(256.0, 512.0),
                FloatPoint::new(0.0, 512.0),
            ]],
            Color::rgb(200, 0, 0),
        );
        canvas.composite();
        let left = canvas.encode_region(0, 0, 256).unwrap();
        let right = canvas.encode_region(256, 0, 256).unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn test_skia_out_of_bounds_slice_fails() {
        let mut canvas = SkiaCanvas::new();
        canvas.begin(128, 128, Color::WHITE);
        assert!(canvas.encode_region(100, 0, 256).is_err());
    }

    #[test]
    fn test_svg_contains_elements() {
        let mut canvas = SvgCanvas::new();
        canvas.begin(512, 512, Color::rgb(0xef, 0xef, 0xd0));
        canvas.draw_line(
            Layer::Stroke,
            &[FloatPoint::new(1.0, 2.0), FloatPoint::new(3.0, 4.0)],
            &stroke(2.0, Color::rgb(0x55, 0x55, 0x55)),
        );
        canvas.draw_polygon(
            Layer::Fill,
            &[vec![
                FloatPoint::new(0.0, 0.0),
                FloatPoint::new(10.0, 0.0),
                FloatPoint::new(10.0, 10.0),
            ]],
            Color::rgb(0, 170, 0),
        );
        canvas.composite();
        let svg = String::from_utf8(canvas.encode_region(0, 0, 256).unwrap().to_vec()).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("<polyline"));
        assert!(svg.contains("#555555"));
        assert!(svg.contains("<path"));
        assert!(svg.contains("#00aa00"));
        assert!(svg.contains("viewBox=\"0 0 256 256\""));
    }

    #[test]
    fn test_svg_text_escaping() {
        let mut canvas = SvgCanvas::new();
        canvas.begin(256, 256, Color::WHITE);
        let style = TextStyle {
            font_family: "DejaVu Sans".into(),
            font_size: 12.0,
            text_color: Color::BLACK,
            halo_color: Color::WHITE,
            halo_radius: 1.0,
        };
        canvas.draw_text(
            Layer::Labels,
            &TextSpec {
                text: "Fish & Chips <caf\u{e9}>",
                origin: FloatPoint::new(10.0, 20.0),
                style: &style,
            },
        );
        canvas.composite();
        let svg = String::from_utf8(canvas.encode_region(0, 0, 256).unwrap().to_vec()).unwrap();
        assert!(svg.contains("Fish &amp; Chips &lt;caf\u{e9}&gt;"));
        // halo stroke plus fill text
        assert_eq!(svg.matches("<text").count(), 2);
    }

    #[test]
    fn test_invisible_paint_is_skipped() {
        let mut canvas = SvgCanvas::new();
        canvas.begin(256, 256, Color::WHITE);
        canvas.draw_line(
            Layer::Stroke,
            &[FloatPoint::new(0.0, 0.0), FloatPoint::new(9.0, 9.0)],
            &stroke(2.0, Color::TRANSPARENT),
        );
        canvas.draw_polygon(Layer::Fill, &[vec![FloatPoint::new(0.0, 0.0)]], Color::TRANSPARENT);
        canvas.composite();
        let svg = String::from_utf8(canvas.encode_region(0, 0, 256).unwrap().to_vec()).unwrap();
        assert!(!svg.contains("<polyline"));
        assert!(!svg.contains("<path"));
    }

    #[test]
    fn test_measure_text_monotonic() {
        let canvas = SkiaCanvas::new();
        let (short, _) = canvas.measure_text("ab", 12.0);
        let (long, _) = canvas.measure_text("abcdef", 12.0);
        assert!(long > short);
        let (_, h12) = canvas.measure_text("ab", 12.0);
        let (_, h24) = canvas.measure_text("ab", 24.0);
        assert!(h24 > h12);
    }
}
