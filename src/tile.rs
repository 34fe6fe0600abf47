//! Tile and meta-tile addressing.
//!
//! A `TileIdentifier` names one slippy-map tile of one stylesheet in one
//! image format. A `MetaIdentifier` names the 4×4 block (clamped at map
//! edges) that shares a single render pass.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{TileError, TileResult};
use crate::geom::MAX_ZOOM;
use crate::strings::{CachedString, StringTable};

/// Tiles per meta-tile edge.
pub const META_TILE_SPAN: u32 = 4;

/// Key of the built-in fallback stylesheet.
pub const FALLBACK_STYLE: &str = ".fallback";

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileFormat {
    Png,
    Svg,
}

impl TileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Svg => "svg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Svg => "image/svg+xml",
        }
    }

    /// Map a URL extension to a format.
    ///
    /// Formats we know of but do not serve report `UnsupportedFormat`;
    /// everything else is a malformed request.
    pub fn from_extension(ext: &str) -> TileResult<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Ok(TileFormat::Png),
            "svg" => Ok(TileFormat::Svg),
            "jpg" | "jpeg" | "gif" | "svgz" => Err(TileError::UnsupportedFormat(ext.into())),
            other => Err(TileError::BadRequest(format!(
                "unknown image format '{other}'"
            ))),
        }
    }
}

/// Distinguishes addressable tiles from the two sentinel encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TileKind {
    /// A regular slippy-map tile.
    Standard,
    /// The stylesheet-specific background-only tile for data-free regions.
    Empty,
}

/// Identifies a tile: coordinates, stylesheet and image format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileIdentifier {
    x: u32,
    y: u32,
    zoom: u8,
    stylesheet: CachedString,
    format: TileFormat,
    kind: TileKind,
}

fn digits_to_u32(part: &str) -> TileResult<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TileError::BadRequest(format!("'{part}' is not a number")));
    }
    part.parse::<u32>()
        .map_err(|_| TileError::BadRequest(format!("'{part}' is out of range")))
}

impl TileIdentifier {
    /// Construct a checked identifier.
    pub fn new(
        x: u32,
        y: u32,
        zoom: u8,
        stylesheet: CachedString,
        format: TileFormat,
    ) -> TileResult<Self> {
        if zoom > MAX_ZOOM {
            return Err(TileError::BadRequest(format!(
                "zoom {zoom} out of range 0-{MAX_ZOOM}"
            )));
        }
        let limit = 1u32 << zoom;
        if x >= limit || y >= limit {
            return Err(TileError::BadRequest(format!(
                "coordinates ({x}, {y}) out of range for zoom {zoom}"
            )));
        }
        Ok(Self {
            x,
            y,
            zoom,
            stylesheet,
            format,
            kind: TileKind::Standard,
        })
    }

    /// The identifier of the stylesheet-specific empty tile.
    pub fn empty_tile(stylesheet: CachedString, format: TileFormat) -> Self {
        Self {
            x: 0,
            y: 0,
            zoom: 0,
            stylesheet,
            format,
            kind: TileKind::Empty,
        }
    }

    /// Parse `/<style-path>/<z>/<x>/<y>.<ext>`.
    ///
    /// The style path may contain `/` and may be omitted entirely. A
    /// missing or unknown style resolves to `default_style`, and to the
    /// built-in fallback if that is unknown too.
    pub fn from_url(
        url: &str,
        has_style: impl Fn(&str) -> bool,
        default_style: &str,
        strings: &StringTable,
    ) -> TileResult<Self> {
        let parts: Vec<&str> = url.split('/').collect();
        // /style/z/x/y.ext → ["", style..., z, x, "y.ext"]; style may be absent
        if parts.len() < 4 {
            return Err(TileError::BadRequest("not enough path segments".into()));
        }
        let last = parts[parts.len() - 1];
        let (y_part, ext) = last
            .split_once('.')
            .ok_or_else(|| TileError::BadRequest("missing image extension".into()))?;
        let format = TileFormat::from_extension(ext)?;

        let zoom_raw = digits_to_u32(parts[parts.len() - 3])?;
        if zoom_raw > MAX_ZOOM as u32 {
            return Err(TileError::BadRequest(format!(
                "zoom {zoom_raw} out of range 0-{MAX_ZOOM}"
            )));
        }
        let zoom = zoom_raw as u8;
        let x = digits_to_u32(parts[parts.len() - 2])?;
        let y = digits_to_u32(y_part)?;

        let style_path = parts[1..parts.len() - 3].join("/");
        let resolved = if !style_path.is_empty() && has_style(&style_path) {
            style_path
        } else if has_style(default_style) {
            default_style.to_string()
        } else {
            FALLBACK_STYLE.to_string()
        };

        Self::new(x, y, zoom, strings.intern(&resolved), format)
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn stylesheet(&self) -> &CachedString {
        &self.stylesheet
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.kind == TileKind::Empty
    }

    /// File name used by the disk spillover: `<z>-<x>-<y>.<ext>`.
    pub fn cache_file_name(&self) -> String {
        match self.kind {
            TileKind::Standard => format!(
                "{}-{}-{}.{}",
                self.zoom,
                self.x,
                self.y,
                self.format.extension()
            ),
            TileKind::Empty => format!("empty.{}", self.format.extension()),
        }
    }
}

impl std::fmt::Display for TileIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.stylesheet,
            self.zoom,
            self.x,
            self.y,
            self.format.extension()
        )
    }
}

/// Identifies the block of tiles rendered in one pass.
///
/// Derived from any contained tile by rounding its coordinates down to a
/// multiple of [`META_TILE_SPAN`] and clamping width and height against the
/// zoom level's tile count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaIdentifier {
    x: u32,
    y: u32,
    zoom: u8,
    stylesheet: CachedString,
    format: TileFormat,
    width: u32,
    height: u32,
}

impl MetaIdentifier {
    pub fn from_tile(origin: &TileIdentifier) -> Self {
        let limit = 1u32 << origin.zoom;
        let x0 = origin.x / META_TILE_SPAN * META_TILE_SPAN;
        let y0 = origin.y / META_TILE_SPAN * META_TILE_SPAN;
        Self {
            x: x0,
            y: y0,
            zoom: origin.zoom,
            stylesheet: origin.stylesheet.clone(),
            format: origin.format,
            width: META_TILE_SPAN.min(limit - x0),
            height: META_TILE_SPAN.min(limit - y0),
        }
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stylesheet(&self) -> &CachedString {
        &self.stylesheet
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }

    /// Whether `tid` is one of the tiles this meta covers.
    pub fn contains(&self, tid: &TileIdentifier) -> bool {
        tid.kind == TileKind::Standard
            && tid.zoom == self.zoom
            && tid.format == self.format
            && tid.stylesheet == self.stylesheet
            && self.x <= tid.x
            && tid.x < self.x + self.width
            && self.y <= tid.y
            && tid.y < self.y + self.height
    }

    /// All contained tile identifiers, row-major.
    pub fn tiles(&self) -> Vec<TileIdentifier> {
        let mut tids = Vec::with_capacity((self.width * self.height) as usize);
        for ty in self.y..self.y + self.height {
            for tx in self.x..self.x + self.width {
                tids.push(TileIdentifier {
                    x: tx,
                    y: ty,
                    zoom: self.zoom,
                    stylesheet: self.stylesheet.clone(),
                    format: self.format,
                    kind: TileKind::Standard,
                });
            }
        }
        tids
    }

    /// The (up to four) meta-tiles covering this meta's area at `zoom + 1`.
    pub fn sub_metas(&self) -> Vec<MetaIdentifier> {
        if self.zoom >= MAX_ZOOM {
            return Vec::new();
        }
        let zoom = self.zoom + 1;
        let limit = 1u32 << zoom;
        let mut subs = Vec::with_capacity(4);
        for dy in 0..2 {
            for dx in 0..2 {
                let x = self.x * 2 + dx * META_TILE_SPAN;
                let y = self.y * 2 + dy * META_TILE_SPAN;
                if x >= limit || y >= limit {
                    continue;
                }
                subs.push(MetaIdentifier {
                    x,
                    y,
                    zoom,
                    stylesheet: self.stylesheet.clone(),
                    format: self.format,
                    width: META_TILE_SPAN.min(limit - x),
                    height: META_TILE_SPAN.min(limit - y),
                });
            }
        }
        subs
    }
}

impl std::fmt::Display for MetaIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}+{}x{}",
            self.stylesheet, self.zoom, self.x, self.width, self.height
        )
    }
}

/// A tile and its encoded image, shared between cache and jobs.
///
/// The image starts out absent and is written exactly once by the render
/// pass that produced it; everyone else treats the bytes as opaque.
pub struct Tile {
    id: TileIdentifier,
    image: Mutex<Option<Bytes>>,
}

impl Tile {
    pub fn new(id: TileIdentifier) -> Self {
        Self {
            id,
            image: Mutex::new(None),
        }
    }

    pub fn with_image(id: TileIdentifier, image: Bytes) -> Self {
        Self {
            id,
            image: Mutex::new(Some(image)),
        }
    }

    pub fn id(&self) -> &TileIdentifier {
        &self.id
    }

    pub fn is_rendered(&self) -> bool {
        self.image.lock().is_some()
    }

    pub fn image(&self) -> Option<Bytes> {
        self.image.lock().clone()
    }

    pub fn set_image(&self, image: Bytes) {
        *self.image.lock() = Some(image);
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("rendered", &self.is_rendered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings() -> StringTable {
        StringTable::new()
    }

    fn tid(x: u32, y: u32, zoom: u8, table: &StringTable) -> TileIdentifier {
        TileIdentifier::new(x, y, zoom, table.intern("default"), TileFormat::Png).unwrap()
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(TileFormat::from_extension("png").unwrap(), TileFormat::Png);
        assert_eq!(TileFormat::from_extension("SVG").unwrap(), TileFormat::Svg);
        assert!(matches!(
            TileFormat::from_extension("jpg"),
            Err(TileError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            TileFormat::from_extension("bmp"),
            Err(TileError::BadRequest(_))
        ));
    }

    #[test]
    fn test_coordinate_bounds() {
        let table = strings();
        assert!(TileIdentifier::new(0, 0, 0, table.intern("s"), TileFormat::Png).is_ok());
        assert!(TileIdentifier::new(1, 0, 0, table.intern("s"), TileFormat::Png).is_err());
        assert!(TileIdentifier::new(0, 0, 19, table.intern("s"), TileFormat::Png).is_err());
        assert!(TileIdentifier::new(262143, 262143, 18, table.intern("s"), TileFormat::Png).is_ok());
    }

    #[test]
    fn test_url_parse_roundtrip() {
        let table = strings();
        let id = TileIdentifier::from_url(
            "/default/13/4286/2812.png",
            |s| s == "default",
            "default",
            &table,
        )
        .unwrap();
        assert_eq!(id.x(), 4286);
        assert_eq!(id.y(), 2812);
        assert_eq!(id.zoom(), 13);
        assert_eq!(id.stylesheet().as_str(), "default");
        assert_eq!(id.format(), TileFormat::Png);
    }

    #[test]
    fn test_url_style_with_slashes() {
        let table = strings();
        let id = TileIdentifier::from_url(
            "/team/blue/7/60/41.svg",
            |s| s == "team/blue",
            "default",
            &table,
        )
        .unwrap();
        assert_eq!(id.stylesheet().as_str(), "team/blue");
        assert_eq!(id.format(), TileFormat::Svg);
    }

    #[test]
    fn test_url_unknown_style_falls_back() {
        let table = strings();
        // default itself known → substituted
        let id = TileIdentifier::from_url("/nope/3/1/1.png", |s| s == "default", "default", &table)
            .unwrap();
        assert_eq!(id.stylesheet().as_str(), "default");
        // nothing known → built-in fallback
        let id = TileIdentifier::from_url("/nope/3/1/1.png", |_| false, "default", &table).unwrap();
        assert_eq!(id.stylesheet().as_str(), FALLBACK_STYLE);
    }

    #[test]
    fn test_url_malformed() {
        let table = strings();
        for url in [
            "/3/1",
            "/default/xx/1/1.png",
            "/default/3/1/1",
            "/default/3/1/-1.png",
            "/default/19/1/1.png",
            "/default/3/9/1.png",
        ] {
            let result = TileIdentifier::from_url(url, |_| true, "default", &table);
            assert!(matches!(result, Err(TileError::BadRequest(_))), "{url}");
        }
    }

    #[test]
    fn test_meta_rounds_down_and_clamps() {
        let table = strings();
        let meta = MetaIdentifier::from_tile(&tid(4286, 2812, 13, &table));
        assert_eq!((meta.x(), meta.y()), (4284, 2812));
        assert_eq!((meta.width(), meta.height()), (4, 4));

        // zoom 0 and 1 clamp the span
        let meta = MetaIdentifier::from_tile(&tid(0, 0, 0, &table));
        assert_eq!((meta.width(), meta.height()), (1, 1));
        let meta = MetaIdentifier::from_tile(&tid(1, 0, 1, &table));
        assert_eq!((meta.width(), meta.height()), (2, 2));
    }

    #[test]
    fn test_meta_contains() {
        let table = strings();
        let meta = MetaIdentifier::from_tile(&tid(4286, 2812, 13, &table));
        assert!(meta.contains(&tid(4284, 2812, 13, &table)));
        assert!(meta.contains(&tid(4287, 2815, 13, &table)));
        assert!(!meta.contains(&tid(4288, 2812, 13, &table)));
        assert!(!meta.contains(&tid(4286, 2811, 13, &table)));
        // different zoom, format or style never match
        assert!(!meta.contains(&tid(4286, 2812, 12, &table)));
        let svg =
            TileIdentifier::new(4286, 2812, 13, table.intern("default"), TileFormat::Svg).unwrap();
        assert!(!meta.contains(&svg));
        let other =
            TileIdentifier::new(4286, 2812, 13, table.intern("other"), TileFormat::Png).unwrap();
        assert!(!meta.contains(&other));
    }

    #[test]
    fn test_meta_tiles_enumeration() {
        let table = strings();
        let meta = MetaIdentifier::from_tile(&tid(5, 9, 4, &table));
        let tids = meta.tiles();
        assert_eq!(tids.len(), 16);
        assert!(tids.iter().all(|t| meta.contains(t)));
        assert_eq!((tids[0].x(), tids[0].y()), (4, 8));
        assert_eq!((tids[15].x(), tids[15].y()), (7, 11));
    }

    #[test]
    fn test_sub_metas_cover_doubled_area() {
        let table = strings();
        let meta = MetaIdentifier::from_tile(&tid(4, 8, 4, &table));
        let subs = meta.sub_metas();
        assert_eq!(subs.len(), 4);
        assert_eq!((subs[0].x(), subs[0].y(), subs[0].zoom()), (8, 16, 5));
        assert_eq!((subs[3].x(), subs[3].y()), (12, 20));

        // zoom 0 meta has two sub-metas at zoom 1 cut to the 2x2 map... all
        // four quadrant origins collapse into the single meta at (0, 0)
        let top = MetaIdentifier::from_tile(&tid(0, 0, 0, &table));
        let subs = top.sub_metas();
        assert_eq!(subs.len(), 1);
        assert_eq!((subs[0].width(), subs[0].height()), (2, 2));

        let deepest = MetaIdentifier {
            x: 0,
            y: 0,
            zoom: MAX_ZOOM,
            stylesheet: table.intern("default"),
            format: TileFormat::Png,
            width: 4,
            height: 4,
        };
        assert!(deepest.sub_metas().is_empty());
    }

    #[test]
    fn test_empty_sentinel_identity() {
        let table = strings();
        let a = TileIdentifier::empty_tile(table.intern("default"), TileFormat::Png);
        let b = TileIdentifier::empty_tile(table.intern("default"), TileFormat::Png);
        assert_eq!(a, b);
        assert!(a.is_empty_sentinel());
        // never equal to the real (0,0,0) tile
        assert_ne!(a, tid(0, 0, 0, &table));
        // and never contained in a meta
        let meta = MetaIdentifier::from_tile(&tid(0, 0, 0, &table));
        assert!(!meta.contains(&a));
    }

    #[test]
    fn test_tile_image_lifecycle() {
        let table = strings();
        let tile = Tile::new(tid(1, 2, 3, &table));
        assert!(!tile.is_rendered());
        assert!(tile.image().is_none());
        tile.set_image(Bytes::from_static(b"png-bytes"));
        assert!(tile.is_rendered());
        assert_eq!(tile.image().unwrap(), Bytes::from_static(b"png-bytes"));
    }
}
