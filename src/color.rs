//! RGBA colors and the MapCSS color language.
//!
//! Accepts named colors, `#rgb`, `#rrggbb`, `#rrggbbaa` and the
//! `rgb(r,g,b)` / `rgba(r,g,b,a)` function forms. The function forms
//! take float components already in `[0, 1]`; only the hex spellings
//! carry 0-255 channel bytes.

/// RGBA color with components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

/// Named colors recognized by stylesheets.
static COLOR_NAMES: &[(&str, u32)] = &[
    ("aqua", 0x00ffff),
    ("black", 0x000000),
    ("blue", 0x0000ff),
    ("brown", 0xa52a2a),
    ("cyan", 0x00ffff),
    ("darkblue", 0x00008b),
    ("darkgray", 0xa9a9a9),
    ("darkgreen", 0x006400),
    ("darkgrey", 0xa9a9a9),
    ("darkred", 0x8b0000),
    ("fuchsia", 0xff00ff),
    ("gray", 0x808080),
    ("green", 0x008000),
    ("grey", 0x808080),
    ("lightblue", 0xadd8e6),
    ("lightgray", 0xd3d3d3),
    ("lightgreen", 0x90ee90),
    ("lightgrey", 0xd3d3d3),
    ("lime", 0x00ff00),
    ("magenta", 0xff00ff),
    ("maroon", 0x800000),
    ("navy", 0x000080),
    ("olive", 0x808000),
    ("orange", 0xffa500),
    ("pink", 0xffc0cb),
    ("purple", 0x800080),
    ("red", 0xff0000),
    ("silver", 0xc0c0c0),
    ("teal", 0x008080),
    ("white", 0xffffff),
    ("yellow", 0xffff00),
];

impl Color {
    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };

    pub fn new(r: f64, g: f64, b: f64, a: f64) -> Self {
        Self { r, g, b, a }
    }

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: r as f64 / 255.0,
            g: g as f64 / 255.0,
            b: b as f64 / 255.0,
            a: 1.0,
        }
    }

    pub fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            a: a as f64 / 255.0,
            ..Self::rgb(r, g, b)
        }
    }

    pub fn is_visible(&self) -> bool {
        self.a > 0.0
    }

    /// Parse any color spelling; `None` if unrecognized.
    pub fn parse(s: &str) -> Option<Color> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix('#') {
            return Self::parse_hex(hex);
        }
        let lower = s.to_ascii_lowercase();
        if let Some(args) = lower
            .strip_prefix("rgba(")
            .and_then(|r| r.strip_suffix(')'))
        {
            let parts: Vec<&str> = args.split(',').map(str::trim).collect();
            if parts.len() != 4 {
                return None;
            }
            let r = parts[0].parse::<f64>().ok()?;
            let g = parts[1].parse::<f64>().ok()?;
            let b = parts[2].parse::<f64>().ok()?;
            let a = parts[3].parse::<f64>().ok()?;
            return Some(Color::new(
                r.clamp(0.0, 1.0),
                g.clamp(0.0, 1.0),
                b.clamp(0.0, 1.0),
                a.clamp(0.0, 1.0),
            ));
        }
        if let Some(args) = lower.strip_prefix("rgb(").and_then(|r| r.strip_suffix(')')) {
            let parts: Vec<&str> = args.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return None;
            }
            let r = parts[0].parse::<f64>().ok()?;
            let g = parts[1].parse::<f64>().ok()?;
            let b = parts[2].parse::<f64>().ok()?;
            return Some(Color::new(
                r.clamp(0.0, 1.0),
                g.clamp(0.0, 1.0),
                b.clamp(0.0, 1.0),
                1.0,
            ));
        }
        COLOR_NAMES
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, packed)| Self::from_packed_rgb(*packed))
    }

    fn parse_hex(hex: &str) -> Option<Color> {
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            3 => {
                let v = u32::from_str_radix(hex, 16).ok()?;
                let r = ((v >> 8) & 0xf) as u8;
                let g = ((v >> 4) & 0xf) as u8;
                let b = (v & 0xf) as u8;
                Some(Color::rgb(r << 4 | r, g << 4 | g, b << 4 | b))
            }
            6 => {
                let v = u32::from_str_radix(hex, 16).ok()?;
                Some(Self::from_packed_rgb(v))
            }
            8 => {
                let v = u32::from_str_radix(hex, 16).ok()?;
                Some(Color::rgba(
                    (v >> 24) as u8,
                    (v >> 16) as u8,
                    (v >> 8) as u8,
                    v as u8,
                ))
            }
            _ => None,
        }
    }

    fn from_packed_rgb(v: u32) -> Color {
        Color::rgb((v >> 16) as u8, (v >> 8) as u8, v as u8)
    }

    fn byte(v: f64) -> u32 {
        (v.clamp(0.0, 1.0) * 255.0).round() as u32
    }

    /// `#rrggbbaa` spelling, used by `colgen` results.
    pub fn to_hex_rgba(&self) -> String {
        let rgb = Self::byte(self.r) << 16 | Self::byte(self.g) << 8 | Self::byte(self.b);
        format!("#{:06x}{:02x}", rgb, Self::byte(self.a))
    }

    pub fn mul(&self, other: &Color) -> Color {
        Color::new(
            self.r * other.r,
            self.g * other.g,
            self.b * other.b,
            self.a * other.a,
        )
    }

    pub fn add(&self, other: &Color) -> Color {
        Color::new(
            (self.r + other.r).min(1.0),
            (self.g + other.g).min(1.0),
            (self.b + other.b).min(1.0),
            (self.a + other.a).min(1.0),
        )
    }

    pub fn sub_clamped(&self, other: &Color) -> Color {
        Color::new(
            (self.r - other.r).max(0.0),
            (self.g - other.g).max(0.0),
            (self.b - other.b).max(0.0),
            (self.a - other.a).max(0.0),
        )
    }

    pub fn with_alpha(&self, a: f64) -> Color {
        Color { a, ..*self }
    }
}
