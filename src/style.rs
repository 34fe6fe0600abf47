//! Concrete render styles, style templates and the per-pass style arena.
//!
//! A `Style` is the flat record of attributes the renderer consumes. A
//! `StyleTemplate` is the parsed form inside a rule: every field optional,
//! literal or expression. Matching folds templates onto styles in rule
//! order, later applications overwriting earlier ones.

use std::collections::HashMap;

use crate::color::Color;
use crate::eval::{Eval, EvalContext, EvalTarget};
use crate::geodata::{NodeId, RelId, WayId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCap {
    Butt,
    Round,
    Square,
}

impl EvalTarget for LineCap {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "none" | "butt" => Some(LineCap::Butt),
            "round" => Some(LineCap::Round),
            "square" => Some(LineCap::Square),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "line cap"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineJoin {
    Miter,
    Round,
    Bevel,
}

impl EvalTarget for LineJoin {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "miter" => Some(LineJoin::Miter),
            "round" => Some(LineJoin::Round),
            "bevel" => Some(LineJoin::Bevel),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "line join"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPosition {
    Line,
    Center,
}

impl EvalTarget for TextPosition {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "line" => Some(TextPosition::Line),
            "center" => Some(TextPosition::Center),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "text position"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontWeight {
    Normal,
    Bold,
}

impl EvalTarget for FontWeight {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "normal" => Some(FontWeight::Normal),
            "bold" => Some(FontWeight::Bold),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "font weight"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontStyle {
    Normal,
    Italic,
}

impl EvalTarget for FontStyle {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "normal" => Some(FontStyle::Normal),
            "italic" | "oblique" => Some(FontStyle::Italic),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "font style"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldShape {
    Rectangular,
    Rounded,
}

impl EvalTarget for ShieldShape {
    fn from_eval_str(s: &str) -> Option<Self> {
        match s.trim() {
            "rectangular" => Some(ShieldShape::Rectangular),
            "rounded" => Some(ShieldShape::Rounded),
            _ => None,
        }
    }

    fn type_name() -> &'static str {
        "shield shape"
    }
}

/// Concrete per-object render attributes.
///
/// Field defaults (in effect when no rule sets the field):
/// stroke and casing invisible (width 0, casing color transparent),
/// transparent fill, solid lines, butt caps, miter joins, 12 px
/// "DejaVu Sans" text in black with no halo, no icon, no shield,
/// `z_index` 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub color: Color,
    pub fill_color: Color,
    pub fill_image: String,
    pub width: f64,
    pub casing_width: f64,
    pub casing_color: Color,
    pub dashes: Vec<f64>,
    pub casing_dashes: Vec<f64>,
    pub linecap: LineCap,
    pub linejoin: LineJoin,
    pub casing_linecap: LineCap,
    pub casing_linejoin: LineJoin,
    pub font_family: String,
    pub font_size: f64,
    pub font_weight: FontWeight,
    pub font_style: FontStyle,
    pub text: String,
    pub text_color: Color,
    pub text_position: TextPosition,
    pub text_offset: f64,
    pub text_halo_color: Color,
    pub text_halo_radius: f64,
    pub icon_image: String,
    pub icon_width: f64,
    pub icon_height: f64,
    pub icon_opacity: f64,
    pub shield_text: String,
    pub shield_color: Color,
    pub shield_opacity: f64,
    pub shield_frame_color: Color,
    pub shield_frame_width: f64,
    pub shield_casing_color: Color,
    pub shield_casing_width: f64,
    pub shield_image: String,
    pub shield_shape: ShieldShape,
    pub z_index: i32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            color: Color::BLACK,
            fill_color: Color::TRANSPARENT,
            fill_image: String::new(),
            width: 0.0,
            casing_width: 0.0,
            casing_color: Color::TRANSPARENT,
            dashes: Vec::new(),
            casing_dashes: Vec::new(),
            linecap: LineCap::Butt,
            linejoin: LineJoin::Miter,
            casing_linecap: LineCap::Butt,
            casing_linejoin: LineJoin::Miter,
            font_family: "DejaVu Sans".into(),
            font_size: 12.0,
            font_weight: FontWeight::Normal,
            font_style: FontStyle::Normal,
            text: String::new(),
            text_color: Color::BLACK,
            text_position: TextPosition::Center,
            text_offset: 0.0,
            text_halo_color: Color::TRANSPARENT,
            text_halo_radius: 0.0,
            icon_image: String::new(),
            icon_width: 0.0,
            icon_height: 0.0,
            icon_opacity: 1.0,
            shield_text: String::new(),
            shield_color: Color::WHITE,
            shield_opacity: 1.0,
            shield_frame_color: Color::BLACK,
            shield_frame_width: 1.0,
            shield_casing_color: Color::TRANSPARENT,
            shield_casing_width: 0.0,
            shield_image: String::new(),
            shield_shape: ShieldShape::Rectangular,
            z_index: 0,
        }
    }
}

/// The parsed form of a rule's declaration block.
///
/// Applying a template writes each set field onto the target style; unset
/// fields leave whatever an earlier rule (or the default) put there.
#[derive(Debug, Default)]
pub struct StyleTemplate {
    pub color: Option<Eval<Color>>,
    pub fill_color: Option<Eval<Color>>,
    pub fill_image: Option<Eval<String>>,
    pub width: Option<Eval<f64>>,
    pub casing_width: Option<Eval<f64>>,
    pub casing_color: Option<Eval<Color>>,
    pub dashes: Option<Eval<Vec<f64>>>,
    pub casing_dashes: Option<Eval<Vec<f64>>>,
    pub linecap: Option<Eval<LineCap>>,
    pub linejoin: Option<Eval<LineJoin>>,
    pub casing_linecap: Option<Eval<LineCap>>,
    pub casing_linejoin: Option<Eval<LineJoin>>,
    pub font_family: Option<Eval<String>>,
    pub font_size: Option<Eval<f64>>,
    pub font_weight: Option<Eval<FontWeight>>,
    pub font_style: Option<Eval<FontStyle>>,
    pub text: Option<Eval<String>>,
    pub text_color: Option<Eval<Color>>,
    pub text_position: Option<Eval<TextPosition>>,
    pub text_offset: Option<Eval<f64>>,
    pub text_halo_color: Option<Eval<Color>>,
    pub text_halo_radius: Option<Eval<f64>>,
    pub icon_image: Option<Eval<String>>,
    pub icon_width: Option<Eval<f64>>,
    pub icon_height: Option<Eval<f64>>,
    pub icon_opacity: Option<Eval<f64>>,
    pub shield_text: Option<Eval<String>>,
    pub shield_color: Option<Eval<Color>>,
    pub shield_opacity: Option<Eval<f64>>,
    pub shield_frame_color: Option<Eval<Color>>,
    pub shield_frame_width: Option<Eval<f64>>,
    pub shield_casing_color: Option<Eval<Color>>,
    pub shield_casing_width: Option<Eval<f64>>,
    pub shield_image: Option<Eval<String>>,
    pub shield_shape: Option<Eval<ShieldShape>>,
    pub z_index: Option<Eval<i32>>,
}

macro_rules! apply_field {
    ($template:expr, $style:expr, $ctx:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(eval) = &$template.$field {
                eval.apply($ctx, &mut $style.$field);
            }
        )+
    };
}

impl StyleTemplate {
    /// Write every set field onto `style`.
    pub fn apply(&self, ctx: &EvalContext<'_>, style: &mut Style) {
        apply_field!(
            self, style, ctx, color, fill_color, fill_image, width, casing_width, casing_color,
            dashes, casing_dashes, linecap, linejoin, casing_linecap, casing_linejoin,
            font_family, font_size, font_weight, font_style, text, text_color, text_position,
            text_offset, text_halo_color, text_halo_radius, icon_image, icon_width, icon_height,
            icon_opacity, shield_text, shield_color, shield_opacity, shield_frame_color,
            shield_frame_width, shield_casing_color, shield_casing_width, shield_image,
            shield_shape, z_index,
        );
    }
}

/// Index of a style in a [`RenderAttributes`] arena.
pub type StyleHandle = usize;

/// Per render pass style storage.
///
/// Styles live in one arena; the id maps hold indices, so dropping the
/// whole pass frees everything at once and ids never dangle.
#[derive(Debug, Default)]
pub struct RenderAttributes {
    arena: Vec<Style>,
    nodes: HashMap<NodeId, StyleHandle>,
    ways: HashMap<WayId, StyleHandle>,
    relations: HashMap<RelId, StyleHandle>,
    canvas: Style,
}

impl RenderAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_style_mut(&mut self, id: NodeId) -> &mut Style {
        let arena = &mut self.arena;
        let handle = *self.nodes.entry(id).or_insert_with(|| {
            arena.push(Style::default());
            arena.len() - 1
        });
        &mut self.arena[handle]
    }

    pub fn way_style_mut(&mut self, id: WayId) -> &mut Style {
        let arena = &mut self.arena;
        let handle = *self.ways.entry(id).or_insert_with(|| {
            arena.push(Style::default());
            arena.len() - 1
        });
        &mut self.arena[handle]
    }

    pub fn relation_style_mut(&mut self, id: RelId) -> &mut Style {
        let arena = &mut self.arena;
        let handle = *self.relations.entry(id).or_insert_with(|| {
            arena.push(Style::default());
            arena.len() - 1
        });
        &mut self.arena[handle]
    }

    pub fn node_style(&self, id: NodeId) -> Option<&Style> {
        self.nodes.get(&id).map(|&h| &self.arena[h])
    }

    pub fn way_style(&self, id: WayId) -> Option<&Style> {
        self.ways.get(&id).map(|&h| &self.arena[h])
    }

    pub fn relation_style(&self, id: RelId) -> Option<&Style> {
        self.relations.get(&id).map(|&h| &self.arena[h])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn way_ids(&self) -> impl Iterator<Item = WayId> + '_ {
        self.ways.keys().copied()
    }

    pub fn relation_ids(&self) -> impl Iterator<Item = RelId> + '_ {
        self.relations.keys().copied()
    }

    pub fn canvas_style(&self) -> &Style {
        &self.canvas
    }

    pub fn canvas_style_mut(&mut self) -> &mut Style {
        &mut self.canvas
    }

    pub fn styled_object_count(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalInfo;
    use crate::strings::{StringTable, Tags};

    #[test]
    fn test_style_defaults() {
        let style = Style::default();
        assert_eq!(style.width, 0.0);
        assert_eq!(style.color, Color::BLACK);
        assert_eq!(style.fill_color, Color::TRANSPARENT);
        assert_eq!(style.z_index, 0);
        assert_eq!(style.font_family, "DejaVu Sans");
        assert!(style.text.is_empty());
        assert_eq!(style.linejoin, LineJoin::Miter);
    }

    #[test]
    fn test_template_apply_overwrites_only_set_fields() {
        let strings = StringTable::new();
        let tags = Tags::new();
        let ctx = EvalContext {
            tags: &tags,
            strings: &strings,
        };

        let mut template = StyleTemplate::default();
        template.width = Some(Eval::literal(3.0));
        template.color = Some(Eval::parse("#ff0000", EvalInfo::default()).unwrap());

        let mut style = Style {
            z_index: 50,
            ..Style::default()
        };
        template.apply(&ctx, &mut style);
        assert_eq!(style.width, 3.0);
        assert_eq!(style.color, Color::rgb(255, 0, 0));
        // untouched fields survive
        assert_eq!(style.z_index, 50);
    }

    #[test]
    fn test_later_template_wins() {
        let strings = StringTable::new();
        let tags = Tags::new();
        let ctx = EvalContext {
            tags: &tags,
            strings: &strings,
        };

        let mut first = StyleTemplate::default();
        first.width = Some(Eval::literal(1.0));
        first.z_index = Some(Eval::literal(5));
        let mut second = StyleTemplate::default();
        second.width = Some(Eval::literal(9.0));

        let mut style = Style::default();
        first.apply(&ctx, &mut style);
        second.apply(&ctx, &mut style);
        assert_eq!(style.width, 9.0);
        assert_eq!(style.z_index, 5);
    }

    #[test]
    fn test_arena_reuses_styles() {
        let mut attrs = RenderAttributes::new();
        attrs.way_style_mut(WayId(4)).width = 2.0;
        attrs.way_style_mut(WayId(4)).z_index = 7;
        assert_eq!(attrs.way_style(WayId(4)).unwrap().width, 2.0);
        assert_eq!(attrs.way_style(WayId(4)).unwrap().z_index, 7);
        assert_eq!(attrs.styled_object_count(), 1);
        assert!(attrs.way_style(WayId(5)).is_none());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(LineCap::from_eval_str("none"), Some(LineCap::Butt));
        assert_eq!(LineCap::from_eval_str("round"), Some(LineCap::Round));
        assert_eq!(LineJoin::from_eval_str("bevel"), Some(LineJoin::Bevel));
        assert_eq!(TextPosition::from_eval_str("line"), Some(TextPosition::Line));
        assert_eq!(ShieldShape::from_eval_str("rounded"), Some(ShieldShape::Rounded));
        assert!(LineCap::from_eval_str("wavy").is_none());
    }
}
