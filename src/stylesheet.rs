//! Compiled stylesheets and rule matching over query results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::color::Color;
use crate::eval::{Eval, EvalContext};
use crate::geodata::{Geodata, NodeId, RelId, WayId};
use crate::rule::{AcceptKind, GeoRef, Rule, Selector, Zoom};
use crate::strings::{StringTable, Tags};
use crate::style::{RenderAttributes, StyleTemplate};

/// An immutable, compiled MapCSS document.
///
/// Shared by `Arc` between the stylesheet manager and running jobs, so a
/// hot swap never invalidates a render pass already under way.
#[derive(Debug)]
pub struct Stylesheet {
    rules: Vec<Rule>,
    canvas: StyleTemplate,
    path: PathBuf,
}

impl Stylesheet {
    pub fn new(rules: Vec<Rule>, canvas: StyleTemplate, path: PathBuf) -> Self {
        Self {
            rules,
            canvas,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Produce the styles for one render pass.
    ///
    /// Every queried object is run through the rules in declaration
    /// order; the resulting style is the fold of all applying templates.
    /// The canvas style is finalized from the `canvas {}` block.
    pub fn match_all(
        &self,
        node_ids: &[NodeId],
        way_ids: &[WayId],
        rel_ids: &[RelId],
        zoom: u8,
        geodata: &Geodata,
        strings: &StringTable,
    ) -> RenderAttributes {
        let mut attrs = RenderAttributes::new();

        let empty = Tags::new();
        let canvas_ctx = EvalContext {
            tags: &empty,
            strings,
        };
        self.canvas.apply(&canvas_ctx, attrs.canvas_style_mut());

        for id in node_ids {
            if let Some(node) = geodata.node(*id) {
                for rule in &self.rules {
                    rule.apply_to(GeoRef::Node(node), zoom, geodata, strings, &mut attrs);
                }
            }
        }
        for id in way_ids {
            if let Some(way) = geodata.way(*id) {
                for rule in &self.rules {
                    rule.apply_to(GeoRef::Way(way), zoom, geodata, strings, &mut attrs);
                }
            }
        }
        for id in rel_ids {
            if let Some(rel) = geodata.relation(*id) {
                for rule in &self.rules {
                    rule.apply_to(GeoRef::Relation(rel), zoom, geodata, strings, &mut attrs);
                }
            }
        }

        attrs
    }

    /// The hard-coded stylesheet guaranteeing the server never has zero
    /// stylesheets: grey roads with zoom-dependent width, green forests,
    /// red administrative boundaries.
    pub fn fallback(strings: &StringTable) -> Self {
        let mut canvas = StyleTemplate::default();
        canvas.fill_color = Some(Eval::literal(Color::rgb(0xef, 0xef, 0xd0)));

        let mut rules = Vec::new();

        let mut thin = StyleTemplate::default();
        thin.color = Some(Eval::literal(Color::rgb(0x55, 0x55, 0x55)));
        thin.width = Some(Eval::literal(1.0));
        rules.push(Rule {
            selectors: vec![
                Selector::HasTag(strings.intern("highway")),
                Selector::Apply,
            ],
            zoom: Zoom::new(0, 15),
            accept: AcceptKind::Way,
            template: Arc::new(thin),
        });

        let mut thick = StyleTemplate::default();
        thick.color = Some(Eval::literal(Color::rgb(0x55, 0x55, 0x55)));
        thick.width = Some(Eval::literal(2.0));
        rules.push(Rule {
            selectors: vec![
                Selector::HasTag(strings.intern("highway")),
                Selector::Apply,
            ],
            zoom: Zoom::new(16, 18),
            accept: AcceptKind::Way,
            template: Arc::new(thick),
        });

        let mut forest = StyleTemplate::default();
        forest.fill_color = Some(Eval::literal(Color::rgb(0x00, 0xaa, 0x00)));
        rules.push(Rule {
            selectors: vec![
                Selector::TagEquals(strings.intern("landuse"), strings.intern("forest")),
                Selector::Apply,
            ],
            zoom: Zoom::default(),
            accept: AcceptKind::Way,
            template: Arc::new(forest),
        });

        let mut boundary = StyleTemplate::default();
        boundary.color = Some(Eval::literal(Color::rgb(0xaa, 0x00, 0x00)));
        boundary.width = Some(Eval::literal(2.0));
        rules.push(Rule {
            selectors: vec![
                Selector::TagEquals(strings.intern("boundary"), strings.intern("administrative")),
                Selector::ChildWays,
                Selector::Apply,
            ],
            zoom: Zoom::default(),
            accept: AcceptKind::Relation,
            template: Arc::new(boundary),
        });

        Self::new(rules, canvas, PathBuf::from(".fallback"))
    }
}
