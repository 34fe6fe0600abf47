//! MapCSS rules: selector chains, zoom ranges and per-object matching.
//!
//! A selector chain is a flat predicate list evaluated left to right; the
//! terminal `Apply` writes the rule's style template onto whichever object
//! reached it, which for relation child selectors is the member itself.

use std::sync::Arc;

use log::warn;
use regex::Regex;

use crate::eval::EvalContext;
use crate::geodata::{Geodata, Node, Relation, Way};
use crate::geom::MAX_ZOOM;
use crate::strings::{CachedString, StringTable, Tags};
use crate::style::{RenderAttributes, StyleTemplate};

/// Zoom range a rule applies to, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zoom {
    pub bottom: u8,
    pub top: u8,
}

impl Zoom {
    pub fn new(bottom: u8, top: u8) -> Self {
        Self { bottom, top }
    }

    pub fn contains(&self, zoom: u8) -> bool {
        self.bottom <= zoom && zoom <= self.top
    }

    /// Intersect with another range; chained subselector zooms narrow.
    pub fn focus(&self, other: &Zoom) -> Zoom {
        Zoom {
            bottom: self.bottom.max(other.bottom),
            top: self.top.min(other.top),
        }
    }
}

impl Default for Zoom {
    fn default() -> Self {
        Self {
            bottom: 0,
            top: MAX_ZOOM,
        }
    }
}

/// Which object kinds a rule's spatial query results are tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptKind {
    Any,
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOp {
    fn test(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Less => lhs < rhs,
            CompareOp::LessEqual => lhs <= rhs,
            CompareOp::Greater => lhs > rhs,
            CompareOp::GreaterEqual => lhs >= rhs,
        }
    }
}

/// One predicate in a selector chain.
#[derive(Debug)]
pub enum Selector {
    HasTag(CachedString),
    HasNotTag(CachedString),
    TagEquals(CachedString, CachedString),
    TagUnequals(CachedString, CachedString),
    TagMatches(CachedString, Regex),
    TagOrd(CachedString, CompareOp, f64),
    /// Open way geometry.
    Line,
    /// Closed way geometry.
    Area,
    /// Recurse into a relation's member nodes.
    ChildNodes,
    /// Recurse into a relation's member ways.
    ChildWays,
    /// Terminal: write the rule's template onto the current object.
    Apply,
}

/// A borrowed geo-object during matching.
#[derive(Clone, Copy)]
pub enum GeoRef<'a> {
    Node(&'a Node),
    Way(&'a Way),
    Relation(&'a Relation),
}

impl<'a> GeoRef<'a> {
    pub fn tags(&self) -> &'a Tags {
        match self {
            GeoRef::Node(n) => &n.tags,
            GeoRef::Way(w) => &w.tags,
            GeoRef::Relation(r) => &r.tags,
        }
    }

    fn kind_accepted(&self, accept: AcceptKind) -> bool {
        matches!(
            (accept, self),
            (AcceptKind::Any, _)
                | (AcceptKind::Node, GeoRef::Node(_))
                | (AcceptKind::Way, GeoRef::Way(_))
                | (AcceptKind::Relation, GeoRef::Relation(_))
        )
    }
}

/// A compiled rule: selector chain, zoom bounds, accept kind and template.
#[derive(Debug)]
pub struct Rule {
    pub selectors: Vec<Selector>,
    pub zoom: Zoom,
    pub accept: AcceptKind,
    pub template: Arc<StyleTemplate>,
}

impl Rule {
    /// Apply this rule to `obj` at `zoom`, writing into `attrs` if the
    /// chain reaches `Apply`. Zoom and kind filters run before any
    /// predicate.
    pub fn apply_to(
        &self,
        obj: GeoRef<'_>,
        zoom: u8,
        geodata: &Geodata,
        strings: &StringTable,
        attrs: &mut RenderAttributes,
    ) {
        if !self.zoom.contains(zoom) || !obj.kind_accepted(self.accept) {
            return;
        }
        self.walk(&self.selectors, obj, geodata, strings, attrs);
    }

    fn walk(
        &self,
        selectors: &[Selector],
        obj: GeoRef<'_>,
        geodata: &Geodata,
        strings: &StringTable,
        attrs: &mut RenderAttributes,
    ) {
        let (first, rest) = match selectors.split_first() {
            Some(split) => split,
            None => return,
        };

        let tags = obj.tags();
        let passes = match first {
            Selector::Apply => {
                let ctx = EvalContext { tags, strings };
                let style = match obj {
                    GeoRef::Node(n) => attrs.node_style_mut(n.id),
                    GeoRef::Way(w) => attrs.way_style_mut(w.id),
                    GeoRef::Relation(r) => attrs.relation_style_mut(r.id),
                };
                self.template.apply(&ctx, style);
                return;
            }
            Selector::ChildNodes => {
                if let GeoRef::Relation(rel) = obj {
                    for id in &rel.nodes {
                        if let Some(node) = geodata.node(*id) {
                            self.walk(rest, GeoRef::Node(node), geodata, strings, attrs);
                        }
                    }
                }
                return;
            }
            Selector::ChildWays => {
                if let GeoRef::Relation(rel) = obj {
                    for id in &rel.ways {
                        if let Some(way) = geodata.way(*id) {
                            self.walk(rest, GeoRef::Way(way), geodata, strings, attrs);
                        }
                    }
                }
                return;
            }
            Selector::HasTag(key) => tags.contains(key),
            Selector::HasNotTag(key) => !tags.contains(key),
            Selector::TagEquals(key, value) => tags.get(key) == Some(value),
            Selector::TagUnequals(key, value) => tags.get(key) != Some(value),
            Selector::TagMatches(key, regex) => tags
                .get(key)
                .is_some_and(|v| regex.is_match(v.as_str())),
            Selector::TagOrd(key, op, rhs) => tags
                .get(key)
                .and_then(|v| v.as_str().parse::<f64>().ok())
                .is_some_and(|lhs| op.test(lhs, *rhs)),
            Selector::Line => matches!(obj, GeoRef::Way(w) if !w.is_closed()),
            Selector::Area => matches!(obj, GeoRef::Way(w) if w.is_closed()),
        };

        if passes {
            self.walk(rest, obj, geodata, strings, attrs);
        }
    }
}

/// Compile a `=~` selector value into a regex, dropping the predicate on
/// a bad pattern the same way a non-numeric ordering value is dropped.
pub fn compile_tag_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("ignoring unparsable selector regex '{pattern}': {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Eval;
    use crate::geodata::{GeodataBuilder, NodeId, RelId, WayId};
    use crate::geom::FixedPoint;

    struct Fixture {
        strings: StringTable,
        geodata: Geodata,
    }

    fn fixture() -> Fixture {
        let strings = StringTable::new();
        let mut builder = GeodataBuilder::new();
        builder.add_node_tagged(
            NodeId(1),
            FixedPoint::new(0, 0),
            Tags::from_pairs([("highway", "bus_stop"), ("lanes", "3")], &strings),
        );
        builder.add_node_tagged(NodeId(2), FixedPoint::new(10, 0), Tags::new());
        builder.add_node_tagged(NodeId(3), FixedPoint::new(10, 10), Tags::new());
        builder.add_way_tagged(
            WayId(10),
            vec![NodeId(1), NodeId(2)],
            Tags::from_pairs([("highway", "primary")], &strings),
        );
        builder.add_way_tagged(
            WayId(11),
            vec![NodeId(1), NodeId(2), NodeId(3), NodeId(1)],
            Tags::from_pairs([("landuse", "forest")], &strings),
        );
        builder.add_relation_tagged(
            RelId(20),
            vec![],
            vec![],
            vec![WayId(10), WayId(11)],
            vec!["outer".into(), "outer".into()],
            Tags::from_pairs([("boundary", "administrative")], &strings),
        );
        Fixture {
            geodata: builder.build(),
            strings,
        }
    }

    fn width_rule(selectors: Vec<Selector>, accept: AcceptKind, width: f64) -> Rule {
        let mut template = StyleTemplate::default();
        template.width = Some(Eval::literal(width));
        Rule {
            selectors,
            zoom: Zoom::default(),
            accept,
            template: Arc::new(template),
        }
    }

    #[test]
    fn test_has_tag_applies() {
        let f = fixture();
        let rule = width_rule(
            vec![
                Selector::HasTag(f.strings.intern("highway")),
                Selector::Apply,
            ],
            AcceptKind::Way,
            4.0,
        );
        let mut attrs = RenderAttributes::new();
        let way = f.geodata.way(WayId(10)).unwrap();
        rule.apply_to(GeoRef::Way(way), 10, &f.geodata, &f.strings, &mut attrs);
        assert_eq!(attrs.way_style(WayId(10)).unwrap().width, 4.0);
    }

    #[test]
    fn test_no_match_means_no_style() {
        let f = fixture();
        let rule = width_rule(
            vec![
                Selector::TagEquals(f.strings.intern("highway"), f.strings.intern("motorway")),
                Selector::Apply,
            ],
            AcceptKind::Way,
            4.0,
        );
        let mut attrs = RenderAttributes::new();
        let way = f.geodata.way(WayId(10)).unwrap();
        rule.apply_to(GeoRef::Way(way), 10, &f.geodata, &f.strings, &mut attrs);
        assert!(attrs.way_style(WayId(10)).is_none());
    }

    #[test]
    fn test_zoom_filter() {
        let f = fixture();
        let mut rule = width_rule(
            vec![
                Selector::HasTag(f.strings.intern("highway")),
                Selector::Apply,
            ],
            AcceptKind::Way,
            4.0,
        );
        rule.zoom = Zoom::new(12, 18);
        let mut attrs = RenderAttributes::new();
        let way = f.geodata.way(WayId(10)).unwrap();
        rule.apply_to(GeoRef::Way(way), 5, &f.geodata, &f.strings, &mut attrs);
        assert!(attrs.way_style(WayId(10)).is_none());
        rule.apply_to(GeoRef::Way(way), 12, &f.geodata, &f.strings, &mut attrs);
        assert!(attrs.way_style(WayId(10)).is_some());
    }

    #[test]
    fn test_accept_kind_filter() {
        let f = fixture();
        let rule = width_rule(
            vec![
                Selector::HasTag(f.strings.intern("highway")),
                Selector::Apply,
            ],
            AcceptKind::Node,
            4.0,
        );
        let mut attrs = RenderAttributes::new();
        let way = f.geodata.way(WayId(10)).unwrap();
        rule.apply_to(GeoRef::Way(way), 10, &f.geodata, &f.strings, &mut attrs);
        assert!(attrs.way_style(WayId(10)).is_none());
    }

    #[test]
    fn test_line_and_area_predicates() {
        let f = fixture();
        let open = f.geodata.way(WayId(10)).unwrap();
        let closed = f.geodata.way(WayId(11)).unwrap();

        let line_rule = width_rule(vec![Selector::Line, Selector::Apply], AcceptKind::Way, 1.0);
        let area_rule = width_rule(vec![Selector::Area, Selector::Apply], AcceptKind::Way, 2.0);

        let mut attrs = RenderAttributes::new();
        line_rule.apply_to(GeoRef::Way(open), 10, &f.geodata, &f.strings, &mut attrs);
        line_rule.apply_to(GeoRef::Way(closed), 10, &f.geodata, &f.strings, &mut attrs);
        area_rule.apply_to(GeoRef::Way(open), 10, &f.geodata, &f.strings, &mut attrs);
        area_rule.apply_to(GeoRef::Way(closed), 10, &f.geodata, &f.strings, &mut attrs);

        assert_eq!(attrs.way_style(WayId(10)).unwrap().width, 1.0);
        assert_eq!(attrs.way_style(WayId(11)).unwrap().width, 2.0);
    }

    #[test]
    fn test_tag_ord_numeric() {
        let f = fixture();
        let node = f.geodata.node(NodeId(1)).unwrap();
        let rule = width_rule(
            vec![
                Selector::TagOrd(f.strings.intern("lanes"), CompareOp::GreaterEqual, 2.0),
                Selector::Apply,
            ],
            AcceptKind::Node,
            5.0,
        );
        let mut attrs = RenderAttributes::new();
        rule.apply_to(GeoRef::Node(node), 10, &f.geodata, &f.strings, &mut attrs);
        assert_eq!(attrs.node_style(NodeId(1)).unwrap().width, 5.0);

        // non-numeric tag value never matches
        let bogus = width_rule(
            vec![
                Selector::TagOrd(f.strings.intern("highway"), CompareOp::Less, 9.0),
                Selector::Apply,
            ],
            AcceptKind::Node,
            6.0,
        );
        let mut attrs = RenderAttributes::new();
        bogus.apply_to(GeoRef::Node(node), 10, &f.geodata, &f.strings, &mut attrs);
        assert!(attrs.node_style(NodeId(1)).is_none());
    }

    #[test]
    fn test_tag_matches_regex() {
        let f = fixture();
        let way = f.geodata.way(WayId(10)).unwrap();
        let rule = width_rule(
            vec![
                Selector::TagMatches(
                    f.strings.intern("highway"),
                    Regex::new("^(primary|secondary)$").unwrap(),
                ),
                Selector::Apply,
            ],
            AcceptKind::Way,
            3.0,
        );
        let mut attrs = RenderAttributes::new();
        rule.apply_to(GeoRef::Way(way), 10, &f.geodata, &f.strings, &mut attrs);
        assert_eq!(attrs.way_style(WayId(10)).unwrap().width, 3.0);
    }

    #[test]
    fn test_child_ways_styles_members() {
        let f = fixture();
        let rel = f.geodata.relation(RelId(20)).unwrap();
        let rule = width_rule(
            vec![
                Selector::TagEquals(
                    f.strings.intern("boundary"),
                    f.strings.intern("administrative"),
                ),
                Selector::ChildWays,
                Selector::Apply,
            ],
            AcceptKind::Relation,
            2.5,
        );
        let mut attrs = RenderAttributes::new();
        rule.apply_to(GeoRef::Relation(rel), 10, &f.geodata, &f.strings, &mut attrs);
        // both member ways styled, the relation itself not
        assert_eq!(attrs.way_style(WayId(10)).unwrap().width, 2.5);
        assert_eq!(attrs.way_style(WayId(11)).unwrap().width, 2.5);
        assert!(attrs.relation_style(RelId(20)).is_none());
    }

    #[test]
    fn test_zoom_focus() {
        let a = Zoom::new(0, 12);
        let b = Zoom::new(4, 18);
        assert_eq!(a.focus(&b), Zoom::new(4, 12));
    }
}
