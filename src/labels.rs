//! Label and shield placement.
//!
//! Painting emits label and shield candidates; after all objects are
//! drawn a greedy pass decides which survive. Bigger text goes first,
//! each label tries five candidate positions around its anchor, and
//! anything overlapping more than a tenth of its area is dropped. Labels
//! whose owner geometry a neighbour tile would not also see are discarded
//! to keep placement deterministic across tile boundaries.

use crate::color::Color;
use crate::geom::{FloatPoint, FloatRect};
use crate::style::ShieldShape;

/// Maximum tolerated overlap, as a fraction of the candidate's area.
const LABEL_OVERLAP: f64 = 0.1;
const SHIELD_OVERLAP: f64 = 0.1;

/// Text style bits copied out of the owning `Style` at emission time.
#[derive(Debug, Clone)]
pub struct TextStyle {
    pub font_family: String,
    pub font_size: f64,
    pub text_color: Color,
    pub halo_color: Color,
    pub halo_radius: f64,
}

/// A text annotation candidate.
#[derive(Debug, Clone)]
pub struct Label {
    pub text: String,
    /// Text bounds at the anchor position.
    pub bounds: FloatRect,
    /// Baseline origin of the text.
    pub origin: FloatPoint,
    /// Bounds of the geometry that emitted the label.
    pub owner: FloatRect,
    pub style: TextStyle,
}

impl Label {
    fn translate(&mut self, dx: f64, dy: f64) {
        self.bounds = self.bounds.translate(dx, dy);
        self.origin = FloatPoint::new(self.origin.x + dx, self.origin.y + dy);
    }
}

/// A boxed road-number plate candidate.
#[derive(Debug, Clone)]
pub struct Shield {
    pub text: String,
    /// Text bounds inside the plate.
    pub bounds: FloatRect,
    pub origin: FloatPoint,
    /// The plate rectangle including frame and casing.
    pub plate: FloatRect,
    pub style: TextStyle,
    pub shield_color: Color,
    pub frame_color: Color,
    pub frame_width: f64,
    pub casing_color: Color,
    pub casing_width: f64,
    pub shape: ShieldShape,
}

/// Sort: larger text first, then left-most for determinism.
fn placement_order(a_size: f64, a_min_x: f64, b_size: f64, b_min_x: f64) -> std::cmp::Ordering {
    b_size
        .partial_cmp(&a_size)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(
            a_min_x
                .partial_cmp(&b_min_x)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
}

fn max_intersection(rect: &FloatRect, placed: impl Iterator<Item = FloatRect>) -> f64 {
    placed
        .map(|other| rect.intersection(&other).area())
        .fold(0.0, f64::max)
}

/// The placement arena: the meta-tile bounds plus what each of the eight
/// neighbour meta-tiles sees of this one.
pub struct PlacementBounds {
    pub bounds: FloatRect,
    neighbours: [FloatRect; 8],
    neighbour_requests: [FloatRect; 8],
}

impl PlacementBounds {
    /// `bounds` is the drawable meta area, `border` the overlap each
    /// neighbour render also covers.
    pub fn new(bounds: FloatRect, border: f64) -> Self {
        let w = bounds.width();
        let h = bounds.height();
        let offsets = [
            (w, h),
            (-w, h),
            (w, -h),
            (-w, -h),
            (0.0, h),
            (0.0, -h),
            (w, 0.0),
            (-w, 0.0),
        ];
        let neighbours = offsets.map(|(dx, dy)| bounds.translate(dx, dy));
        let neighbour_requests = neighbours.map(|n| n.grow(border, border));
        Self {
            bounds,
            neighbours,
            neighbour_requests,
        }
    }

    /// A label crossing into a neighbour tile must have an owner that
    /// neighbour's own render pass also sees, or it would appear on one
    /// side of the boundary only.
    fn is_cut_off(&self, bounds: &FloatRect, owner: &FloatRect) -> bool {
        (0..8).any(|i| {
            bounds.intersects(&self.neighbours[i]) && !self.neighbour_requests[i].intersects(owner)
        })
    }
}

/// Greedy label placement. Returns the surviving labels, translated to
/// their chosen positions.
pub fn place_labels(mut labels: Vec<Label>, arena: &PlacementBounds) -> Vec<Label> {
    labels.sort_by(|a, b| {
        placement_order(
            a.style.font_size,
            a.bounds.min_x,
            b.style.font_size,
            b.bounds.min_x,
        )
    });

    let mut placed: Vec<Label> = Vec::with_capacity(labels.len());
    let mut contained: Vec<Label> = Vec::with_capacity(labels.len());

    // edge-crossing labels first: they cannot slide, only pass or fail
    for label in labels {
        if arena.bounds.contains(&label.bounds) {
            contained.push(label);
        } else if arena.bounds.intersection(&label.bounds).area() > 0.0 {
            if arena.is_cut_off(&label.bounds, &label.owner) {
                continue;
            }
            let overlap = max_intersection(&label.bounds, placed.iter().map(|l| l.bounds));
            if overlap < LABEL_OVERLAP * label.bounds.area() {
                placed.push(label);
            }
        }
    }

    for mut label in contained {
        let width = label.bounds.width();
        let height = label.bounds.height();
        let candidates = [
            (0.0, 0.0),
            (0.0, -height / 2.0),
            (width / 2.0, 0.0),
            (0.0, height / 2.0),
            (-width / 2.0, 0.0),
        ];

        let mut best = 0;
        let mut best_overlap = f64::INFINITY;
        for (index, (dx, dy)) in candidates.iter().enumerate() {
            let moved = label.bounds.translate(*dx, *dy);
            if index > 0 && !arena.bounds.contains(&moved) {
                continue;
            }
            let overlap = max_intersection(&moved, placed.iter().map(|l| l.bounds));
            if overlap < best_overlap {
                best_overlap = overlap;
                best = index;
            }
        }

        if best_overlap < LABEL_OVERLAP * label.bounds.area() {
            let (dx, dy) = candidates[best];
            label.translate(dx, dy);
            placed.push(label);
        }
    }

    placed
}

/// Greedy shield placement: in-bounds plates only, no sliding.
pub fn place_shields(mut shields: Vec<Shield>, arena: &PlacementBounds) -> Vec<Shield> {
    shields.sort_by(|a, b| {
        placement_order(
            a.style.font_size,
            a.bounds.min_x,
            b.style.font_size,
            b.bounds.min_x,
        )
    });

    let mut placed: Vec<Shield> = Vec::new();
    for shield in shields {
        if !arena.bounds.contains(&shield.plate) {
            continue;
        }
        let overlap = max_intersection(&shield.bounds, placed.iter().map(|s| s.bounds));
        if overlap < SHIELD_OVERLAP * shield.bounds.area() {
            placed.push(shield);
        }
    }
    placed
}
