use std::f64::consts::PI;

use geo::coordinate_position::CoordPos;
use geo::dimensions::Dimensions;
use geo::{Area, BooleanOps, BoundingRect, ConvexHull, EuclideanLength, Intersects, MultiPolygon, Polygon, Relate};

/// Compactness: `4π·area / convex_hull_perimeter²`.
/// 1 for a circle, ~0.785 for a square, towards 0 for elongated shapes.
pub fn roundness(polygon: &Polygon<f64>) -> f64 {
    let perimeter = polygon.convex_hull().exterior().euclidean_length();
    if perimeter <= 0.0 {
        return 0.0;
    }
    4.0 * PI * polygon.unsigned_area() / (perimeter * perimeter)
}

pub fn area(polygon: &Polygon<f64>) -> f64 {
    polygon.unsigned_area()
}

/// When two polygons are fused by [`dissolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Interiors overlap with positive area.
    SharedArea,
    /// Interiors overlap, or the boundaries share a segment.
    SharedBoundary,
}

fn bboxes_meet(a: &Polygon<f64>, b: &Polygon<f64>) -> bool {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => ra.intersects(&rb),
        _ => false,
    }
}

/// Whether the interiors of `a` and `b` share a positive area.
pub fn interiors_overlap(a: &Polygon<f64>, b: &Polygon<f64>) -> bool {
    bboxes_meet(a, b) && a.relate(b).get(CoordPos::Inside, CoordPos::Inside) == Dimensions::TwoDimensional
}

fn should_merge(a: &Polygon<f64>, b: &Polygon<f64>, rule: MergeRule) -> bool {
    if !bboxes_meet(a, b) {
        return false;
    }
    let matrix = a.relate(b);
    let overlap = matrix.get(CoordPos::Inside, CoordPos::Inside) == Dimensions::TwoDimensional;
    match rule {
        MergeRule::SharedArea => overlap,
        MergeRule::SharedBoundary => {
            overlap || matrix.get(CoordPos::OnBoundary, CoordPos::OnBoundary) == Dimensions::OneDimensional
        }
    }
}

/// Dissolve then explode: fuse polygons according to `rule` and return the
/// maximal single-part components. Polygons meeting only at points stay
/// separate parts.
pub fn dissolve(polygons: impl IntoIterator<Item = Polygon<f64>>, rule: MergeRule) -> Vec<Polygon<f64>> {
    let mut parts: Vec<Polygon<f64>> = Vec::new();
    for polygon in polygons {
        let (touching, rest): (Vec<_>, Vec<_>) =
            parts.into_iter().partition(|part| should_merge(part, &polygon, rule));
        parts = rest;
        if touching.is_empty() {
            parts.push(polygon);
            continue;
        }
        let merged = touching
            .into_iter()
            .fold(MultiPolygon::new(vec![polygon]), |acc, part| acc.union(&MultiPolygon::new(vec![part])));
        parts.extend(merged.0.into_iter().filter(|p| p.unsigned_area() > 0.0));
    }
    parts
}
