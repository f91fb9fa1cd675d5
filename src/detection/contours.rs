use std::collections::{BTreeMap, HashMap};

use geo::orient::{Direction, Orient};
use geo::{LineString, Polygon};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::models::GeoTransform;

type Vertex = (i64, i64);

/// Boundary of one connected region, in pixel-corner coordinates
/// (x to the right, y down, pixel (c, r) spans [c, c+1] x [r, r+1]).
#[derive(Debug, Clone, PartialEq)]
pub struct PixelPolygon {
    pub exterior: Vec<Vertex>,
    pub holes: Vec<Vec<Vertex>>,
    pub pixel_count: u32,
}

impl PixelPolygon {
    /// Project the pixel-corner rings through `transform` into map space.
    pub fn to_map(&self, transform: &GeoTransform) -> Polygon<f64> {
        let ring = |vertices: &[Vertex]| -> LineString<f64> {
            vertices
                .iter()
                .map(|&(x, y)| transform.apply(x as f64, y as f64))
                .collect::<Vec<_>>()
                .into()
        };
        Polygon::new(ring(&self.exterior), self.holes.iter().map(|h| ring(h)).collect())
            .orient(Direction::Default)
    }
}

#[derive(Clone, Copy)]
struct Edge {
    start: Vertex,
    end: Vertex,
}

impl Edge {
    fn direction(&self) -> Vertex {
        (self.end.0 - self.start.0, self.end.1 - self.start.1)
    }
}

/// Trace the outline of every 4-connected foreground region of `mask`
/// (non-zero pixels), in raster scan order of the regions.
pub fn find_contours(mask: &GrayImage) -> Vec<PixelPolygon> {
    // One pixel of background all around; foreground never sits on the border
    let (width, height) = mask.dimensions();
    let padded = GrayImage::from_fn(width + 2, height + 2, |x, y| {
        if x == 0 || y == 0 || x > width || y > height {
            Luma([0])
        } else {
            *mask.get_pixel(x - 1, y - 1)
        }
    });
    let labeled = connected_components(&padded, Connectivity::Four, Luma([0]));
    let label_at = |x: i64, y: i64| -> u32 { labeled.get_pixel(x as u32, y as u32)[0] };

    // Boundary edges per region, oriented clockwise around each pixel on screen.
    // Vertices are shifted back by the padding.
    let mut regions: BTreeMap<u32, (Vec<Edge>, u32)> = BTreeMap::new();
    for (px, py, label) in labeled.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let (px, py) = (px as i64, py as i64);
        let (x, y) = (px - 1, py - 1);
        let (edges, count) = regions.entry(label).or_default();
        *count += 1;
        if label_at(px, py - 1) != label {
            edges.push(Edge { start: (x, y), end: (x + 1, y) });
        }
        if label_at(px + 1, py) != label {
            edges.push(Edge { start: (x + 1, y), end: (x + 1, y + 1) });
        }
        if label_at(px, py + 1) != label {
            edges.push(Edge { start: (x + 1, y + 1), end: (x, y + 1) });
        }
        if label_at(px - 1, py) != label {
            edges.push(Edge { start: (x, y + 1), end: (x, y) });
        }
    }

    regions
        .into_values()
        .filter_map(|(edges, pixel_count)| assemble(&edges, pixel_count))
        .collect()
}

/// Link boundary edges into closed rings and sort them into exterior/holes.
fn assemble(edges: &[Edge], pixel_count: u32) -> Option<PixelPolygon> {
    let mut outgoing: HashMap<Vertex, Vec<usize>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.start).or_default().push(i);
    }

    let mut used = vec![false; edges.len()];
    let mut exteriors = Vec::new();
    let mut holes = Vec::new();

    for first in 0..edges.len() {
        if used[first] {
            continue;
        }
        let origin = edges[first].start;
        let mut ring = Vec::new();
        let mut current = first;
        loop {
            used[current] = true;
            ring.push(edges[current].start);
            let edge = edges[current];
            if edge.end == origin {
                break;
            }
            let (dx, dy) = edge.direction();
            let counter_clockwise = (dy, -dx);
            let candidates = outgoing.get(&edge.end)?;
            // At a saddle vertex two edges leave. Turning counter-clockwise
            // stays on the same background region, so a hole that reaches the
            // outside through a diagonal gap becomes its own ring touching the
            // exterior at that vertex.
            current = candidates
                .iter()
                .copied()
                .filter(|&i| !used[i])
                .min_by_key(|&i| if edges[i].direction() == counter_clockwise { 0 } else { 1 })?;
        }

        let ring = drop_collinear(ring);
        if ring.len() < 4 {
            continue;
        }
        let area = signed_area(&ring);
        if area > 0 {
            exteriors.push((area, ring));
        } else if area < 0 {
            holes.push(ring);
        }
    }

    // A 4-connected region has a single outer boundary; keep the largest
    // positive ring should edge linking ever produce more.
    let (_, exterior) = exteriors.into_iter().max_by_key(|(area, _)| *area)?;
    Some(PixelPolygon {
        exterior,
        holes,
        pixel_count,
    })
}

fn drop_collinear(ring: Vec<Vertex>) -> Vec<Vertex> {
    let n = ring.len();
    if n < 3 {
        return ring;
    }
    (0..n)
        .filter(|&i| {
            let prev = ring[(i + n - 1) % n];
            let here = ring[i];
            let next = ring[(i + 1) % n];
            let a = (here.0 - prev.0, here.1 - prev.1);
            let b = (next.0 - here.0, next.1 - here.1);
            a.0 * b.1 - a.1 * b.0 != 0
        })
        .map(|i| ring[i])
        .collect()
}

/// Twice the shoelace area; positive for clockwise rings on screen.
fn signed_area(ring: &[Vertex]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum()
}
