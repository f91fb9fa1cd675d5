//! GeoPackageBinary geometry blobs: the `GP` header followed by WKB.

use geo::{BoundingRect, Coord, Geometry, LineString, MultiPolygon, Polygon};

const MAGIC: &[u8; 2] = b"GP";
const VERSION: u8 = 0;
const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const ENVELOPE_XY: u8 = 0b0000_0010;
const FLAG_EMPTY: u8 = 0b0001_0000;

const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_ring(out: &mut Vec<u8>, ring: &LineString<f64>) {
    put_u32(out, ring.0.len() as u32);
    for c in &ring.0 {
        put_f64(out, c.x);
        put_f64(out, c.y);
    }
}

fn put_polygon(out: &mut Vec<u8>, polygon: &Polygon<f64>) {
    out.push(1);
    put_u32(out, WKB_POLYGON);
    if polygon.exterior().0.is_empty() {
        put_u32(out, 0);
        return;
    }
    put_u32(out, 1 + polygon.interiors().len() as u32);
    put_ring(out, polygon.exterior());
    for hole in polygon.interiors() {
        put_ring(out, hole);
    }
}

/// Encode a polygon or multi-polygon as a little-endian GeoPackage blob
/// with an XY envelope.
pub fn encode(geometry: &Geometry<f64>, srs_id: i32) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    match geometry {
        Geometry::Polygon(polygon) => put_polygon(&mut body, polygon),
        Geometry::MultiPolygon(multi) => {
            body.push(1);
            put_u32(&mut body, WKB_MULTIPOLYGON);
            put_u32(&mut body, multi.0.len() as u32);
            for polygon in &multi.0 {
                put_polygon(&mut body, polygon);
            }
        }
        _ => anyhow::bail!("only polygon geometries can be stored"),
    }

    let envelope = geometry.bounding_rect();
    let mut flags = FLAG_LITTLE_ENDIAN;
    match envelope {
        Some(_) => flags |= ENVELOPE_XY,
        None => flags |= FLAG_EMPTY,
    }

    let mut out = Vec::with_capacity(8 + 32 + body.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(flags);
    out.extend_from_slice(&srs_id.to_le_bytes());
    if let Some(rect) = envelope {
        for value in [rect.min().x, rect.max().x, rect.min().y, rect.max().y] {
            put_f64(&mut out, value);
        }
    }
    out.extend_from_slice(&body);
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| anyhow::anyhow!("WKB truncated at byte {}", self.pos))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u32(&mut self, little: bool) -> anyhow::Result<u32> {
        let b = self.take::<4>()?;
        Ok(if little { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    }

    fn f64(&mut self, little: bool) -> anyhow::Result<f64> {
        let b = self.take::<8>()?;
        Ok(if little { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) })
    }

    /// Byte order marker and geometry type of the next WKB geometry
    fn header(&mut self) -> anyhow::Result<(bool, u32)> {
        let [order] = self.take::<1>()?;
        let little = order == 1;
        Ok((little, self.u32(little)?))
    }

    fn polygon_body(&mut self, little: bool) -> anyhow::Result<Polygon<f64>> {
        let rings = self.u32(little)?;
        let mut parsed = Vec::with_capacity(rings as usize);
        for _ in 0..rings {
            let points = self.u32(little)?;
            let mut coords = Vec::with_capacity(points as usize);
            for _ in 0..points {
                let x = self.f64(little)?;
                let y = self.f64(little)?;
                coords.push(Coord { x, y });
            }
            parsed.push(LineString::new(coords));
        }
        let mut rings = parsed.into_iter();
        let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
        Ok(Polygon::new(exterior, rings.collect()))
    }

    fn geometry(&mut self) -> anyhow::Result<Geometry<f64>> {
        let (little, kind) = self.header()?;
        match kind {
            WKB_POLYGON => Ok(Geometry::Polygon(self.polygon_body(little)?)),
            WKB_MULTIPOLYGON => {
                let count = self.u32(little)?;
                let mut polygons = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (inner_little, inner_kind) = self.header()?;
                    if inner_kind != WKB_POLYGON {
                        anyhow::bail!("multi-polygon member has WKB type {}", inner_kind);
                    }
                    polygons.push(self.polygon_body(inner_little)?);
                }
                Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
            }
            other => anyhow::bail!("unsupported WKB geometry type {}", other),
        }
    }
}

/// Decode a GeoPackage blob holding a polygon or multi-polygon.
pub fn decode(blob: &[u8]) -> anyhow::Result<Geometry<f64>> {
    if blob.len() < 8 || &blob[..2] != MAGIC {
        anyhow::bail!("not a GeoPackage geometry blob");
    }
    let flags = blob[3];
    let envelope_len = match (flags >> 1) & 0b111 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => anyhow::bail!("invalid envelope indicator {}", other),
    };
    let mut reader = Reader {
        data: blob,
        pos: 8 + envelope_len,
    };
    reader.geometry()
}

/// srs_id stored in a GeoPackage blob header.
pub fn srs_id(blob: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = blob.get(4..8)?.try_into().ok()?;
    let little = blob.get(3)? & FLAG_LITTLE_ENDIAN != 0;
    Some(if little { i32::from_le_bytes(bytes) } else { i32::from_be_bytes(bytes) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Rect, coord};

    #[test]
    fn header_layout() {
        let square = Rect::new(coord! { x: 1.0, y: 2.0 }, coord! { x: 3.0, y: 5.0 }).to_polygon();
        let blob = encode(&Geometry::Polygon(square.clone()), 3794).unwrap();
        assert_eq!(&blob[..4], &[b'G', b'P', 0, 0b0000_0011]);
        assert_eq!(srs_id(&blob), Some(3794));
        // envelope is minx, maxx, miny, maxy
        assert_eq!(f64::from_le_bytes(blob[8..16].try_into().unwrap()), 1.0);
        assert_eq!(f64::from_le_bytes(blob[16..24].try_into().unwrap()), 3.0);
        assert_eq!(f64::from_le_bytes(blob[24..32].try_into().unwrap()), 2.0);
        assert_eq!(f64::from_le_bytes(blob[32..40].try_into().unwrap()), 5.0);
        assert_eq!(decode(&blob).unwrap(), Geometry::Polygon(square));
    }

    #[test]
    fn reads_big_endian_wkb() {
        let mut blob = vec![b'G', b'P', 0, 0, 0, 0, 0, 0];
        blob.push(0);
        blob.extend_from_slice(&WKB_POLYGON.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&4u32.to_be_bytes());
        for (x, y) in [(0.0f64, 0.0f64), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)] {
            blob.extend_from_slice(&x.to_be_bytes());
            blob.extend_from_slice(&y.to_be_bytes());
        }
        match decode(&blob).unwrap() {
            Geometry::Polygon(p) => assert_eq!(p.exterior().0.len(), 4),
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn rejects_foreign_blobs() {
        assert!(decode(b"SQLite format 3").is_err());
    }
}
