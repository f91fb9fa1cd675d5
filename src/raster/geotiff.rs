use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;

use anyhow::Context;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

use crate::error::ConfigurationError;
use crate::models::{Crs, GeoTransform};

use super::{GeoRaster, RasterHeader};

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const USER_DEFINED: u16 = 32767;

fn open_decoder(path: &Path) -> anyhow::Result<Decoder<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open raster {:?}", path))?;
    Decoder::new(BufReader::new(file))
        .with_context(|| format!("Failed to initialise TIFF decoder for {:?}", path))
}

/// Read dimensions and georeferencing without decoding pixels.
pub fn read_header(path: &Path) -> anyhow::Result<RasterHeader> {
    let mut decoder = open_decoder(path)?;
    header_from(&mut decoder, path)
}

fn header_from<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> anyhow::Result<RasterHeader> {
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("Cannot read dimensions of {:?}", path))?;
    let transform = read_transform(decoder)?
        .ok_or_else(|| ConfigurationError::MissingGeoreference(path.display().to_string()))?;
    let crs = read_epsg(decoder)?.map(Crs::from_epsg);
    let nodata = read_nodata(decoder)?;
    Ok(RasterHeader {
        width,
        height,
        transform,
        crs,
        nodata,
    })
}

/// Read a GeoTIFF into band-sequential f32 samples.
pub fn read_geotiff(path: &Path) -> anyhow::Result<GeoRaster> {
    let mut decoder = open_decoder(path)?;
    let header = header_from(&mut decoder, path)?;

    let decoded = decoder
        .read_image()
        .with_context(|| format!("Failed to decode pixels of {:?}", path))?;
    let interleaved = samples_as_f32(decoded)
        .with_context(|| format!("Unsupported sample format in {:?}", path))?;

    let plane = header.width as usize * header.height as usize;
    if plane == 0 || interleaved.len() % plane != 0 {
        anyhow::bail!(
            "Raster {:?} has {} samples for {}x{} pixels",
            path,
            interleaved.len(),
            header.width,
            header.height
        );
    }
    let bands = interleaved.len() / plane;
    let data = if bands == 1 {
        interleaved
    } else {
        let mut planar = vec![0.0f32; interleaved.len()];
        for (i, value) in interleaved.into_iter().enumerate() {
            planar[(i % bands) * plane + i / bands] = value;
        }
        planar
    };

    Ok(GeoRaster {
        header,
        bands,
        data,
    })
}

#[allow(unreachable_patterns)]
fn samples_as_f32(decoded: DecodingResult) -> anyhow::Result<Vec<f32>> {
    Ok(match decoded {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => anyhow::bail!("sample type not supported"),
    })
}

fn read_f64_tag<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> anyhow::Result<Option<Vec<f64>>> {
    Ok(decoder.find_tag(tag)?.map(|v| v.into_f64_vec()).transpose()?)
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> anyhow::Result<Option<GeoTransform>> {
    if let Some(m) = read_f64_tag(decoder, Tag::ModelTransformationTag)? {
        if m.len() >= 16 {
            return Ok(Some(GeoTransform {
                origin_x: m[3],
                pixel_width: m[0],
                row_rotation: m[1],
                origin_y: m[7],
                col_rotation: m[4],
                pixel_height: m[5],
            }));
        }
    }

    let scale = read_f64_tag(decoder, Tag::ModelPixelScaleTag)?;
    let tiepoint = read_f64_tag(decoder, Tag::ModelTiepointTag)?;
    match (scale, tiepoint) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            let (i, j, x, y) = (t[0], t[1], t[3], t[4]);
            Ok(Some(GeoTransform {
                origin_x: x - i * s[0],
                pixel_width: s[0],
                row_rotation: 0.0,
                origin_y: y + j * s[1],
                col_rotation: 0.0,
                pixel_height: -s[1],
            }))
        }
        _ => Ok(None),
    }
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> anyhow::Result<Option<u32>> {
    let keys = match decoder.find_tag(Tag::GeoKeyDirectoryTag)? {
        Some(value) => value.into_u16_vec()?,
        None => return Ok(None),
    };
    Ok(epsg_from_geokeys(&keys))
}

/// Pull the EPSG code out of a GeoKey directory (header + 4-tuples).
pub(crate) fn epsg_from_geokeys(keys: &[u16]) -> Option<u32> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let mut projected = None;
    let mut geographic = None;
    for entry in keys[4..].chunks_exact(4).take(count) {
        // location 0 means the value is stored inline
        if entry[1] != 0 || entry[3] == 0 || entry[3] == USER_DEFINED {
            continue;
        }
        match entry[0] {
            PROJECTED_CS_TYPE => projected = Some(entry[3] as u32),
            GEOGRAPHIC_TYPE => geographic = Some(entry[3] as u32),
            _ => {}
        }
    }
    projected.or(geographic)
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> anyhow::Result<Option<f64>> {
    let text = match decoder.find_tag(Tag::GdalNodata)? {
        Some(value) => value.into_string()?,
        None => return Ok(None),
    };
    let text = text.trim_matches('\0').trim();
    match text.to_lowercase().as_str() {
        "nan" | "-nan" => Ok(Some(f64::NAN)),
        other => Ok(other.parse::<f64>().ok()),
    }
}

fn geokeys_for(crs: Option<Crs>) -> Vec<u16> {
    let mut keys = vec![1, 1, 0, 0];
    let mut push = |id: u16, value: u16| keys.extend_from_slice(&[id, 0, 1, value]);
    match crs {
        Some(crs) if crs.is_geographic() => {
            push(GT_MODEL_TYPE, MODEL_TYPE_GEOGRAPHIC);
            push(GT_RASTER_TYPE, RASTER_PIXEL_IS_AREA);
            push(GEOGRAPHIC_TYPE, crs.epsg as u16);
        }
        Some(crs) => {
            push(GT_MODEL_TYPE, MODEL_TYPE_PROJECTED);
            push(GT_RASTER_TYPE, RASTER_PIXEL_IS_AREA);
            push(PROJECTED_CS_TYPE, crs.epsg as u16);
        }
        None => push(GT_RASTER_TYPE, RASTER_PIXEL_IS_AREA),
    }
    keys[3] = ((keys.len() - 4) / 4) as u16;
    keys
}

/// Write a single-band Float32 GeoTIFF.
pub fn write_geotiff(
    path: &Path,
    width: u32,
    height: u32,
    samples: &[f32],
    transform: &GeoTransform,
    crs: Option<Crs>,
    nodata: Option<f64>,
) -> anyhow::Result<()> {
    if samples.len() != width as usize * height as usize {
        anyhow::bail!(
            "{} samples do not fill a {}x{} single-band raster",
            samples.len(),
            width,
            height
        );
    }
    if crs.is_some_and(|c| c.epsg > u16::MAX as u32) {
        anyhow::bail!("EPSG code of {:?} does not fit a GeoKey", crs);
    }

    let file = File::create(path).with_context(|| format!("Failed to create raster {:?}", path))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(width, height)?;

    if transform.row_rotation == 0.0 && transform.col_rotation == 0.0 {
        let scale = [transform.pixel_width, -transform.pixel_height, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
        image.encoder().write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        image.encoder().write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    } else {
        let t = transform;
        let matrix = [
            t.pixel_width, t.row_rotation, 0.0, t.origin_x,
            t.col_rotation, t.pixel_height, 0.0, t.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        image.encoder().write_tag(Tag::ModelTransformationTag, &matrix[..])?;
    }
    let keys = geokeys_for(crs);
    image.encoder().write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;
    if let Some(nodata) = nodata {
        let text = if nodata.is_nan() { "nan".to_string() } else { nodata.to_string() };
        image.encoder().write_tag(Tag::GdalNodata, text.as_str())?;
    }
    image
        .write_data(samples)
        .with_context(|| format!("Failed to write pixels to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geokeys_round_trip_projected_code() {
        let keys = geokeys_for(Some(Crs::from_epsg(32633)));
        assert_eq!(epsg_from_geokeys(&keys), Some(32633));
    }

    #[test]
    fn geokeys_prefer_projected_over_geographic() {
        let keys = [1, 1, 0, 2, 2048, 0, 1, 4326, 3072, 0, 1, 3794];
        assert_eq!(epsg_from_geokeys(&keys), Some(3794));
    }

    #[test]
    fn user_defined_code_is_ignored() {
        let keys = [1, 1, 0, 1, 3072, 0, 1, USER_DEFINED];
        assert_eq!(epsg_from_geokeys(&keys), None);
    }
}
