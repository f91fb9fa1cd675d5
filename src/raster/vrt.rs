use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::read_header;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Write a GDAL VRT mosaic referencing every raster in `sources`.
///
/// All sources must share the resolution and CRS of the first one. Sources
/// below the VRT's directory are referenced relative to it.
pub fn build_vrt(sources: &[PathBuf], vrt_path: &Path) -> anyhow::Result<()> {
    let first = sources.first().context("Cannot build a VRT from zero rasters")?;
    let base = read_header(first)?;
    let t = base.transform;
    if t.row_rotation != 0.0 || t.col_rotation != 0.0 {
        anyhow::bail!("Rotated rasters are not supported in VRT mosaics: {:?}", first);
    }

    let mut headers = Vec::with_capacity(sources.len());
    let (mut min_x, mut max_y) = (f64::MAX, f64::MIN);
    let (mut max_x, mut min_y) = (f64::MIN, f64::MAX);
    for source in sources {
        let header = read_header(source)?;
        if (header.transform.pixel_width - t.pixel_width).abs() > 1e-9
            || (header.transform.pixel_height - t.pixel_height).abs() > 1e-9
        {
            anyhow::bail!("Raster {:?} has a different resolution than {:?}", source, first);
        }
        if header.crs != base.crs {
            anyhow::bail!("Raster {:?} has a different CRS than {:?}", source, first);
        }
        let extent = header.transform.extent(header.width, header.height);
        min_x = min_x.min(extent.min().x);
        min_y = min_y.min(extent.min().y);
        max_x = max_x.max(extent.max().x);
        max_y = max_y.max(extent.max().y);
        headers.push(header);
    }

    let pixel_w = t.pixel_width;
    let pixel_h = -t.pixel_height;
    let width = ((max_x - min_x) / pixel_w).round() as u64;
    let height = ((max_y - min_y) / pixel_h).round() as u64;
    let vrt_dir = vrt_path.parent().unwrap_or_else(|| Path::new("."));

    let mut xml = String::new();
    writeln!(xml, r#"<VRTDataset rasterXSize="{}" rasterYSize="{}">"#, width, height)?;
    if let Some(crs) = base.crs {
        writeln!(xml, "  <SRS>{}</SRS>", crs)?;
    }
    writeln!(
        xml,
        "  <GeoTransform>{}, {}, 0, {}, 0, {}</GeoTransform>",
        min_x, pixel_w, max_y, -pixel_h
    )?;
    writeln!(xml, r#"  <VRTRasterBand dataType="Float32" band="1">"#)?;
    if let Some(nodata) = base.nodata {
        writeln!(xml, "    <NoDataValue>{}</NoDataValue>", nodata)?;
    }
    for (source, header) in sources.iter().zip(&headers) {
        let (relative, name) = match source.strip_prefix(vrt_dir) {
            Ok(rel) => (1, rel.to_string_lossy().replace('\\', "/")),
            Err(_) => (0, source.to_string_lossy().into_owned()),
        };
        let x_off = ((header.transform.origin_x - min_x) / pixel_w).round() as i64;
        let y_off = ((max_y - header.transform.origin_y) / pixel_h).round() as i64;
        writeln!(xml, "    <SimpleSource>")?;
        writeln!(
            xml,
            r#"      <SourceFilename relativeToVRT="{}">{}</SourceFilename>"#,
            relative,
            escape(&name)
        )?;
        writeln!(xml, "      <SourceBand>1</SourceBand>")?;
        writeln!(
            xml,
            r#"      <SrcRect xOff="0" yOff="0" xSize="{}" ySize="{}" />"#,
            header.width, header.height
        )?;
        writeln!(
            xml,
            r#"      <DstRect xOff="{}" yOff="{}" xSize="{}" ySize="{}" />"#,
            x_off, y_off, header.width, header.height
        )?;
        writeln!(xml, "    </SimpleSource>")?;
    }
    writeln!(xml, "  </VRTRasterBand>")?;
    writeln!(xml, "</VRTDataset>")?;

    std::fs::write(vrt_path, xml).with_context(|| format!("Failed to write VRT {:?}", vrt_path))?;
    Ok(())
}
