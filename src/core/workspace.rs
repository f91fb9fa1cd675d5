use std::path::{Path, PathBuf};

use anyhow::Context;
use tempdir::TempDir;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::models::DetectionKind;

/// Temporary directory for intermediate artifacts of one stage.
///
/// Dropping removes it silently; [`ScratchSpace::close`] removes it and
/// reports failures.
#[derive(Debug)]
pub struct ScratchSpace {
    dir: TempDir,
}

impl ScratchSpace {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let dir = TempDir::new(prefix).context("Failed to create scratch directory")?;
        Ok(Self { dir })
    }

    /// Scratch directory under `parent` instead of the system temp dir
    pub fn new_in(parent: &Path, prefix: &str) -> anyhow::Result<Self> {
        let dir = TempDir::new_in(parent, prefix)
            .with_context(|| format!("Failed to create scratch directory in {:?}", parent))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn close(self) -> anyhow::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove scratch directory {:?}", path))
    }
}

/// Name of the run directory: `<stem>_<YYYYmmdd_HHMMSS>_<obj|seg>`.
pub fn run_dir_name(raster_path: &Path, kind: DetectionKind, at: OffsetDateTime) -> anyhow::Result<String> {
    let stem = raster_path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("Raster path has no usable file stem: {:?}", raster_path))?;
    let stamp = at.format(format_description!("[year][month][day]_[hour][minute][second]"))?;
    Ok(format!("{}_{}_{}", stem, stamp, kind.run_suffix()))
}

/// Create the run directory next to the raster.
pub async fn create_run_dir(raster_path: &Path, kind: DetectionKind) -> anyhow::Result<PathBuf> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let parent = raster_path.parent().unwrap_or_else(|| Path::new("."));
    let run_dir = parent.join(run_dir_name(raster_path, kind, now)?);
    tokio::fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("Failed to create run directory {:?}", run_dir))?;
    Ok(run_dir)
}
