use std::io;
use std::path::{Path, PathBuf};

use lumen_core::stage::StageName;
use tempfile::TempDir;

/// Directories owned by one stage for the duration of its execution.
///
/// The output directory persists (it feeds the next stage). The scratch
/// directory is deleted when the workspace is dropped, which happens when
/// the stage returns, whatever its outcome.
#[derive(Debug)]
pub struct StageWorkspace {
    output_dir: PathBuf,
    temp: TempDir,
}

impl StageWorkspace {
    /// Prepare `<output_root>/<stage dir>` and a scratch directory next to it.
    ///
    /// Frames left in the stage directory by an earlier run are removed so
    /// that file-count progress starts from zero.
    pub fn create(output_root: &Path, stage: StageName) -> io::Result<Self> {
        std::fs::create_dir_all(output_root)?;
        let output_dir = output_root.join(stage.output_dir_name());
        if output_dir.exists() {
            std::fs::remove_dir_all(&output_dir)?;
        }
        std::fs::create_dir_all(&output_dir)?;
        let temp = tempfile::Builder::new()
            .prefix(&format!(".lumen-{}-", stage.as_str()))
            .tempdir_in(output_root)?;
        Ok(Self { output_dir, temp })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp.path()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
