use std::path::{Path, PathBuf};

use crate::config::ToolPaths;
use crate::domain::MeasurementFormat;
use crate::error::DepotError;
use crate::tools::{self, ToolExit};

/// Byte-level conversion is delegated to the format library.
pub trait FormatConverter: Send + Sync {
    /// Writes a compressed `.rtdc` copy of `source` to `dest`.
    fn compress(
        &self,
        source: &Path,
        format: MeasurementFormat,
        dest: &Path,
    ) -> Result<(), DepotError>;

    /// Writes the condensed (metadata-only) derivative of `source` to `dest`.
    fn condense(&self, source: &Path, dest: &Path) -> Result<(), DepotError>;
}

#[derive(Debug, Clone)]
pub struct CommandConverter {
    compress: PathBuf,
    tdms2rtdc: PathBuf,
    condense: PathBuf,
}

impl CommandConverter {
    pub fn new(tools: &ToolPaths) -> Result<Self, DepotError> {
        Ok(Self {
            compress: tools::require_tool(&tools.compress)?,
            tdms2rtdc: tools::require_tool(&tools.tdms2rtdc)?,
            condense: tools::require_tool(&tools.condense)?,
        })
    }

    fn run(&self, program: &Path, source: &Path, dest: &Path) -> Result<(), DepotError> {
        match tools::run_tool(program, &[source, dest])? {
            ToolExit::Success(_) => Ok(()),
            ToolExit::Interrupted => Err(DepotError::Interrupted),
            ToolExit::Failed { stderr, .. } => Err(DepotError::Conversion(format!(
                "{}: {stderr}",
                source.display()
            ))),
        }
    }
}

impl FormatConverter for CommandConverter {
    fn compress(
        &self,
        source: &Path,
        format: MeasurementFormat,
        dest: &Path,
    ) -> Result<(), DepotError> {
        let program = match format {
            MeasurementFormat::Rtdc => &self.compress,
            MeasurementFormat::Tdms => &self.tdms2rtdc,
        };
        self.run(program, source, dest)
    }

    fn condense(&self, source: &Path, dest: &Path) -> Result<(), DepotError> {
        self.run(&self.condense, source, dest)
    }
}
