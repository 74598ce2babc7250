use std::fs;
use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::{debug, info};

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::DepotError;
use crate::fs_util;
use crate::store::{self, WorkingDir};

/// Unpacks `archive` to `<archive>_depotize/data/` and returns that path.
///
/// Extraction is skipped when `data/` already exists. The payload is
/// extracted into a staging directory next to `data/` and renamed into
/// place, so a half-finished extraction never looks complete and two
/// workers racing on the same archive cannot both publish `data/`.
pub fn unpack(archive: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, DepotError> {
    let working_dir = WorkingDir::for_archive(archive)?;
    let data_dir = working_dir.data_dir();
    if working_dir.is_unpacked() {
        debug!(path = %data_dir.display(), "data directory exists, skipping extraction");
        sink.event(ProgressEvent::log(
            1,
            "Skipping extraction, because 'data' directory exists.",
        ));
        return Ok(data_dir);
    }

    fs::create_dir_all(working_dir.root())
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    let staging = Builder::new()
        .prefix("data.partial-")
        .tempdir_in(working_dir.root())
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;

    sink.event(ProgressEvent::progress(format!(
        "Unpacking {}",
        archive.display()
    )));
    fs_util::extract_archive(archive, staging.path())?;

    let published = store::rename_dir_if_absent(staging.path(), &data_dir)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    if published {
        info!(archive = %archive.display(), "unpacked archive");
    } else {
        debug!(path = %data_dir.display(), "another worker unpacked this archive first");
    }
    Ok(data_dir)
}
