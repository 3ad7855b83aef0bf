//! Per-station record files
//!
//! Writes go to a temporary sibling that is synced and renamed over the
//! target, so a reader sees either the previous record or the new one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use helm_core::StationName;

use crate::{Missing, ReconcileError, ReconcileResult};

/// `<dir>/<station>.<ext>`
pub fn record_path(dir: &Path, station: &StationName, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", station.as_str(), ext))
}

/// Atomically replace `path` with `data`, creating the directory if needed
pub fn write_record(path: &Path, data: &[u8]) -> ReconcileResult<()> {
    let io_err = |source: io::Error| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(err) = write_synced(&tmp, path, data) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(err));
    }
    Ok(())
}

fn write_synced(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

/// Read a whole record; a missing file is reported as not found
pub fn read_record(path: &Path) -> ReconcileResult<Vec<u8>> {
    fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ReconcileError::NotFound(Missing::File(path.to_path_buf()))
        } else {
            ReconcileError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
