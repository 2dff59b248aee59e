/// File extraction -- copies guest files out of an image for offline analysis.
///
/// Files land in `<dest>/extracted_files/<digest hex>`, so identical content
/// found under several paths is written once. A destination that already
/// exists counts as extracted and is not rewritten.
use crate::adapter::GuestAccess;
use crate::content::Digest;
use crate::error::{CompareError, CompareResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Subdirectory of the destination that receives extracted files.
pub const EXTRACTED_DIR: &str = "extracted_files";

/// Outcome of one extraction, keyed by digest hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    /// Digest → host path of the extracted copy.
    pub extracted: BTreeMap<String, PathBuf>,
    /// Digest → guest path that could not be read or written.
    pub failed: BTreeMap<String, String>,
}

/// Copy each `(guest path, digest)` in `files` out of `guest` into
/// `dest/extracted_files/`.
///
/// Only failing to create the output directory is an error; per-file
/// failures are collected in [`ExtractionReport::failed`].
pub fn extract_files<'a>(
    guest: &dyn GuestAccess,
    files: impl IntoIterator<Item = (&'a str, &'a Digest)>,
    dest: &Path,
) -> CompareResult<ExtractionReport> {
    let dir = dest.join(EXTRACTED_DIR);
    fs::create_dir_all(&dir).map_err(|source| CompareError::ExtractDir {
        path: dir.clone(),
        source,
    })?;

    let mut report = ExtractionReport::default();
    for (path, digest) in files {
        let name = digest.to_hex();
        let target = dir.join(&name);

        if target.exists() {
            debug!("{path}: {name} already extracted");
            report.extracted.insert(name, target);
            continue;
        }

        match copy_out(guest, path, &target) {
            Ok(bytes) => {
                debug!("{path}: extracted {bytes} bytes as {name}");
                report.extracted.insert(name, target);
            }
            Err(err) => {
                warn!("{path}: extraction failed: {err}");
                // Never leave a truncated file under a digest name.
                let _ = fs::remove_file(&target);
                report.failed.insert(name, path.to_string());
            }
        }
    }

    info!(
        "Extracted {} files into {} ({} failed)",
        report.extracted.len(),
        dir.display(),
        report.failed.len()
    );
    Ok(report)
}

fn copy_out(guest: &dyn GuestAccess, path: &str, target: &Path) -> io::Result<u64> {
    let mut stream = guest
        .read_content(path)
        .map_err(|err| io::Error::other(err.to_string()))?;
    let mut file = fs::File::create(target)?;
    io::copy(&mut stream, &mut file)
}
