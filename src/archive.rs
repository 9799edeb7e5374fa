use flate2::write::GzEncoder;
use flate2::Compression;
use std::io;
use std::path::Path;
use tar::Builder;
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::ValarError;

fn is_ignored(name: &str, ignores: &[String]) -> bool {
    ignores
        .iter()
        .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
}

/// Packs `source` into a temporary `.tar.gz`, following symlinks and
/// skipping every entry whose relative path starts with one of `ignores`.
/// The archive is removed when the returned handle is dropped.
pub(crate) fn compress_dir(source: &Path, ignores: &[String]) -> Result<NamedTempFile, ValarError> {
    if !source.is_dir() {
        return Err(ValarError::Validation(format!(
            "expected a directory to push: {}",
            source.display()
        )));
    }
    let archive = tempfile::Builder::new()
        .prefix("valar")
        .suffix(".tar.gz")
        .tempfile()?;
    let encoder = GzEncoder::new(archive.reopen()?, Compression::default());
    let mut builder = Builder::new(encoder);

    let walker = WalkDir::new(source)
        .follow_links(true)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry
                .path()
                .strip_prefix(source)
                .map(|rel| rel.to_string_lossy().to_string())
                .unwrap_or_default();
            !is_ignored(&name, ignores)
        });

    let mut count = 0usize;
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(name) = entry.path().strip_prefix(source) else {
            continue;
        };
        if entry.file_type().is_dir() {
            builder.append_dir(name, entry.path())?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(entry.path(), name)?;
        } else {
            continue;
        }
        count += 1;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    debug!(entries = count, path = %archive.path().display(), "packed source archive");
    Ok(archive)
}
