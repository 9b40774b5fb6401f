use std::fs;
use std::io::{self, Read};
use std::path::Path;

use camino::Utf8Path;
use flate2::read::GzDecoder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::SyncError;
use crate::store::walk_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
}

/// Sniffs the archive format from its leading bytes.
pub fn detect_archive(path: &Path) -> Result<Option<ArchiveKind>, SyncError> {
    let mut file = fs::File::open(path)
        .map_err(|err| SyncError::extraction(path.display(), format!("open: {err}")))?;
    let mut magic = [0u8; 4];
    let read = file
        .read(&mut magic)
        .map_err(|err| SyncError::extraction(path.display(), err))?;
    let magic = &magic[..read];
    if magic.starts_with(b"PK\x03\x04") || magic.starts_with(b"PK\x05\x06") {
        return Ok(Some(ArchiveKind::Zip));
    }
    if magic.starts_with(&[0x1f, 0x8b]) {
        return Ok(Some(ArchiveKind::Gzip));
    }
    Ok(None)
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| SyncError::extraction(zip_path.display(), format!("open: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| SyncError::extraction(zip_path.display(), err))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::extraction(zip_path.display(), err))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(SyncError::extraction(
                    zip_path.display(),
                    "zip entry path traversal detected",
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| SyncError::extraction(zip_path.display(), err))?;
    }
    Ok(())
}

/// Decompresses a single-member gzip file into `target_dir/<name without .gz>`.
pub fn extract_gzip(gz_path: &Path, target_dir: &Path) -> Result<(), SyncError> {
    let file = fs::File::open(gz_path)
        .map_err(|err| SyncError::extraction(gz_path.display(), format!("open: {err}")))?;
    let name = gz_path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.strip_suffix(".gz").unwrap_or(name))
        .filter(|name| !name.is_empty())
        .unwrap_or("payload");
    fs::create_dir_all(target_dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let mut decoder = GzDecoder::new(file);
    let mut outfile = fs::File::create(target_dir.join(name))
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut outfile)
        .map_err(|err| SyncError::extraction(gz_path.display(), err))?;
    Ok(())
}

/// Zips `source_dir` into `zip_path`; entries are prefixed with `root_name/`.
pub fn compress_dir(
    source_dir: &Utf8Path,
    root_name: &str,
    zip_path: &Utf8Path,
) -> Result<(), SyncError> {
    let file = fs::File::create(zip_path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("create {zip_path}: {err}")))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = walk_dir(source_dir.as_std_path())?;
    entries.sort();
    writer
        .add_directory(format!("{root_name}/"), options)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for entry in entries {
        let relative = entry
            .strip_prefix(source_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = format!("{root_name}/{name}");
        if entry.is_dir() {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            continue;
        }
        writer
            .start_file(name, options)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut input =
            fs::File::open(&entry).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        io::copy(&mut input, &mut writer).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn detects_gzip_and_unwraps_payload() {
        let temp = tempfile::tempdir().unwrap();
        let gz_path = temp.path().join("volume.nii.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(b"voxels").unwrap();
        encoder.finish().unwrap();

        assert_eq!(detect_archive(&gz_path).unwrap(), Some(ArchiveKind::Gzip));
        let out = temp.path().join("out");
        extract_gzip(&gz_path, &out).unwrap();
        assert_eq!(fs::read(out.join("volume.nii")).unwrap(), b"voxels");
    }

    #[test]
    fn unknown_bytes_are_not_an_archive() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("plain.txt");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(detect_archive(&path).unwrap(), None);
    }
}
