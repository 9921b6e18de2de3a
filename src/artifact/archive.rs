//! Zip archive helpers.
//!
//! All functions here are blocking and are meant to run on
//! `tokio::task::spawn_blocking`.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{ArtifactError, Result};

/// Directory names never included in an archive.
const EXCLUDED_DIRS: &[&str] = &[".git"];

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn create_writer(dest: &Path) -> Result<ZipWriter<BufWriter<File>>> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(ZipWriter::new(BufWriter::new(File::create(dest)?)))
}

fn finish(writer: ZipWriter<BufWriter<File>>, dest: &Path) -> Result<()> {
    let mut inner = writer
        .finish()
        .map_err(|e| ArtifactError::archive(dest, e.to_string()))?;
    inner.flush()?;
    Ok(())
}

/// Zips the contents of `src` into `dest`, skipping `.git`.
///
/// Entries are added in sorted order so identical trees give identical
/// archives.
///
/// # Errors
///
/// Returns an error if the tree cannot be read or the archive written.
pub fn zip_directory(src: &Path, dest: &Path) -> Result<()> {
    let mut writer = create_writer(dest)?;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name().to_str().is_some_and(|n| EXCLUDED_DIRS.contains(&n)))
        });

    for entry in walker {
        let entry = entry.map_err(|e| ArtifactError::archive(src, e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ArtifactError::archive(entry.path(), e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{name}/"), options())
                .map_err(|e| ArtifactError::archive(entry.path(), e.to_string()))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name, options().unix_permissions(file_mode(entry.path())))
                .map_err(|e| ArtifactError::archive(entry.path(), e.to_string()))?;
            let mut file = BufReader::new(File::open(entry.path())?);
            io::copy(&mut file, &mut writer)?;
        }
    }

    finish(writer, dest)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map_or(0o644, |m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

/// Drops the first component of an archive entry name.
fn strip_first(name: &str) -> Option<String> {
    let (_, rest) = name.split_once('/')?;
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Rewrites a zip so its single top-level directory becomes the root.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the destination written.
pub fn rezip_stripped(src: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(src)?))
        .map_err(|e| ArtifactError::archive(src, e.to_string()))?;
    let mut writer = create_writer(dest)?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ArtifactError::archive(src, e.to_string()))?;
        let Some(name) = strip_first(entry.name()) else {
            continue;
        };

        if entry.is_dir() {
            writer
                .add_directory(name, options())
                .map_err(|e| ArtifactError::archive(dest, e.to_string()))?;
        } else {
            let mode = entry.unix_mode().unwrap_or(0o644) & 0o777;
            writer
                .start_file(name, options().unix_permissions(mode))
                .map_err(|e| ArtifactError::archive(dest, e.to_string()))?;
            io::copy(&mut entry, &mut writer)?;
        }
    }

    finish(writer, dest)
}

/// Converts a `.tar.gz` into a zip, dropping the top-level directory.
///
/// # Errors
///
/// Returns an error if the tarball cannot be read or the zip written.
pub fn tarball_to_zip(src: &Path, dest: &Path) -> Result<()> {
    let decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut tarball = tar::Archive::new(decoder);
    let mut writer = create_writer(dest)?;

    let entries = tarball
        .entries()
        .map_err(|e| ArtifactError::archive(src, e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArtifactError::archive(src, e.to_string()))?;
        let raw_name = entry
            .path()
            .map_err(|e| ArtifactError::archive(src, e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let Some(name) = strip_first(&raw_name) else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            let name = if name.ends_with('/') { name } else { format!("{name}/") };
            writer
                .add_directory(name, options())
                .map_err(|e| ArtifactError::archive(dest, e.to_string()))?;
        } else if entry_type.is_file() {
            let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
            writer
                .start_file(name, options().unix_permissions(mode))
                .map_err(|e| ArtifactError::archive(dest, e.to_string()))?;
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            writer.write_all(&buffer)?;
        }
    }

    finish(writer, dest)
}

/// Returns true if the file starts with the zip local header signature.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn is_zip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let read = file.read(&mut magic)?;
    Ok(read == 4 && (magic == *b"PK\x03\x04" || magic == *b"PK\x05\x06"))
}

/// Sibling path used for an intermediate download.
#[must_use]
pub fn staging_path(dest: &Path, suffix: &str) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    dest.with_file_name(name)
}
