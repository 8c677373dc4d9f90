//! ZIP assembly and extraction.
//!
//! The archive is built entry by entry from the staging directory rather
//! than zipping the directory wholesale, so the staging temp dir's
//! restrictive permissions (0600 umask on some platforms) never leak into
//! the archive and strip directory execute bits on extraction.
//!
//! Extraction streams one entry at a time, freeing each entry's bytes
//! between writes, and defends against ZIP slip: any entry whose path is
//! absolute or contains a parent-directory component is skipped, never
//! extracted and never fatal.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::BackupError;

/// Build a ZIP from the contents of `staging_dir`.
///
/// Entry names are the paths relative to the staging root, with forward
/// slashes. Empty directories are preserved as directory entries.
pub fn build_zip(staging_dir: &Path, zip_path: &Path) -> Result<(), BackupError> {
    let file = File::create(zip_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(staging_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BackupError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(staging_dir)
            .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut writer)?;
        }
    }

    writer.finish()?;
    Ok(())
}

/// Resolve an archive entry name against the extraction base.
///
/// Returns `None` for names that would escape the base: absolute paths,
/// drive prefixes, or any `..` component.
#[must_use]
pub fn safe_entry_path(base: &Path, entry_name: &str) -> Option<PathBuf> {
    let entry = Path::new(entry_name);
    let mut resolved = base.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    // The resolved path must stay inside (or equal) the base
    if resolved.starts_with(base) { Some(resolved) } else { None }
}

/// Extract a ZIP into `dest_dir` with the ZIP-slip guard.
///
/// Traversal entries are logged and skipped; everything else extracts.
/// Returns the number of entries written.
pub fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<usize, BackupError> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut written = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();

        let Some(dest_path) = safe_entry_path(dest_dir, &name) else {
            tracing::warn!(entry = %name, "skipping archive entry with path traversal");
            continue;
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Stream this entry to disk; its decompressed bytes never
            // accumulate across entries.
            let mut output = File::create(&dest_path)?;
            let copied = io::copy(&mut entry, &mut output)?;
            if copied != entry.size() {
                return Err(BackupError::Restore(format!(
                    "short write for archive entry {name}: {copied} of {} bytes",
                    entry.size()
                )));
            }
        }
        written += 1;
    }
    Ok(written)
}

/// Copy every regular file under `src` into `dest`, preserving the
/// relative directory structure. `skip` names are excluded at any depth.
pub fn copy_directory(src: &Path, dest: &Path, skip: &[&str]) -> Result<usize, BackupError> {
    if !src.is_dir() {
        return Ok(0);
    }
    let mut copied = 0usize;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            BackupError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let file_name = entry.file_name().to_string_lossy();
        if skip.contains(&file_name.as_ref()) {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_round_trip_preserves_structure() {
        let staging = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(staging.path().join("profiles/user")).expect("mkdir");
        std::fs::write(staging.path().join("settings.json"), b"{}").expect("write");
        std::fs::write(staging.path().join("profiles/user/classic.json"), b"{\"title\":\"Classic\"}")
            .expect("write");

        let zip_dir = tempfile::tempdir().expect("tempdir");
        let zip_path = zip_dir.path().join("backup.zip");
        build_zip(staging.path(), &zip_path).expect("build");

        let out = tempfile::tempdir().expect("tempdir");
        extract_zip(&zip_path, out.path()).expect("extract");

        assert_eq!(std::fs::read(out.path().join("settings.json")).expect("read"), b"{}");
        assert_eq!(
            std::fs::read(out.path().join("profiles/user/classic.json")).expect("read"),
            b"{\"title\":\"Classic\"}"
        );
    }

    #[test]
    fn zip_slip_entry_is_skipped_not_fatal() {
        let zip_dir = tempfile::tempdir().expect("tempdir");
        let zip_path = zip_dir.path().join("evil.zip");
        {
            let file = File::create(&zip_path).expect("create");
            let mut writer = ZipWriter::new(file);
            let options = SimpleFileOptions::default();
            writer.start_file("../evil.txt", options).expect("entry");
            io::Write::write_all(&mut writer, b"pwned").expect("write");
            writer.start_file("good.txt", options).expect("entry");
            io::Write::write_all(&mut writer, b"fine").expect("write");
            writer.finish().expect("finish");
        }

        let out_parent = tempfile::tempdir().expect("tempdir");
        let out = out_parent.path().join("extract");
        std::fs::create_dir_all(&out).expect("mkdir");

        let written = extract_zip(&zip_path, &out).expect("extract");
        assert_eq!(written, 1, "only the good entry extracts");
        assert!(out.join("good.txt").is_file());
        assert!(!out_parent.path().join("evil.txt").exists(), "traversal blocked");
    }

    #[test]
    fn safe_entry_path_rejects_escapes() {
        let base = Path::new("/tmp/extract");
        assert!(safe_entry_path(base, "ok/file.txt").is_some());
        assert!(safe_entry_path(base, "./ok.txt").is_some());
        assert!(safe_entry_path(base, "../evil").is_none());
        assert!(safe_entry_path(base, "nested/../../evil").is_none());
        assert!(safe_entry_path(base, "/etc/passwd").is_none());
    }

    #[test]
    fn copy_directory_skips_named_files() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("a.jpg"), b"a").expect("write");
        std::fs::write(src.path().join("catalog.json"), b"{}").expect("write");

        let dest = tempfile::tempdir().expect("tempdir");
        let copied =
            copy_directory(src.path(), dest.path(), &["catalog.json"]).expect("copy");
        assert_eq!(copied, 1);
        assert!(dest.path().join("a.jpg").is_file());
        assert!(!dest.path().join("catalog.json").exists());
    }
}
