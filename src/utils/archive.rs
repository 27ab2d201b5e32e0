//! Zip packing and unpacking with exclude-pattern filtering.
//!
//! Symlinks are stored as zip symlink entries (mode `0o120000`, target as
//! content) and recreated on unpack, so a backup restores them as links.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use glob_match::glob_match;
use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

/// Glob patterns that keep files out of an archive.
///
/// A pattern matches a relative path when it matches the whole path, any
/// ancestor directory of it, or (for patterns without `/`) any path segment.
/// A leading `/` anchors the pattern to the root: `/dist` excludes the
/// top-level `dist` but not `assets/vendor/dist`.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<String>,
}

impl ExcludeSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .map(Into::into)
            .map(|p: String| normalize_pattern(&p))
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn push(&mut self, pattern: impl Into<String>) {
        let pattern = normalize_pattern(&pattern.into());
        if !pattern.is_empty() && !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        let relative = relative.trim_start_matches("./").trim_end_matches('/');
        if relative.is_empty() {
            return false;
        }

        self.patterns.iter().any(|pattern| {
            let (pattern, anchored) = match pattern.strip_prefix('/') {
                Some(rest) => (rest, true),
                None => (pattern.as_str(), false),
            };
            if glob_match(pattern, relative) {
                return true;
            }
            if ancestors(relative).any(|dir| glob_match(pattern, dir)) {
                return true;
            }
            !anchored
                && !pattern.contains('/')
                && relative
                    .split('/')
                    .any(|segment| glob_match(pattern, segment))
        })
    }
}

fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim().trim_start_matches("./").trim_end_matches('/');
    if pattern == "/" {
        return String::new();
    }
    pattern.to_string()
}

fn ancestors(relative: &str) -> impl Iterator<Item = &str> {
    relative
        .match_indices('/')
        .map(move |(idx, _)| &relative[..idx])
}

/// Summary of a packed archive.
#[derive(Debug, Clone)]
pub struct PackSummary {
    pub file_count: usize,
    pub excluded: usize,
}

/// Pack `entries` (relative to `root`) into a zip at `dest`.
///
/// An entry of `.` packs the contents of `root` itself. Entries are walked in
/// sorted order so identical trees give identical entry lists.
pub fn pack_tree(
    root: &Path,
    entries: &[String],
    excludes: &ExcludeSet,
    dest: &Path,
) -> Result<PackSummary> {
    let file = File::create(dest).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("create {}", dest.display())))
    })?;
    let mut zip = ZipWriter::new(file);
    let mut summary = PackSummary {
        file_count: 0,
        excluded: 0,
    };
    let mut pending = Vec::new();

    for entry in entries {
        let relative = normalize_relative(entry)?;
        let source = if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&relative)
        };
        if fs::symlink_metadata(&source).is_err() {
            continue;
        }
        add_path(&mut zip, &source, &relative, excludes, &mut pending, &mut summary)?;
    }

    zip.finish()
        .map_err(|e| Error::internal_io(e.to_string(), Some("finish archive".to_string())))?;
    Ok(summary)
}

/// Write an archive containing no entries.
pub fn write_empty(dest: &Path) -> Result<()> {
    let file = File::create(dest).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("create {}", dest.display())))
    })?;
    ZipWriter::new(file)
        .finish()
        .map_err(|e| Error::internal_io(e.to_string(), Some("finish archive".to_string())))?;
    Ok(())
}

/// Directory entries waiting for their first packed descendant.
///
/// A directory is only written once something under it is, so a directory
/// whose every child is excluded leaves no trace in the archive. Directories
/// that are empty on disk are written as-is.
type PendingDirs = Vec<(String, FileOptions)>;

fn flush_pending(zip: &mut ZipWriter<File>, pending: &mut PendingDirs) -> Result<()> {
    for (name, options) in pending.drain(..) {
        zip.add_directory(name, options).map_err(zip_error)?;
    }
    Ok(())
}

fn add_path(
    zip: &mut ZipWriter<File>,
    source: &Path,
    relative: &str,
    excludes: &ExcludeSet,
    pending: &mut PendingDirs,
    summary: &mut PackSummary,
) -> Result<()> {
    if !relative.is_empty() && excludes.is_excluded(relative) {
        summary.excluded += 1;
        return Ok(());
    }

    // The root itself may be a link (e.g. a `current` release pointer); follow it.
    let metadata = if relative.is_empty() {
        fs::metadata(source)
    } else {
        fs::symlink_metadata(source)
    }
    .map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("stat {}", source.display())))
    })?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(source).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("readlink {}", source.display())))
        })?;
        flush_pending(zip, pending)?;
        zip.add_symlink(relative, target.to_string_lossy(), FileOptions::default())
            .map_err(zip_error)?;
        summary.file_count += 1;
        return Ok(());
    }

    if metadata.is_dir() {
        let mark = pending.len();
        if !relative.is_empty() {
            pending.push((format!("{}/", relative), options_for(&metadata)));
        }

        let mut children: Vec<PathBuf> = fs::read_dir(source)
            .map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("read {}", source.display())))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        children.sort();

        if children.is_empty() {
            flush_pending(zip, pending)?;
        }

        for child in children {
            let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let child_relative = if relative.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", relative, name)
            };
            add_path(zip, &child, &child_relative, excludes, pending, summary)?;
        }
        pending.truncate(mark);
        return Ok(());
    }

    if !metadata.is_file() {
        // Sockets, fifos and devices are skipped.
        return Ok(());
    }

    flush_pending(zip, pending)?;
    zip.start_file(relative, options_for(&metadata))
        .map_err(zip_error)?;
    let mut reader = File::open(source).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("open {}", source.display())))
    })?;
    io::copy(&mut reader, zip)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("pack {}", relative))))?;
    summary.file_count += 1;
    Ok(())
}

#[cfg(unix)]
fn options_for(metadata: &fs::Metadata) -> FileOptions {
    use std::os::unix::fs::PermissionsExt;
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn options_for(_metadata: &fs::Metadata) -> FileOptions {
    FileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::internal_io(e.to_string(), Some("zip".to_string()))
}

fn open_archive(archive: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(archive).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("open {}", archive.display())))
    })?;
    ZipArchive::new(BufReader::new(file)).map_err(zip_error)
}

/// List entry names in an archive, in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let mut zip = open_archive(archive)?;
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(zip_error)?;
        names.push(entry.name().to_string());
    }
    Ok(names)
}

/// Mode bits marking a zip entry as a symlink.
const SYMLINK_MODE: u32 = 0o120000;
const FILE_TYPE_MASK: u32 = 0o170000;

/// Extract an archive into `dest`, refusing entries that escape it.
///
/// Symlink entries are created after every regular entry is written, so a
/// link never redirects a later write.
pub fn unpack(archive: &Path, dest: &Path) -> Result<usize> {
    let mut zip = open_archive(archive)?;
    fs::create_dir_all(dest).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("create {}", dest.display())))
    })?;

    let mut written = 0;
    let mut links: Vec<(PathBuf, String)> = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_error)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(Error::internal_io(
                format!("Archive entry escapes destination: {}", entry.name()),
                Some(archive.display().to_string()),
            ));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            clear_symlink(&target)?;
            fs::create_dir_all(&target).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", target.display())))
            })?;
            continue;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", entry.name())))
        })?;

        if entry
            .unix_mode()
            .is_some_and(|mode| mode & FILE_TYPE_MASK == SYMLINK_MODE)
        {
            links.push((target, String::from_utf8_lossy(&buf).to_string()));
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }
        clear_symlink(&target)?;
        let mut out = File::create(&target).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("create {}", target.display())))
        })?;
        out.write_all(&buf).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("write {}", target.display())))
        })?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777));
        }
        written += 1;
    }

    for (target, link) in links {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }
        replace_with_symlink(&target, &link)?;
        written += 1;
    }
    Ok(written)
}

/// Remove `path` if it is a symlink, leaving real files and directories alone.
fn clear_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("remove {}", path.display())))
        }),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn replace_with_symlink(path: &Path, link: &str) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => Ok(()),
    }
    .map_err(|e| Error::internal_io(e.to_string(), Some(format!("remove {}", path.display()))))?;

    std::os::unix::fs::symlink(link, path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("symlink {}", path.display())))
    })
}

#[cfg(not(unix))]
fn replace_with_symlink(path: &Path, _link: &str) -> Result<()> {
    Err(Error::internal_io(
        "Symlink entries can only be restored on unix hosts".to_string(),
        Some(path.display().to_string()),
    ))
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("open {}", path.display())))
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("hash {}", path.display()))))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Validate a path relative to a deploy root: no absolute paths, no `..`.
///
/// Returns the normalized form, with `.` mapping to the empty string.
pub fn normalize_relative(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => {
                return Err(Error::config_invalid_value(
                    "paths",
                    Some(path.to_string()),
                    "must be relative to the environment root without '..'",
                ))
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn exclude_matches_file_names_and_directories() {
        let set = ExcludeSet::new(["*.log", "secrets/*", ".git"]);
        assert!(set.is_excluded("app.log"));
        assert!(set.is_excluded("logs/app.log"));
        assert!(set.is_excluded("secrets/key"));
        assert!(set.is_excluded("secrets/nested/key"));
        assert!(set.is_excluded(".git/HEAD"));
        assert!(!set.is_excluded("index.php"));
        assert!(!set.is_excluded("secrets"));
    }

    #[test]
    fn leading_slash_anchors_pattern_to_root() {
        let set = ExcludeSet::new(["/dist", "/tests/", "node_modules"]);
        assert!(set.is_excluded("dist"));
        assert!(set.is_excluded("dist/app.js"));
        assert!(set.is_excluded("tests/unit/a.php"));
        assert!(!set.is_excluded("resources/lib/jquery/dist/jquery.js"));
        assert!(!set.is_excluded("vendor/acme/tests/fixture.php"));
        assert!(set.is_excluded("skins/node_modules/x.js"));
        assert_eq!(
            set.patterns().to_vec(),
            vec!["/dist".to_string(), "/tests".to_string(), "node_modules".to_string()]
        );
    }

    #[test]
    fn fully_excluded_directory_leaves_no_entry() {
        let src = TempDir::new().unwrap();
        write(src.path(), "index.php", "<?php");
        write(src.path(), "secrets/db.key", "hunter2");
        write(src.path(), "config/private/token", "t");
        fs::create_dir_all(src.path().join("cache")).unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle.zip");
        pack_tree(
            src.path(),
            &[".".to_string()],
            &ExcludeSet::new(["secrets/*", "config/private/*"]),
            &dest,
        )
        .unwrap();

        let names = list_entries(&dest).unwrap();
        assert!(!names.iter().any(|n| n.starts_with("secrets")));
        assert!(!names.iter().any(|n| n.starts_with("config")));
        assert!(names.contains(&"cache/".to_string()));
        assert!(names.contains(&"index.php".to_string()));
    }

    #[test]
    fn pack_honours_excludes() {
        let src = TempDir::new().unwrap();
        write(src.path(), "index.php", "<?php");
        write(src.path(), "app.log", "noise");
        write(src.path(), "secrets/key", "hunter2");
        write(src.path(), "skins/main.css", "body{}");

        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle.zip");
        let summary = pack_tree(
            src.path(),
            &[".".to_string()],
            &ExcludeSet::new(["*.log", "secrets/*"]),
            &dest,
        )
        .unwrap();

        let names = list_entries(&dest).unwrap();
        assert!(names.contains(&"index.php".to_string()));
        assert!(names.contains(&"skins/main.css".to_string()));
        assert!(!names.iter().any(|n| n.contains("app.log")));
        assert!(!names.iter().any(|n| n.starts_with("secrets/key")));
        assert_eq!(summary.file_count, 2);
    }

    #[test]
    fn unpack_restores_contents() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a/b.txt", "bee");
        let out = TempDir::new().unwrap();
        let dest = out.path().join("x.zip");
        pack_tree(src.path(), &["a".to_string()], &ExcludeSet::default(), &dest).unwrap();

        let target = TempDir::new().unwrap();
        unpack(&dest, target.path()).unwrap();
        assert_eq!(fs::read_to_string(target.path().join("a/b.txt")).unwrap(), "bee");
        assert_eq!(
            list_entries(&dest).unwrap(),
            vec!["a/".to_string(), "a/b.txt".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_survive_pack_and_unpack() {
        let src = TempDir::new().unwrap();
        write(src.path(), "images/logo.png", "png");
        std::os::unix::fs::symlink("/srv/shared/uploads", src.path().join("uploads")).unwrap();
        std::os::unix::fs::symlink("images/logo.png", src.path().join("favicon.png")).unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("links.zip");
        let summary =
            pack_tree(src.path(), &[".".to_string()], &ExcludeSet::default(), &dest).unwrap();
        assert_eq!(summary.file_count, 3);

        let target = TempDir::new().unwrap();
        write(target.path(), "favicon.png", "stale regular file");
        unpack(&dest, target.path()).unwrap();

        assert_eq!(
            fs::read_link(target.path().join("uploads")).unwrap(),
            PathBuf::from("/srv/shared/uploads")
        );
        assert_eq!(
            fs::read_link(target.path().join("favicon.png")).unwrap(),
            PathBuf::from("images/logo.png")
        );
        assert_eq!(
            fs::read_to_string(target.path().join("favicon.png")).unwrap(),
            "png"
        );
    }

    #[test]
    fn empty_archive_has_no_entries() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("empty.zip");
        write_empty(&dest).unwrap();
        assert!(list_entries(&dest).unwrap().is_empty());
    }

    #[test]
    fn normalize_rejects_parent_segments() {
        assert_eq!(normalize_relative(".").unwrap(), "");
        assert_eq!(normalize_relative("./images/").unwrap(), "images");
        assert!(normalize_relative("../etc").is_err());
        assert!(normalize_relative("/etc").is_err());
    }

    #[test]
    fn sha256_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
