// src/resolver.rs
use std::ffi::OsStr;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, warn};

use crate::config::ServeConfig;
use crate::response::Status;

const WORLD_READABLE: u32 = 0o004;

/// A file resolved under the document root, mapped read-only.
///
/// Owns its mapping: dropping the value unmaps it, and since it can only be
/// moved the mapping is released exactly once. Empty files carry no mapping.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    mode: u32,
    map: Option<Mmap>,
}

impl MappedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }
}

/// Map a request target onto a file under `config.doc_root`, which must
/// already be canonical.
///
/// The error side is the status to answer with.
pub fn resolve(config: &ServeConfig, target: &[u8]) -> Result<MappedFile, Status> {
    let relative = normalize(target).ok_or_else(|| {
        debug!(target_path = %String::from_utf8_lossy(target), "target escapes document root");
        Status::BadRequest
    })?;
    let path = config.doc_root.join(relative);
    if path.as_os_str().len() > config.limits.max_path_len {
        debug!(path = %path.display(), "resolved path too long");
        return Err(Status::BadRequest);
    }

    // Symlinks are followed, but only to files that stay under the root.
    let path = path.canonicalize().map_err(|_| Status::NotFound)?;
    if !path.starts_with(&config.doc_root) {
        debug!(path = %path.display(), "link leads outside document root");
        return Err(Status::BadRequest);
    }

    let meta = fs::metadata(&path).map_err(|_| Status::NotFound)?;
    let mode = meta.permissions().mode();
    if mode & WORLD_READABLE == 0 {
        return Err(Status::Forbidden);
    }
    if meta.is_dir() {
        return Err(Status::BadRequest);
    }

    let file = File::open(&path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "open failed");
        Status::InternalError
    })?;
    let map = if meta.len() == 0 {
        None
    } else {
        // SAFETY: private, read-only mapping. Truncation of the file by
        // another process while it is mapped can still SIGBUS the sender.
        let map = unsafe { MmapOptions::new().map_copy_read_only(&file) }.map_err(|e| {
            warn!(path = %path.display(), error = %e, "mmap failed");
            Status::InternalError
        })?;
        Some(map)
    };

    Ok(MappedFile { path, mode, map })
}

/// Strip query and fragment, then fold `.` and `..` segments. `None` when a
/// `..` would climb above the root.
fn normalize(target: &[u8]) -> Option<PathBuf> {
    let end = target
        .iter()
        .position(|&b| b == b'?' || b == b'#')
        .unwrap_or(target.len());

    let mut segments: Vec<&[u8]> = Vec::new();
    for segment in target[..end].split(|&b| b == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(segments.iter().map(|s| OsStr::from_bytes(s)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use std::fs::Permissions;

    fn site() -> (tempfile::TempDir, ServeConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("index.html"), b"<h1>hi</h1>").unwrap();
        fs::create_dir(root.join("docs")).unwrap();
        fs::write(root.join("docs/a.txt"), b"alpha").unwrap();
        fs::write(root.join("empty.txt"), b"").unwrap();
        let config = ServeConfig::new(root, Limits::default());
        (dir, config)
    }

    #[test]
    fn test_resolves_and_maps_file() {
        let (_dir, config) = site();
        let file = resolve(&config, b"/index.html").unwrap();
        assert_eq!(file.as_bytes(), b"<h1>hi</h1>");
        assert_eq!(file.len(), 11);
        assert_eq!(file.path(), config.doc_root.join("index.html"));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, config) = site();
        assert_eq!(resolve(&config, b"/nope.html").unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_directory_is_bad_request() {
        let (_dir, config) = site();
        assert_eq!(resolve(&config, b"/docs").unwrap_err(), Status::BadRequest);
        assert_eq!(resolve(&config, b"/").unwrap_err(), Status::BadRequest);
    }

    #[test]
    fn test_not_world_readable_is_forbidden() {
        let (_dir, config) = site();
        let secret = config.doc_root.join("secret.txt");
        fs::write(&secret, b"x").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o640)).unwrap();
        assert_eq!(resolve(&config, b"/secret.txt").unwrap_err(), Status::Forbidden);
    }

    #[test]
    fn test_traversal_is_rejected() {
        let (_dir, config) = site();
        assert_eq!(resolve(&config, b"/../etc/passwd").unwrap_err(), Status::BadRequest);
        assert_eq!(resolve(&config, b"/docs/../../x").unwrap_err(), Status::BadRequest);

        let file = resolve(&config, b"/docs/./../docs/a.txt").unwrap();
        assert_eq!(file.as_bytes(), b"alpha");
    }

    #[test]
    fn test_symlink_out_of_root_is_rejected() {
        let (_dir, config) = site();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        fs::write(&secret, b"outside").unwrap();
        std::os::unix::fs::symlink(&secret, config.doc_root.join("leak.txt")).unwrap();
        std::os::unix::fs::symlink(outside.path(), config.doc_root.join("out")).unwrap();

        assert_eq!(resolve(&config, b"/leak.txt").unwrap_err(), Status::BadRequest);
        assert_eq!(resolve(&config, b"/out/secret.txt").unwrap_err(), Status::BadRequest);
    }

    #[test]
    fn test_symlink_within_root_is_followed() {
        let (_dir, config) = site();
        std::os::unix::fs::symlink("docs/a.txt", config.doc_root.join("alias.txt")).unwrap();
        let file = resolve(&config, b"/alias.txt").unwrap();
        assert_eq!(file.as_bytes(), b"alpha");
        assert_eq!(file.path(), config.doc_root.join("docs/a.txt"));

        std::os::unix::fs::symlink("nowhere.txt", config.doc_root.join("dangling.txt")).unwrap();
        assert_eq!(resolve(&config, b"/dangling.txt").unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_query_and_fragment_are_ignored() {
        let (_dir, config) = site();
        let file = resolve(&config, b"/docs/a.txt?v=2#top").unwrap();
        assert_eq!(file.as_bytes(), b"alpha");
    }

    #[test]
    fn test_path_length_bound() {
        let (_dir, mut config) = site();
        config.limits.max_path_len = config.doc_root.as_os_str().len() + 5;
        assert!(resolve(&config, b"/docs").is_err());
        assert_eq!(resolve(&config, b"/index.html").unwrap_err(), Status::BadRequest);
    }

    #[test]
    fn test_empty_file_has_no_mapping() {
        let (_dir, config) = site();
        let file = resolve(&config, b"/empty.txt").unwrap();
        assert!(file.is_empty());
        assert_eq!(file.as_bytes(), b"");
    }
}
