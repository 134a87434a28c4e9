//! Materializes the packaged backend into the per-user data directory.
//!
//! A marker file is the only completion signal: when it exists the target is trusted as-is.
//! Concurrent extractors serialize on an exclusive lock file next to the marker.

use super::repair;
use crate::error::SetupError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const EXTRACT_MARKER: &str = ".extracted";
const LOCK_FILE: &str = ".extract.lock";
/// Top-level folder archives may wrap the bundle in.
const ARCHIVE_PREFIX: &str = "backend";

const LOCK_POLL: Duration = Duration::from_millis(200);
const LOCK_WAIT: Duration = Duration::from_secs(600);
/// Age after which a lock with no checkable owner is considered abandoned.
const LOCK_STALE: Duration = Duration::from_secs(600);

/// Where the packaged bundle lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    Directory(PathBuf),
    Archive(PathBuf),
}

impl BundleSource {
    pub fn detect(root: &Path) -> Option<Self> {
        if root.is_dir() {
            Some(BundleSource::Directory(root.to_path_buf()))
        } else if root.is_file() {
            Some(BundleSource::Archive(root.to_path_buf()))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub dir: PathBuf,
    /// False when the marker short-circuited extraction.
    pub fresh: bool,
    pub files: usize,
}

/// Copy the bundle at `resource_root` into `target` once, repair it, then write the marker.
pub fn ensure_extracted(resource_root: &Path, target: &Path) -> Result<Extracted, SetupError> {
    let marker = target.join(EXTRACT_MARKER);
    if marker.exists() {
        return Ok(already(target));
    }

    let source = BundleSource::detect(resource_root)
        .ok_or_else(|| SetupError::BundleMissing(resource_root.to_path_buf()))?;
    fs::create_dir_all(target).map_err(|e| extraction_err(target, e))?;

    let Some(_lock) = ExtractionLock::acquire(target, &marker)? else {
        return Ok(already(target));
    };
    // Another extractor may have finished between our marker check and taking the lock.
    if marker.exists() {
        return Ok(already(target));
    }

    info!(source = ?source, target = %target.display(), "extracting backend bundle");
    let files = match &source {
        BundleSource::Directory(src) => copy_tree(src, target),
        BundleSource::Archive(zip) => unpack_archive(zip, target),
    }
    .map_err(|e| extraction_err(target, e))?;

    let report = repair::repair(target);
    debug!(fixed = report.fixed.len(), "repaired relocated bundle paths");
    if !report.failed.is_empty() {
        warn!(
            failed = report.failed.len(),
            "some bundle files could not be repaired; affected installations may not start"
        );
    }

    fs::write(&marker, b"ok").map_err(|e| extraction_err(target, e))?;
    info!(files, "backend bundle extracted");
    Ok(Extracted {
        dir: target.to_path_buf(),
        fresh: true,
        files,
    })
}

fn already(target: &Path) -> Extracted {
    Extracted {
        dir: target.to_path_buf(),
        fresh: false,
        files: 0,
    }
}

fn extraction_err(target: &Path, e: impl std::fmt::Display) -> SetupError {
    SetupError::Extraction {
        target: target.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Exclusive `create_new` lock, removed on drop.
struct ExtractionLock {
    path: PathBuf,
}

impl ExtractionLock {
    /// `Ok(None)` means another extractor completed while we waited.
    fn acquire(target: &Path, marker: &Path) -> Result<Option<Self>, SetupError> {
        let path = target.join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if marker.exists() {
                        return Ok(None);
                    }
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "removing stale extraction lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        return Err(SetupError::LockTimeout(LOCK_WAIT));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(extraction_err(target, e)),
            }
        }
    }
}

impl Drop for ExtractionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A lock is stale when its recorded owner is gone. Without a readable owner (or where
/// liveness cannot be checked) fall back to the lock's age.
fn is_stale(lock: &Path) -> bool {
    let owner = fs::read_to_string(lock)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    if let Some(alive) = owner.and_then(owner_alive) {
        return !alive;
    }
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > LOCK_STALE)
}

#[cfg(unix)]
fn owner_alive(pid: u32) -> Option<bool> {
    let pid = libc::pid_t::try_from(pid).ok()?;
    // SAFETY: signal 0 only checks that the pid exists; nothing is delivered.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return Some(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Some(false),
        Some(libc::EPERM) => Some(true),
        _ => None,
    }
}

#[cfg(not(unix))]
fn owner_alive(_pid: u32) -> Option<bool> {
    None
}

/// Mirror a loose directory tree into `dest`. Symlinks are recreated as links on unix.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<usize> {
    let mut files = 0usize;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(r) if !r.as_os_str().is_empty() => r,
            _ => continue,
        };
        let target = dest.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if ft.is_symlink() {
            copy_symlink(path, &target)?;
        } else {
            fs::copy(path, &target)?;
        }
        files += 1;
    }
    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> std::io::Result<()> {
    let link = fs::read_link(src)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> std::io::Result<()> {
    fs::copy(src, target).map(|_| ())
}

/// Unpack a zip archive into `dest`, dropping a leading `backend/` folder if present.
fn unpack_archive(archive: &Path, dest: &Path) -> std::io::Result<usize> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
    let mut files = 0usize;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(std::io::Error::other)?;
        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry with unsafe path");
            continue;
        };
        let rel = strip_archive_prefix(&name);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = entry.unix_mode();
        if mode.is_some_and(is_symlink_mode) {
            let mut link = String::new();
            std::io::Read::read_to_string(&mut entry, &mut link)?;
            write_symlink(&link, &out_path)?;
        } else {
            let mut out = fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        files += 1;
    }
    Ok(files)
}

fn strip_archive_prefix(name: &Path) -> PathBuf {
    let mut comps = name.components();
    match comps.next() {
        Some(Component::Normal(first)) if first == ARCHIVE_PREFIX => comps.as_path().to_path_buf(),
        _ => name.to_path_buf(),
    }
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

#[cfg(unix)]
fn write_symlink(link: &str, target: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn write_symlink(link: &str, target: &Path) -> std::io::Result<()> {
    // No portable symlinks; copy the sibling the link points at when it is already unpacked.
    let resolved = target
        .parent()
        .map(|p| p.join(link))
        .unwrap_or_else(|| PathBuf::from(link));
    fs::copy(resolved, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_bundle(root: &Path) {
        fs::create_dir_all(root.join("venv_v4/bin")).unwrap();
        fs::write(root.join("start_backend.py"), "print('hi')\n").unwrap();
        fs::write(root.join("venv_v4/pyvenv.cfg"), "home = /build/python\n").unwrap();
        fs::write(root.join("venv_v4/bin/python3"), "").unwrap();
    }

    #[test]
    fn second_call_is_short_circuited_by_marker() {
        let src = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fixture_bundle(src.path());
        let target = data.path().join("backend");

        let first = ensure_extracted(src.path(), &target).unwrap();
        assert!(first.fresh);
        assert_eq!(first.files, 3);
        assert!(target.join(EXTRACT_MARKER).exists());
        assert!(!target.join(LOCK_FILE).exists());

        // Edits after extraction must survive: the marker is trusted, nothing is re-copied.
        fs::write(target.join("start_backend.py"), "edited").unwrap();
        let second = ensure_extracted(src.path(), &target).unwrap();
        assert!(!second.fresh);
        assert_eq!(second.files, 0);
        assert_eq!(
            fs::read_to_string(target.join("start_backend.py")).unwrap(),
            "edited"
        );
    }

    #[test]
    fn extraction_repairs_venv_config() {
        let src = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fixture_bundle(src.path());
        let target = data.path().join("backend");
        ensure_extracted(src.path(), &target).unwrap();

        let cfg = fs::read_to_string(target.join("venv_v4/pyvenv.cfg")).unwrap();
        assert_eq!(
            cfg,
            format!("home = {}\n", repair::interpreter_home(&target).display())
        );
    }

    #[test]
    fn missing_bundle_leaves_no_marker() {
        let data = tempfile::tempdir().unwrap();
        let target = data.path().join("backend");
        let err = ensure_extracted(&data.path().join("nope"), &target).unwrap_err();
        assert!(matches!(err, SetupError::BundleMissing(_)));
        assert!(!target.join(EXTRACT_MARKER).exists());
    }

    #[test]
    fn corrupt_archive_fails_and_can_be_retried() {
        let src = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let archive = src.path().join("backend.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let target = data.path().join("backend");

        let err = ensure_extracted(&archive, &target).unwrap_err();
        assert!(matches!(err, SetupError::Extraction { .. }));
        assert!(!target.join(EXTRACT_MARKER).exists());
        assert!(!target.join(LOCK_FILE).exists());

        write_zip(&archive, &[("backend/start_backend.py", b"x".as_slice())]);
        let ok = ensure_extracted(&archive, &target).unwrap();
        assert!(ok.fresh);
        assert!(target.join("start_backend.py").exists());
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, data) in entries {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn archive_source_strips_backend_prefix() {
        let src = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let archive = src.path().join("backend.zip");
        write_zip(
            &archive,
            &[
                ("backend/start_backend.py", b"print('hi')\n".as_slice()),
                ("backend/venv_v4/pyvenv.cfg", b"home = /build\n".as_slice()),
                ("backend/venv_v4/bin/python3", b"".as_slice()),
            ],
        );
        let target = data.path().join("backend");
        let out = ensure_extracted(&archive, &target).unwrap();
        assert_eq!(out.files, 3);
        assert!(target.join("start_backend.py").is_file());
        assert!(target.join("venv_v4/bin/python3").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(target.join("venv_v4/bin/python3"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn waiter_returns_when_marker_appears() {
        let data = tempfile::tempdir().unwrap();
        let target = data.path().to_path_buf();
        let marker = target.join(EXTRACT_MARKER);
        fs::write(target.join(LOCK_FILE), "12345").unwrap();

        let marker2 = marker.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            fs::write(marker2, b"ok").unwrap();
        });
        let lock = ExtractionLock::acquire(&target, &marker).unwrap();
        assert!(lock.is_none());
        writer.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn directory_symlinks_are_preserved() {
        let src = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fixture_bundle(src.path());
        std::os::unix::fs::symlink("python3", src.path().join("venv_v4/bin/python")).unwrap();
        let target = data.path().join("backend");
        ensure_extracted(src.path(), &target).unwrap();
        let link = fs::read_link(target.join("venv_v4/bin/python")).unwrap();
        assert_eq!(link, PathBuf::from("python3"));
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_exited_owner_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();
        fs::write(&lock, format!("{pid}\n")).unwrap();
        assert!(is_stale(&lock));

        let lock = ExtractionLock::acquire(dir.path(), &dir.path().join(EXTRACT_MARKER))
            .unwrap()
            .expect("stale lock should be taken over");
        assert_eq!(
            fs::read_to_string(&lock.path).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[cfg(unix)]
    #[test]
    fn old_lock_of_live_owner_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        fs::write(&lock, format!("{}\n", std::process::id())).unwrap();
        let long_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
        fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(long_ago)
            .unwrap();
        assert!(!is_stale(&lock));
    }

    #[test]
    fn ownerless_lock_goes_stale_with_age() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        fs::write(&lock, "").unwrap();
        assert!(!is_stale(&lock));
        let long_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
        fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(long_ago)
            .unwrap();
        assert!(is_stale(&lock));
    }
}
