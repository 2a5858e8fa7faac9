// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Path, directory, and cross-filesystem move primitives shared by the
//! cleaner and the recorder.
//!
//! Grounded in the original program's `get_oldest`/`move_between_fs`/
//! `move_file`/`mkdir_recursive` functions, re-expressed without the
//! fixed-size scratch buffers: the oldest-scan contract here is simply
//! "return the relative subpath of the oldest regular file beneath a
//! directory, or `None`", and callers own whatever `PathBuf` comes back.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

/// Creates `path` and all missing ancestors with mode 0755, tolerating an
/// already-existing directory.
pub fn mkdir_recursive(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}

/// Like [`mkdir_recursive`], but creates only `path`'s parent directory.
pub fn mkdir_recursive_only_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        mkdir_recursive(parent)?;
    }
    Ok(())
}

const SKIP_NAMES: &[&str] = &["lost+found"];

/// Recursively finds the oldest regular file beneath `root`, by mtime.
///
/// Empty subdirectories encountered along the way are removed immediately
/// and are not counted as entries. Returns the path relative to `root`.
pub fn find_oldest(root: &Path) -> io::Result<Option<PathBuf>> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    scan_dir(root, Path::new(""), &mut best)?;
    Ok(best.map(|(_, p)| p))
}

/// Returns `true` if `dir` was removed because scanning left it empty.
fn scan_dir(
    abs_dir: &Path,
    rel_dir: &Path,
    best: &mut Option<(SystemTime, PathBuf)>,
) -> io::Result<bool> {
    let mut entry_count = 0usize;
    let entries = match fs::read_dir(abs_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.is_empty() || SKIP_NAMES.contains(&name_str.as_ref()) {
            continue;
        }
        let abs_child = entry.path();
        let rel_child = rel_dir.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let removed = scan_dir(&abs_child, &rel_child, best)?;
            if removed {
                continue;
            }
            entry_count += 1;
        } else if file_type.is_file() {
            let meta = entry.metadata()?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let replace = match best {
                None => true,
                Some((best_mtime, _)) => mtime < *best_mtime,
            };
            if replace {
                *best = Some((mtime, rel_child));
            }
            entry_count += 1;
        }
        // Other file types (symlinks, devices, sockets) are ignored.
    }
    if entry_count == 0 && !rel_dir.as_os_str().is_empty() {
        match fs::remove_dir(abs_dir) {
            Ok(()) => {
                debug!(dir = %abs_dir.display(), "removed empty subdirectory");
                return Ok(true);
            }
            Err(e) => {
                warn!(dir = %abs_dir.display(), err = %e, "failed to remove empty subdirectory");
            }
        }
    }
    Ok(false)
}

/// Moves `src` to `dst`, preferring an atomic rename and falling back to a
/// streaming copy-then-unlink across filesystem boundaries.
///
/// A source that has already vanished (raced with some other deleter) is
/// treated as a successful move, matching the original program's tolerance
/// for concurrent cleanup.
pub fn move_across_fs(src: &Path, dst: &Path) -> io::Result<()> {
    mkdir_recursive_only_parent(dst)?;
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(src = %src.display(), "source vanished before move; treating as done");
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_then_unlink(src, dst),
        Err(e) => Err(e),
    }
}

fn copy_then_unlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst)?;
    if let Err(e) = fs::remove_file(src) {
        warn!(src = %src.display(), err = %e, "failed to unlink source after cross-fs copy");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    fn touch(path: &Path, age_secs: u64) {
        mkdir_recursive_only_parent(path).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(b"x").unwrap();
        drop(f);
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        set_mtime(path, mtime, mtime);
    }

    // Minimal mtime setter via `utimensat`-equivalent through the nix crate,
    // avoiding an extra dependency just for test fixtures.
    fn set_mtime(path: &Path, mtime: SystemTime, atime: SystemTime) {
        use nix::sys::stat::{utimensat, UtimensatFlags};
        use nix::sys::time::{TimeSpec, TimeValLike};
        let to_ts = |t: SystemTime| {
            let dur = t.duration_since(SystemTime::UNIX_EPOCH).unwrap();
            TimeSpec::seconds(dur.as_secs() as i64)
        };
        utimensat(
            None,
            path,
            &to_ts(atime),
            &to_ts(mtime),
            UtimensatFlags::FollowSymlink,
        )
        .unwrap();
    }

    #[test]
    fn finds_oldest_by_mtime_across_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mkv");
        let b = dir.path().join("sub/b.mkv");
        touch(&a, 10);
        touch(&b, 100);
        let oldest = find_oldest(dir.path()).unwrap().unwrap();
        assert_eq!(oldest, Path::new("sub/b.mkv"));
    }

    #[test]
    fn removes_emptied_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let only = dir.path().join("sub/only.mkv");
        touch(&only, 1);
        let oldest = find_oldest(dir.path()).unwrap().unwrap();
        assert_eq!(oldest, Path::new("sub/only.mkv"));
        fs::remove_file(dir.path().join("sub/only.mkv")).unwrap();
        assert!(find_oldest(dir.path()).unwrap().is_none());
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn skips_lost_and_found() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lost+found/orphan"), 1);
        assert!(find_oldest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn move_across_fs_renames_within_same_fs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.mkv");
        let dst = dir.path().join("sub/a.mkv");
        touch(&src, 0);
        move_across_fs(&src, &dst).unwrap();
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[test]
    fn move_across_fs_tolerates_vanished_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.mkv");
        let dst = dir.path().join("dst.mkv");
        move_across_fs(&src, &dst).unwrap();
        assert!(!dst.exists());
    }
}
