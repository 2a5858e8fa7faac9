// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! The storage cleaner: evicts the oldest file from a tier to the next tier
//! (or deletes it, on the last tier) until the tier's high-water mark is
//! reached. Grounded in the original program's `storage_watcher`.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::fsutil;
use crate::storage::Storage;

/// Safety bound on evictions per pass, matching the original program's
/// `0xffff`-iteration cap against a runaway loop.
const MAX_ITERATIONS: u32 = 0xffff;

/// Runs one cleaner pass for `storage`, evicting to `next` (or deleting, if
/// `next` is `None`) until its high-water mark is reached.
///
/// `one_shot` performs at most one eviction per call, used when a global
/// `--max-cleaners` budget is in effect. `cross_fs_lock`, if present, is
/// acquired (after any half-duplex locks) around every cross-filesystem
/// copy, implementing `--limit-move-across-fs`.
pub fn clean_pass(
    storage: &Storage,
    next: Option<&Storage>,
    one_shot: bool,
    cross_fs_lock: Option<&Mutex<()>>,
    cancel: &AtomicBool,
) -> Result<(), base::Error> {
    for _ in 0..MAX_ITERATIONS {
        if cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(next) = next {
            wait_for_downstream_idle(next, cancel);
        }

        let Some(victim_rel) = fsutil::find_oldest(&storage.path)? else {
            break;
        };
        let abs_src = storage.path.join(&victim_rel);

        match next {
            Some(next_storage) => {
                let abs_dst = next_storage.path.join(&victim_rel);
                move_one(storage, next_storage, &abs_src, &abs_dst, cross_fs_lock)?;
                info!(
                    from = %abs_src.display(),
                    to = %abs_dst.display(),
                    "evicted file to next tier"
                );
            }
            None => {
                match fs::remove_file(&abs_src) {
                    Ok(()) => {
                        info!(path = %abs_src.display(), "deleted file from last tier");
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %abs_src.display(), "victim vanished before delete");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if one_shot && next.is_some() {
            break;
        }
        if storage.free_blocks()? >= storage.to_free_blocks {
            break;
        }
    }
    Ok(())
}

/// Locks are acquired source-then-destination, matching the spec's fixed
/// lock order, so two cleaners on adjacent tiers can never deadlock.
fn move_one(
    src_storage: &Storage,
    dst_storage: &Storage,
    abs_src: &std::path::Path,
    abs_dst: &std::path::Path,
    cross_fs_lock: Option<&Mutex<()>>,
) -> Result<(), base::Error> {
    let _src_guard = src_storage.half_duplex.then(|| src_storage.io_mutex.lock().unwrap());
    let _dst_guard = dst_storage.half_duplex.then(|| dst_storage.io_mutex.lock().unwrap());
    let _global_guard = cross_fs_lock.map(|m| m.lock().unwrap());
    fsutil::move_across_fs(abs_src, abs_dst).map_err(Into::into)
}

/// Polls (rather than blocks) until `next`'s cleaner has gone idle, so a
/// cancellation request is still observed promptly.
fn wait_for_downstream_idle(next: &Storage, cancel: &AtomicBool) {
    loop {
        if *next.state.lock().unwrap() == crate::storage::CleanerState::Idle {
            return;
        }
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CleanerState, StorageSpec};
    use std::fs::File;
    use std::io::Write;

    fn make_storage(dir: &std::path::Path, to_free_blocks: u64) -> Storage {
        let spec = StorageSpec::parse(&format!("{}:0:{to_free_blocks}", dir.display())).unwrap();
        Storage::bootstrap(&spec).unwrap()
    }

    fn touch(path: &std::path::Path) {
        fsutil::mkdir_recursive_only_parent(path).unwrap();
        File::create(path).unwrap().write_all(b"x").unwrap();
    }

    #[test]
    fn deletes_oldest_file_on_last_tier() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.mkv"));
        // to_free_blocks = 0 means the very first statvfs check already satisfies
        // the high-water mark, so the loop deletes exactly the one victim it finds
        // before re-checking and stopping.
        let storage = make_storage(dir.path(), 0);
        let cancel = AtomicBool::new(false);
        clean_pass(&storage, None, false, None, &cancel).unwrap();
        assert!(!dir.path().join("a.mkv").exists());
    }

    #[test]
    fn moves_oldest_file_to_next_tier() {
        let hot = tempfile::tempdir().unwrap();
        let cold = tempfile::tempdir().unwrap();
        touch(&hot.path().join("sub/a.mkv"));
        let hot_storage = make_storage(hot.path(), 0);
        let cold_storage = make_storage(cold.path(), u64::MAX);
        let cancel = AtomicBool::new(false);
        clean_pass(&hot_storage, Some(&cold_storage), false, None, &cancel).unwrap();
        assert!(!hot.path().join("sub/a.mkv").exists());
        assert!(cold.path().join("sub/a.mkv").exists());
    }

    #[test]
    fn one_shot_stops_after_a_single_eviction() {
        let hot = tempfile::tempdir().unwrap();
        let cold = tempfile::tempdir().unwrap();
        touch(&hot.path().join("a.mkv"));
        touch(&hot.path().join("b.mkv"));
        let hot_storage = make_storage(hot.path(), 0);
        let cold_storage = make_storage(cold.path(), u64::MAX);
        let cancel = AtomicBool::new(false);
        clean_pass(&hot_storage, Some(&cold_storage), true, None, &cancel).unwrap();
        let remaining = std::fs::read_dir(hot.path()).unwrap().count();
        assert_eq!(remaining, 1, "one-shot should evict exactly one file");
    }

    #[test]
    fn no_candidate_files_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = make_storage(dir.path(), 0);
        let cancel = AtomicBool::new(false);
        clean_pass(&storage, None, false, None, &cancel).unwrap();
    }

    #[test]
    fn idle_state_default() {
        let dir = tempfile::tempdir().unwrap();
        let storage = make_storage(dir.path(), 0);
        assert_eq!(*storage.state.lock().unwrap(), CleanerState::Idle);
    }
}
