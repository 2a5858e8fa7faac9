// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Bootstrap and the single-threaded cooperative tick loop that ties the
//! cleaner and recorder worlds together. Grounded in the original program's
//! `main`/`wait_all`, redesigned per the spec's call for owned
//! `SupervisorConfig`/`SupervisorState` values in place of global mutable
//! state and intrusive linked lists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use base::ErrorKind;

use crate::camera::{Camera, CameraSpec};
use crate::cleaner;
use crate::media_copier::MediaCopier;
use crate::storage::{CleanerState, Storage, StorageSpec};
use crate::worker::{PollResult, ThreadWorker, WorkerHandle};

/// Process-wide knobs parsed from the CLI. Replaces the original program's
/// global `max_cleaners`/`oneshot_cleaner`/`storage_move_across_fs_limited`.
#[derive(Clone, Debug, Default)]
pub struct SupervisorConfig {
    /// `--max-cleaners`: caps how many tiers may be `Cleaning` at once.
    /// Setting this also puts every tier but the last into one-shot mode.
    pub max_cleaners: Option<usize>,
    /// `--limit-move-across-fs`: serializes every cross-filesystem copy
    /// behind one process-wide lock, in addition to any per-tier half-duplex
    /// locks already held.
    pub limit_move_across_fs: bool,
}

pub struct Supervisor {
    storages: Vec<Arc<Storage>>,
    cleaner_workers: Vec<Option<ThreadWorker>>,
    cameras: Vec<Camera>,
    config: SupervisorConfig,
    running_cleaners: Arc<AtomicUsize>,
    cross_fs_lock: Option<Arc<Mutex<()>>>,
    copier: Arc<dyn MediaCopier>,
}

impl Supervisor {
    /// Bootstraps storage tiers and cameras: creates directory trees,
    /// resolves thresholds against the live filesystem, and binds every
    /// camera's output to the first tier.
    pub fn bootstrap(
        storage_specs: &[StorageSpec],
        camera_specs: &[CameraSpec],
        config: SupervisorConfig,
        copier: Arc<dyn MediaCopier>,
        skip_preflight: bool,
    ) -> Result<Supervisor, base::Error> {
        if storage_specs.is_empty() {
            return Err(base::format_err_t!(Arg, "at least one --storage is required"));
        }
        if camera_specs.is_empty() {
            return Err(base::format_err_t!(Arg, "at least one --camera is required"));
        }

        let mut storages = Vec::with_capacity(storage_specs.len());
        for spec in storage_specs {
            storages.push(Arc::new(Storage::bootstrap(spec)?));
        }

        let tz = jiff::tz::TimeZone::system();
        let head = storages[0].path.clone();
        let cameras: Vec<Camera> = camera_specs
            .iter()
            .map(|spec| Camera::new(spec, head.clone(), tz.clone()))
            .collect();

        if !skip_preflight {
            for camera in &cameras {
                camera.preflight(copier.as_ref());
            }
        }

        let cleaner_workers = storages.iter().map(|_| None).collect();

        Ok(Supervisor {
            cleaner_workers,
            cameras,
            running_cleaners: Arc::new(AtomicUsize::new(0)),
            cross_fs_lock: config.limit_move_across_fs.then(|| Arc::new(Mutex::new(()))),
            storages,
            config,
            copier,
        })
    }

    /// Runs the main tick loop at roughly 1 Hz until `shutdown` is observed.
    pub fn run(&mut self, shutdown: &base::shutdown::Receiver) {
        loop {
            self.tick();
            if shutdown.wait_for(Duration::from_secs(1)).is_err() {
                break;
            }
        }
        self.shutdown_all();
    }

    /// Advances every tier's cleaner and every camera's recorder by one tick.
    pub fn tick(&mut self) {
        self.tick_cleaners();
        let now = std::time::SystemTime::now();
        for camera in &mut self.cameras {
            camera.tick(now, self.copier.as_ref());
        }
    }

    fn tick_cleaners(&mut self) {
        for i in 0..self.storages.len() {
            if let Some(worker) = &mut self.cleaner_workers[i] {
                match worker.poll() {
                    PollResult::Running => continue,
                    PollResult::ExitedOk => {
                        self.finish_cleaner(i, None);
                    }
                    PollResult::ExitedErr(code) => {
                        self.finish_cleaner(i, Some(code));
                    }
                }
                continue;
            }
            self.maybe_start_cleaner(i);
        }
    }

    fn finish_cleaner(&mut self, i: usize, err_code: Option<i32>) {
        self.cleaner_workers[i] = None;
        *self.storages[i].state.lock().unwrap() = CleanerState::Idle;
        self.running_cleaners.fetch_sub(1, Ordering::SeqCst);
        if let Some(code) = err_code {
            warn!(storage = %self.storages[i].path.display(), code, "cleaner exited with an error");
        }
    }

    fn maybe_start_cleaner(&mut self, i: usize) {
        let storage = &self.storages[i];
        if *storage.state.lock().unwrap() != CleanerState::Idle {
            return;
        }
        if let Some(max) = self.config.max_cleaners {
            if self.running_cleaners.load(Ordering::SeqCst) >= max {
                return;
            }
        }
        let free = match storage.free_blocks() {
            Ok(f) => f,
            Err(e) => {
                error!(storage = %storage.path.display(), err = %e.chain(), "statvfs failed");
                return;
            }
        };
        if free > storage.from_free_blocks {
            return;
        }

        *storage.state.lock().unwrap() = CleanerState::Cleaning;
        self.running_cleaners.fetch_add(1, Ordering::SeqCst);

        let this_storage = storage.clone();
        let next_storage = self.storages.get(i + 1).cloned();
        // One-shot mode applies to every tier that has a downstream tier;
        // the last tier always drains fully since deletion can't deadlock.
        let one_shot = self.config.max_cleaners.is_some() && next_storage.is_some();
        let cross_fs_lock = self.cross_fs_lock.clone();
        let name = format!("cleaner-{}", storage.path.display());

        info!(storage = %storage.path.display(), free, "starting cleaner");
        let worker = ThreadWorker::spawn(name, move |cancel| {
            let result = cleaner::clean_pass(
                &this_storage,
                next_storage.as_deref(),
                one_shot,
                cross_fs_lock.as_deref(),
                &cancel,
            );
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!(storage = %this_storage.path.display(), err = %e.chain(), "cleaner pass failed");
                    if matches!(e.kind(), ErrorKind::Internal | ErrorKind::Init) {
                        1
                    } else {
                        // Fs/Race errors are tolerated at the pass level; don't
                        // treat them as a fatal worker break.
                        0
                    }
                }
            }
        });
        self.cleaner_workers[i] = Some(worker);
    }

    fn shutdown_all(&mut self) {
        for worker in self.cleaner_workers.iter_mut().flatten() {
            worker.cancel();
        }
        for worker in self.cleaner_workers.iter_mut().flatten() {
            while matches!(worker.poll(), PollResult::Running) {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        for camera in &mut self.cameras {
            camera.shutdown();
        }
    }
}
