// This file is part of nvrd, a multi-camera network video recorder supervisor.

use std::sync::Arc;

use tracing::{error, info};

mod args;
mod camera;
mod cleaner;
mod fsutil;
mod media_copier;
mod storage;
mod supervisor;
mod worker;

use args::args;
use media_copier::FfmpegCopier;
use supervisor::{Supervisor, SupervisorConfig};

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let args = args().fallback_to_usage().run();
    tracing::trace!("parsed command-line arguments: {args:#?}");

    let code = match run(args) {
        Ok(()) => 0,
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            1
        }
    };
    std::process::exit(code);
}

fn run(args: args::Args) -> Result<(), base::Error> {
    let config = SupervisorConfig {
        max_cleaners: args.max_cleaners,
        limit_move_across_fs: args.limit_move_across_fs,
    };
    let copier = Arc::new(FfmpegCopier {
        ffmpeg_path: args.ffmpeg_path,
    });

    let mut supervisor = Supervisor::bootstrap(
        &args.storage,
        &args.camera,
        config,
        copier,
        args.skip_preflight,
    )?;

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    install_signal_handlers(shutdown_tx);

    info!("supervisor started");
    supervisor.run(&shutdown_rx);
    info!("supervisor shut down cleanly");
    Ok(())
}

/// Registers `SIGINT`/`SIGTERM` handlers that trip the shutdown flag, so the
/// main loop's next tick observes it and winds down outstanding workers.
fn install_signal_handlers(shutdown_tx: base::shutdown::Sender) {
    use std::sync::atomic::Ordering;
    static SHUTDOWN_FLAG: std::sync::OnceLock<std::sync::Arc<std::sync::atomic::AtomicBool>> =
        std::sync::OnceLock::new();
    let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let _ = SHUTDOWN_FLAG.set(flag.clone());

    extern "C" fn handle_signal(_: libc::c_int) {
        // Signal-safe: only a relaxed store on an already-initialized atomic.
        if let Some(flag) = SHUTDOWN_FLAG.get() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    std::thread::spawn(move || loop {
        if flag.load(Ordering::Relaxed) {
            info!("received shutdown signal");
            shutdown_tx.shutdown();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
}
