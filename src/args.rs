// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Command-line argument parsing.

use std::path::PathBuf;

use bpaf::Bpaf;

use crate::camera::CameraSpec;
use crate::storage::StorageSpec;

/// Multi-camera network video recorder supervisor.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// A storage tier: `PATH:FROM:TO[:half_duplex]`.
    ///
    /// `FROM` and `TO` are free-space thresholds, each a bare integer (free
    /// blocks), a `N%` percentage of the filesystem's total blocks, or an
    /// absolute size such as `50g`. The cleaner evicts this tier's oldest
    /// file (to the next tier, or deleting it on the last tier) whenever
    /// free space drops to `FROM`, until it's back up to `TO`.
    ///
    /// Repeat this flag once per tier, ordered from hottest to coldest.
    #[bpaf(long("storage"), argument("SPEC"), many, parse(parse_storage_specs))]
    pub storage: Vec<StorageSpec>,

    /// A camera: `NAME:STRFTIME:URL`.
    ///
    /// `STRFTIME` names the per-segment output filename pattern (relative to
    /// the first storage tier); if empty, it defaults to
    /// `NAME_%Y%m%d_%H%M%S`. `URL` is the stream to record from.
    ///
    /// Repeat this flag once per camera.
    #[bpaf(long("camera"), argument("SPEC"), many, parse(parse_camera_specs))]
    pub camera: Vec<CameraSpec>,

    /// Caps how many storage tiers may be actively cleaning at once.
    ///
    /// When set, every tier but the last evicts only a single file per
    /// cleaning pass before yielding, so the budget is shared fairly instead
    /// of one tier's cleaner running to completion before another starts.
    #[bpaf(long("max-cleaners"), argument("N"))]
    pub max_cleaners: Option<usize>,

    /// Serializes all cross-filesystem moves behind one process-wide lock.
    ///
    /// Use this if your storage tiers share a slow upstream link or disk
    /// controller that a concurrent move would contend for.
    #[bpaf(long("limit-move-across-fs"))]
    pub limit_move_across_fs: bool,

    /// Path to the `ffmpeg` binary used to copy camera segments.
    #[bpaf(long("ffmpeg-path"), argument("PATH"), fallback(PathBuf::from("ffmpeg")))]
    pub ffmpeg_path: PathBuf,

    /// Skip probing each camera's URL at startup.
    ///
    /// By default, before entering the main loop, every camera is given a
    /// brief, immediately-cancelled trial recording so a typo'd URL is
    /// reported at startup instead of silently entering the backoff ladder.
    /// Skip this on a flaky network where the probe itself might time out.
    #[bpaf(long("skip-preflight"))]
    pub skip_preflight: bool,
}

fn parse_storage_specs(raw: Vec<String>) -> Result<Vec<StorageSpec>, String> {
    raw.iter()
        .map(|s| StorageSpec::parse(s).map_err(|e| e.to_string()))
        .collect()
}

fn parse_camera_specs(raw: Vec<String>) -> Result<Vec<CameraSpec>, String> {
    raw.iter()
        .map(|s| CameraSpec::parse(s).map_err(|e| e.to_string()))
        .collect()
}
