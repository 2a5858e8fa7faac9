// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! Storage tiers: parsing `--storage` arguments, resolving free-space
//! thresholds against the filesystem, and the per-tier state the cleaner
//! acts on.
//!
//! The tier list used to be an intrusive linked list (`struct storage *next`)
//! in the original program; here it's simply an ordered `Vec<Storage>` owned
//! by the supervisor, with "next tier" expressed as `storages[i + 1]`.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use base::{bail_t, ErrorKind};
use nix::sys::statvfs::statvfs;

/// A `FROM` or `TO` value from a `--storage` argument, before it's resolved
/// against a filesystem's actual block count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThresholdSpec {
    /// Bare integer: an absolute free-block count.
    Blocks(u64),
    /// `N%`: a percentage of the filesystem's total blocks.
    Percent(u8),
    /// `Nk`/`Nm`/`Ng`/`Nt` (optionally with a trailing `b`): absolute bytes.
    Bytes(u64),
}

impl ThresholdSpec {
    pub fn parse(s: &str) -> Result<ThresholdSpec, base::Error> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct
                .parse()
                .map_err(|_| base::format_err_t!(Arg, "invalid percent threshold {s:?}"))?;
            if pct > 100 {
                bail_t!(Arg, "percent threshold {s:?} exceeds 100%");
            }
            return Ok(ThresholdSpec::Percent(pct));
        }
        let lower = s.to_ascii_lowercase();
        let suffixes: &[(&str, u32)] = &[("tb", 40), ("t", 40), ("gb", 30), ("g", 30), ("mb", 20), ("m", 20), ("kb", 10), ("k", 10)];
        for (suffix, shift) in suffixes {
            if let Some(digits) = lower.strip_suffix(suffix) {
                let n: u64 = digits
                    .parse()
                    .map_err(|_| base::format_err_t!(Arg, "invalid size threshold {s:?}"))?;
                let bytes = n
                    .checked_shl(*shift)
                    .ok_or_else(|| base::format_err_t!(Arg, "size threshold {s:?} overflows"))?;
                return Ok(ThresholdSpec::Bytes(bytes));
            }
        }
        let blocks: u64 = s
            .parse()
            .map_err(|_| base::format_err_t!(Arg, "invalid threshold {s:?}"))?;
        Ok(ThresholdSpec::Blocks(blocks))
    }

    /// Resolves against a filesystem with `total_blocks` blocks of `block_size` bytes each.
    pub fn resolve(&self, total_blocks: u64, block_size: u64) -> u64 {
        match *self {
            ThresholdSpec::Blocks(b) => b,
            ThresholdSpec::Percent(p) => total_blocks * u64::from(p) / 100,
            ThresholdSpec::Bytes(b) => {
                if block_size == 0 {
                    0
                } else {
                    b / block_size
                }
            }
        }
    }
}

/// A parsed but not-yet-resolved `--storage` argument.
#[derive(Clone, Debug)]
pub struct StorageSpec {
    pub path: PathBuf,
    pub from: ThresholdSpec,
    pub to: ThresholdSpec,
    pub half_duplex: bool,
}

impl StorageSpec {
    /// Parses `PATH:FROM:TO[:half_duplex]`.
    pub fn parse(arg: &str) -> Result<StorageSpec, base::Error> {
        let parts: Vec<&str> = arg.split(':').collect();
        if parts.len() != 3 && parts.len() != 4 {
            bail_t!(
                Arg,
                "--storage argument {arg:?} must have the form PATH:FROM:TO[:half_duplex]"
            );
        }
        if parts.len() == 4 && parts[3] != "half_duplex" {
            bail_t!(Arg, "unknown --storage modifier {:?}", parts[3]);
        }
        if parts[0].is_empty() {
            bail_t!(Arg, "--storage argument {arg:?} has an empty path");
        }
        Ok(StorageSpec {
            path: PathBuf::from(parts[0]),
            from: ThresholdSpec::parse(parts[1])?,
            to: ThresholdSpec::parse(parts[2])?,
            half_duplex: parts.len() == 4,
        })
    }
}

/// Whether a tier's cleaner is currently running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CleanerState {
    Idle,
    Cleaning,
}

/// One storage tier, with thresholds resolved to absolute block counts.
pub struct Storage {
    pub path: PathBuf,
    pub from_free_blocks: u64,
    pub to_free_blocks: u64,
    pub half_duplex: bool,
    /// Held around a cross-filesystem copy when `half_duplex` (source side)
    /// or the destination tier is half-duplex (destination side).
    pub io_mutex: Mutex<()>,
    pub state: Mutex<CleanerState>,
    /// Set while a Cleaner worker is live for this tier; lets a future tick
    /// request early cancellation (unused today since clean_pass doesn't
    /// support mid-pass cancellation, but kept for symmetry with Camera).
    pub shutdown: AtomicBool,
}

impl Storage {
    /// Creates the directory tree and resolves thresholds against the live filesystem.
    pub fn bootstrap(spec: &StorageSpec) -> Result<Storage, base::Error> {
        crate::fsutil::mkdir_recursive(&spec.path).map_err(|e| {
            base::Error::from(ErrorKind::Init).with_msg(format!(
                "failed to create storage directory {}: {e}",
                spec.path.display()
            ))
        })?;
        let stat = statvfs(&spec.path).map_err(|e| {
            base::Error::from(ErrorKind::Init).with_msg(format!(
                "statvfs({}) failed: {e}",
                spec.path.display()
            ))
        })?;
        let total_blocks = stat.blocks();
        let block_size = stat.fragment_size().max(1);
        let mut from_free_blocks = spec.from.resolve(total_blocks, block_size);
        let to_free_blocks = spec.to.resolve(total_blocks, block_size).min(total_blocks);
        if from_free_blocks >= to_free_blocks {
            from_free_blocks = to_free_blocks.saturating_sub(1);
        }
        Ok(Storage {
            path: spec.path.clone(),
            from_free_blocks,
            to_free_blocks,
            half_duplex: spec.half_duplex,
            io_mutex: Mutex::new(()),
            state: Mutex::new(CleanerState::Idle),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Current free-block count, per a fresh `statvfs` call.
    pub fn free_blocks(&self) -> Result<u64, base::Error> {
        let stat = statvfs(&self.path)
            .map_err(|e| base::format_err_t!(Fs, "statvfs({}) failed: {e}", self.path.display()))?;
        Ok(stat.blocks_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_block_count() {
        assert_eq!(ThresholdSpec::parse("1000").unwrap(), ThresholdSpec::Blocks(1000));
    }

    #[test]
    fn parses_percent() {
        assert_eq!(ThresholdSpec::parse("10%").unwrap(), ThresholdSpec::Percent(10));
    }

    #[test]
    fn rejects_percent_over_100() {
        ThresholdSpec::parse("200%").unwrap_err();
    }

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(ThresholdSpec::parse("1g").unwrap(), ThresholdSpec::Bytes(1 << 30));
        assert_eq!(ThresholdSpec::parse("1gb").unwrap(), ThresholdSpec::Bytes(1 << 30));
        assert_eq!(ThresholdSpec::parse("4k").unwrap(), ThresholdSpec::Bytes(4 << 10));
    }

    #[test]
    fn resolves_percent_of_total_blocks() {
        assert_eq!(ThresholdSpec::Percent(10).resolve(1_000_000, 4096), 100_000);
    }

    #[test]
    fn resolves_bytes_with_block_size() {
        assert_eq!(ThresholdSpec::Bytes(1 << 30).resolve(10_000_000, 4096), 262_144);
    }

    #[test]
    fn parses_storage_spec_with_half_duplex() {
        let s = StorageSpec::parse("/mnt/cold:5%:10%:half_duplex").unwrap();
        assert!(s.half_duplex);
        assert_eq!(s.path, PathBuf::from("/mnt/cold"));
    }

    #[test]
    fn rejects_malformed_storage_spec() {
        StorageSpec::parse("/mnt/cold:5%").unwrap_err();
        StorageSpec::parse("/mnt/cold:5%:10%:bogus").unwrap_err();
    }
}
