// This file is part of nvrd, a multi-camera network video recorder supervisor.

//! The `MediaCopier` collaborator: given a camera's URL, copies packets into
//! a segment file until a deadline or end of stream, then closes the
//! container. The Recorder (`crate::camera`) only ever talks to this through
//! the [`MediaCopier`] trait and the [`worker::WorkerHandle`] it returns, so
//! alternate implementations (a real remuxer, a mock for tests) are
//! interchangeable.
//!
//! The production implementation shells out to `ffmpeg`, mirroring the
//! original program's `fork`+`exec` of an external codec process rather than
//! linking a remuxing library directly.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::SystemTime;

use crate::worker::{PollResult, WorkerHandle};

/// A source to record from and a deadline to stop by.
#[derive(Clone, Debug)]
pub struct Segment {
    pub input_url: String,
    pub output_path: PathBuf,
    pub end_time: SystemTime,
}

/// Starts a copy job for a [`Segment`] and returns a handle to it.
pub trait MediaCopier: Send + Sync + 'static {
    fn start(&self, segment: &Segment) -> Box<dyn WorkerHandle>;
}

/// Copies via an external `ffmpeg` process, in the spirit of the original
/// program's `ffmpeg -use_wallclock_as_timestamps 1 -i URL -c copy -t DURATION -y PATH`.
pub struct FfmpegCopier {
    pub ffmpeg_path: PathBuf,
}

impl Default for FfmpegCopier {
    fn default() -> Self {
        FfmpegCopier {
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl MediaCopier for FfmpegCopier {
    fn start(&self, segment: &Segment) -> Box<dyn WorkerHandle> {
        let duration_secs = segment
            .end_time
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs()
            .max(1);
        let child = Command::new(&self.ffmpeg_path)
            .arg("-use_wallclock_as_timestamps")
            .arg("1")
            .arg("-i")
            .arg(&segment.input_url)
            .arg("-c")
            .arg("copy")
            .arg("-t")
            .arg(duration_secs.to_string())
            .arg("-y")
            .arg(&segment.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(child) => Box::new(ChildWorker { child }),
            Err(e) => Box::new(FailedSpawn {
                message: e.to_string(),
            }),
        }
    }
}

struct ChildWorker {
    child: Child,
}

impl WorkerHandle for ChildWorker {
    fn poll(&mut self) -> PollResult {
        match self.child.try_wait() {
            Ok(Some(status)) => match status.code() {
                Some(0) => PollResult::ExitedOk,
                Some(code) => PollResult::ExitedErr(code),
                None => PollResult::ExitedErr(-1), // killed by signal
            },
            Ok(None) => PollResult::Running,
            Err(_) => PollResult::ExitedErr(-1),
        }
    }

    fn cancel(&mut self) {
        #[cfg(unix)]
        {
            let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }
}

/// A handle representing a copier that failed to even start; reports as an
/// immediate error exit so the Recorder counts it toward its backoff ladder.
struct FailedSpawn {
    message: String,
}

impl WorkerHandle for FailedSpawn {
    fn poll(&mut self) -> PollResult {
        tracing::warn!(err = %self.message, "failed to start media copier");
        PollResult::ExitedErr(-1)
    }

    fn cancel(&mut self) {}
}

/// Builds the output path for a segment: `{base}/{strftime(pattern, start)}.mkv`.
pub fn segment_path(base: &Path, pattern: &str, start: &jiff::Zoned) -> PathBuf {
    let name = start
        .strftime(pattern)
        .to_string();
    base.join(format!("{name}.mkv"))
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A scripted copier: each `start()` call hands out a handle that reports
    /// `Running` for `polls_until_done` polls, then the given exit outcome.
    pub struct MockCopier {
        pub polls_until_done: usize,
        pub outcome: PollResult,
        pub starts: Arc<AtomicUsize>,
        /// Output path of the most recent `start()` call, for assertions
        /// about filename generation. Defaults to an empty mutex.
        pub last_output: Arc<std::sync::Mutex<Option<std::path::PathBuf>>>,
    }

    impl Clone for MockCopier {
        fn clone(&self) -> Self {
            MockCopier {
                polls_until_done: self.polls_until_done,
                outcome: match self.outcome {
                    PollResult::Running => PollResult::Running,
                    PollResult::ExitedOk => PollResult::ExitedOk,
                    PollResult::ExitedErr(c) => PollResult::ExitedErr(c),
                },
                starts: self.starts.clone(),
                last_output: self.last_output.clone(),
            }
        }
    }

    impl MediaCopier for MockCopier {
        fn start(&self, segment: &Segment) -> Box<dyn WorkerHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.last_output.lock().unwrap() = Some(segment.output_path.clone());
            Box::new(MockHandle {
                polls_left: self.polls_until_done,
                outcome: match self.outcome {
                    PollResult::Running => PollResult::Running,
                    PollResult::ExitedOk => PollResult::ExitedOk,
                    PollResult::ExitedErr(c) => PollResult::ExitedErr(c),
                },
                cancelled: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct MockHandle {
        polls_left: usize,
        outcome: PollResult,
        cancelled: Arc<AtomicBool>,
    }

    impl WorkerHandle for MockHandle {
        fn poll(&mut self) -> PollResult {
            if self.cancelled.load(Ordering::SeqCst) {
                return PollResult::ExitedOk;
            }
            if self.polls_left > 0 {
                self.polls_left -= 1;
                return PollResult::Running;
            }
            match self.outcome {
                PollResult::Running => PollResult::Running,
                PollResult::ExitedOk => PollResult::ExitedOk,
                PollResult::ExitedErr(c) => PollResult::ExitedErr(c),
            }
        }

        fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }
}
