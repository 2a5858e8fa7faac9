// This file is part of nvrd, a multi-camera network video recorder supervisor.

use std::fmt::{self, Write};

/// Returns a pretty-and-informative rendering of `e`, including its full cause chain.
pub fn prettify_error(e: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = e.to_string();
    let mut cause = e.source();
    while let Some(c) = cause {
        write!(&mut msg, "\ncaused by: {c}").unwrap();
        cause = c.source();
    }
    msg
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn chain(&self) -> String {
        prettify_error(self)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            None => fmt::Display::fmt(&self.kind, f),
            Some(c) => write!(f, "{}: {}", self.kind, c),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            kind: ErrorKind::Fs,
            source: Some(Box::new(e)),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error {
            kind: ErrorKind::Fs,
            source: Some(Box::new(e)),
        }
    }
}

/// Error classification for the supervisor. See `ErrorKind` variants for the
/// propagation policy each one carries.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    /// Malformed CLI input. Fatal at startup.
    Arg,
    /// Directory creation, statvfs, or directory-open failure at bootstrap. Fatal.
    Init,
    /// Runtime filesystem error while cleaning. Non-fatal unless it stalls the tier.
    Fs,
    /// A file vanished between scan and move; treated as a successful eviction.
    Race,
    /// A MediaCopier exited non-zero. Counted toward a camera's backoff ladder.
    Worker,
    /// Invariant violation. Fatal.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Arg => "invalid argument",
            ErrorKind::Init => "initialization failure",
            ErrorKind::Fs => "filesystem error",
            ErrorKind::Race => "lost a race with a concurrent mutation",
            ErrorKind::Worker => "worker exited with an error",
            ErrorKind::Internal => "internal error",
        })
    }
}

/// Extension methods for `Result`, used to annotate a lower-level error with
/// the `ErrorKind` under which the caller wants it classified.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    ///
    /// ```
    /// use nvrd_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error {
            kind: k,
            source: Some(Box::new(e)),
        })
    }
}

/// Like `anyhow::bail!`, but the first argument gives the `ErrorKind`.
///
/// ```
/// use nvrd_base::bail_t;
/// let e = (|| -> Result<(), nvrd_base::Error> {
///     bail_t!(Arg, "unknown camera: {}", "front");
/// })()
/// .unwrap_err();
/// assert_eq!(e.kind(), nvrd_base::ErrorKind::Arg);
/// assert_eq!(e.to_string(), "invalid argument: unknown camera: front");
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err($crate::Error::from($crate::ErrorKind::$t).with_msg($e));
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::from($crate::ErrorKind::$t).with_msg(format!($fmt, $($arg)+)));
    };
}

/// Like `bail_t!`, but returns the error instead of returning from the function.
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        $crate::Error::from($crate::ErrorKind::$t).with_msg($e)
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::from($crate::ErrorKind::$t).with_msg(format!($fmt, $($arg)+))
    };
}

impl Error {
    /// Attaches a plain-text message as the error's source, for use from `bail_t!`.
    pub fn with_msg(mut self, msg: impl Into<String>) -> Error {
        self.source = Some(Box::new(PlainMessage(msg.into())));
        self
    }
}

#[derive(Debug)]
struct PlainMessage(String);

impl fmt::Display for PlainMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PlainMessage {}
