// This file is part of nvrd, a multi-camera network video recorder supervisor.

pub mod clock;
mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{prettify_error, Error, ErrorKind, ResultExt};
