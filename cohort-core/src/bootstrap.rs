//! Worker dispatch at process startup.
//!
//! A program that launches groups is also its own worker: the
//! [`ProcessGroup`](crate::process::ProcessGroup) re-executes the current
//! executable with an [`ActiveMessage`] in [`BOOTSTRAP_VAR`]. The first thing
//! `main` does is call [`bootstrap`], which either returns (normal startup) or
//! runs the message and terminates the process.
//!
//! ```no_run
//! fn main() -> anyhow::Result<()> {
//!     cohort::bootstrap();
//!
//!     // Ordinary program from here on.
//!     Ok(())
//! }
//! ```
use std::{env::VarError, process};

use tracing::{error, info_span};

use crate::{
    error::{Error, Result},
    message::ActiveMessage,
};

/// Environment variable carrying a hex-encoded [`ActiveMessage`].
pub const BOOTSTRAP_VAR: &str = "EXECUTE_ACTIVE_MESSAGE_BEFORE_MAIN";

/// Exit status of a worker whose message activated successfully.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status of a worker whose message returned an error.
pub const EXIT_ACTIVATION_FAILED: i32 = 1;
/// Exit status of a worker that could not decode its message.
pub const EXIT_DECODE_FAILED: i32 = 2;

/// What this process was started to do.
#[derive(Debug)]
pub enum Mode {
    Normal,
    Worker(ActiveMessage),
}

impl Mode {
    /// Reads [`BOOTSTRAP_VAR`] from the environment.
    ///
    /// # Safety
    /// If the variable is set, its value is subject to the contract of
    /// [`ActiveMessage::from_bytes`].
    pub unsafe fn from_env() -> Result<Self> {
        match std::env::var(BOOTSTRAP_VAR) {
            // SAFETY: forwarded to the caller.
            Ok(value) => unsafe { Self::from_value(Some(&value)) },
            Err(VarError::NotPresent) => Ok(Self::Normal),
            Err(err @ VarError::NotUnicode(_)) => Err(Error::Decode(err.to_string())),
        }
    }

    /// # Safety
    /// A present `value` is subject to the contract of
    /// [`ActiveMessage::from_bytes`].
    pub unsafe fn from_value(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::Normal),
            // SAFETY: forwarded to the caller.
            Some(value) => Ok(Self::Worker(unsafe { ActiveMessage::from_env_value(value) }?)),
        }
    }

    /// Activates a worker message and reports the exit status it earned.
    ///
    /// Returns `None` in normal mode.
    pub fn run(self) -> Option<i32> {
        match self {
            Self::Normal => None,
            Self::Worker(message) => {
                let _span = info_span!("worker", kind = message.kind()).entered();
                match message.activate() {
                    Ok(()) => Some(EXIT_SUCCESS),
                    Err(err) => {
                        error!("active message failed: {err:#}");
                        Some(EXIT_ACTIVATION_FAILED)
                    }
                }
            }
        }
    }
}

/// Runs the active message this process was started with, if any, and exits.
///
/// Returns only when the process was started normally. Call it before any
/// other work in `main`.
///
/// The startup environment is trusted like the executable itself: whoever
/// sets [`BOOTSTRAP_VAR`] for this process chooses the code it runs. Programs
/// must not set the variable themselves.
pub fn bootstrap() {
    // SAFETY: only `ProcessGroup` puts a message into the environment of a
    // new process, and it starts this same executable file with it.
    let mode = match unsafe { Mode::from_env() } {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("{BOOTSTRAP_VAR}: {err}");
            process::exit(EXIT_DECODE_FAILED);
        }
    };

    if let Mode::Worker(_) = mode {
        // Processes spawned by the worker must start normally.
        std::env::remove_var(BOOTSTRAP_VAR);
    }

    if let Some(status) = mode.run() {
        process::exit(status);
    }
}
