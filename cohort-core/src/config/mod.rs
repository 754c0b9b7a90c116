//! Shared executor configuration.
//!
//! This module introduces types to facilitate the configuration of a
//! [`BulkExecutor`](crate::executor::BulkExecutor).
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes so it can be flattened into any command line, and
//!   every field can also be supplied through the environment.
//! - [`Serializer`]: Specifies the serialization format to use.
//! - [`Runtime`]: Enumerates the ways a group of processing elements can be
//!   realized.
//!
//! # Usage:
//! ```no_run
//! use clap::Parser;
//! use cohort::{config::Config, executor::BulkExecutor};
//!
//! #[derive(Parser, Debug)]
//! pub struct Cli {
//!     #[command(flatten)]
//!     pub options: Config,
//! }
//!
//! let args = Cli::parse();
//! let executor = BulkExecutor::from_config(&args.options);
//! ```
use std::path::PathBuf;

use clap::{Args, ValueEnum};

const HELP_HEADING: &str = "Cohort options";

/// Launcher used when none is configured. Ships with this crate.
pub const DEFAULT_LAUNCHER: &str = "cohort-run";

/// Well-known port on which a two-way invocation waits for its result.
///
/// Groups report back on port 71342, which does not fit in 16 bits; this is
/// the port that number names once truncated.
pub const DEFAULT_RESULT_PORT: u16 = (71342u32 % 65536) as u16;

/// Size of each processing element's symmetric heap.
pub const DEFAULT_SYMMETRIC_HEAP_SIZE: usize = 1 << 20;

/// Represents the main configuration structure for the executor.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// The distributed-job launcher that starts the processing elements.
    #[arg(long, help_heading = HELP_HEADING, env = "COHORT_LAUNCHER", default_value = DEFAULT_LAUNCHER)]
    pub launcher: PathBuf,

    /// Arguments passed to the launcher ahead of the processing element count.
    #[arg(
        long,
        help_heading = HELP_HEADING,
        env = "COHORT_LAUNCHER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub launcher_args: Vec<String>,

    /// Determines the serialization format to be used.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Specifies how processing elements are realized.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Runtime::Process)]
    pub runtime: Runtime,

    /// Host the launching process listens on for two-way results.
    #[arg(long, help_heading = HELP_HEADING, env = "COHORT_RESULT_HOST", default_value = "127.0.0.1")]
    pub result_host: String,

    /// Port the launching process listens on for two-way results. Zero picks
    /// an ephemeral port.
    #[arg(long, help_heading = HELP_HEADING, env = "COHORT_RESULT_PORT", default_value_t = DEFAULT_RESULT_PORT)]
    pub result_port: u16,

    /// Size in bytes of each processing element's symmetric heap.
    #[arg(long, help_heading = HELP_HEADING, env = "COHORT_HEAP_SIZE", default_value_t = DEFAULT_SYMMETRIC_HEAP_SIZE)]
    pub symmetric_heap_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            launcher: PathBuf::from(DEFAULT_LAUNCHER),
            launcher_args: Default::default(),
            serializer: Default::default(),
            runtime: Default::default(),
            result_host: "127.0.0.1".to_string(),
            result_port: DEFAULT_RESULT_PORT,
            symmetric_heap_size: DEFAULT_SYMMETRIC_HEAP_SIZE,
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Enumerates the ways a group can be realized.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Runtime {
    /// One OS process per processing element, started through the launcher.
    #[default]
    Process,
    /// One thread per processing element inside the calling process.
    InMemory,
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn result_port_is_the_truncated_constant() {
        assert_eq!(DEFAULT_RESULT_PORT, 5806);
    }

    #[test]
    fn parses_flattened_options() {
        let cli = Cli::try_parse_from([
            "app",
            "--launcher",
            "/opt/shmem/bin/oshrun",
            "--launcher-args=--bind-to core",
            "--runtime",
            "in-memory",
            "--result-port",
            "0",
        ])
        .unwrap();

        assert_eq!(cli.options.launcher, PathBuf::from("/opt/shmem/bin/oshrun"));
        assert_eq!(cli.options.launcher_args, vec!["--bind-to", "core"]);
        assert_eq!(cli.options.runtime, Runtime::InMemory);
        assert_eq!(cli.options.result_port, 0);
        assert_eq!(cli.options.serializer, Serializer::Postcard);
    }
}
