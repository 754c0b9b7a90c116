#![cfg_attr(docsrs, feature(doc_cfg))]

//! Bulk-synchronous SPMD execution for Rust.
//!
//! Cohort launches a fixed-size group of cooperating processes, processing
//! elements (PEs), that all run one function. PE 0 builds a shared parameter
//! that every PE reads through one-sided remote memory access, and the group
//! reports either a single result or a single failure back to the process
//! that launched it.
//!
//! Features:
//! - **Active messages**: A callable and its captured state, shipped to a
//!   fresh copy of the running executable and invoked there.
//! - **One binary**: The launching program is also every worker. No separate
//!   worker executable, no registry of operations.
//! - **All-or-nothing results**: A group either delivers its result or fails
//!   as a whole, no matter which PE failed.
//! - **Emulation**: Every group can also run as threads of one process, which
//!   finds immediate practical use in tests.
//!
//! # How to use Cohort
//!
//! A program that launches groups must call [`bootstrap`] before anything
//! else in `main`. When the program is started as a worker, `bootstrap` runs
//! the worker's message and exits; otherwise it returns and `main` proceeds as
//! usual.
//!
//! ## Defining functions
//!
//! The function every PE runs is a serializable type implementing
//! [`BulkFunction`](crate::executor::BulkFunction) (one-way) or
//! [`BulkTwoWayFunction`](crate::executor::BulkTwoWayFunction) (two-way). Its
//! fields are the state captured by the call.
//!
//! ```no_run
//! use cohort::{
//!     config::Config,
//!     executor::{BulkExecutor, BulkTwoWayFunction, Constant},
//!     remote::RemoteRef,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Scale {
//!     factor: u64,
//! }
//!
//! impl BulkTwoWayFunction<u64, u64> for Scale {
//!     fn call(
//!         &self,
//!         pe: usize,
//!         result: RemoteRef<'_, u64>,
//!         shared: RemoteRef<'_, u64>,
//!     ) -> anyhow::Result<()> {
//!         if pe == 0 {
//!             result.set(shared.get()? * self.factor)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     cohort::bootstrap();
//!     cohort::init::tracing();
//!
//!     let executor = BulkExecutor::from_config(&Config::default());
//!     let future = executor.bulk_execute_two_way(Scale { factor: 3 }, 4, Constant(0u64), Constant(13u64))?;
//!     assert_eq!(future.get()?, 39);
//!     Ok(())
//! }
//! ```
//!
//! ## Launching
//!
//! By default groups are started through `cohort-run`, the launcher shipped
//! with this crate, which starts one process per PE on the local host. Any
//! launcher accepting `[args..] -n N program` can be configured instead; see
//! [`config`].
//!
//! ## Lower level pieces
//!
//! - [`message`]: active messages and the [`Activate`](message::Activate)
//!   and [`Invoke`](message::Invoke) traits.
//! - [`process`]: spawning workers, with or without a result channel.
//! - [`future`]: one-shot result channels between processes.
//! - [`remote`] and [`slot`]: one-sided addressing of another PE's memory.
//! - [`transport`]: the runtime a group of PEs runs on.
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod init;
pub mod launcher;
pub mod message;
pub mod process;
pub mod remote;
pub mod serializer;
pub mod slot;
pub mod transport;

pub use bootstrap::bootstrap;
pub use error::{Error, Result};
pub use tracing;
