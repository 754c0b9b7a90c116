//! The distributed-memory runtime a group of PEs runs on.
//!
//! A [`Transport`] gives a PE its rank, its local [`SymmetricHeap`], one-sided
//! access to every other PE's heap (through [`RemoteAccess`]), and the two
//! collectives the bulk executor relies on: a barrier and a logical-OR
//! reduction.
//!
//! Two implementations are provided:
//! - [`InMemoryTransport`](in_memory::InMemoryTransport): PEs are threads of
//!   one process. Useful for tests and for emulating a group locally.
//! - [`TcpTransport`](tcp::TcpTransport): PEs are OS processes started by the
//!   [`cohort-run`](crate::launcher) launcher, talking over TCP.
use crate::{error::Result, remote::RemoteAccess};

mod heap;
pub mod in_memory;
pub mod tcp;

pub use heap::SymmetricHeap;

pub trait Transport: RemoteAccess {
    /// Rank of the calling PE, in `0..n_pes()`.
    fn my_pe(&self) -> usize;

    fn n_pes(&self) -> usize;

    /// The calling PE's own symmetric heap.
    fn heap(&self) -> &SymmetricHeap;

    /// Blocks until every PE of the group has called `barrier`.
    fn barrier(&self) -> Result<()>;

    /// Returns the logical OR of `value` over all PEs.
    ///
    /// Also a barrier: no PE returns before every PE has contributed.
    fn reduce_or(&self, value: bool) -> Result<bool>;

    /// Leaves the group. No collective may follow.
    fn finalize(self) -> Result<()>
    where
        Self: Sized;
}
