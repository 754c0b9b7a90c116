//! PEs as threads of a single process.
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use tracing::instrument;

use super::{SymmetricHeap, Transport};
use crate::{
    error::{Error, Result},
    remote::{RemoteAccess, SymmetricAddr},
};

#[derive(Debug)]
struct Shared {
    heaps: Vec<SymmetricHeap>,
    barrier: Barrier,
    vote: Mutex<bool>,
}

/// One PE's handle onto a group emulated in memory.
///
/// Every PE must run on its own thread: collectives block until all members
/// of the group arrive.
#[derive(Debug)]
pub struct InMemoryTransport {
    pe: usize,
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    /// Creates the handles of a group of `n` PEs, indexed by rank.
    pub fn group(n: usize, heap_size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            heaps: (0..n).map(|_| SymmetricHeap::new(heap_size)).collect(),
            barrier: Barrier::new(n),
            vote: Mutex::new(false),
        });

        (0..n)
            .map(|pe| Self {
                pe,
                shared: shared.clone(),
            })
            .collect()
    }

    fn heap_of(&self, pe: usize) -> Result<&SymmetricHeap> {
        self.shared.heaps.get(pe).ok_or(Error::NoSuchPe {
            pe,
            n_pes: self.shared.heaps.len(),
        })
    }

    fn vote(&self) -> MutexGuard<'_, bool> {
        self.shared.vote.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RemoteAccess for InMemoryTransport {
    fn get(&self, pe: usize, addr: SymmetricAddr, buf: &mut [u8]) -> Result<()> {
        self.heap_of(pe)?.read(addr, buf)
    }

    fn put(&self, pe: usize, addr: SymmetricAddr, bytes: &[u8]) -> Result<()> {
        self.heap_of(pe)?.write(addr, bytes)
    }
}

impl Transport for InMemoryTransport {
    fn my_pe(&self) -> usize {
        self.pe
    }

    fn n_pes(&self) -> usize {
        self.shared.heaps.len()
    }

    fn heap(&self) -> &SymmetricHeap {
        &self.shared.heaps[self.pe]
    }

    #[instrument(skip(self), fields(pe = self.pe), level = "trace")]
    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    #[instrument(skip(self), fields(pe = self.pe), level = "trace")]
    fn reduce_or(&self, value: bool) -> Result<bool> {
        *self.vote() |= value;
        self.shared.barrier.wait();

        let result = *self.vote();
        if self.shared.barrier.wait().is_leader() {
            *self.vote() = false;
        }
        // Nobody may vote in the next round before the reset.
        self.shared.barrier.wait();

        Ok(result)
    }

    fn finalize(self) -> Result<()> {
        Ok(())
    }
}
