//! One-sided remote memory addressing.
//!
//! A [`RemotePtr`] is a relation between a symmetric address and the PE whose
//! memory it refers to. It owns nothing. Loading and storing go through a
//! [`RemoteAccess`] implementation, which the pointer borrows, so a pointer can
//! never outlive the transport that gives it meaning.
use std::{fmt, marker::PhantomData};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Offset into a PE's symmetric heap.
///
/// The same allocation sequence yields the same address on every PE, so an
/// address computed locally is also valid for any other PE.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymmetricAddr(pub(crate) usize);

impl SymmetricAddr {
    pub fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for SymmetricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One-sided byte transfer to and from the symmetric heap of any PE.
pub trait RemoteAccess: Send + Sync {
    /// Fills `buf` with the bytes at `addr` on `pe`.
    fn get(&self, pe: usize, addr: SymmetricAddr, buf: &mut [u8]) -> Result<()>;

    /// Writes `bytes` at `addr` on `pe`.
    fn put(&self, pe: usize, addr: SymmetricAddr, bytes: &[u8]) -> Result<()>;
}

/// An address on a specific PE.
///
/// `T: Pod` restricts remote values to types that can be moved as raw bytes:
/// no pointers, no drop glue, every bit pattern valid.
pub struct RemotePtr<'a, T> {
    addr: SymmetricAddr,
    pe: usize,
    access: &'a dyn RemoteAccess,
    _marker: PhantomData<T>,
}

impl<T> Clone for RemotePtr<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RemotePtr<'_, T> {}

impl<T> fmt::Debug for RemotePtr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePtr")
            .field("addr", &self.addr)
            .field("pe", &self.pe)
            .finish()
    }
}

impl<'a, T: Pod> RemotePtr<'a, T> {
    /// Records the pair. No transfer happens.
    pub fn new(access: &'a dyn RemoteAccess, addr: SymmetricAddr, pe: usize) -> Self {
        Self {
            addr,
            pe,
            access,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> SymmetricAddr {
        self.addr
    }

    pub fn pe(&self) -> usize {
        self.pe
    }

    /// The pointer `count` elements of `T` further along, on the same PE.
    ///
    /// Saturates instead of wrapping, so an offset past the end of the address
    /// space is reported as out of bounds by the transport.
    pub fn add(&self, count: usize) -> Self {
        let offset = count.saturating_mul(std::mem::size_of::<T>());
        Self::new(self.access, SymmetricAddr(self.addr.0.saturating_add(offset)), self.pe)
    }

    /// Reads `size_of::<T>()` bytes from the target PE.
    pub fn load(&self) -> Result<T> {
        let mut value = T::zeroed();
        self.access
            .get(self.pe, self.addr, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Writes the bytes of `value` to the target PE.
    pub fn store(&self, value: T) -> Result<()> {
        self.access.put(self.pe, self.addr, bytemuck::bytes_of(&value))
    }

    /// A proxy that loads on read and stores on write.
    pub fn deref(&self) -> RemoteRef<'a, T> {
        RemoteRef { ptr: *self }
    }
}

/// Proxy reference to a remote value.
#[derive(Clone, Copy, Debug)]
pub struct RemoteRef<'a, T> {
    ptr: RemotePtr<'a, T>,
}

impl<'a, T: Pod> RemoteRef<'a, T> {
    pub fn get(&self) -> Result<T> {
        self.ptr.load()
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.ptr.store(value)
    }

    /// Read, modify locally, write back. Not atomic with respect to other PEs.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<()> {
        self.set(f(self.get()?))
    }

    pub fn pointer(&self) -> RemotePtr<'a, T> {
        self.ptr
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::error::Error;

    /// Plain per-PE byte arrays.
    struct Memories(Mutex<Vec<Vec<u8>>>);

    impl Memories {
        fn new(n: usize, size: usize) -> Self {
            Self(Mutex::new(vec![vec![0; size]; n]))
        }
    }

    impl RemoteAccess for Memories {
        fn get(&self, pe: usize, addr: SymmetricAddr, buf: &mut [u8]) -> Result<()> {
            let memories = self.0.lock().unwrap();
            let memory = memories.get(pe).ok_or(Error::NoSuchPe {
                pe,
                n_pes: memories.len(),
            })?;
            buf.copy_from_slice(&memory[addr.0..addr.0 + buf.len()]);
            Ok(())
        }

        fn put(&self, pe: usize, addr: SymmetricAddr, bytes: &[u8]) -> Result<()> {
            let mut memories = self.0.lock().unwrap();
            let n_pes = memories.len();
            let memory = memories.get_mut(pe).ok_or(Error::NoSuchPe { pe, n_pes })?;
            memory[addr.0..addr.0 + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Pair {
        result: u64,
        shared: u64,
    }

    #[test]
    fn store_is_visible_only_on_the_target() {
        let memories = Memories::new(2, 64);
        let on_one = RemotePtr::<u32>::new(&memories, SymmetricAddr(8), 1);
        let on_zero = RemotePtr::<u32>::new(&memories, SymmetricAddr(8), 0);

        on_one.store(0xdead_beef).unwrap();

        assert_eq!(on_one.load().unwrap(), 0xdead_beef);
        assert_eq!(on_zero.load().unwrap(), 0);
    }

    #[test]
    fn proxy_reads_and_writes_through() {
        let memories = Memories::new(1, 64);
        let pair = RemotePtr::<Pair>::new(&memories, SymmetricAddr(16), 0).deref();

        pair.set(Pair {
            result: 0,
            shared: 13,
        })
        .unwrap();
        pair.update(|p| Pair {
            result: p.shared * 2,
            ..p
        })
        .unwrap();

        assert_eq!(
            pair.get().unwrap(),
            Pair {
                result: 26,
                shared: 13
            }
        );
        assert_eq!(pair.pointer().addr(), SymmetricAddr(16));
    }

    #[test]
    fn elements_of_a_remote_array_are_addressable() {
        let memories = Memories::new(2, 64);
        let base = RemotePtr::<u32>::new(&memories, SymmetricAddr(8), 1);

        for i in 0..4 {
            base.add(i).store(10 * i as u32).unwrap();
        }

        assert_eq!(base.add(3).addr(), SymmetricAddr(20));
        assert_eq!(base.add(3).pe(), 1);
        assert_eq!(
            (0..4).map(|i| base.add(i).load().unwrap()).collect::<Vec<_>>(),
            vec![0, 10, 20, 30]
        );
        assert_eq!(base.add(usize::MAX).addr(), SymmetricAddr(usize::MAX));
    }

    #[test]
    fn unknown_pe_is_reported() {
        let memories = Memories::new(2, 8);
        let ptr = RemotePtr::<u8>::new(&memories, SymmetricAddr(0), 5);

        assert!(matches!(
            ptr.load(),
            Err(Error::NoSuchPe { pe: 5, n_pes: 2 })
        ));
    }
}
