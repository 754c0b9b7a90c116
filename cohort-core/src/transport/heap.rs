use std::sync::Mutex;

use crate::{
    error::{Error, Result},
    remote::SymmetricAddr,
};

/// A fixed-size byte segment with a deterministic bump allocator.
///
/// Every PE creates a heap of the same size and performs the same sequence of
/// allocations, which is what makes the resulting addresses symmetric.
/// Nothing is ever freed; a heap lives for exactly one group invocation.
#[derive(Debug)]
pub struct SymmetricHeap {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    next: usize,
}

impl SymmetricHeap {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes: vec![0; size],
                next: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Reserves `size` zeroed bytes aligned to `align`.
    pub fn allocate(&self, size: usize, align: usize) -> Result<SymmetricAddr> {
        let mut inner = self.lock();
        let capacity = inner.bytes.len();
        let align = align.max(1);

        let start = inner.next.div_ceil(align) * align;
        match start.checked_add(size) {
            Some(end) if end <= capacity => {
                inner.next = end;
                Ok(SymmetricAddr(start))
            }
            _ => Err(Error::HeapExhausted {
                requested: size,
                available: capacity.saturating_sub(start),
            }),
        }
    }

    pub fn read(&self, addr: SymmetricAddr, buf: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let range = Self::range(inner.bytes.len(), addr, buf.len())?;
        buf.copy_from_slice(&inner.bytes[range]);
        Ok(())
    }

    /// Copies `len` bytes out of the heap. Out-of-range requests are refused
    /// before anything is allocated.
    pub fn read_to_vec(&self, addr: SymmetricAddr, len: usize) -> Result<Vec<u8>> {
        let inner = self.lock();
        let range = Self::range(inner.bytes.len(), addr, len)?;
        Ok(inner.bytes[range].to_vec())
    }

    pub fn write(&self, addr: SymmetricAddr, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let range = Self::range(inner.bytes.len(), addr, bytes.len())?;
        inner.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    fn range(capacity: usize, addr: SymmetricAddr, len: usize) -> Result<std::ops::Range<usize>> {
        match addr.0.checked_add(len) {
            Some(end) if end <= capacity => Ok(addr.0..end),
            _ => Err(Error::OutOfBounds {
                offset: addr.0,
                len,
                capacity,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The byte segment stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocation_is_deterministic_and_aligned() {
        let addresses = |heap: &SymmetricHeap| {
            [(1, 1), (8, 8), (3, 4), (16, 16)]
                .map(|(size, align)| heap.allocate(size, align).unwrap().offset())
        };

        let a = addresses(&SymmetricHeap::new(128));
        let b = addresses(&SymmetricHeap::new(128));

        assert_eq!(a, [0, 8, 16, 32]);
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_and_bounds_are_errors() {
        let heap = SymmetricHeap::new(16);
        heap.allocate(12, 1).unwrap();

        assert!(matches!(
            heap.allocate(8, 8),
            Err(Error::HeapExhausted {
                requested: 8,
                available: 0
            })
        ));
        assert!(matches!(
            heap.write(SymmetricAddr(12), &[0; 8]),
            Err(Error::OutOfBounds { offset: 12, len: 8, capacity: 16 })
        ));
    }

    #[test]
    fn reads_what_was_written() {
        let heap = SymmetricHeap::new(32);
        let addr = heap.allocate(4, 4).unwrap();
        heap.write(addr, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0; 4];
        heap.read(addr, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(heap.read_to_vec(addr, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            heap.read_to_vec(addr, usize::MAX),
            Err(Error::OutOfBounds { capacity: 32, .. })
        ));
    }
}
