//! Shared parameter slots.
//!
//! A [`SharedSlot`] is symmetric storage for one value of type `T` that lives
//! on a single designated PE, its owner. Every PE allocates the slot, so the
//! address is the same everywhere, but only the owner constructs and destroys
//! the value. Other PEs reach it through [`SharedSlot::pointer`].
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::{
    error::{Error, Result},
    remote::{RemoteAccess, RemotePtr, SymmetricAddr},
    transport::{SymmetricHeap, Transport},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Occupied,
}

#[derive(Debug)]
pub struct SharedSlot<T> {
    addr: SymmetricAddr,
    owner: usize,
    state: SlotState,
    _marker: PhantomData<T>,
}

impl<T: Pod> SharedSlot<T> {
    /// Reserves room for a `T` in the local symmetric heap.
    ///
    /// Every PE of the group must allocate its slots in the same order.
    pub fn allocate(heap: &SymmetricHeap, owner: usize) -> Result<Self> {
        let addr = heap.allocate(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;

        Ok(Self {
            addr,
            owner,
            state: SlotState::Empty,
            _marker: PhantomData,
        })
    }

    pub fn addr(&self) -> SymmetricAddr {
        self.addr
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    /// State as seen by the calling PE. Always [`SlotState::Empty`] on PEs
    /// other than the owner.
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn construct(&mut self, transport: &dyn Transport, value: T) -> Result<()> {
        self.check_owner(transport)?;
        if self.state == SlotState::Occupied {
            return Err(Error::SlotOccupied);
        }

        transport.heap().write(self.addr, bytemuck::bytes_of(&value))?;
        self.state = SlotState::Occupied;
        Ok(())
    }

    /// Takes the value out of the slot, leaving zeroed storage behind.
    pub fn destroy(&mut self, transport: &dyn Transport) -> Result<T> {
        self.check_owner(transport)?;
        if self.state == SlotState::Empty {
            return Err(Error::SlotEmpty);
        }

        let mut value = T::zeroed();
        let heap = transport.heap();
        heap.read(self.addr, bytemuck::bytes_of_mut(&mut value))?;
        heap.write(self.addr, bytemuck::bytes_of(&T::zeroed()))?;
        self.state = SlotState::Empty;
        Ok(value)
    }

    /// Address of the owner's instance.
    pub fn pointer<'a>(&self, access: &'a dyn RemoteAccess) -> RemotePtr<'a, T> {
        RemotePtr::new(access, self.addr, self.owner)
    }

    fn check_owner(&self, transport: &dyn Transport) -> Result<()> {
        let pe = transport.my_pe();
        if pe != self.owner {
            return Err(Error::NotOwner {
                owner: self.owner,
                pe,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::in_memory::InMemoryTransport;

    #[test]
    fn owner_controls_the_lifecycle() {
        let group = InMemoryTransport::group(2, 64);
        let mut slots = group
            .iter()
            .map(|t| SharedSlot::<u32>::allocate(t.heap(), 0).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(slots[0].addr(), slots[1].addr());

        assert!(matches!(
            slots[1].construct(&group[1], 7),
            Err(Error::NotOwner { owner: 0, pe: 1 })
        ));
        slots[0].construct(&group[0], 13).unwrap();
        assert!(matches!(
            slots[0].construct(&group[0], 14),
            Err(Error::SlotOccupied)
        ));
        assert_eq!(slots[0].state(), SlotState::Occupied);
        assert_eq!(slots[1].state(), SlotState::Empty);

        assert_eq!(slots[1].pointer(&group[1]).load().unwrap(), 13);

        assert_eq!(slots[0].destroy(&group[0]).unwrap(), 13);
        assert!(matches!(slots[0].destroy(&group[0]), Err(Error::SlotEmpty)));
        assert_eq!(slots[1].pointer(&group[1]).load().unwrap(), 0);
    }

    #[test]
    fn allocation_fails_when_the_heap_is_too_small() {
        let group = InMemoryTransport::group(1, 4);

        assert!(matches!(
            SharedSlot::<u64>::allocate(group[0].heap(), 0),
            Err(Error::HeapExhausted { .. })
        ));
    }
}
