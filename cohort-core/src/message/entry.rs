//! Function identity for active messages.
//!
//! A worker is always a fresh copy of the executable that composed the
//! message, so a function is identified by where it lives in that executable
//! rather than by a registry. The address of a monomorphized trampoline is
//! recorded relative to an anchor function of this crate: relative offsets
//! survive address space layout randomization, absolute addresses do not.
//!
//! Every entry also carries a fingerprint of the executable: the offset
//! between two fixed functions of this crate, and the size and modification
//! time of the executable file. A message composed by a different build fails
//! to resolve instead of jumping to an arbitrary address.
//!
//! The fingerprint detects honest mismatches only. Anyone who can hand a
//! process an entry point can copy a valid fingerprint along with it, which is
//! why decoding a message is `unsafe`.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    serializer::Serializer,
};

/// Decodes a payload with the given serializer and activates it.
pub(crate) type Trampoline = fn(Serializer, &[u8]) -> Result<()>;

#[inline(never)]
fn anchor() -> u64 {
    std::hint::black_box(0x636f_686f_7274_0001)
}

#[inline(never)]
fn landmark() -> u64 {
    std::hint::black_box(0x636f_686f_7274_0002)
}

fn anchor_address() -> usize {
    (anchor as fn() -> u64) as usize
}

fn layout() -> u64 {
    ((landmark as fn() -> u64) as usize).wrapping_sub(anchor_address()) as u64
}

/// Hash of the executable file's size and modification time, or of nothing if
/// the file cannot be inspected.
fn image() -> u64 {
    static IMAGE: OnceLock<u64> = OnceLock::new();

    *IMAGE.get_or_init(|| {
        let mut hasher = DefaultHasher::new();
        if let Ok(metadata) = std::env::current_exe().and_then(std::fs::metadata) {
            metadata.len().hash(&mut hasher);
            if let Ok(modified) = metadata.modified() {
                modified.hash(&mut hasher);
            }
        }
        hasher.finish()
    })
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    offset: u64,
    layout: u64,
    image: u64,
}

impl EntryPoint {
    pub(crate) fn of(trampoline: Trampoline) -> Self {
        Self {
            offset: (trampoline as usize).wrapping_sub(anchor_address()) as u64,
            layout: layout(),
            image: image(),
        }
    }

    /// Turns the entry back into a function of this executable.
    ///
    /// # Safety
    /// The entry must have been created by [`EntryPoint::of`] in a process
    /// running this same executable file. Mismatched builds are detected and
    /// rejected, but a forged offset paired with a copied fingerprint is not.
    pub(crate) unsafe fn resolve(&self) -> Result<Trampoline> {
        if self.layout != layout() || self.image != image() {
            return Err(Error::Decode(
                "message was composed by a different executable".to_string(),
            ));
        }

        let address = anchor_address().wrapping_add(self.offset as usize);
        if address == 0 {
            return Err(Error::Decode("entry point resolves to null".to_string()));
        }

        // SAFETY: per the caller's contract `offset` was taken from a
        // `Trampoline` of this executable. Adding it back to the anchor yields
        // that same function.
        Ok(unsafe { std::mem::transmute::<usize, Trampoline>(address) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn succeed(_: Serializer, _: &[u8]) -> Result<()> {
        Ok(())
    }

    fn fail(_: Serializer, bytes: &[u8]) -> Result<()> {
        Err(Error::Protocol(format!("{} bytes", bytes.len())))
    }

    #[test]
    fn resolves_to_the_recorded_function() {
        let entry = EntryPoint::of(fail);
        let resolved = unsafe { entry.resolve() }.unwrap();

        assert_eq!(resolved as usize, (fail as Trampoline) as usize);
        assert!(matches!(
            resolved(Serializer::Postcard, &[0; 3]),
            Err(Error::Protocol(msg)) if msg == "3 bytes"
        ));
        let succeeding = unsafe { EntryPoint::of(succeed).resolve() }.unwrap();
        assert!(succeeding(Serializer::Cbor, &[]).is_ok());
    }

    #[test]
    fn foreign_layouts_are_rejected() {
        let mut entry = EntryPoint::of(succeed);
        entry.layout ^= 1;

        assert!(matches!(unsafe { entry.resolve() }, Err(Error::Decode(_))));
    }

    #[test]
    fn rebuilt_executables_are_rejected() {
        let entry = EntryPoint::of(succeed);
        assert_eq!(entry.image, image());

        let rebuilt = EntryPoint {
            image: entry.image.wrapping_add(1),
            ..entry
        };
        assert!(matches!(unsafe { rebuilt.resolve() }, Err(Error::Decode(_))));
    }
}
