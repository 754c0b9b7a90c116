//! Error types.
//!
//! Cohort distinguishes errors that are local to the calling process (bad
//! arguments, local I/O setup, spawn failures) from errors that happened
//! somewhere in a launched group. Local errors are returned synchronously at
//! the point of occurrence. Group errors can only travel back through an
//! [`InterprocessFuture`](crate::future::InterprocessFuture), and always
//! surface as [`Error::InterprocessFailure`].
//!
//! Nothing in this crate retries. A failed spawn, a failed group, or a failed
//! socket operation is reported once and left to the caller.
use std::io;

use thiserror::Error;

/// Errors produced by cohort.
#[derive(Error, Debug)]
pub enum Error {
    /// The OS refused to create a process for the launcher.
    #[error("failed to spawn {launcher}: {source}")]
    Spawn {
        launcher: String,
        #[source]
        source: io::Error,
    },

    /// An active message could not be reconstructed from its bytes.
    #[error("failed to decode active message: {0}")]
    Decode(String),

    /// A remote worker or group failed, or its result channel closed without
    /// a result.
    #[error("interprocess failure: {0}")]
    InterprocessFailure(String),

    #[error("a group needs at least one processing element")]
    EmptyGroup,

    /// A processing element rank outside of the current group.
    #[error("processing element {pe} is not part of a group of {n_pes}")]
    NoSuchPe { pe: usize, n_pes: usize },

    /// The symmetric heap cannot satisfy an allocation.
    #[error("symmetric heap exhausted: requested {requested} bytes, {available} available")]
    HeapExhausted { requested: usize, available: usize },

    /// A symmetric access reaches past the end of the heap.
    #[error("symmetric access of {len} bytes at offset {offset} exceeds heap of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// A shared slot was constructed or destroyed by a PE that does not own it.
    #[error("shared slot is owned by PE {owner}, not PE {pe}")]
    NotOwner { owner: usize, pe: usize },

    #[error("shared slot is already occupied")]
    SlotOccupied,

    #[error("shared slot is empty")]
    SlotEmpty,

    /// A peer violated the transport protocol or hung up mid-collective.
    #[error("transport protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
