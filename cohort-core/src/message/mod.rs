//! Active messages.
//!
//! An active message is a unit of deferred work that can leave the process
//! that created it: a callable together with its captured state, turned into
//! bytes, shipped to a freshly spawned copy of the same executable, and
//! activated there exactly once.
//!
//! Callables are plain types implementing [`Activate`]. Their fields are the
//! captured state; nested functors and factories are simply nested fields.
//!
//! ```
//! use cohort::{
//!     message::{Activate, ActiveMessage},
//!     serializer::Serializer,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! impl Activate for Greet {
//!     fn activate(self) -> anyhow::Result<()> {
//!         println!("hello, {}", self.name);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> cohort::Result<()> {
//! let message = ActiveMessage::compose(Greet { name: "world".into() }, Serializer::Postcard)?;
//! let bytes = message.to_bytes()?;
//!
//! // Typically on the other side of a process boundary.
//! // SAFETY: `bytes` was just encoded by this executable.
//! unsafe { ActiveMessage::from_bytes(&bytes) }?.activate()?;
//! # Ok(())
//! # }
//! ```
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use self::entry::EntryPoint;
use crate::{
    error::{Error, Result},
    serializer::{Serializable, Serializer},
};

mod entry;

/// A callable that can be shipped to another process and invoked there.
pub trait Activate: Serializable {
    /// Invoke the callable, consuming its captured state.
    fn activate(self) -> anyhow::Result<()>;
}

/// A callable that produces a value for whoever spawned it.
///
/// Used by [`ProcessGroup::spawn_two_way`](crate::process::ProcessGroup::spawn_two_way),
/// which ships the output back through an
/// [`InterprocessPromise`](crate::future::InterprocessPromise).
pub trait Invoke: Serializable {
    type Output: Serializable;

    fn invoke(self) -> anyhow::Result<Self::Output>;
}

fn trampoline<A: Activate>(serializer: Serializer, payload: &[u8]) -> Result<()> {
    let callable: A = serializer
        .from_bytes(payload)
        .map_err(|err| Error::Decode(format!("{}: {err:#}", std::any::type_name::<A>())))?;

    callable.activate().map_err(Error::from)
}

/// A serialized [`Activate`] implementation, ready to cross a process boundary.
///
/// The envelope is always encoded with postcard. The captured state inside it
/// is encoded with the [`Serializer`] given to [`compose`](Self::compose).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ActiveMessage {
    kind: String,
    entry: EntryPoint,
    serializer: Serializer,
    payload: Bytes,
}

impl ActiveMessage {
    /// Wrap a callable and its captured state into a message.
    pub fn compose<A: Activate>(callable: A, serializer: Serializer) -> Result<Self> {
        let payload = serializer.to_bytes(&callable)?;

        Ok(Self {
            kind: std::any::type_name::<A>().to_string(),
            entry: EntryPoint::of(trampoline::<A>),
            serializer,
            payload: payload.into(),
        })
    }

    /// The type name of the wrapped callable.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Serializer::Postcard.to_bytes(self)?)
    }

    /// Decodes a message produced by [`to_bytes`](Self::to_bytes).
    ///
    /// A message names the function it runs by its position in the
    /// executable, so decoding cannot be safe for arbitrary input:
    ///
    /// ```compile_fail
    /// # use cohort::message::ActiveMessage;
    /// let message = ActiveMessage::from_bytes(&[]);
    /// ```
    ///
    /// # Safety
    /// If decoding succeeds, `bytes` must have come from
    /// [`to_bytes`](Self::to_bytes) in a process running this same executable
    /// file. Messages from other builds of the program are detected and
    /// rejected with [`Error::Decode`]; a forged message is not, and activating
    /// it calls an arbitrary address.
    pub unsafe fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Serializer::Postcard
            .from_bytes(bytes)
            .map_err(|err| Error::Decode(format!("{err:#}")))
    }

    /// Text form of the message, suitable for an environment variable.
    pub fn to_env_value(&self) -> Result<String> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Decodes the text form produced by [`to_env_value`](Self::to_env_value).
    ///
    /// # Safety
    /// Same contract as [`from_bytes`](Self::from_bytes).
    pub unsafe fn from_env_value(value: &str) -> Result<Self> {
        let bytes = hex::decode(value).map_err(|err| Error::Decode(err.to_string()))?;
        // SAFETY: forwarded to the caller.
        unsafe { Self::from_bytes(&bytes) }
    }

    /// Decode the captured state and invoke the callable.
    ///
    /// Consumes the message: a message is activated at most once. Whether the
    /// process terminates afterwards is up to the caller.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub fn activate(self) -> Result<()> {
        // SAFETY: the message was either composed here or decoded by
        // `from_bytes`, whose caller vouched for its origin.
        let trampoline = unsafe { self.entry.resolve() }?;
        debug!("activating message");
        trampoline(self.serializer, &self.payload)
    }
}
