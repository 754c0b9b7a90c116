//! Serialization of payloads, results, and wire frames.
//!
//! Everything that crosses a process boundary in cohort goes through a
//! [`Serializer`]: the captured state of an
//! [`ActiveMessage`](crate::message::ActiveMessage), the value carried by an
//! [`InterprocessPromise`](crate::future::InterprocessPromise), and the frames
//! exchanged by the [`tcp`](crate::transport::tcp) transport.
//!
//! Two formats are available. Postcard is compact and the default; CBOR is
//! self-describing and easier to inspect. The encoding of an active message
//! envelope is fixed to postcard, only the payload inside it follows the
//! configured [`Serializer`].
//!
//! # Examples
//!
//! ```rust
//! use cohort::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Captured {
//!    scale: i32,
//! }
//!
//! let data = Captured { scale: 13 };
//! let bytes = Serializer::Cbor.to_bytes(&data).unwrap();
//! let back: Captured = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!(back, data);
//! ```

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Shorthand for values that can be shipped to another processing element.
///
/// Values that travel between processing elements are moved onto worker
/// threads and across process boundaries, hence the requirements for `Send`,
/// `Sync`, and `'static`. Use owned types.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// A binary encoding.
///
/// The serializer is itself serializable so that a receiver can learn how a
/// payload was encoded from the envelope that carries it.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Postcard => "postcard",
            Self::Cbor => "cbor",
        })
    }
}

impl Serializer {
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Postcard => postcard::to_allocvec(value)?,
            Self::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)?;
                bytes
            }
        };
        Ok(bytes)
    }

    /// Decodes a value. Errors name the format, since a mismatched format is
    /// the usual cause.
    #[instrument(skip(bytes), fields(len = bytes.len()), level = "trace")]
    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => postcard::from_bytes(bytes).map_err(anyhow::Error::from),
            Self::Cbor => ciborium::from_reader(bytes).map_err(anyhow::Error::from),
        }
        .with_context(|| format!("invalid {self} input"))
    }
}

impl From<config::Serializer> for Serializer {
    fn from(serializer: config::Serializer) -> Self {
        match serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        config.serializer.into()
    }
}
