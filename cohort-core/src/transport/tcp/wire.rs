//! Frames exchanged by the TCP transport.
//!
//! Every connection is a stream of length-delimited frames, each holding one
//! postcard-encoded message.
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    error::{Error, Result},
    remote::SymmetricAddr,
    serializer::Serializer,
};

pub(crate) type Wire = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn wire(stream: TcpStream) -> Result<Wire> {
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, LengthDelimitedCodec::new()))
}

pub(crate) async fn send<T: Serialize>(wire: &mut Wire, message: &T) -> Result<()> {
    let bytes = Serializer::Postcard.to_bytes(message)?;
    wire.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Receives one message, or `None` if the peer closed the connection.
pub(crate) async fn recv<T: DeserializeOwned>(wire: &mut Wire) -> Result<Option<T>> {
    let Some(frame) = wire.next().await else {
        return Ok(None);
    };

    Serializer::Postcard
        .from_bytes(&frame?)
        .map(Some)
        .map_err(|err| Error::Protocol(format!("malformed frame: {err:#}")))
}

/// One-sided requests served by every PE.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rma {
    Get { addr: SymmetricAddr, len: usize },
    Put { addr: SymmetricAddr, data: Bytes },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) enum RmaReply {
    Data(Bytes),
    Ack,
    /// The request could not be applied to the local heap.
    Fault(String),
}

/// Requests from a PE to the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Join { pe: usize, rma: SocketAddr },
    Barrier,
    ReduceOr(bool),
    Leave,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlReply {
    /// RMA addresses of every PE, indexed by rank.
    Joined { peers: Vec<SocketAddr> },
    Released,
    Reduced(bool),
}
