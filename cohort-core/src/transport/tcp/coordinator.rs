use std::net::SocketAddr;

use futures::future::try_join_all;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, instrument};

use super::wire::{self, Control, ControlReply, Wire};
use crate::error::{Error, Result};

/// Rendezvous point of a group of [`TcpTransport`](super::TcpTransport)s.
///
/// Collects the RMA address of every PE, hands out the peer table, and then
/// runs collectives in lockstep: each round, every PE submits one request and
/// all requests of a round must be of the same kind. A PE that disconnects or
/// submits a mismatched request ends the run with an error, and dropping the
/// remaining connections releases every PE still blocked in a collective.
pub struct Coordinator {
    listener: TcpListener,
    n_pes: usize,
}

enum Round {
    Reply(ControlReply),
    Leave,
}

impl Coordinator {
    pub async fn bind(addr: impl ToSocketAddrs, n_pes: usize) -> Result<Self> {
        if n_pes == 0 {
            return Err(Error::EmptyGroup);
        }

        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            n_pes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[instrument(skip(self), fields(n_pes = self.n_pes))]
    pub async fn run(self) -> Result<()> {
        let mut wires = self.join().await?;
        info!("group assembled");

        let mut round = 0usize;
        loop {
            let requests = try_join_all(wires.iter_mut().enumerate().map(|(pe, wire)| async move {
                wire::recv::<Control>(wire)
                    .await?
                    .ok_or_else(|| Error::Protocol(format!("PE {pe} disconnected")))
            }))
            .await?;

            let outcome = Self::resolve(&requests)?;
            debug!(round, ?requests, "collective complete");
            round += 1;

            match outcome {
                Round::Reply(reply) => {
                    for wire in &mut wires {
                        wire::send(wire, &reply).await?;
                    }
                }
                Round::Leave => {
                    for wire in &mut wires {
                        wire::send(wire, &ControlReply::Released).await?;
                    }
                    info!("group finalized");
                    return Ok(());
                }
            }
        }
    }

    async fn join(&self) -> Result<Vec<Wire>> {
        let mut slots: Vec<Option<(SocketAddr, Wire)>> = (0..self.n_pes).map(|_| None).collect();
        let mut joined = 0;

        while joined < self.n_pes {
            let (stream, peer) = self.listener.accept().await?;
            let mut wire = wire::wire(stream)?;

            match wire::recv::<Control>(&mut wire).await? {
                Some(Control::Join { pe, rma }) if pe < self.n_pes && slots[pe].is_none() => {
                    debug!(pe, %rma, %peer, "PE joined");
                    slots[pe] = Some((rma, wire));
                    joined += 1;
                }
                Some(Control::Join { pe, .. }) => {
                    return Err(Error::Protocol(format!(
                        "unexpected join from PE {pe} in a group of {}",
                        self.n_pes
                    )))
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected a join from {peer}, got {other:?}"
                    )))
                }
            }
        }

        let (peers, mut wires): (Vec<_>, Vec<_>) = slots.into_iter().flatten().unzip();
        let joined = ControlReply::Joined { peers };
        for wire in &mut wires {
            wire::send(wire, &joined).await?;
        }

        Ok(wires)
    }

    fn resolve(requests: &[Control]) -> Result<Round> {
        match requests.first() {
            Some(Control::Barrier) if requests.iter().all(|r| *r == Control::Barrier) => {
                Ok(Round::Reply(ControlReply::Released))
            }
            Some(Control::ReduceOr(_)) => {
                let mut any = false;
                for request in requests {
                    match request {
                        Control::ReduceOr(value) => any |= *value,
                        _ => return Err(Self::mismatch(requests)),
                    }
                }
                Ok(Round::Reply(ControlReply::Reduced(any)))
            }
            Some(Control::Leave) if requests.iter().all(|r| *r == Control::Leave) => {
                Ok(Round::Leave)
            }
            _ => Err(Self::mismatch(requests)),
        }
    }

    fn mismatch(requests: &[Control]) -> Error {
        Error::Protocol(format!("mismatched collective: {requests:?}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounds_must_agree() {
        assert!(matches!(
            Coordinator::resolve(&[Control::ReduceOr(false), Control::ReduceOr(true)]),
            Ok(Round::Reply(ControlReply::Reduced(true)))
        ));
        assert!(matches!(
            Coordinator::resolve(&[Control::Barrier, Control::Barrier]),
            Ok(Round::Reply(ControlReply::Released))
        ));
        assert!(matches!(
            Coordinator::resolve(&[Control::Leave]),
            Ok(Round::Leave)
        ));
        assert!(matches!(
            Coordinator::resolve(&[Control::Barrier, Control::ReduceOr(true)]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Coordinator::resolve(&[Control::ReduceOr(true), Control::Leave]),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn empty_groups_are_rejected() {
        assert!(matches!(
            Coordinator::bind("127.0.0.1:0", 0).await,
            Err(Error::EmptyGroup)
        ));
    }
}
