//! PEs as OS processes connected over TCP.
//!
//! Each PE serves one-sided requests against its own [`SymmetricHeap`] on an
//! RMA listener, and holds a control connection to the group's
//! [`Coordinator`], which runs the collectives. Both sides speak the frames
//! defined in [`wire`].
//!
//! A PE learns who it is from the environment prepared by the launcher, see
//! [`PeEnvironment`].
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use clap::Parser;
use dashmap::DashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Runtime,
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{debug, debug_span, instrument, warn, Instrument};

use self::wire::{Control, ControlReply, Rma, RmaReply, Wire};
use super::{SymmetricHeap, Transport};
use crate::{
    error::{Error, Result},
    remote::{RemoteAccess, SymmetricAddr},
};

mod coordinator;
mod wire;

pub use coordinator::Coordinator;

pub const PE_RANK_VAR: &str = "COHORT_PE_RANK";
pub const PE_COUNT_VAR: &str = "COHORT_PE_COUNT";
pub const COORDINATOR_VAR: &str = "COHORT_COORDINATOR";
pub const PE_HOST_VAR: &str = "COHORT_PE_HOST";

/// Identity of a PE within a launched group, read from the environment.
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
#[command(no_binary_name = true)]
pub struct PeEnvironment {
    #[arg(long, env = PE_RANK_VAR)]
    pub rank: usize,

    #[arg(long, env = PE_COUNT_VAR)]
    pub count: usize,

    /// Address of the group's coordinator.
    #[arg(long, env = COORDINATOR_VAR)]
    pub coordinator: SocketAddr,

    /// Interface the PE's RMA service binds to.
    #[arg(long, env = PE_HOST_VAR, default_value = "127.0.0.1")]
    pub host: IpAddr,
}

impl PeEnvironment {
    pub fn from_env() -> Result<Self> {
        let env = Self::try_parse_from(std::iter::empty::<String>())
            .map_err(|err| Error::Protocol(format!("not started by a launcher: {err}")))?;

        if env.rank >= env.count {
            return Err(Error::NoSuchPe {
                pe: env.rank,
                n_pes: env.count,
            });
        }
        Ok(env)
    }

    /// Variables that make a process see this environment.
    pub fn vars(&self) -> [(&'static str, String); 4] {
        [
            (PE_RANK_VAR, self.rank.to_string()),
            (PE_COUNT_VAR, self.count.to_string()),
            (COORDINATOR_VAR, self.coordinator.to_string()),
            (PE_HOST_VAR, self.host.to_string()),
        ]
    }
}

/// One PE's handle onto a group of processes.
///
/// Owns a small tokio runtime; all methods are blocking and must not be called
/// from within another runtime.
pub struct TcpTransport {
    pe: usize,
    heap: Arc<SymmetricHeap>,
    peers: Vec<SocketAddr>,
    links: DashMap<usize, Arc<Mutex<Wire>>>,
    control: Mutex<Wire>,
    server: JoinHandle<()>,
    runtime: Runtime,
}

impl TcpTransport {
    /// Joins the group described by the launcher's environment.
    pub fn from_env(heap_size: usize) -> Result<Self> {
        Self::connect(&PeEnvironment::from_env()?, heap_size)
    }

    #[instrument(skip_all, fields(pe = env.rank, n_pes = env.count))]
    pub fn connect(env: &PeEnvironment, heap_size: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let heap = Arc::new(SymmetricHeap::new(heap_size));

        let joined: Result<(JoinHandle<()>, Wire, Vec<SocketAddr>)> = runtime.block_on(async {
            let listener = TcpListener::bind((env.host, 0)).await?;
            let rma = listener.local_addr()?;
            let server = tokio::spawn(
                serve(listener, heap.clone()).instrument(debug_span!("rma", pe = env.rank)),
            );

            let mut control = wire::wire(TcpStream::connect(env.coordinator).await?)?;
            wire::send(&mut control, &Control::Join { pe: env.rank, rma }).await?;

            match wire::recv(&mut control).await? {
                Some(ControlReply::Joined { peers }) if peers.len() == env.count => {
                    Ok((server, control, peers))
                }
                other => Err(Error::Protocol(format!("expected a peer table, got {other:?}"))),
            }
        });
        let (server, control, peers) = joined?;
        debug!(?peers, "joined group");

        Ok(Self {
            pe: env.rank,
            heap,
            peers,
            links: DashMap::new(),
            control: Mutex::new(control),
            server,
            runtime,
        })
    }

    fn peer(&self, pe: usize) -> Result<SocketAddr> {
        self.peers.get(pe).copied().ok_or(Error::NoSuchPe {
            pe,
            n_pes: self.peers.len(),
        })
    }

    async fn link(&self, pe: usize) -> Result<Arc<Mutex<Wire>>> {
        if let Some(link) = self.links.get(&pe) {
            return Ok(link.clone());
        }

        let stream = TcpStream::connect(self.peer(pe)?).await?;
        let link = Arc::new(Mutex::new(wire::wire(stream)?));
        Ok(self.links.entry(pe).or_insert(link).clone())
    }

    fn request(&self, pe: usize, request: Rma) -> Result<RmaReply> {
        self.runtime.block_on(async {
            let link = self.link(pe).await?;
            let mut wire = link.lock().await;
            wire::send(&mut *wire, &request).await?;
            wire::recv(&mut *wire)
                .await?
                .ok_or_else(|| Error::Protocol(format!("PE {pe} closed its RMA connection")))
        })
    }

    fn collective(&self, request: Control) -> Result<ControlReply> {
        self.runtime.block_on(async {
            let mut control = self.control.lock().await;
            wire::send(&mut *control, &request).await?;
            wire::recv(&mut *control)
                .await?
                .ok_or_else(|| Error::Protocol("coordinator went away".to_string()))
        })
    }
}

impl RemoteAccess for TcpTransport {
    fn get(&self, pe: usize, addr: SymmetricAddr, buf: &mut [u8]) -> Result<()> {
        if pe == self.pe {
            return self.heap.read(addr, buf);
        }

        let request = Rma::Get {
            addr,
            len: buf.len(),
        };
        match self.request(pe, request)? {
            RmaReply::Data(data) if data.len() == buf.len() => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            RmaReply::Fault(fault) => Err(Error::Protocol(format!("PE {pe}: {fault}"))),
            other => Err(Error::Protocol(format!("unexpected reply to get: {other:?}"))),
        }
    }

    fn put(&self, pe: usize, addr: SymmetricAddr, bytes: &[u8]) -> Result<()> {
        if pe == self.pe {
            return self.heap.write(addr, bytes);
        }

        let request = Rma::Put {
            addr,
            data: Bytes::copy_from_slice(bytes),
        };
        match self.request(pe, request)? {
            RmaReply::Ack => Ok(()),
            RmaReply::Fault(fault) => Err(Error::Protocol(format!("PE {pe}: {fault}"))),
            other => Err(Error::Protocol(format!("unexpected reply to put: {other:?}"))),
        }
    }
}

impl Transport for TcpTransport {
    fn my_pe(&self) -> usize {
        self.pe
    }

    fn n_pes(&self) -> usize {
        self.peers.len()
    }

    fn heap(&self) -> &SymmetricHeap {
        &self.heap
    }

    #[instrument(skip(self), fields(pe = self.pe), level = "trace")]
    fn barrier(&self) -> Result<()> {
        match self.collective(Control::Barrier)? {
            ControlReply::Released => Ok(()),
            other => Err(Error::Protocol(format!("unexpected reply to barrier: {other:?}"))),
        }
    }

    #[instrument(skip(self), fields(pe = self.pe), level = "trace")]
    fn reduce_or(&self, value: bool) -> Result<bool> {
        match self.collective(Control::ReduceOr(value))? {
            ControlReply::Reduced(any) => Ok(any),
            other => Err(Error::Protocol(format!("unexpected reply to reduction: {other:?}"))),
        }
    }

    #[instrument(skip(self), fields(pe = self.pe))]
    fn finalize(self) -> Result<()> {
        let reply = self.collective(Control::Leave)?;
        self.server.abort();

        match reply {
            ControlReply::Released => Ok(()),
            other => Err(Error::Protocol(format!("unexpected reply to leave: {other:?}"))),
        }
    }
}

async fn serve(listener: TcpListener, heap: Arc<SymmetricHeap>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("RMA listener failed: {err}");
                return;
            }
        };

        let heap = heap.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_peer(stream, &heap).await {
                warn!(%peer, "RMA connection failed: {err}");
            }
        });
    }
}

async fn serve_peer(stream: TcpStream, heap: &SymmetricHeap) -> Result<()> {
    let mut wire = wire::wire(stream)?;

    while let Some(request) = wire::recv::<Rma>(&mut wire).await? {
        let reply = match request {
            Rma::Get { addr, len } => match heap.read_to_vec(addr, len) {
                Ok(data) => RmaReply::Data(data.into()),
                Err(err) => RmaReply::Fault(err.to_string()),
            },
            Rma::Put { addr, data } => match heap.write(addr, &data) {
                Ok(()) => RmaReply::Ack,
                Err(err) => RmaReply::Fault(err.to_string()),
            },
        };
        wire::send(&mut wire, &reply).await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::{net::Ipv4Addr, thread};

    use super::*;

    /// Runs a coordinator and `n` PEs, each PE on its own thread.
    fn run<R: Send + 'static>(
        n: usize,
        f: impl Fn(TcpTransport) -> R + Send + Sync + 'static,
    ) -> (Vec<R>, Result<()>) {
        let runtime = Runtime::new().unwrap();
        let coordinator = runtime
            .block_on(Coordinator::bind("127.0.0.1:0", n))
            .unwrap();
        let address = coordinator.local_addr().unwrap();
        let coordinator = runtime.spawn(coordinator.run());

        let f = Arc::new(f);
        let results = (0..n)
            .map(|rank| {
                let f = f.clone();
                let env = PeEnvironment {
                    rank,
                    count: n,
                    coordinator: address,
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                };
                thread::spawn(move || f(TcpTransport::connect(&env, 64).unwrap()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        (results, runtime.block_on(coordinator).unwrap())
    }

    #[test]
    fn collectives_and_remote_access_across_processes() {
        let (results, coordinator) = run(3, |t| {
            let addr = t.heap().allocate(8, 8).unwrap();
            if t.my_pe() == 0 {
                t.heap().write(addr, &13u64.to_le_bytes()).unwrap();
            }
            t.barrier().unwrap();

            let mut shared = [0; 8];
            t.get(0, addr, &mut shared).unwrap();
            let any = t.reduce_or(t.my_pe() == 1).unwrap();
            let none = t.reduce_or(false).unwrap();

            t.put(0, addr, &[0; 8]).unwrap();
            t.barrier().unwrap();
            let mut cleared = [1; 8];
            t.get(0, addr, &mut cleared).unwrap();

            let result = (u64::from_le_bytes(shared), any, none, cleared == [0; 8]);
            t.finalize().unwrap();
            result
        });

        coordinator.unwrap();
        assert_eq!(results, vec![(13, true, false, true); 3]);
    }

    #[test]
    fn disconnected_pe_releases_the_group() {
        let (results, coordinator) = run(2, |t| {
            if t.my_pe() == 1 {
                drop(t);
                return true;
            }
            t.barrier().is_err()
        });

        assert_eq!(results, vec![true, true]);
        assert!(matches!(coordinator, Err(Error::Protocol(_))));
    }

    #[test]
    fn faults_are_reported_to_the_caller() {
        let (results, coordinator) = run(2, |t| {
            let mut buf = [0; 8];
            let far = t.get(1 - t.my_pe(), SymmetricAddr(60), &mut buf);
            let missing = t.get(2, SymmetricAddr(0), &mut buf);
            t.finalize().unwrap();
            (
                matches!(far, Err(Error::Protocol(_))),
                matches!(missing, Err(Error::NoSuchPe { pe: 2, n_pes: 2 })),
            )
        });

        coordinator.unwrap();
        assert_eq!(results, vec![(true, true); 2]);
    }

    #[test]
    fn oversized_reads_are_refused() {
        let runtime = Runtime::new().unwrap();
        let reply = runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = tokio::spawn(async move {
                let heap = SymmetricHeap::new(64);
                let (stream, _) = listener.accept().await.unwrap();
                serve_peer(stream, &heap).await
            });

            let mut wire = wire::wire(TcpStream::connect(addr).await.unwrap()).unwrap();
            let request = Rma::Get {
                addr: SymmetricAddr(0),
                len: usize::MAX,
            };
            wire::send(&mut wire, &request).await.unwrap();
            let reply = wire::recv::<RmaReply>(&mut wire).await.unwrap();

            drop(wire);
            server.await.unwrap().unwrap();
            reply
        });

        assert!(matches!(reply, Some(RmaReply::Fault(_))));
    }

    #[test]
    fn environment_round_trips_through_variables() {
        let env = PeEnvironment {
            rank: 1,
            count: 4,
            coordinator: "127.0.0.1:4000".parse().unwrap(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let args = env
            .vars()
            .into_iter()
            .flat_map(|(var, value)| {
                let flag = match var {
                    PE_RANK_VAR => "--rank",
                    PE_COUNT_VAR => "--count",
                    COORDINATOR_VAR => "--coordinator",
                    _ => "--host",
                };
                [flag.to_string(), value]
            });

        assert_eq!(PeEnvironment::try_parse_from(args).unwrap(), env);
    }
}
