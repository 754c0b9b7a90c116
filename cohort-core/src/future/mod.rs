//! One-shot result channels between processes.
//!
//! An [`InterprocessPromise`] writes exactly one [`Outcome`] into a byte
//! stream; the matching [`InterprocessFuture`] reads exactly one back. Both
//! are consumed by their single operation, so a second write or read cannot
//! be expressed.
//!
//! The stream is either a local pipe (the producer is a process spawned on the
//! same host) or a TCP connection that the future accepts on a listening
//! socket (the producer is PE 0 of a launched group).
//!
//! # Frame
//! An 8-byte big-endian length, followed by that many bytes of the
//! serialized [`Outcome`]: a [`LengthDelimitedCodec`] frame with an 8-byte
//! length field rather than the transport's 4-byte one. A stream that ends
//! before a complete frame is read, or announces a frame longer than
//! [`MAX_RESULT_FRAME`], is reported as [`Error::InterprocessFailure`].
use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    marker::PhantomData,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    os::fd::OwnedFd,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{length_delimited, Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    serializer::{Serializable, Serializer},
};

/// Description used when a channel closes without delivering a frame.
pub const CLOSED_WITHOUT_RESULT: &str = "result channel closed before a result was delivered";

/// Description used when the producer is known to be gone before connecting.
pub const PRODUCER_EXITED: &str = "producer exited before delivering a result";

/// Largest serialized outcome a future accepts.
pub const MAX_RESULT_FRAME: usize = 64 << 20;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 8 << 10;

fn frame_codec() -> LengthDelimitedCodec {
    length_delimited::Builder::new()
        .length_field_length(8)
        .max_frame_length(MAX_RESULT_FRAME)
        .new_codec()
}

/// The tagged message carried by a result channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    Failure(String),
}

/// Write side of a result channel.
pub struct InterprocessPromise<T> {
    sink: Box<dyn Write + Send>,
    serializer: Serializer,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serializable> InterprocessPromise<T> {
    /// Binds a promise to the write end of a pipe.
    pub fn from_fd(fd: OwnedFd, serializer: Serializer) -> Self {
        Self {
            sink: Box::new(File::from(fd)),
            serializer,
            _marker: PhantomData,
        }
    }

    /// Connects to a listening [`InterprocessFuture`].
    pub fn connect(addr: impl ToSocketAddrs, serializer: Serializer) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        Ok(Self {
            sink: Box::new(stream),
            serializer,
            _marker: PhantomData,
        })
    }

    pub fn set_value(self, value: T) -> Result<()> {
        self.fulfill(Outcome::Value(value))
    }

    pub fn set_exception(self, description: impl Into<String>) -> Result<()> {
        self.fulfill(Outcome::Failure(description.into()))
    }

    #[instrument(skip_all, level = "debug")]
    fn fulfill(mut self, outcome: Outcome<T>) -> Result<()> {
        let bytes = self.serializer.to_bytes(&outcome)?;
        let len = bytes.len();

        let mut frame = BytesMut::with_capacity(len + 8);
        frame_codec().encode(Bytes::from(bytes), &mut frame)?;
        self.sink.write_all(&frame)?;
        self.sink.flush()?;
        debug!(len, "promise fulfilled");

        // Dropping `self` closes the stream, signalling end of transmission.
        Ok(())
    }
}

enum Source {
    Pipe(File),
    Listener(TcpListener),
}

type Liveness = Box<dyn FnMut() -> bool + Send>;

/// Read side of a result channel.
pub struct InterprocessFuture<T> {
    source: Source,
    serializer: Serializer,
    liveness: Option<Liveness>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serializable> InterprocessFuture<T> {
    /// Binds a future to the read end of a pipe.
    pub fn from_pipe(fd: OwnedFd, serializer: Serializer) -> Self {
        Self {
            source: Source::Pipe(File::from(fd)),
            serializer,
            liveness: None,
            _marker: PhantomData,
        }
    }

    /// Binds a future to the first connection accepted on `listener`.
    pub fn accept(listener: TcpListener, serializer: Serializer) -> Self {
        Self {
            source: Source::Listener(listener),
            serializer,
            liveness: None,
            _marker: PhantomData,
        }
    }

    /// Installs a predicate reporting whether the producer may still connect.
    ///
    /// Only consulted while waiting for a connection. Once it returns `false`,
    /// [`get`](Self::get) makes one final attempt to accept and then fails
    /// with [`Error::InterprocessFailure`] instead of blocking forever.
    pub fn with_liveness(mut self, alive: impl FnMut() -> bool + Send + 'static) -> Self {
        self.liveness = Some(Box::new(alive));
        self
    }

    /// Address the future is listening on, for socket-bound futures.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.source {
            Source::Listener(listener) => listener.local_addr().ok(),
            Source::Pipe(_) => None,
        }
    }

    /// Blocks until the producer delivers its outcome.
    #[instrument(skip_all, level = "debug")]
    pub fn get(self) -> Result<T> {
        let serializer = self.serializer;
        let frame = match self.source {
            Source::Pipe(mut file) => read_frame(&mut file)?,
            Source::Listener(listener) => {
                let mut stream = accept(&listener, self.liveness)?;
                read_frame(&mut stream)?
            }
        };

        let outcome: Outcome<T> = serializer
            .from_bytes(&frame)
            .map_err(|err| Error::InterprocessFailure(format!("malformed result: {err:#}")))?;

        match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Failure(description) => Err(Error::InterprocessFailure(description)),
        }
    }
}

fn accept(listener: &TcpListener, liveness: Option<Liveness>) -> Result<TcpStream> {
    let Some(mut alive) = liveness else {
        let (stream, peer) = listener.accept()?;
        debug!(%peer, "accepted producer");
        return Ok(stream);
    };

    listener.set_nonblocking(true)?;
    loop {
        let still_alive = alive();
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted producer");
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                // Sampled before the attempt, so a producer that connected and
                // then exited is still accepted above.
                if !still_alive {
                    return Err(Error::InterprocessFailure(PRODUCER_EXITED.to_string()));
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_frame(reader: &mut impl Read) -> Result<BytesMut> {
    let mut codec = frame_codec();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(err) => {
                return Err(Error::InterprocessFailure(format!(
                    "malformed result frame: {err}"
                )))
            }
        }

        match reader.read(&mut chunk) {
            Ok(0) => return Err(Error::InterprocessFailure(CLOSED_WITHOUT_RESULT.to_string())),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Creates a pipe neither end of which is inherited by spawned processes.
///
/// Returns `(read, write)`. A process meant to fulfill a promise bound to the
/// write end must have it made inheritable in that process alone, as
/// [`ProcessGroup::spawn_two_way`](crate::process::ProcessGroup::spawn_two_way)
/// does.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let ends = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(io::Error::from)?;

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let ends = {
        use std::os::fd::AsRawFd;

        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
        for fd in [&read, &write] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
        }
        (read, write)
    };

    Ok(ends)
}
