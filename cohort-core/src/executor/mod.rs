//! Bulk-synchronous execution of one function on a group of PEs.
//!
//! [`BulkExecutor::bulk_execute`] launches `n` PEs which all run the same
//! [`BulkFunction`], each with its own rank and a reference to one shared
//! parameter. The parameter is built by a [`Factory`] on PE 0 and read by
//! every other PE through a [`RemoteRef`].
//!
//! [`BulkExecutor::bulk_execute_two_way`] additionally gives every PE a
//! reference to a result value living on PE 0, and returns an
//! [`InterprocessFuture`] for it. If the function fails on any PE, the future
//! fails with [`Error::InterprocessFailure`].
//!
//! Every PE runs the same sequence:
//! 1. join the group;
//! 2. PE 0 builds the shared parameter (and the initial result) into symmetric
//!    slots;
//! 3. a logical-OR reduction over "did my factory fail", which is also the
//!    barrier publishing the slots; if any factory failed, no PE runs the
//!    function;
//! 4. every PE forms remote pointers to PE 0's slots and the function runs;
//! 5. two-way only: a logical-OR reduction over "did my call fail", which is
//!    also a barrier;
//! 6. two-way only: PE 0 connects back to the caller and fulfills the promise;
//! 7. barrier; PE 0 destroys whichever slots it constructed; the group is left.
//!
//! ```no_run
//! use cohort::{
//!     config::Config,
//!     executor::{BulkExecutor, BulkFunction, Constant},
//!     remote::RemoteRef,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello;
//!
//! impl BulkFunction<i32> for Hello {
//!     fn call(&self, pe: usize, shared: RemoteRef<'_, i32>) -> anyhow::Result<()> {
//!         anyhow::ensure!(shared.get()? == 13);
//!         println!("hello world from PE {pe}");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     cohort::bootstrap();
//!
//!     let executor = BulkExecutor::from_config(&Config::default());
//!     executor.bulk_execute(Hello, 2, Constant(13))?;
//!     executor.wait()?;
//!     Ok(())
//! }
//! ```
use std::{
    net::{SocketAddr, TcpListener},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, error, info, instrument};

use crate::{
    config::{self, Config},
    error::{Error, Result},
    future::{InterprocessFuture, InterprocessPromise},
    message::{Activate, ActiveMessage},
    process::ProcessGroup,
    remote::RemoteRef,
    serializer::{Serializable, Serializer},
    slot::{SharedSlot, SlotState},
    transport::{in_memory::InMemoryTransport, tcp::TcpTransport, Transport},
};

/// Rank that owns the shared slots and fulfills the promise.
pub const ROOT: usize = 0;

/// Description carried by the future when the function failed on any PE.
pub const GROUP_FAILED: &str = "one or more processing elements failed";

/// Builds a value on PE 0.
pub trait Factory: Serializable {
    type Output: Pod;

    fn build(&self) -> Self::Output;

    /// Runs on PE 0 once every PE is done with the value.
    fn teardown(&self, _value: Self::Output) {}
}

/// A factory that always builds the same value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Constant<T>(pub T);

impl<T: Pod + Serializable> Factory for Constant<T> {
    type Output = T;

    fn build(&self) -> T {
        self.0
    }
}

/// The function run by every PE of a one-way call.
pub trait BulkFunction<S: Pod>: Serializable {
    fn call(&self, pe: usize, shared: RemoteRef<'_, S>) -> anyhow::Result<()>;
}

/// The function run by every PE of a two-way call.
///
/// `result` refers to the value that is delivered to the caller once every PE
/// has returned.
pub trait BulkTwoWayFunction<R: Pod, S: Pod>: Serializable {
    fn call(
        &self,
        pe: usize,
        result: RemoteRef<'_, R>,
        shared: RemoteRef<'_, S>,
    ) -> anyhow::Result<()>;
}

/// Launches groups of PEs.
pub struct BulkExecutor {
    config: Config,
    serializer: Serializer,
    processes: Arc<ProcessGroup>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BulkExecutor {
    pub fn from_config(config: &Config) -> Self {
        let serializer = Serializer::from(config);

        Self {
            config: config.clone(),
            serializer,
            processes: Arc::new(ProcessGroup::new(serializer)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Short-hand for an executor that emulates groups with threads.
    ///
    /// Two-way results are still delivered over a socket, on an ephemeral
    /// port.
    pub fn in_memory() -> Self {
        Self::from_config(&Config {
            runtime: config::Runtime::InMemory,
            result_port: 0,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `function` on `n` PEs and returns once the group is started.
    ///
    /// Failures inside the group are not observable here; in the process
    /// runtime they show up as the launcher's exit status.
    #[instrument(skip(self, function, shared_factory), fields(runtime = ?self.config.runtime))]
    pub fn bulk_execute<F, SF>(&self, function: F, n: usize, shared_factory: SF) -> Result<()>
    where
        F: BulkFunction<SF::Output>,
        SF: Factory,
    {
        if n == 0 {
            return Err(Error::EmptyGroup);
        }

        let group = OneWayGroup {
            function,
            shared_factory,
            heap_size: self.config.symmetric_heap_size,
        };

        match self.config.runtime {
            config::Runtime::Process => {
                let message = ActiveMessage::compose(group, self.serializer)?;
                self.processes
                    .spawn_message(&self.config.launcher, self.launcher_args(n), &message)?;
            }
            config::Runtime::InMemory => {
                self.emulate(group, n, None, |group, transport| {
                    run_one_way(transport, &group.function, &group.shared_factory)
                })?;
            }
        }

        info!("group started");
        Ok(())
    }

    /// Runs `function` on `n` PEs and returns a future for the result built by
    /// `result_factory` and updated by the PEs.
    ///
    /// The result socket is listening before the group is started.
    #[instrument(
        skip(self, function, result_factory, shared_factory),
        fields(runtime = ?self.config.runtime)
    )]
    pub fn bulk_execute_two_way<F, RF, SF>(
        &self,
        function: F,
        n: usize,
        result_factory: RF,
        shared_factory: SF,
    ) -> Result<InterprocessFuture<RF::Output>>
    where
        F: BulkTwoWayFunction<RF::Output, SF::Output>,
        RF: Factory,
        RF::Output: Serializable,
        SF: Factory,
    {
        if n == 0 {
            return Err(Error::EmptyGroup);
        }

        let listener =
            TcpListener::bind((self.config.result_host.as_str(), self.config.result_port))?;
        let reply_to = listener.local_addr()?;
        debug!(%reply_to, "listening for the result");

        let group = TwoWayGroup {
            function,
            result_factory,
            shared_factory,
            reply_to,
            serializer: self.serializer,
            heap_size: self.config.symmetric_heap_size,
        };
        let future = InterprocessFuture::accept(listener, self.serializer);

        let future = match self.config.runtime {
            config::Runtime::Process => {
                let message = ActiveMessage::compose(group, self.serializer)?;
                let pid = self.processes.spawn_message(
                    &self.config.launcher,
                    self.launcher_args(n),
                    &message,
                )?;

                let processes = self.processes.clone();
                future.with_liveness(move || matches!(processes.has_exited(pid), Ok(false)))
            }
            config::Runtime::InMemory => {
                let running = Arc::new(AtomicUsize::new(n));
                self.emulate(group, n, Some(running.clone()), |group, transport| {
                    run_two_way(
                        transport,
                        &group.function,
                        &group.result_factory,
                        &group.shared_factory,
                        group.reply_to,
                        group.serializer,
                    )
                })?;

                future.with_liveness(move || running.load(Ordering::SeqCst) > 0)
            }
        };

        info!("group started");
        Ok(future)
    }

    /// Blocks until every group started by this executor has finished.
    pub fn wait(&self) -> Result<()> {
        let threads =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(|p| p.into_inner()));
        for thread in threads {
            if thread.join().is_err() {
                error!("emulated PE thread panicked");
            }
        }

        for status in self.processes.wait_all()? {
            if !status.success() {
                error!(%status, "launcher exited abnormally");
            }
        }
        Ok(())
    }

    fn launcher_args(&self, n: usize) -> Vec<String> {
        let mut args = self.config.launcher_args.clone();
        args.extend(["-n".to_string(), n.to_string()]);
        args
    }

    /// Runs `run` on `n` threads, one per PE. Each thread decodes its own copy
    /// of `group`, as a process would.
    fn emulate<G, Run>(
        &self,
        group: G,
        n: usize,
        running: Option<Arc<AtomicUsize>>,
        run: Run,
    ) -> Result<()>
    where
        G: Serializable,
        Run: Fn(G, InMemoryTransport) -> Result<()> + Send + Sync + 'static,
    {
        let bytes: Arc<[u8]> = self.serializer.to_bytes(&group)?.into();
        let run = Arc::new(run);
        let serializer = self.serializer;

        let mut handles = Vec::with_capacity(n);
        for transport in InMemoryTransport::group(n, self.config.symmetric_heap_size) {
            let bytes = bytes.clone();
            let run = run.clone();
            let running = running.clone().map(Running);
            let pe = transport.my_pe();

            let handle = std::thread::Builder::new()
                .name(format!("cohort-pe-{pe}"))
                .spawn(move || {
                    let _running = running;
                    let result = serializer
                        .from_bytes::<G>(&bytes)
                        .map_err(Error::from)
                        .and_then(|group| (*run)(group, transport));
                    if let Err(err) = result {
                        error!(pe, "PE failed: {err}");
                    }
                })?;
            handles.push(handle);
        }

        self.threads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);
        Ok(())
    }
}

/// Counts an emulated PE as running until dropped.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A one-way group, as shipped to every PE.
#[derive(Serialize, Deserialize)]
struct OneWayGroup<F, SF> {
    function: F,
    shared_factory: SF,
    heap_size: usize,
}

impl<F, SF> Activate for OneWayGroup<F, SF>
where
    F: BulkFunction<SF::Output>,
    SF: Factory,
{
    fn activate(self) -> anyhow::Result<()> {
        let transport = TcpTransport::from_env(self.heap_size)?;
        Ok(run_one_way(transport, &self.function, &self.shared_factory)?)
    }
}

/// A two-way group, as shipped to every PE.
#[derive(Serialize, Deserialize)]
struct TwoWayGroup<F, RF, SF> {
    function: F,
    result_factory: RF,
    shared_factory: SF,
    reply_to: SocketAddr,
    serializer: Serializer,
    heap_size: usize,
}

impl<F, RF, SF> Activate for TwoWayGroup<F, RF, SF>
where
    F: BulkTwoWayFunction<RF::Output, SF::Output>,
    RF: Factory,
    RF::Output: Serializable,
    SF: Factory,
{
    fn activate(self) -> anyhow::Result<()> {
        let transport = TcpTransport::from_env(self.heap_size)?;
        Ok(run_two_way(
            transport,
            &self.function,
            &self.result_factory,
            &self.shared_factory,
            self.reply_to,
            self.serializer,
        )?)
    }
}

/// Runs user code, turning errors and panics into a description.
fn guarded<T>(
    pe: usize,
    what: &str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!(pe, "{what} failed: {err:#}");
            Err(format!("{err:#}"))
        }
        Err(panic) => {
            let description = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(pe, "{what} panicked: {description}");
            Err(format!("{what} panicked: {description}"))
        }
    }
}

/// Builds a factory's value into `slot`. A panicking factory leaves the slot
/// empty and is reported as the inner error.
fn construct<SF: Factory>(
    transport: &dyn Transport,
    slot: &mut SharedSlot<SF::Output>,
    factory: &SF,
) -> Result<std::result::Result<(), String>> {
    match guarded(transport.my_pe(), "factory", || Ok(factory.build())) {
        Ok(value) => {
            slot.construct(transport, value)?;
            Ok(Ok(()))
        }
        Err(description) => Ok(Err(description)),
    }
}

fn run_one_way<T, F, SF>(transport: T, function: &F, shared_factory: &SF) -> Result<()>
where
    T: Transport,
    F: BulkFunction<SF::Output>,
    SF: Factory,
{
    let pe = transport.my_pe();
    let _span = debug_span!("pe", pe).entered();

    let mut shared = SharedSlot::<SF::Output>::allocate(transport.heap(), ROOT)?;
    let mut outcome = Ok(());
    if pe == ROOT {
        outcome = construct(&transport, &mut shared, shared_factory)?;
    }
    let unbuilt = transport.reduce_or(outcome.is_err())?;
    debug!(unbuilt, "shared parameter broadcast");

    if !unbuilt {
        let shared_ptr = shared.pointer(&transport);
        outcome = guarded(pe, "function", || function.call(pe, shared_ptr.deref()));
        debug!(ok = outcome.is_ok(), "function returned");
    }

    transport.barrier()?;
    if shared.state() == SlotState::Occupied {
        shared_factory.teardown(shared.destroy(&transport)?);
    }
    transport.finalize()?;

    outcome.map_err(|description| Error::Other(anyhow::anyhow!("PE {pe}: {description}")))
}

fn run_two_way<T, F, RF, SF>(
    transport: T,
    function: &F,
    result_factory: &RF,
    shared_factory: &SF,
    reply_to: SocketAddr,
    serializer: Serializer,
) -> Result<()>
where
    T: Transport,
    F: BulkTwoWayFunction<RF::Output, SF::Output>,
    RF: Factory,
    RF::Output: Serializable,
    SF: Factory,
{
    let pe = transport.my_pe();
    let _span = debug_span!("pe", pe).entered();

    let mut result = SharedSlot::<RF::Output>::allocate(transport.heap(), ROOT)?;
    let mut shared = SharedSlot::<SF::Output>::allocate(transport.heap(), ROOT)?;
    let mut outcome = Ok(());
    if pe == ROOT {
        outcome = construct(&transport, &mut result, result_factory)?;
        if outcome.is_ok() {
            outcome = construct(&transport, &mut shared, shared_factory)?;
        }
    }
    let unbuilt = transport.reduce_or(outcome.is_err())?;
    debug!(unbuilt, "shared parameter broadcast");

    if !unbuilt {
        let result_ptr = result.pointer(&transport);
        let shared_ptr = shared.pointer(&transport);
        outcome = guarded(pe, "function", || {
            function.call(pe, result_ptr.deref(), shared_ptr.deref())
        });
    }

    let any_failed = transport.reduce_or(outcome.is_err())?;
    debug!(any_failed, "failures aggregated");

    let fulfilled = if pe == ROOT {
        fulfill(&transport, &result, any_failed, reply_to, serializer)
    } else {
        Ok(())
    };

    transport.barrier()?;
    if result.state() == SlotState::Occupied {
        result_factory.teardown(result.destroy(&transport)?);
    }
    if shared.state() == SlotState::Occupied {
        shared_factory.teardown(shared.destroy(&transport)?);
    }
    transport.finalize()?;

    fulfilled
}

fn fulfill<T, R>(
    transport: &T,
    result: &SharedSlot<R>,
    any_failed: bool,
    reply_to: SocketAddr,
    serializer: Serializer,
) -> Result<()>
where
    T: Transport,
    R: Pod + Serializable,
{
    let promise = InterprocessPromise::<R>::connect(reply_to, serializer)?;
    if any_failed {
        promise.set_exception(GROUP_FAILED)
    } else {
        promise.set_value(result.pointer(transport).load()?)
    }
}
