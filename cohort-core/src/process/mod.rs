//! Spawning copies of the current executable as workers.
//!
//! A [`ProcessGroup`] starts a launcher with this executable's path as its last
//! argument and an [`ActiveMessage`] in the environment. Whatever the launcher
//! runs of that path calls [`bootstrap`](crate::bootstrap()) and executes the
//! message instead of its ordinary `main`.
//!
//! Every spawned process is reaped exactly once, by whichever of
//! [`ProcessGroup::wait_all`], [`ProcessGroup::has_exited`] or dropping the
//! group notices its exit first. It stays tracked, with its status, until
//! `wait_all` hands the status out.
use std::{
    ffi::OsStr,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::process::CommandExt,
    },
    path::Path,
    process::{Child, Command, ExitStatus},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::{
    bootstrap::BOOTSTRAP_VAR,
    error::{Error, Result},
    future::{self, InterprocessFuture, InterprocessPromise},
    message::{Activate, ActiveMessage, Invoke},
    serializer::Serializer,
};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Processes spawned by this program.
#[derive(Debug)]
pub struct ProcessGroup {
    children: Mutex<Vec<Child>>,
    serializer: Serializer,
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self::new(Serializer::default())
    }
}

impl ProcessGroup {
    /// `serializer` encodes the captured state of spawned callables and the
    /// results of two-way spawns.
    pub fn new(serializer: Serializer) -> Self {
        Self {
            children: Mutex::new(Vec::new()),
            serializer,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Runs `callable` in a process started through `launcher`. Returns the
    /// launcher's process id.
    pub fn spawn<A: Activate>(
        &self,
        launcher: impl AsRef<Path>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        callable: A,
    ) -> Result<u32> {
        let message = ActiveMessage::compose(callable, self.serializer)?;
        self.spawn_message(launcher, args, &message)
    }

    #[instrument(skip_all, fields(launcher = %launcher.as_ref().display(), kind = message.kind()))]
    pub fn spawn_message(
        &self,
        launcher: impl AsRef<Path>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        message: &ActiveMessage,
    ) -> Result<u32> {
        let launcher = launcher.as_ref();
        let mut command = Command::new(launcher);
        command
            .args(args)
            .arg(std::env::current_exe()?)
            .env(BOOTSTRAP_VAR, message.to_env_value()?);

        self.launch(launcher, &mut command)
    }

    /// Runs `callable` like [`spawn`](Self::spawn) and returns a future for its
    /// output, delivered over a pipe.
    #[instrument(skip_all, fields(launcher = %launcher.as_ref().display()))]
    pub fn spawn_two_way<C: Invoke>(
        &self,
        launcher: impl AsRef<Path>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        callable: C,
    ) -> Result<InterprocessFuture<C::Output>> {
        let launcher = launcher.as_ref();
        let (read, write) = future::pipe()?;
        let write_fd = write.as_raw_fd();

        let adapter = InvokeAndWriteResult {
            callable,
            write_fd,
            serializer: self.serializer,
        };
        let message = ActiveMessage::compose(adapter, self.serializer)?;

        let mut command = Command::new(launcher);
        command
            .args(args)
            .arg(std::env::current_exe()?)
            .env(BOOTSTRAP_VAR, message.to_env_value()?);
        // Both ends are close-on-exec, so processes spawned concurrently by
        // other threads never hold the write end. Only this child keeps it.
        // SAFETY: fcntl is async-signal-safe and touches only the child's copy
        // of a descriptor that stays open in the parent until spawn returns.
        unsafe {
            command.pre_exec(move || {
                fcntl(write_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                Ok(())
            });
        }
        self.launch(launcher, &mut command)?;

        // The worker holds its own copy now. Ours must close, or the future
        // would never observe end of transmission.
        drop(write);

        Ok(InterprocessFuture::from_pipe(read, self.serializer))
    }

    fn launch(&self, launcher: &Path, command: &mut Command) -> Result<u32> {
        let child = command.spawn().map_err(|source| Error::Spawn {
            launcher: launcher.display().to_string(),
            source,
        })?;

        let pid = child.id();
        self.lock().push(child);
        info!(pid, "spawned");

        Ok(pid)
    }

    /// Blocks until every process tracked at the time of the call has exited,
    /// and stops tracking them.
    ///
    /// Returns exit statuses in spawn order. Processes stay tracked while this
    /// blocks, so [`has_exited`](Self::has_exited) keeps answering for them
    /// from other threads.
    #[instrument(skip(self))]
    pub fn wait_all(&self) -> Result<Vec<ExitStatus>> {
        let pids: Vec<u32> = self.lock().iter().map(Child::id).collect();

        loop {
            let mut children = self.lock();
            let mut done = true;
            for child in children.iter_mut().filter(|child| pids.contains(&child.id())) {
                // Reaped children keep answering with their status.
                done &= child.try_wait()?.is_some();
            }

            if done {
                let mut statuses = Vec::with_capacity(pids.len());
                children.retain_mut(|child| {
                    if !pids.contains(&child.id()) {
                        return true;
                    }
                    if let Ok(Some(status)) = child.try_wait() {
                        debug!(pid = child.id(), %status, "reaped");
                        statuses.push(status);
                    }
                    false
                });
                return Ok(statuses);
            }
            drop(children);

            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    /// Whether the process `pid` has exited. Reaps it if so.
    ///
    /// A process this group does not track, or no longer tracks because
    /// [`wait_all`](Self::wait_all) returned its status, is reported as
    /// exited.
    pub fn has_exited(&self, pid: u32) -> Result<bool> {
        let mut children = self.lock();
        // The newest entry wins should the system have reused `pid`.
        match children.iter_mut().rev().find(|child| child.id() == pid) {
            Some(child) => Ok(child.try_wait()?.is_some()),
            None => Ok(true),
        }
    }

    /// Number of processes whose status has not been handed out by
    /// [`wait_all`](Self::wait_all).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Child>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Err(err) = self.wait_all() {
            error!("failed to reap spawned processes: {err}");
        }
    }
}

/// Invokes a callable in the worker and writes its outcome into the pipe the
/// spawning process is reading from.
#[derive(Serialize, Deserialize)]
struct InvokeAndWriteResult<C> {
    callable: C,
    /// Made inheritable in this worker only, so the number is valid there.
    write_fd: RawFd,
    serializer: Serializer,
}

impl<C: Invoke> Activate for InvokeAndWriteResult<C> {
    fn activate(self) -> anyhow::Result<()> {
        // SAFETY: the spawning process cleared close-on-exec on this
        // descriptor for this worker alone, and nothing else here claims it.
        let fd = unsafe { OwnedFd::from_raw_fd(self.write_fd) };
        let promise = InterprocessPromise::from_fd(fd, self.serializer);

        match self.callable.invoke() {
            Ok(value) => promise.set_value(value)?,
            Err(err) => promise.set_exception(format!("{err:#}"))?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::Arc,
        thread,
        time::Instant,
    };

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Noop;

    impl Activate for Noop {
        fn activate(self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Answer;

    impl Invoke for Answer {
        type Output = u32;

        fn invoke(self) -> anyhow::Result<u32> {
            Ok(42)
        }
    }

    #[test]
    fn launcher_sees_the_message_and_the_executable() {
        let group = ProcessGroup::new(Serializer::Cbor);
        // `sh -c script exe` binds the executable path to `$0`.
        let script = format!(r#"test -n "${BOOTSTRAP_VAR}" && test -x "$0" && exit 3"#);

        let pid = group.spawn("/bin/sh", ["-c", script.as_str()], Noop).unwrap();
        assert_eq!(group.len(), 1);

        let statuses = group.wait_all().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].code(), Some(3));
        assert!(group.is_empty());
        assert!(group.has_exited(pid).unwrap());
    }

    #[test]
    fn exited_processes_are_noticed() {
        let group = ProcessGroup::default();
        let pid = group.spawn("/bin/sh", ["-c", "exit 0"], Noop).unwrap();

        while !group.has_exited(pid).unwrap() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(group.wait_all().unwrap()[0].success());
    }

    #[test]
    fn running_processes_stay_tracked_while_waiting() {
        let group = Arc::new(ProcessGroup::default());
        let pid = group.spawn("/bin/sh", ["-c", "sleep 1"], Noop).unwrap();

        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.wait_all())
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!group.has_exited(pid).unwrap());
        assert_eq!(group.len(), 1);

        let statuses = waiter.join().unwrap().unwrap();
        assert!(statuses[0].success());
        assert!(group.has_exited(pid).unwrap());
        assert!(group.is_empty());
    }

    #[test]
    fn unrelated_spawns_do_not_hold_the_write_end() {
        let group = ProcessGroup::default();
        let (read, write) = future::pipe().unwrap();
        group.spawn("/bin/sh", ["-c", "sleep 2"], Noop).unwrap();
        drop(write);

        let started = Instant::now();
        assert!(matches!(
            InterprocessFuture::<u32>::from_pipe(read, Serializer::Postcard).get(),
            Err(Error::InterprocessFailure(d)) if d == future::CLOSED_WITHOUT_RESULT
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn missing_launcher_is_a_spawn_error() {
        let group = ProcessGroup::default();
        let err = group
            .spawn("/nonexistent/launcher", std::iter::empty::<&str>(), Noop)
            .unwrap_err();

        assert!(matches!(err, Error::Spawn { launcher, .. } if launcher == "/nonexistent/launcher"));
        assert!(group.is_empty());
    }

    #[test]
    fn worker_that_never_answers_fails_the_future() {
        let group = ProcessGroup::default();
        // Exits without running the executable, so the promise is never set.
        let future = group
            .spawn_two_way("/bin/sh", ["-c", "exit 0"], Answer)
            .unwrap();

        assert!(matches!(
            future.get(),
            Err(Error::InterprocessFailure(d)) if d == future::CLOSED_WITHOUT_RESULT
        ));
    }

    #[test]
    fn adapter_writes_the_output_into_the_pipe() {
        let (read, write) = future::pipe().unwrap();
        let adapter = InvokeAndWriteResult {
            callable: Answer,
            write_fd: write.as_raw_fd(),
            serializer: Serializer::Postcard,
        };
        // The adapter takes ownership of the descriptor.
        std::mem::forget(write);

        adapter.activate().unwrap();
        let value = InterprocessFuture::<u32>::from_pipe(read, Serializer::Postcard)
            .get()
            .unwrap();
        assert_eq!(value, 42);
    }
}
