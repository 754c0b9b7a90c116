//! The bundled distributed-job launcher.
//!
//! `cohort-run -n N program [args..]` hosts a [`Coordinator`], starts `N`
//! copies of `program` with the [`PeEnvironment`] of each rank, and waits for
//! all of them. When a PE exits abnormally the coordinator is stopped, which
//! releases every PE still blocked in a collective, and the launcher exits with
//! that PE's status.
use std::{ffi::OsString, net::IpAddr, path::PathBuf, process::ExitStatus, time::Duration};

use clap::Args;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Error, Result},
    transport::tcp::{Coordinator, PeEnvironment, PE_HOST_VAR},
};

/// How long the coordinator may take to wind down once every PE has exited.
const COORDINATOR_GRACE: Duration = Duration::from_secs(1);

#[derive(Args, Clone, Debug)]
pub struct Launch {
    /// Number of processing elements to start.
    #[arg(short = 'n', long = "pes")]
    pub n_pes: usize,

    /// Interface the coordinator and the PEs bind to.
    #[arg(long, env = PE_HOST_VAR, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Program every PE runs.
    pub program: PathBuf,

    /// Arguments passed to every PE.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}

impl Launch {
    /// Runs the group to completion and returns the exit code the launcher
    /// should report.
    #[instrument(skip(self), fields(n_pes = self.n_pes, program = %self.program.display()))]
    pub async fn run(self) -> Result<i32> {
        let coordinator = Coordinator::bind((self.host, 0), self.n_pes).await?;
        let address = coordinator.local_addr()?;
        let mut coordinator = tokio::spawn(coordinator.run());
        info!(%address, "coordinator listening");

        let mut running = FuturesUnordered::new();
        for rank in 0..self.n_pes {
            let env = PeEnvironment {
                rank,
                count: self.n_pes,
                coordinator: address,
                host: self.host,
            };

            let child = Command::new(&self.program)
                .args(&self.args)
                .envs(env.vars())
                .spawn();
            let mut child = match child {
                Ok(child) => child,
                Err(source) => {
                    coordinator.abort();
                    return Err(Error::Spawn {
                        launcher: self.program.display().to_string(),
                        source,
                    });
                }
            };

            running.push(async move { (rank, child.wait().await) });
        }

        let mut failure: Option<(usize, ExitStatus)> = None;
        while let Some((rank, status)) = running.next().await {
            let status = status?;
            if status.success() {
                info!(rank, "PE finished");
                continue;
            }

            error!(rank, %status, "PE exited abnormally");
            if failure.is_none() {
                failure = Some((rank, status));
                coordinator.abort();
            }
        }

        if let Some((_, status)) = failure {
            return Ok(exit_code(status));
        }

        match tokio::time::timeout(COORDINATOR_GRACE, &mut coordinator).await {
            Ok(Ok(Ok(()))) => Ok(0),
            Ok(Ok(Err(err))) => {
                warn!("coordinator failed: {err}");
                Ok(1)
            }
            Ok(Err(err)) => Err(Error::Other(err.into())),
            Err(_) => {
                // Every PE succeeded without ever joining the group.
                coordinator.abort();
                debug!("no PE joined the group");
                Ok(0)
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}
