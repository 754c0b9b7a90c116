//! Exercises real worker processes. Runs without the libtest harness because
//! every worker is a copy of this executable and must reach
//! [`cohort::bootstrap`] before anything else.
use std::process::ExitCode;

use anyhow::{ensure, Context, Result};
use cohort::{
    config::{Config, Runtime},
    executor::{BulkExecutor, BulkFunction, BulkTwoWayFunction, Constant, GROUP_FAILED},
    message::Invoke,
    process::ProcessGroup,
    remote::RemoteRef,
    Error,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Multiply {
    a: u64,
    b: u64,
}

impl Invoke for Multiply {
    type Output = u64;

    fn invoke(self) -> anyhow::Result<u64> {
        Ok(self.a * self.b)
    }
}

#[derive(Serialize, Deserialize)]
struct SetOnRoot {
    value: u64,
    fail_on: Option<usize>,
}

impl BulkTwoWayFunction<u64, i32> for SetOnRoot {
    fn call(
        &self,
        pe: usize,
        result: RemoteRef<'_, u64>,
        shared: RemoteRef<'_, i32>,
    ) -> anyhow::Result<()> {
        ensure!(shared.get()? == 13, "wrong shared value on PE {pe}");
        ensure!(self.fail_on != Some(pe), "PE {pe} refused");
        if pe == 0 {
            result.set(self.value)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Hello;

impl BulkFunction<i32> for Hello {
    fn call(&self, pe: usize, shared: RemoteRef<'_, i32>) -> anyhow::Result<()> {
        ensure!(shared.get()? == 13);
        println!("hello world from PE {pe}");
        Ok(())
    }
}

fn executor() -> BulkExecutor {
    BulkExecutor::from_config(&Config {
        launcher: env!("CARGO_BIN_EXE_cohort-run").into(),
        runtime: Runtime::Process,
        result_port: 0,
        ..Default::default()
    })
}

fn two_way_spawn_delivers_over_a_pipe() -> Result<()> {
    let processes = ProcessGroup::default();
    let future = processes.spawn_two_way("/usr/bin/env", std::iter::empty::<&str>(), Multiply { a: 6, b: 7 })?;

    ensure!(future.get()? == 42);
    ensure!(processes.wait_all()?.iter().all(|status| status.success()));
    Ok(())
}

fn bulk_two_way_delivers_the_result() -> Result<()> {
    let executor = executor();
    let future = executor.bulk_execute_two_way(
        SetOnRoot {
            value: 7,
            fail_on: None,
        },
        2,
        Constant(0u64),
        Constant(13),
    )?;

    ensure!(future.get()? == 7);
    executor.wait()?;
    Ok(())
}

fn bulk_two_way_reports_group_failure() -> Result<()> {
    let executor = executor();
    let future = executor.bulk_execute_two_way(
        SetOnRoot {
            value: 7,
            fail_on: Some(1),
        },
        2,
        Constant(0u64),
        Constant(13),
    )?;

    match future.get() {
        Err(Error::InterprocessFailure(description)) if description == GROUP_FAILED => {}
        other => anyhow::bail!("expected a group failure, got {other:?}"),
    }
    executor.wait()?;
    Ok(())
}

fn waiting_on_another_thread_keeps_the_future_alive() -> Result<()> {
    let executor = executor();
    let future = executor.bulk_execute_two_way(
        SetOnRoot {
            value: 9,
            fail_on: None,
        },
        2,
        Constant(0u64),
        Constant(13),
    )?;

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| executor.wait());
        ensure!(future.get()? == 9);
        waiter
            .join()
            .map_err(|_| anyhow::anyhow!("waiting thread panicked"))??;
        Ok(())
    })
}

fn bulk_one_way_runs_to_completion() -> Result<()> {
    let executor = executor();
    executor.bulk_execute(Hello, 2, Constant(13))?;
    executor.wait()?;
    Ok(())
}

fn main() -> ExitCode {
    cohort::bootstrap();
    cohort::init::tracing();

    let tests: [(&str, fn() -> Result<()>); 5] = [
        ("two_way_spawn_delivers_over_a_pipe", two_way_spawn_delivers_over_a_pipe),
        ("bulk_two_way_delivers_the_result", bulk_two_way_delivers_the_result),
        ("bulk_two_way_reports_group_failure", bulk_two_way_reports_group_failure),
        (
            "waiting_on_another_thread_keeps_the_future_alive",
            waiting_on_another_thread_keeps_the_future_alive,
        ),
        ("bulk_one_way_runs_to_completion", bulk_one_way_runs_to_completion),
    ];

    let mut failed = 0;
    for (name, test) in tests {
        match test().with_context(|| name.to_string()) {
            Ok(()) => println!("test {name} ... ok"),
            Err(err) => {
                println!("test {name} ... FAILED: {err:#}");
                failed += 1;
            }
        }
    }

    println!("{} passed; {failed} failed", tests.len() - failed);
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
