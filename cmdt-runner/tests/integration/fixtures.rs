// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use cmdt_runner::{
    OutputMux,
    config::MuxConfig,
    format::{PlainFormatter, SuiteStats, TestOutcome, TestResult},
};
use color_eyre::eyre::Result;
use std::{sync::Arc, time::Duration};
use swrite::{SWrite, swrite};

pub(crate) fn config(work_dir: &Utf8Path) -> MuxConfig {
    MuxConfig::builder("integration")
        .isolation("worker-0")
        .work_dir(work_dir)
        .flush_poll_interval(Duration::from_millis(1))
        .tail_poll_interval(Duration::from_millis(5))
        .stall_timeout(Duration::from_secs(30))
        .default_timeout(Duration::from_secs(30))
        .build()
        .expect("valid config")
}

pub(crate) fn file_mux(config: &MuxConfig) -> OutputMux {
    OutputMux::with_file_store(config.clone(), Arc::new(PlainFormatter::new()))
        .expect("created namespace dir")
}

/// Runs a suite whose tests finish in `finish_order`, each as its own task.
///
/// Test `seq` sleeps for a time proportional to its position in `finish_order`, so the tests
/// end in exactly that order.
pub(crate) async fn run_suite(mux: &OutputMux, suite: &str, finish_order: &[u32]) -> Result<()> {
    mux.open_suite(suite, Some(&format!("== {suite}\n")))?;

    let mut tasks = Vec::new();
    for (position, &seq) in finish_order.iter().enumerate() {
        let mux = mux.clone();
        let suite = suite.to_owned();
        tasks.push(tokio::spawn(async move {
            let session = mux.open(&suite, seq)?;
            session.title(&format!("test-{seq}"))?;
            session.stdout(format!("{suite}/{seq} out\n"))?;
            tokio::time::sleep(Duration::from_millis(5 * position as u64)).await;
            session.stderr(format!("{suite}/{seq} err\n"))?;
            session.outcome(&TestOutcome::new(TestResult::Passed, Duration::ZERO))?;
            mux.close(&suite, seq)?;
            Ok::<_, color_eyre::Report>(TestResult::Passed)
        }));
    }

    let mut stats = SuiteStats::new();
    for task in tasks {
        stats.record(task.await??);
    }
    let mut report = stats.report();
    report.elapsed = Duration::ZERO;
    mux.report_suite(suite, &report)?;
    Ok(())
}

/// The lines a suite is expected to produce on stdout, in order.
pub(crate) fn expected_stdout(suite: &str, count: u32) -> String {
    let mut expected = format!("== {suite}\n");
    for seq in 1..=count {
        swrite!(
            expected,
            "       START {suite} #{seq} test-{seq}\n\
             {suite}/{seq} out\n\
             \x20       PASS [   0.000s] {suite} #{seq} test-{seq}\n"
        );
    }
    swrite!(
        expected,
        "------------\n     Summary [   0.000s] {count} {} run in {suite}: {count} passed, 0 ignored\n",
        cmdt_runner::plural::tests_str(count as usize),
    );
    expected
}

pub(crate) fn expected_stderr(suite: &str, count: u32) -> String {
    (1..=count)
        .map(|seq| format!("{suite}/{seq} err\n"))
        .collect()
}
