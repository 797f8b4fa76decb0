// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch mode end to end: spawning real fixture executables and
//! aggregating their event streams.

use crucible_runner::{
    file_runner::{FileRunnerOptions, TestCommand, run_test_files},
    reporter::TestEventKind,
    runner::RunSummary,
};
use integration_tests::EventLog;
use pretty_assertions::assert_eq;
use std::{collections::BTreeSet, process::Command, time::Duration};

fn passing() -> TestCommand {
    TestCommand::new(env!("CARGO_BIN_EXE_passing-suite"))
}

fn mixed() -> TestCommand {
    TestCommand::new(env!("CARGO_BIN_EXE_mixed-suite"))
}

fn stalling() -> TestCommand {
    TestCommand::new(env!("CARGO_BIN_EXE_stalling-suite"))
}

fn aborting() -> TestCommand {
    TestCommand::new(env!("CARGO_BIN_EXE_aborting-file"))
}

fn garbage() -> TestCommand {
    TestCommand::new(env!("CARGO_BIN_EXE_garbage-events"))
}

fn run(commands: &[TestCommand], options: &FileRunnerOptions) -> (EventLog, RunSummary) {
    let mut log = EventLog::new();
    let summary =
        run_test_files(commands, &mut log, options).expect("in-memory reporting cannot fail");
    (log, summary)
}

#[test]
fn aggregates_across_files() {
    let (log, summary) = run(&[passing(), mixed()], &FileRunnerOptions::default());

    assert_eq!(summary.passed, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed_files, 0);
    assert_eq!(summary.total(), 6);
    assert!(!summary.success());

    let passing_path = env!("CARGO_BIN_EXE_passing-suite");
    let mixed_path = env!("CARGO_BIN_EXE_mixed-suite");
    assert_eq!(
        log.lines(),
        [
            "started_run".to_owned(),
            format!("started_file {passing_path}"),
            "started_suite greetings".to_owned(),
            "started_test greetings > builds the greeting".to_owned(),
            "passed_test greetings > builds the greeting".to_owned(),
            "started_test greetings > counts the letters".to_owned(),
            "passed_test greetings > counts the letters".to_owned(),
            "ended_suite greetings".to_owned(),
            format!("ended_file {passing_path}"),
            format!("started_file {mixed_path}"),
            "started_suite arithmetic".to_owned(),
            "started_test arithmetic > adds".to_owned(),
            "passed_test arithmetic > adds".to_owned(),
            "started_test arithmetic > overflows".to_owned(),
            "failed_test arithmetic > overflows [attempt to add with overflow]".to_owned(),
            "started_suite arithmetic > edge cases".to_owned(),
            "started_test arithmetic > edge cases > wraps on max".to_owned(),
            "passed_test arithmetic > edge cases > wraps on max".to_owned(),
            "ended_suite arithmetic > edge cases".to_owned(),
            "ended_suite arithmetic".to_owned(),
            "started_suite io".to_owned(),
            "started_test io > fetches".to_owned(),
            "skipped_test io > fetches [network access is flaky in CI]".to_owned(),
            "ended_suite io".to_owned(),
            format!("ended_file {mixed_path}"),
            "ended_run".to_owned(),
        ]
    );
}

#[test]
fn output_travels_across_the_wire() {
    let (log, _) = run(&[mixed()], &FileRunnerOptions::default());

    let adds = log
        .events
        .iter()
        .find_map(|event| match event {
            TestEventKind::PassedTest { test, output, .. } if test.name == "adds" => {
                Some(output.clone())
            }
            _ => None,
        })
        .expect("adds passed");
    assert_eq!(adds.stdout, "computing 2 + 2\n");

    let overflows = log
        .events
        .iter()
        .find_map(|event| match event {
            TestEventKind::FailedTest { test, output, .. } if test.name == "overflows" => {
                Some(output.clone())
            }
            _ => None,
        })
        .expect("overflows failed");
    assert!(
        String::from_utf8_lossy(&overflows.stderr).contains("this one is broken"),
        "stderr: {:?}",
        overflows.stderr
    );
}

#[test]
fn remaps_uids_into_per_file_blocks() {
    // The same binary twice: both children allocate the same local uids,
    // so distinct aggregated ids prove the per-file remapping.
    let (log, summary) = run(&[passing(), passing()], &FileRunnerOptions::default());
    assert_eq!(summary.passed, 4);

    let mut ids = BTreeSet::new();
    let mut blocks = BTreeSet::new();
    for event in &log.events {
        if let TestEventKind::PassedTest { test, .. } = event {
            ids.insert(test.id);
            blocks.insert(test.id >> 32);
        }
    }
    assert_eq!(ids.len(), 4);
    assert_eq!(blocks.len(), 2);
}

#[test]
fn files_continue_after_in_band_timeouts() {
    let options = FileRunnerOptions {
        timeout: Some(Duration::from_millis(500)),
    };
    let (log, summary) = run(&[stalling()], &options);

    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_files, 0);

    let lines = log.lines();
    let stalled = lines
        .iter()
        .position(|l| l == "failed_test stalling > stalls forever [Timed out after 500 ms]")
        .expect("timeout reported in band");
    let finished = lines
        .iter()
        .position(|l| l == "passed_test stalling > finishes instantly")
        .expect("file kept going after the timeout");
    assert!(stalled < finished);
    assert!(lines.iter().any(|l| l.starts_with("ended_file")));
}

#[test]
fn crashed_files_are_reported_whole() {
    let (log, summary) = run(&[aborting()], &FileRunnerOptions::default());

    assert_eq!(summary.failed_files, 1);
    assert_eq!(summary.total(), 0);
    assert!(!summary.success());

    let message = failed_file_message(&log);
    #[cfg(unix)]
    assert_eq!(message, "Aborted with signal 6 (SIGABRT)");
    #[cfg(windows)]
    assert!(message.starts_with("Exited with status"), "message: {message}");

    // A failed file gets no clean ending event.
    assert!(log.lines().iter().all(|l| !l.starts_with("ended_file")));
}

#[test]
fn corrupt_event_streams_fail_the_file() {
    let (log, summary) = run(&[garbage()], &FileRunnerOptions::default());

    assert_eq!(summary.failed_files, 1);
    let message = failed_file_message(&log);
    assert!(message.contains("invalid byte"), "message: {message}");
}

#[test]
fn unspawnable_files_are_reported() {
    let missing = TestCommand::new("/nonexistent/crucible-fixture");
    let (log, summary) = run(&[missing], &FileRunnerOptions::default());

    assert_eq!(summary.failed_files, 1);
    let message = failed_file_message(&log);
    assert!(
        message.starts_with("spawning test file failed: "),
        "message: {message}"
    );
}

#[test]
fn direct_runs_exit_by_outcome() {
    let ok = Command::new(env!("CARGO_BIN_EXE_passing-suite"))
        .output()
        .expect("ran fixture");
    assert_eq!(ok.status.code(), Some(0));
    assert!(
        String::from_utf8_lossy(&ok.stdout).contains("ok   greetings > builds the greeting"),
        "stdout: {:?}",
        ok.stdout
    );

    let bad = Command::new(env!("CARGO_BIN_EXE_mixed-suite"))
        .output()
        .expect("ran fixture");
    assert_eq!(bad.status.code(), Some(1));
    assert!(
        String::from_utf8_lossy(&bad.stdout)
            .contains("FAIL arithmetic > overflows: attempt to add with overflow"),
        "stdout: {:?}",
        bad.stdout
    );
}

fn failed_file_message(log: &EventLog) -> String {
    log.events
        .iter()
        .find_map(|event| match event {
            TestEventKind::FailedFile { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("a file failed")
}
