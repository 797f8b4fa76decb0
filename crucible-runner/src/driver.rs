// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The entry point a test executable's `main` hands control to.
//!
//! [`drive_tests`] inspects the environment to decide what kind of process
//! it is running in. Under the batch file runner it becomes a child that
//! reports over an inherited pipe; on Windows a relaunched single-test
//! child runs exactly one test and reports through its exit status. In the
//! ordinary case it drives the configured number of runs against the
//! caller's reporter and turns the tally into an exit code.

use crate::{
    errors::ReportError,
    filter::FilterSet,
    protocol::EventWriter,
    reporter::TestReporter,
    runner::{ForkedRunner, InlineRunner, RunSummary, TestRunner, run_tests},
    suite::CompiledSuite,
};
use std::{env, fs::File, process::ExitCode, time::Duration};
use tracing::debug;

/// The exit codes test processes use to communicate outcomes.
pub mod exit_code {
    /// Everything ran and passed.
    pub const SUCCESS: i32 = 0;

    /// At least one test failed.
    pub const FAILURE: i32 = 1;

    /// Reserved for timed-out units. Timeouts are normally reported
    /// in-band, but the code stays part of the contract.
    pub const TIMEOUT: i32 = 32;

    /// The framework itself failed inside a child process.
    pub const FATAL: i32 = 71;
}

/// Environment variable carrying the event pipe for a batch child.
///
/// On Unix the value is a file descriptor number; on Windows it is the raw
/// handle value. Set by the file runner, honored by [`drive_tests`].
pub const CRUCIBLE_EVENTS_FD: &str = "CRUCIBLE_EVENTS_FD";

/// Environment variable overriding the per-test timeout, in milliseconds,
/// for a batch child.
pub const CRUCIBLE_TIMEOUT_MS: &str = "CRUCIBLE_TIMEOUT_MS";

/// Environment variable selecting single-test mode: the uid of the one
/// test to run. Used on Windows, where test isolation relaunches the
/// executable instead of forking.
pub const CRUCIBLE_TEST_UID: &str = "CRUCIBLE_TEST_UID";

/// Environment variable carrying the raw handle a single-test child writes
/// its result record to.
pub const CRUCIBLE_RESULT_HANDLE: &str = "CRUCIBLE_RESULT_HANDLE";

/// Configuration for [`drive_tests`].
#[derive(Clone, Debug)]
pub struct DriverOptions {
    /// Wall-clock limit per test. `None` arms no deadline.
    pub timeout: Option<Duration>,
    /// How many times to run the whole suite tree.
    pub runs: usize,
    /// Whether each test gets its own process. Disabling this runs test
    /// bodies inline, with no capture, crash containment, or timeouts.
    pub isolate: bool,
    /// Which tests to run.
    pub filter: FilterSet,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            runs: 1,
            isolate: true,
            filter: FilterSet::new(),
        }
    }
}

/// Runs the suites and returns the process exit code.
///
/// Intended to be the last call in a test executable's `main`:
///
/// ```no_run
/// use crucible_runner::driver::{DriverOptions, drive_tests};
/// use crucible_runner::reporter::TestReporter;
/// use crucible_runner::suite::suite;
/// use std::process::ExitCode;
///
/// struct QuietReporter;
/// impl TestReporter for QuietReporter {}
///
/// fn main() -> ExitCode {
///     let suites = [suite("math", |b| {
///         b.test("adds", |_| assert_eq!(2 + 2, 4));
///     })];
///     drive_tests(&suites, &mut QuietReporter, &DriverOptions::default())
/// }
/// ```
///
/// Suites must be built the same way on every invocation of the
/// executable: batch children and single-test children rely on test uids
/// being stable across processes, which declaration-order allocation
/// guarantees as long as suite construction is deterministic.
pub fn drive_tests(
    suites: &[CompiledSuite],
    reporter: &mut dyn TestReporter,
    options: &DriverOptions,
) -> ExitCode {
    #[cfg(windows)]
    {
        if let Ok(uid) = env::var(CRUCIBLE_TEST_UID) {
            return single_test_child(suites, &uid);
        }
    }

    if let Ok(value) = env::var(CRUCIBLE_EVENTS_FD) {
        let Some(events) = events_file(&value) else {
            return exit(exit_code::FATAL);
        };
        return batch_child(suites, events, options);
    }

    match run_repeatedly(suites, reporter, options) {
        Ok(totals) if totals.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(_) => exit(exit_code::FATAL),
    }
}

fn run_repeatedly(
    suites: &[CompiledSuite],
    reporter: &mut dyn TestReporter,
    options: &DriverOptions,
) -> Result<RunSummary, ReportError> {
    debug!(runs = options.runs, isolate = options.isolate, "driving test run");

    let forked;
    let inline;
    let runner: &dyn TestRunner = if options.isolate {
        forked = forked_runner(options.timeout);
        &forked
    } else {
        inline = InlineRunner::new();
        &inline
    };

    let mut totals = RunSummary::default();
    for _ in 0..options.runs {
        let summary = run_tests(suites, reporter, runner, &options.filter)?;
        totals.merge(&summary);
    }
    Ok(totals)
}

/// The batch-child half of the file runner handshake: report everything
/// over the inherited pipe and exit successfully. Results travel in-band;
/// only a broken pipe makes the process itself fail.
fn batch_child(suites: &[CompiledSuite], events: File, options: &DriverOptions) -> ExitCode {
    debug!("reporting to an inherited event pipe");
    let timeout = env::var(CRUCIBLE_TIMEOUT_MS)
        .ok()
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis)
        .or(options.timeout);

    let runner = forked_runner(timeout);
    let mut writer = EventWriter::new(events);
    match run_tests(suites, &mut writer, &runner, &options.filter) {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => exit(exit_code::FATAL),
    }
}

fn forked_runner(timeout: Option<Duration>) -> ForkedRunner {
    match timeout {
        Some(timeout) => ForkedRunner::with_timeout(timeout),
        None => ForkedRunner::new(),
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

/// Reopens the event pipe a batch parent left in our environment.
#[cfg(unix)]
fn events_file(value: &str) -> Option<File> {
    use std::os::fd::{FromRawFd, RawFd};

    let fd: RawFd = value.parse().ok()?;
    unsafe {
        // Keep the pipe out of anything the tests themselves spawn.
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return None;
        }
        Some(File::from_raw_fd(fd))
    }
}

#[cfg(windows)]
fn events_file(value: &str) -> Option<File> {
    use std::os::windows::io::{FromRawHandle, RawHandle};

    let raw: usize = value.parse().ok()?;
    Some(unsafe { File::from_raw_handle(raw as RawHandle) })
}

/// Runs the one test named in the environment and reports through the
/// inherited result handle plus the exit code.
#[cfg(windows)]
fn single_test_child(suites: &[CompiledSuite], uid_value: &str) -> ExitCode {
    use crate::{protocol::write_result_record, suite::find_test, test_name::TestUid};
    use std::os::windows::io::{FromRawHandle, RawHandle};

    let Ok(uid) = uid_value.parse::<TestUid>() else {
        return exit(exit_code::FATAL);
    };
    let Some(test) = find_test(suites, uid) else {
        return exit(exit_code::FATAL);
    };
    let Some(raw) = env::var(CRUCIBLE_RESULT_HANDLE)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    else {
        return exit(exit_code::FATAL);
    };
    let mut result = unsafe { File::from_raw_handle(raw as RawHandle) };

    let verdict = test.call();
    if write_result_record(&mut result, verdict.message().unwrap_or("")).is_err() {
        return exit(exit_code::FATAL);
    }
    if verdict.is_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reporter::{TestEventKind, test_helpers::RecordingReporter},
        suite::suite,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn default_options() {
        let options = DriverOptions::default();
        assert_eq!(options.timeout, None);
        assert_eq!(options.runs, 1);
        assert!(options.isolate);
    }

    #[test]
    fn repeated_runs_accumulate() {
        let suites = [suite("counting", |b| {
            b.test("up", |_| {});
            b.test("down", |_| panic!("fell over"));
        })];
        let options = DriverOptions {
            runs: 3,
            isolate: false,
            ..DriverOptions::default()
        };

        let mut reporter = RecordingReporter::new();
        let totals = run_repeatedly(&suites, &mut reporter, &options).unwrap();

        assert_eq!(totals.passed, 3);
        assert_eq!(totals.failed, 3);
        assert!(!totals.success());
        let run_starts = reporter
            .events
            .iter()
            .filter(|event| matches!(event, TestEventKind::StartedRun))
            .count();
        assert_eq!(run_starts, 3);
    }

    #[test]
    fn zero_runs_do_nothing() {
        let suites = [suite("idle", |b| {
            b.test("never", |_| panic!("unreachable"));
        })];
        let options = DriverOptions {
            runs: 0,
            isolate: false,
            ..DriverOptions::default()
        };

        let mut reporter = RecordingReporter::new();
        let totals = run_repeatedly(&suites, &mut reporter, &options).unwrap();
        assert_eq!(totals, RunSummary::default());
        assert_eq!(reporter.events, vec![]);
    }
}
