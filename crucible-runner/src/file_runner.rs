// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch mode: running whole test executables and aggregating their events.
//!
//! Each command is spawned with the write end of an event pipe and reports
//! its run over the wire protocol. This runner brackets every executable
//! with `started_file`/`ended_file`, remaps test uids into a per-file block
//! so ids from different files never collide, and turns crashes, bad exits,
//! and malformed streams into `failed_file` events.
//!
//! Files run strictly one at a time; a file is fully read and reaped before
//! the next is spawned. There is no per-file deadline. The per-test timeout
//! travels to each child through the environment and is enforced by the
//! child's own forked runner.

use crate::{
    driver::{CRUCIBLE_EVENTS_FD, CRUCIBLE_TIMEOUT_MS},
    errors::{ProtocolError, ReportError, RunTestError},
    helpers::display_exited_with,
    protocol::read_file_events,
    reporter::{FileReporter, TestOutput, TestReporter},
    runner::RunSummary,
    test_name::{FileUidMaker, SuiteName, TestFile, TestName},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    io::{self, BufReader, PipeWriter},
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use tracing::{debug, warn};

/// One test executable to run in batch mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCommand {
    program: Utf8PathBuf,
    args: Vec<String>,
}

impl TestCommand {
    /// Creates a command running `program` with no arguments.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The executable to run.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The arguments passed to the executable.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Options for a batch run.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileRunnerOptions {
    /// Per-test timeout handed down to each file's forked runner.
    pub timeout: Option<Duration>,
}

/// Runs every command in order, forwarding the aggregated event stream to
/// `reporter`.
///
/// The returned summary tallies individual test outcomes decoded from the
/// children alongside whole-file failures. Reporter errors abort the run;
/// everything that goes wrong with a child is contained to its file.
pub fn run_test_files(
    commands: &[TestCommand],
    reporter: &mut dyn FileReporter,
    options: &FileRunnerOptions,
) -> Result<RunSummary, ReportError> {
    let mut uids = FileUidMaker::new();
    let mut tally = TallyReporter {
        inner: reporter,
        summary: RunSummary::default(),
    };

    tally.started_run()?;
    for command in commands {
        let file = TestFile {
            id: uids.make_file_uid(),
            path: command.program().to_owned(),
        };
        debug!(file = %file.path, "running test file");
        tally.started_file(&file)?;
        run_one_file(command, &file, options, &mut tally)?;
    }
    tally.ended_run()?;
    Ok(tally.summary)
}

fn run_one_file(
    command: &TestCommand,
    file: &TestFile,
    options: &FileRunnerOptions,
    tally: &mut TallyReporter<'_>,
) -> Result<(), ReportError> {
    let pipe = io::pipe().map_err(|error| RunTestError::new("creating the event pipe", error));
    let (events_read, events_write) = match pipe {
        Ok(pair) => pair,
        Err(error) => return fail_file(tally, file, &error.to_string()),
    };

    let spawned = spawn_file_child(command, &events_write, options.timeout)
        .map_err(|error| RunTestError::new("spawning test file", error));
    // Close our copy so the stream ends when the child exits.
    drop(events_write);
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => return fail_file(tally, file, &error.to_string()),
    };

    let health = read_file_events(BufReader::new(events_read), file, tally)?;

    let status = match child.wait() {
        Ok(status) => status,
        Err(error) => {
            let error = RunTestError::new("waiting for test file", error);
            return fail_file(tally, file, &error.to_string());
        }
    };

    match file_failure(status, health) {
        Some(message) => fail_file(tally, file, &message),
        None => tally.ended_file(file),
    }
}

/// Decides whether the file as a whole failed, and with what message.
///
/// An abnormal exit outranks a malformed stream: a crashing child usually
/// truncates its last record, and the crash is the story worth telling.
fn file_failure(status: ExitStatus, health: Result<(), ProtocolError>) -> Option<String> {
    if !status.success() {
        return Some(display_exited_with(status));
    }
    health.err().map(|error| error.to_string())
}

fn fail_file(
    tally: &mut TallyReporter<'_>,
    file: &TestFile,
    message: &str,
) -> Result<(), ReportError> {
    warn!(file = %file.path, message, "test file failed");
    tally.failed_file(file, message)
}

fn spawn_file_child(
    command: &TestCommand,
    events_write: &PipeWriter,
    timeout: Option<Duration>,
) -> io::Result<Child> {
    let mut cmd = Command::new(command.program());
    cmd.args(command.args()).stdin(Stdio::null());
    if let Some(timeout) = timeout {
        cmd.env(CRUCIBLE_TIMEOUT_MS, timeout.as_millis().to_string());
    }
    configure_events_handle(&mut cmd, events_write)?;
    cmd.spawn()
}

/// Arranges for the pipe's write end to survive into the child and tells
/// the child where to find it.
#[cfg(unix)]
fn configure_events_handle(cmd: &mut Command, events_write: &PipeWriter) -> io::Result<()> {
    use std::os::{fd::AsRawFd, unix::process::CommandExt};

    let raw = events_write.as_raw_fd();
    cmd.env(CRUCIBLE_EVENTS_FD, raw.to_string());
    unsafe {
        cmd.pre_exec(move || {
            // Pipe fds are close-on-exec; this child must keep this one.
            let flags = libc::fcntl(raw, libc::F_GETFD);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

/// On Windows the child receives the raw handle value rather than a
/// descriptor number.
#[cfg(windows)]
fn configure_events_handle(cmd: &mut Command, events_write: &PipeWriter) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{HANDLE_FLAG_INHERIT, SetHandleInformation};

    let raw = events_write.as_raw_handle();
    if unsafe { SetHandleInformation(raw as _, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) } == 0 {
        return Err(io::Error::last_os_error());
    }
    cmd.env(CRUCIBLE_EVENTS_FD, (raw as usize).to_string());
    Ok(())
}

/// Forwards events to the caller's reporter while tallying outcomes, so
/// batch runs produce the same summary shape as in-process runs.
struct TallyReporter<'a> {
    inner: &'a mut dyn FileReporter,
    summary: RunSummary,
}

impl TestReporter for TallyReporter<'_> {
    fn started_run(&mut self) -> Result<(), ReportError> {
        self.inner.started_run()
    }

    fn ended_run(&mut self) -> Result<(), ReportError> {
        self.inner.ended_run()
    }

    fn started_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.inner.started_suite(suites)
    }

    fn ended_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.inner.ended_suite(suites)
    }

    fn started_test(&mut self, test: &TestName) -> Result<(), ReportError> {
        self.inner.started_test(test)
    }

    fn passed_test(
        &mut self,
        test: &TestName,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.summary.passed += 1;
        self.inner.passed_test(test, output, duration)
    }

    fn failed_test(
        &mut self,
        test: &TestName,
        message: &str,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.summary.failed += 1;
        self.inner.failed_test(test, message, output, duration)
    }

    fn skipped_test(&mut self, test: &TestName, message: &str) -> Result<(), ReportError> {
        self.summary.skipped += 1;
        self.inner.skipped_test(test, message)
    }
}

impl FileReporter for TallyReporter<'_> {
    fn started_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.inner.started_file(file)
    }

    fn ended_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.inner.ended_file(file)
    }

    fn failed_file(&mut self, file: &TestFile, message: &str) -> Result<(), ReportError> {
        self.summary.failed_files += 1;
        self.inner.failed_file(file, message)
    }
}
