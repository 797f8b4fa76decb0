// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process isolation on Windows.
//!
//! There is no fork here: the runner relaunches its own executable with an
//! environment variable naming the one test to run. The child rebuilds the
//! suites, finds the test by uid, runs it inline, writes the failure record
//! to an inherited pipe handle, and encodes the verdict in its exit code.
//! A job object groups the child with anything it spawns so a timeout can
//! take the whole tree down at once.

use crate::{
    driver::{CRUCIBLE_RESULT_HANDLE, CRUCIBLE_TEST_UID, exit_code},
    errors::RunTestError,
    protocol::read_result_record,
    reporter::TestOutput,
    suite::{TestInfo, TestVerdict},
};
use std::{
    io::{self, Read},
    os::windows::io::AsRawHandle,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;
use win32job::Job;
use windows_sys::Win32::{
    Foundation::{HANDLE_FLAG_INHERIT, SetHandleInformation},
    System::JobObjects::TerminateJobObject,
};

pub(super) fn run_isolated(
    test: &TestInfo,
    output: &mut TestOutput,
    timeout: Option<Duration>,
) -> Result<TestVerdict, RunTestError> {
    let exe = std::env::current_exe()
        .map_err(|error| RunTestError::new("locating the test executable", error))?;

    let (result_read, result_write) =
        io::pipe().map_err(|error| RunTestError::new("creating pipes", error))?;

    // Anonymous pipe handles are not inheritable by default, and the child
    // needs the write end.
    let raw_result = result_write.as_raw_handle();
    if unsafe { SetHandleInformation(raw_result as _, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) }
        == 0
    {
        return Err(RunTestError::new(
            "marking the result handle inheritable",
            io::Error::last_os_error(),
        ));
    }

    let mut child = Command::new(exe)
        .env(CRUCIBLE_TEST_UID, test.id().to_string())
        .env(CRUCIBLE_RESULT_HANDLE, (raw_result as usize).to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| RunTestError::new("spawning test process", error))?;
    // Close our copy so the reader sees end-of-file once the child exits.
    drop(result_write);

    // Best effort; without a job a timeout still kills the direct child.
    let job = Job::create().ok();
    if let Some(job) = &job {
        let _ = job.assign_process(child.as_raw_handle() as isize);
    }

    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_thread = thread::spawn(move || read_all(stdout_pipe));
    let stderr_thread = thread::spawn(move || read_all(stderr_pipe));
    let result_thread = thread::spawn(move || read_all(result_read));

    let deadline = timeout.map(|t| Instant::now() + t);
    let (status, timed_out) = wait_with_deadline(&mut child, job.as_ref(), deadline)
        .map_err(|error| RunTestError::new("waiting for test process", error))?;

    // Sweep everything left in the job, timeout or not, so no grandchild
    // outlives the test.
    terminate_job(job.as_ref());

    output.stdout = stdout_thread.join().unwrap_or_default().into();
    output.stderr = stderr_thread.join().unwrap_or_default().into();
    let message_buf = result_thread.join().unwrap_or_default();

    if timed_out {
        let timeout = timeout.expect("a hit deadline implies a configured timeout");
        return Ok(TestVerdict::failed(format!(
            "Timed out after {} ms",
            timeout.as_millis()
        )));
    }

    let record = read_result_record(message_buf.as_slice()).ok().flatten();
    Ok(decode_status(status, record))
}

fn decode_status(status: ExitStatus, record: Option<String>) -> TestVerdict {
    match status.code() {
        Some(exit_code::SUCCESS) => TestVerdict::passed(),
        Some(exit_code::FAILURE) => TestVerdict::failed(record.unwrap_or_default()),
        Some(exit_code::FATAL) => TestVerdict::failed(
            record
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "fatal internal framework error".to_owned()),
        ),
        Some(other) => TestVerdict::failed(
            record
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("Exited with status {other}")),
        ),
        None => TestVerdict::failed("Exited with an unknown error".to_owned()),
    }
}

fn read_all(mut source: impl Read) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = source.read_to_end(&mut buf);
    buf
}

/// Waits for the child, polling against the deadline if one is set. On
/// expiry the child's job is terminated and the wait completes; the second
/// tuple element says whether that happened.
fn wait_with_deadline(
    child: &mut Child,
    job: Option<&Job>,
    deadline: Option<Instant>,
) -> io::Result<(ExitStatus, bool)> {
    let Some(deadline) = deadline else {
        return Ok((child.wait()?, false));
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        let now = Instant::now();
        if now >= deadline {
            debug!("test deadline expired, terminating job");
            terminate_job(job);
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((status, true));
        }
        thread::sleep(deadline.duration_since(now).min(Duration::from_millis(10)));
    }
}

fn terminate_job(job: Option<&Job>) {
    if let Some(job) = job {
        let handle = job.handle();
        unsafe {
            // Note: 1 is the exit code the killed processes report.
            _ = TerminateJobObject(handle as _, 1);
        }
    }
}
