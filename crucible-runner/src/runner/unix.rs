// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fork-based test isolation.
//!
//! Each test forks a child that puts itself in a fresh process group,
//! redirects its standard streams into pipes, runs the body, and reports
//! the verdict through a result pipe plus its exit code. The parent drains
//! the pipes with `pselect`, enforces the deadline, and sweeps the whole
//! process group with SIGKILL afterwards so no grandchild outlives the
//! test.
//!
//! SIGCHLD stays blocked in the parent except inside `pselect` itself.
//! The child can therefore never die "between" a readiness check and a
//! blocking read; its exit either interrupts `pselect` or is observed as
//! end-of-file on the pipes.

use crate::{
    driver::exit_code,
    errors::RunTestError,
    helpers::{display_signal, nix_to_io},
    protocol::{read_result_record, write_result_record},
    reporter::TestOutput,
    signal::{self, ForwardGuard, MaskGuard},
    suite::{TestInfo, TestVerdict},
};
use nix::{
    sys::{
        signal::{Signal, killpg},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork, getpgrp, setpgid},
};
use std::{
    io::{self, PipeReader, PipeWriter, Read, Write},
    mem::MaybeUninit,
    os::fd::{AsRawFd, RawFd},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

pub(super) fn run_isolated(
    test: &TestInfo,
    output: &mut TestOutput,
    timeout: Option<Duration>,
) -> Result<TestVerdict, RunTestError> {
    debug_assert!(
        signal::forward_pgid().is_none(),
        "only one isolated test may run at a time"
    );

    let pipe_failed = |error| RunTestError::new("creating pipes", error);
    let (stdout_read, stdout_write) = io::pipe().map_err(pipe_failed)?;
    let (stderr_read, stderr_write) = io::pipe().map_err(pipe_failed)?;
    let (pgid_read, pgid_write) = io::pipe().map_err(pipe_failed)?;
    let (result_read, result_write) = io::pipe().map_err(pipe_failed)?;

    // Anything buffered now would otherwise be flushed by both processes.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    let mask = MaskGuard::block_fork_signals()
        .map_err(|error| RunTestError::new("blocking signals", error))?;

    match unsafe { fork() }.map_err(|errno| RunTestError::new("fork", nix_to_io(errno)))? {
        ForkResult::Child => {
            drop(stdout_read);
            drop(stderr_read);
            drop(pgid_read);
            drop(result_read);
            run_child(&mask, stdout_write, stderr_write, pgid_write, result_write, test)
        }
        ForkResult::Parent { child } => {
            drop(stdout_write);
            drop(stderr_write);
            drop(pgid_write);
            drop(result_write);
            run_parent(
                child,
                stdout_read,
                stderr_read,
                pgid_read,
                result_read,
                output,
                timeout,
                mask,
            )
        }
    }
}

/// The child half: never returns. Any setup failure exits with the fatal
/// code; the test's own verdict exits with success or failure.
fn run_child(
    mask: &MaskGuard,
    stdout_write: PipeWriter,
    stderr_write: PipeWriter,
    pgid_write: PipeWriter,
    result_write: PipeWriter,
    test: &TestInfo,
) -> ! {
    match child_body(mask, stdout_write, stderr_write, pgid_write, result_write, test) {
        Ok(code) => unsafe { libc::_exit(code) },
        Err(_) => unsafe { libc::_exit(exit_code::FATAL) },
    }
}

fn child_body(
    mask: &MaskGuard,
    stdout_write: PipeWriter,
    stderr_write: PipeWriter,
    mut pgid_write: PipeWriter,
    mut result_write: PipeWriter,
    test: &TestInfo,
) -> io::Result<i32> {
    mask.restore()?;

    redirect_fd(stdout_write.as_raw_fd(), libc::STDOUT_FILENO)?;
    redirect_fd(stderr_write.as_raw_fd(), libc::STDERR_FILENO)?;

    // A fresh process group lets the parent kill the test and all its
    // children in one stroke.
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(nix_to_io)?;
    pgid_write.write_all(&getpgrp().as_raw().to_ne_bytes())?;
    drop(pgid_write);

    let verdict = test.call();
    write_result_record(&mut result_write, verdict.message().unwrap_or(""))?;
    drop(result_write);

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    Ok(if verdict.is_passed() {
        exit_code::SUCCESS
    } else {
        exit_code::FAILURE
    })
}

fn redirect_fd(from: RawFd, to: libc::c_int) -> io::Result<()> {
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[expect(clippy::too_many_arguments)]
fn run_parent(
    child: Pid,
    stdout_read: PipeReader,
    stderr_read: PipeReader,
    mut pgid_read: PipeReader,
    result_read: PipeReader,
    output: &mut TestOutput,
    timeout: Option<Duration>,
    mask: MaskGuard,
) -> Result<TestVerdict, RunTestError> {
    let mut guard = ChildGuard::new(child);

    let mut raw_pgid = [0u8; 4];
    pgid_read
        .read_exact(&mut raw_pgid)
        .map_err(|error| RunTestError::new("receiving test process group", error))?;
    let pgid = Pid::from_raw(i32::from_ne_bytes(raw_pgid));
    guard.set_pgid(pgid);

    let forward = ForwardGuard::install(pgid)
        .map_err(|error| RunTestError::new("installing signal handlers", error))?;
    mask.unblock_interactive()
        .map_err(|error| RunTestError::new("unblocking signals", error))?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut message_buf = Vec::new();
    let mut targets = [
        ReadTarget::new(stdout_read.as_raw_fd(), &mut output.stdout),
        ReadTarget::new(stderr_read.as_raw_fd(), &mut output.stderr),
        ReadTarget::new(result_read.as_raw_fd(), &mut message_buf),
    ];
    let empty = empty_sigset();

    let read_failed = |error| RunTestError::new("reading test output", error);
    let mut timed_out = false;
    match read_into(&mut targets, deadline, Some(&empty)).map_err(read_failed)? {
        ReadOutcome::AllClosed => {}
        ReadOutcome::Interrupted => {
            // SIGCHLD fired inside pselect. One zero-timeout pass picks up
            // whatever the child wrote between our last read and its exit.
            drain_ready(&mut targets).map_err(read_failed)?;
        }
        ReadOutcome::TimedOut => {
            debug!(%pgid, "test deadline expired, killing process group");
            timed_out = true;
            let _ = killpg(pgid, Signal::SIGKILL);
            drain_ready(&mut targets).map_err(read_failed)?;
        }
    }

    let wait_deadline = if timed_out { None } else { deadline };
    let (status, deadline_hit) = wait_with_deadline(child, pgid, wait_deadline)
        .map_err(|error| RunTestError::new("waiting for test process", error))?;
    timed_out |= deadline_hit;

    // Sweep everything left in the test's process group. Orphans get
    // reparented to init; reaping them is not our concern.
    let _ = killpg(pgid, Signal::SIGKILL);
    guard.disarm();
    drop(forward);

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

fn decode_status(status: WaitStatus, record: Option<String>) -> TestVerdict {
    match status {
        WaitStatus::Exited(_, code) => match code {
            exit_code::SUCCESS => TestVerdict::passed(),
            exit_code::FAILURE => TestVerdict::failed(record.unwrap_or_default()),
            exit_code::FATAL => TestVerdict::failed(
                record
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "fatal internal framework error".to_owned()),
            ),
            other => TestVerdict::failed(
                record
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("Exited with status {other}")),
            ),
        },
        WaitStatus::Signaled(_, sig, _) => TestVerdict::failed(display_signal(sig as i32)),
        other => TestVerdict::failed(format!("unexpected wait status: {other:?}")),
    }
}

/// Kills the child (or its whole group, once known) if the parent bails
/// out before the normal kill-and-reap sequence.
struct ChildGuard {
    child: Pid,
    pgid: Option<Pid>,
    armed: bool,
}

impl ChildGuard {
    fn new(child: Pid) -> Self {
        Self {
            child,
            pgid: None,
            armed: true,
        }
    }

    fn set_pgid(&mut self, pgid: Pid) {
        self.pgid = Some(pgid);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.pgid {
            Some(pgid) => {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            None => {
                let _ = nix::sys::signal::kill(self.child, Signal::SIGKILL);
            }
        }
        let _ = waitpid(self.child, Some(WaitPidFlag::WNOHANG));
    }
}

struct ReadTarget<'a> {
    fd: RawFd,
    buf: &'a mut Vec<u8>,
    open: bool,
}

impl<'a> ReadTarget<'a> {
    fn new(fd: RawFd, buf: &'a mut Vec<u8>) -> Self {
        Self {
            fd,
            buf,
            open: true,
        }
    }
}

enum ReadOutcome {
    /// Every target has reached end-of-file.
    AllClosed,
    /// The deadline expired with targets still open.
    TimedOut,
    /// `pselect` was interrupted by a signal.
    Interrupted,
}

/// Reads from all open targets until end-of-file, the deadline, or a
/// signal.
///
/// `sigmask` is the signal mask to apply inside `pselect`; passing the
/// empty set unblocks SIGCHLD there and only there. With a deadline in the
/// past this degenerates to a non-blocking drain of whatever is ready.
fn read_into(
    targets: &mut [ReadTarget<'_>],
    deadline: Option<Instant>,
    sigmask: Option<&libc::sigset_t>,
) -> io::Result<ReadOutcome> {
    loop {
        let mut read_fds = unsafe {
            let mut set = MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(set.as_mut_ptr());
            set.assume_init()
        };
        let mut max_fd: RawFd = -1;
        for target in targets.iter() {
            if target.open {
                unsafe { libc::FD_SET(target.fd, &mut read_fds) };
                max_fd = max_fd.max(target.fd);
            }
        }
        if max_fd < 0 {
            return Ok(ReadOutcome::AllClosed);
        }

        let mut timeout_storage: libc::timespec = unsafe { std::mem::zeroed() };
        let timeout_ptr = match deadline {
            None => std::ptr::null(),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                timeout_storage.tv_sec = remaining.as_secs() as libc::time_t;
                timeout_storage.tv_nsec = libc::c_long::from(remaining.subsec_nanos());
                &raw const timeout_storage
            }
        };
        let sigmask_ptr = sigmask.map_or(std::ptr::null(), std::ptr::from_ref);

        let ready = unsafe {
            libc::pselect(
                max_fd + 1,
                &mut read_fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                timeout_ptr,
                sigmask_ptr,
            )
        };
        if ready < 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::EINTR) {
                return Ok(ReadOutcome::Interrupted);
            }
            return Err(error);
        }
        if ready == 0 {
            return Ok(ReadOutcome::TimedOut);
        }

        for target in targets.iter_mut() {
            if !target.open || !unsafe { libc::FD_ISSET(target.fd, &read_fds) } {
                continue;
            }
            let mut chunk = [0u8; 8192];
            let n = unsafe { libc::read(target.fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                target.open = false;
            } else {
                target.buf.extend_from_slice(&chunk[..n as usize]);
            }
        }
    }
}

/// One non-blocking sweep over whatever is already readable.
fn drain_ready(targets: &mut [ReadTarget<'_>]) -> io::Result<()> {
    read_into(targets, Some(Instant::now()), None).map(|_| ())
}

/// Waits for the child, polling against the deadline if one is set. On
/// expiry the child's group is killed and the wait completes; the second
/// tuple element says whether that happened.
fn wait_with_deadline(
    child: Pid,
    pgid: Pid,
    deadline: Option<Instant>,
) -> io::Result<(WaitStatus, bool)> {
    let Some(deadline) = deadline else {
        return Ok((waitpid(child, None).map_err(nix_to_io)?, false));
    };
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)).map_err(nix_to_io)? {
            WaitStatus::StillAlive => {
                let now = Instant::now();
                if now >= deadline {
                    debug!(%pgid, "test closed its pipes but outlived the deadline");
                    let _ = killpg(pgid, Signal::SIGKILL);
                    let status = waitpid(child, None).map_err(nix_to_io)?;
                    return Ok((status, true));
                }
                thread::sleep(deadline.duration_since(now).min(Duration::from_millis(10)));
            }
            status => return Ok((status, false)),
        }
    }
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_prefers_records_over_generic_messages() {
        let exited = |code| WaitStatus::Exited(Pid::from_raw(100), code);

        assert_eq!(decode_status(exited(0), None), TestVerdict::passed());
        assert_eq!(
            decode_status(exited(1), Some("left != right".to_owned())),
            TestVerdict::failed("left != right")
        );
        assert_eq!(decode_status(exited(1), None), TestVerdict::failed(""));
        assert_eq!(
            decode_status(exited(exit_code::FATAL), None),
            TestVerdict::failed("fatal internal framework error")
        );
        assert_eq!(
            decode_status(exited(5), None),
            TestVerdict::failed("Exited with status 5")
        );
        assert_eq!(
            decode_status(exited(5), Some("wrote then exited".to_owned())),
            TestVerdict::failed("wrote then exited")
        );
        assert_eq!(
            decode_status(
                WaitStatus::Signaled(Pid::from_raw(100), Signal::SIGABRT, false),
                None
            ),
            TestVerdict::failed("signal 6 (SIGABRT)")
        );
    }

    #[test]
    fn read_into_collects_until_eof() {
        let (reader, mut writer) = io::pipe().unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let mut buf = Vec::new();
        let mut targets = [ReadTarget::new(reader.as_raw_fd(), &mut buf)];
        let outcome = read_into(&mut targets, None, None).unwrap();
        assert!(matches!(outcome, ReadOutcome::AllClosed));
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn read_into_honors_a_past_deadline() {
        let (reader, mut writer) = io::pipe().unwrap();
        writer.write_all(b"now").unwrap();

        let mut buf = Vec::new();
        let mut targets = [ReadTarget::new(reader.as_raw_fd(), &mut buf)];
        // Writer still open: the drain must stop once nothing is ready
        // instead of blocking.
        let outcome = read_into(&mut targets, Some(Instant::now()), None).unwrap();
        assert!(matches!(outcome, ReadOutcome::TimedOut));
        assert_eq!(buf, b"now");
        drop(writer);
    }
}
