// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executing compiled tests.
//!
//! A [`TestRunner`] turns one compiled test into a verdict. [`InlineRunner`]
//! calls the body directly in the current process; [`ForkedRunner`] gives
//! each test its own process group so that crashes, leaked children, and
//! runaway loops stay contained. The run loop in this module drives either
//! runner over a whole suite tree, reporting as it goes.

use crate::{
    errors::RunTestError,
    reporter::TestOutput,
    suite::{TestInfo, TestVerdict},
};
use std::time::Duration;

mod dispatcher;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod os;
    } else if #[cfg(windows)] {
        #[path = "windows.rs"]
        mod os;
    }
}

pub use dispatcher::*;

/// Executes one compiled test, filling in whatever output it captured.
pub trait TestRunner {
    /// Runs `test` to a verdict.
    ///
    /// An `Err` means the runner's own machinery failed, not the test; the
    /// run loop reports such tests as failed with the error's message.
    fn run(&self, test: &TestInfo, output: &mut TestOutput) -> Result<TestVerdict, RunTestError>;
}

/// Runs test bodies in the calling process.
///
/// Nothing is captured or isolated: output goes wherever the process's
/// streams point, and a test that corrupts or exits the process takes the
/// whole run with it.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineRunner;

impl InlineRunner {
    /// Creates an inline runner.
    pub fn new() -> Self {
        Self
    }
}

impl TestRunner for InlineRunner {
    fn run(&self, test: &TestInfo, _output: &mut TestOutput) -> Result<TestVerdict, RunTestError> {
        Ok(test.call())
    }
}

/// Runs each test in its own child process and process group.
///
/// The child's stdout and stderr are captured into the test's output, and
/// an optional timeout bounds the test's wall-clock time. When the deadline
/// passes, the whole process group is killed and the test fails with a
/// timeout message.
///
/// Only one isolated test may be in flight per process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkedRunner {
    timeout: Option<Duration>,
}

impl ForkedRunner {
    /// Creates a runner with no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that kills tests running longer than `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl TestRunner for ForkedRunner {
    fn run(&self, test: &TestInfo, output: &mut TestOutput) -> Result<TestVerdict, RunTestError> {
        os::run_isolated(test, output, self.timeout)
    }
}
