// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting test events.
//!
//! The run loop and the file runner drive a reporter through the traits in
//! this module. Reporters see a strictly nested event sequence: a run
//! brackets files (in batch mode), files bracket suites, and suites bracket
//! tests. Suite events fire lazily, only once a contained test is actually
//! reported.

use crate::{
    errors::ReportError,
    test_name::{SuiteName, TestFile, TestName},
};
use bstr::BString;
use std::time::Duration;

mod events;
#[cfg(test)]
pub(crate) mod test_helpers;

pub use events::*;

/// Output captured from one test invocation.
///
/// Both fields are raw byte strings: tests may write arbitrary bytes to
/// their standard streams.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestOutput {
    /// Bytes the test wrote to standard output.
    pub stdout: BString,
    /// Bytes the test wrote to standard error.
    pub stderr: BString,
}

impl TestOutput {
    /// Creates an empty output record.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Receives events for a single-process test run.
///
/// All methods default to doing nothing, so reporters only implement the
/// events they care about. Suite events carry the full stack of enclosing
/// suites, outermost first.
pub trait TestReporter {
    /// A run is starting.
    fn started_run(&mut self) -> Result<(), ReportError> {
        Ok(())
    }

    /// The run has ended.
    fn ended_run(&mut self) -> Result<(), ReportError> {
        Ok(())
    }

    /// The innermost suite in `suites` has produced its first reported
    /// test.
    fn started_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        let _ = suites;
        Ok(())
    }

    /// The innermost suite in `suites` has no further tests or subsuites.
    fn ended_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        let _ = suites;
        Ok(())
    }

    /// A test is about to run.
    fn started_test(&mut self, test: &TestName) -> Result<(), ReportError> {
        let _ = test;
        Ok(())
    }

    /// A test passed.
    fn passed_test(
        &mut self,
        test: &TestName,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        let _ = (test, output, duration);
        Ok(())
    }

    /// A test failed.
    fn failed_test(
        &mut self,
        test: &TestName,
        message: &str,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        let _ = (test, message, output, duration);
        Ok(())
    }

    /// A test was skipped without running.
    fn skipped_test(&mut self, test: &TestName, message: &str) -> Result<(), ReportError> {
        let _ = (test, message);
        Ok(())
    }
}

/// Receives events for a multi-process (batch) run, where each test file is
/// a child process streaming its own events back to the parent.
pub trait FileReporter: TestReporter {
    /// A test file's child process has been spawned.
    fn started_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        let _ = file;
        Ok(())
    }

    /// A test file's child process exited cleanly.
    fn ended_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        let _ = file;
        Ok(())
    }

    /// A test file failed as a whole: it crashed, exited nonzero, or
    /// produced an unreadable event stream.
    fn failed_file(&mut self, file: &TestFile, message: &str) -> Result<(), ReportError> {
        let _ = (file, message);
        Ok(())
    }
}
