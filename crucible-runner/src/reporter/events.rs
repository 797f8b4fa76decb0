// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Owned representations of reporter events.

use crate::{
    reporter::TestOutput,
    test_name::{SuiteName, TestFile, TestName},
};
use std::time::Duration;

/// One reporter event, with all borrowed data cloned into owned form.
///
/// Useful for recording and replaying event streams, chiefly in tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestEventKind {
    /// A run started.
    StartedRun,
    /// The run ended.
    EndedRun,
    /// A suite produced its first reported test.
    StartedSuite {
        /// The enclosing suites, outermost first.
        suites: Vec<SuiteName>,
    },
    /// A suite finished.
    EndedSuite {
        /// The enclosing suites, outermost first.
        suites: Vec<SuiteName>,
    },
    /// A test is about to run.
    StartedTest {
        /// The test's full name.
        test: TestName,
    },
    /// A test passed.
    PassedTest {
        /// The test's full name.
        test: TestName,
        /// Captured output.
        output: TestOutput,
        /// Wall-clock duration of the test body.
        duration: Duration,
    },
    /// A test failed.
    FailedTest {
        /// The test's full name.
        test: TestName,
        /// The failure message.
        message: String,
        /// Captured output.
        output: TestOutput,
        /// Wall-clock duration of the test body.
        duration: Duration,
    },
    /// A test was skipped.
    SkippedTest {
        /// The test's full name.
        test: TestName,
        /// Why the test was skipped.
        message: String,
    },
    /// A test file's child process was spawned.
    StartedFile {
        /// The file that started.
        file: TestFile,
    },
    /// A test file's child process exited cleanly.
    EndedFile {
        /// The file that ended.
        file: TestFile,
    },
    /// A test file failed as a whole.
    FailedFile {
        /// The file that failed.
        file: TestFile,
        /// What went wrong.
        message: String,
    },
}
