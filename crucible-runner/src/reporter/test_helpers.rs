// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared infrastructure for reporter-driven tests.

use crate::{
    errors::ReportError,
    reporter::{FileReporter, TestEventKind, TestOutput, TestReporter},
    test_name::{SuiteName, TestFile, TestName},
};
use proptest::prelude::*;
use std::time::Duration;

/// Records every event it receives, for asserting on event sequences.
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    pub(crate) events: Vec<TestEventKind>,
}

impl RecordingReporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl TestReporter for RecordingReporter {
    fn started_run(&mut self) -> Result<(), ReportError> {
        self.events.push(TestEventKind::StartedRun);
        Ok(())
    }

    fn ended_run(&mut self) -> Result<(), ReportError> {
        self.events.push(TestEventKind::EndedRun);
        Ok(())
    }

    fn started_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.events.push(TestEventKind::StartedSuite {
            suites: suites.to_vec(),
        });
        Ok(())
    }

    fn ended_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.events.push(TestEventKind::EndedSuite {
            suites: suites.to_vec(),
        });
        Ok(())
    }

    fn started_test(&mut self, test: &TestName) -> Result<(), ReportError> {
        self.events.push(TestEventKind::StartedTest { test: test.clone() });
        Ok(())
    }

    fn passed_test(
        &mut self,
        test: &TestName,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.events.push(TestEventKind::PassedTest {
            test: test.clone(),
            output: output.clone(),
            duration,
        });
        Ok(())
    }

    fn failed_test(
        &mut self,
        test: &TestName,
        message: &str,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.events.push(TestEventKind::FailedTest {
            test: test.clone(),
            message: message.to_owned(),
            output: output.clone(),
            duration,
        });
        Ok(())
    }

    fn skipped_test(&mut self, test: &TestName, message: &str) -> Result<(), ReportError> {
        self.events.push(TestEventKind::SkippedTest {
            test: test.clone(),
            message: message.to_owned(),
        });
        Ok(())
    }
}

impl FileReporter for RecordingReporter {
    fn started_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.events.push(TestEventKind::StartedFile { file: file.clone() });
        Ok(())
    }

    fn ended_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.events.push(TestEventKind::EndedFile { file: file.clone() });
        Ok(())
    }

    fn failed_file(&mut self, file: &TestFile, message: &str) -> Result<(), ReportError> {
        self.events.push(TestEventKind::FailedFile {
            file: file.clone(),
            message: message.to_owned(),
        });
        Ok(())
    }
}

/// Renders recorded events as compact one-line summaries, so tests can
/// assert entire event sequences against a readable literal.
pub(crate) fn summarize(events: &[TestEventKind]) -> Vec<String> {
    fn suite_path(suites: &[SuiteName]) -> String {
        suites
            .iter()
            .map(|suite| suite.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    events
        .iter()
        .map(|event| match event {
            TestEventKind::StartedRun => "started_run".to_owned(),
            TestEventKind::EndedRun => "ended_run".to_owned(),
            TestEventKind::StartedSuite { suites } => {
                format!("started_suite {}", suite_path(suites))
            }
            TestEventKind::EndedSuite { suites } => {
                format!("ended_suite {}", suite_path(suites))
            }
            TestEventKind::StartedTest { test } => format!("started_test {test}"),
            TestEventKind::PassedTest { test, .. } => format!("passed_test {test}"),
            TestEventKind::FailedTest { test, message, .. } => {
                format!("failed_test {test} [{message}]")
            }
            TestEventKind::SkippedTest { test, message } => {
                format!("skipped_test {test} [{message}]")
            }
            TestEventKind::StartedFile { file } => format!("started_file {}", file.path),
            TestEventKind::EndedFile { file } => format!("ended_file {}", file.path),
            TestEventKind::FailedFile { file, message } => {
                format!("failed_file {} [{message}]", file.path)
            }
        })
        .collect()
}

/// Strategy for durations that survive the wire's whole-millisecond
/// resolution.
pub(crate) fn arb_duration() -> impl Strategy<Value = Duration> {
    any::<u32>().prop_map(|ms| Duration::from_millis(u64::from(ms)))
}

pub(crate) fn arb_suite_name() -> impl Strategy<Value = SuiteName> {
    ("[a-z ]{1,16}", "[a-z_/]{1,24}", any::<u32>())
        .prop_map(|(name, file, line)| SuiteName::new(name, file, line))
}

pub(crate) fn arb_test_name() -> impl Strategy<Value = TestName> {
    (
        // Local uids as a child process would allocate them.
        (1..=u64::from(u32::MAX)),
        prop::collection::vec(arb_suite_name(), 0..4),
        "[a-z ]{1,16}",
        "[a-z_/]{1,24}",
        any::<u32>(),
    )
        .prop_map(|(id, suites, name, file, line)| TestName {
            id,
            suites,
            name,
            file,
            line,
        })
}

pub(crate) fn arb_test_output() -> impl Strategy<Value = TestOutput> {
    (
        prop::collection::vec(any::<u8>(), 0..64),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(stdout, stderr)| TestOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
}
