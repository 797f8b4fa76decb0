// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared support code for crucible's integration tests and fixture
//! binaries.

use crucible_runner::{
    errors::ReportError,
    reporter::{FileReporter, TestEventKind, TestOutput, TestReporter},
    test_name::{SuiteName, TestFile, TestName},
};
use std::time::Duration;

/// Installs a stderr logger when `CRUCIBLE_DEBUG` is set.
///
/// Fixture binaries call this on startup so runner internals can be traced
/// when an integration test misbehaves in CI.
pub fn init_logging() {
    if std::env::var_os("CRUCIBLE_DEBUG").is_some() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Records every reporter event in arrival order.
#[derive(Debug, Default)]
pub struct EventLog {
    /// The recorded events.
    pub events: Vec<TestEventKind>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders each event as one line, convenient for order assertions.
    pub fn lines(&self) -> Vec<String> {
        fn suite_path(suites: &[SuiteName]) -> String {
            suites
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" > ")
        }

        self.events
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
}

impl TestReporter for EventLog {
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

impl FileReporter for EventLog {
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

/// Prints one line per test outcome.
///
/// Fixture binaries use this as their reporter so that running one directly
/// produces something readable. In batch mode the driver reports over the
/// inherited pipe instead and this goes unused.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleReporter;

impl TestReporter for ConsoleReporter {
    fn passed_test(
        &mut self,
        test: &TestName,
        _output: &TestOutput,
        _duration: Duration,
    ) -> Result<(), ReportError> {
        println!("ok   {test}");
        Ok(())
    }

    fn failed_test(
        &mut self,
        test: &TestName,
        message: &str,
        _output: &TestOutput,
        _duration: Duration,
    ) -> Result<(), ReportError> {
        println!("FAIL {test}: {message}");
        Ok(())
    }

    fn skipped_test(&mut self, test: &TestName, message: &str) -> Result<(), ReportError> {
        println!("skip {test}: {message}");
        Ok(())
    }
}
