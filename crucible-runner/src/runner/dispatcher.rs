// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The run loop: traversal, filtering, and reporting.

use crate::{
    errors::ReportError,
    filter::{FilterAction, TestFilter, filter_by_attr},
    reporter::{TestOutput, TestReporter},
    runner::TestRunner,
    suite::{CompiledSuite, TestVerdict},
    test_name::{SuiteName, TestName},
    time::Stopwatch,
};
use tracing::debug;

/// Counts of what happened during one run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Tests that ran and passed.
    pub passed: usize,
    /// Tests that ran and failed, or could not be run at all.
    pub failed: usize,
    /// Tests that were skipped.
    pub skipped: usize,
    /// Whole files that failed in batch mode.
    pub failed_files: usize,
}

impl RunSummary {
    /// Whether the run had no failures of any kind.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.failed_files == 0
    }

    /// Total number of tests reported, skips included.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    /// Folds another summary into this one.
    pub fn merge(&mut self, other: &RunSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failed_files += other.failed_files;
    }
}

/// The stack of suites enclosing the current traversal position.
///
/// Suites are pushed as the traversal descends but only become visible to
/// the reporter once one of their tests is actually reported. `commit`
/// flushes the queued tail into the committed prefix, firing the callback
/// once per newly committed suite, so filtered-out suites never appear in
/// the event stream at all.
#[derive(Debug, Default)]
struct SuiteStack {
    committed: Vec<SuiteName>,
    queued: Vec<SuiteName>,
}

impl SuiteStack {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, suite: SuiteName) {
        self.queued.push(suite);
    }

    fn pop(&mut self) {
        if self.queued.is_empty() {
            self.committed.pop();
        } else {
            self.queued.pop();
        }
    }

    fn commit(
        &mut self,
        mut on_commit: impl FnMut(&[SuiteName]) -> Result<(), ReportError>,
    ) -> Result<(), ReportError> {
        for suite in self.queued.drain(..) {
            self.committed.push(suite);
            on_commit(&self.committed)?;
        }
        Ok(())
    }

    fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    fn committed(&self) -> &[SuiteName] {
        &self.committed
    }

    /// The full enclosing path, committed or not.
    fn all(&self) -> Vec<SuiteName> {
        self.committed
            .iter()
            .chain(self.queued.iter())
            .cloned()
            .collect()
    }
}

/// Runs every test in `suites` that the filter lets through, reporting
/// each as it goes.
///
/// Tests the filter hides are invisible: they produce no events, and a
/// suite whose tests are all hidden is never started. Tests with no
/// explicit filter verdict fall back to their attributes, so a `skip`
/// attribute skips the test unless a filter explicitly selected it.
pub fn run_tests(
    suites: &[CompiledSuite],
    reporter: &mut dyn TestReporter,
    runner: &dyn TestRunner,
    filter: &dyn TestFilter,
) -> Result<RunSummary, ReportError> {
    let mut summary = RunSummary::default();
    let mut parents = SuiteStack::new();
    reporter.started_run()?;
    run_tests_impl(suites, reporter, runner, filter, &mut parents, &mut summary)?;
    reporter.ended_run()?;
    Ok(summary)
}

fn run_tests_impl(
    suites: &[CompiledSuite],
    reporter: &mut dyn TestReporter,
    runner: &dyn TestRunner,
    filter: &dyn TestFilter,
    parents: &mut SuiteStack,
    summary: &mut RunSummary,
) -> Result<(), ReportError> {
    for suite in suites {
        parents.push(SuiteName::new(suite.name(), suite.file(), suite.line()));

        for test in suite.tests() {
            let name = TestName {
                id: test.id(),
                suites: parents.all(),
                name: test.name().to_owned(),
                file: test.file().to_owned(),
                line: test.line(),
            };

            let mut result = filter.filter(&name, test.attrs());
            if result.action == FilterAction::Indeterminate {
                result = filter_by_attr(test.attrs());
            }
            if result.action == FilterAction::Hide {
                continue;
            }

            parents.commit(|committed| reporter.started_suite(committed))?;
            reporter.started_test(&name)?;

            if result.action == FilterAction::Skip {
                summary.skipped += 1;
                reporter.skipped_test(&name, result.message.as_deref().unwrap_or(""))?;
                continue;
            }

            debug!(test = %name, "running test");
            let mut output = TestOutput::new();
            let watch = Stopwatch::start();
            let verdict = runner.run(test, &mut output);
            let duration = watch.elapsed();
            match verdict {
                Ok(TestVerdict::Passed) => {
                    summary.passed += 1;
                    reporter.passed_test(&name, &output, duration)?;
                }
                Ok(TestVerdict::Failed { message }) => {
                    summary.failed += 1;
                    reporter.failed_test(&name, &message, &output, duration)?;
                }
                Err(error) => {
                    summary.failed += 1;
                    reporter.failed_test(&name, &error.to_string(), &output, duration)?;
                }
            }
        }

        run_tests_impl(
            suite.subsuites(),
            reporter,
            runner,
            filter,
            parents,
            summary,
        )?;

        if !parents.has_queued() {
            reporter.ended_suite(parents.committed())?;
        }
        parents.pop();
    }
    Ok(())
}
