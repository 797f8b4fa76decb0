// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The execution core of the crucible test framework.
//!
//! Suites are declared with [`suite::suite`], compiled into a tree of
//! tests, and driven by [`driver::drive_tests`], which runs each test in
//! its own process group with captured output and an optional deadline.
//! Whole test executables can in turn be aggregated by
//! [`file_runner::run_test_files`], which spawns them as children and
//! merges their event streams over a pipe protocol.
//!
//! Reporting is pluggable: anything implementing
//! [`reporter::TestReporter`] receives the run's event sequence.

pub mod attrs;
pub mod driver;
pub mod errors;
pub mod file_runner;
pub mod filter;
mod helpers;
pub mod protocol;
pub mod reporter;
pub mod runner;
#[cfg(unix)]
mod signal;
pub mod suite;
pub mod test_name;
mod time;
