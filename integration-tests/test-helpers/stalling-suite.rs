// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture whose first test outlives any reasonable deadline.
//!
//! Batch tests run this with a short timeout to check that a timed-out test
//! is reported in band and that the file keeps going afterwards.

use crucible_runner::{
    driver::{DriverOptions, drive_tests},
    suite::suite,
};
use integration_tests::ConsoleReporter;
use std::{process::ExitCode, time::Duration};

fn main() -> ExitCode {
    integration_tests::init_logging();

    let suites = vec![suite("stalling", |s| {
        s.test("stalls forever", |_| {
            std::thread::sleep(Duration::from_secs(60));
        });
        s.test("finishes instantly", |_| {});
    })];

    drive_tests(&suites, &mut ConsoleReporter, &DriverOptions::default())
}
