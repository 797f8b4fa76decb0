// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture whose tests all pass.
//!
//! The suite carries a per-test fixture value with a setup step, so batch
//! runs exercise that path through a real child process.

use crucible_runner::{
    driver::{DriverOptions, drive_tests},
    suite::suite_with,
};
use integration_tests::ConsoleReporter;
use std::process::ExitCode;

fn main() -> ExitCode {
    integration_tests::init_logging();

    let suites = vec![suite_with(
        "greetings",
        || String::from("hello"),
        |s| {
            s.setup(|greeting| greeting.push_str(", world"));
            s.test("builds the greeting", |greeting| {
                assert_eq!(greeting, "hello, world");
            });
            s.test("counts the letters", |greeting| {
                assert_eq!(greeting.len(), 12);
            });
        },
    )];

    drive_tests(&suites, &mut ConsoleReporter, &DriverOptions::default())
}
