// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture with passing, failing and skipped tests across nested suites.

use crucible_runner::{
    attrs::AttrInstance,
    driver::{DriverOptions, drive_tests},
    suite::suite,
};
use integration_tests::ConsoleReporter;
use std::process::ExitCode;

fn main() -> ExitCode {
    integration_tests::init_logging();

    let suites = vec![
        suite("arithmetic", |s| {
            s.test("adds", |_| {
                println!("computing 2 + 2");
                assert_eq!(2 + 2, 4);
            });
            s.test("overflows", |_| {
                eprintln!("this one is broken");
                panic!("attempt to add with overflow");
            });
            s.subsuite("edge cases", |s| {
                s.test("wraps on max", |_| {
                    assert_eq!(u32::MAX.wrapping_add(1), 0);
                });
            });
        }),
        suite("io", |s| {
            s.test_with(
                "fetches",
                [AttrInstance::skip_because("network access is flaky in CI")],
                |_| unreachable!("skipped tests never run"),
            );
        }),
    ];

    drive_tests(&suites, &mut ConsoleReporter, &DriverOptions::default())
}
