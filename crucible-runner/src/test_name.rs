// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test and suite identities.

use camino::Utf8PathBuf;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// A unique identifier for a test within one run.
///
/// Uids are allocated from a process-wide counter starting at 1. In batch
/// mode, the aggregating parent offsets each child's uids into a per-file
/// block occupying the high 32 bits, so uids from different files never
/// collide.
pub type TestUid = u64;

static NEXT_TEST_UID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next test uid.
pub(crate) fn next_test_uid() -> TestUid {
    NEXT_TEST_UID.fetch_add(1, Ordering::Relaxed)
}

/// Allocates per-file uid blocks for batch mode.
///
/// Blocks start at `1 << 32` so remapped uids can never collide with uids
/// allocated locally in the aggregating process.
#[derive(Debug)]
pub(crate) struct FileUidMaker {
    next_file_uid: u64,
}

impl FileUidMaker {
    pub(crate) fn new() -> Self {
        Self { next_file_uid: 1 }
    }

    pub(crate) fn make_file_uid(&mut self) -> TestUid {
        let uid = self.next_file_uid << 32;
        self.next_file_uid += 1;
        uid
    }
}

/// Remaps a uid decoded from a child's event stream into the file's uid
/// block.
pub(crate) fn remap_uid(file_uid: TestUid, local: TestUid) -> TestUid {
    file_uid | (local & 0xffff_ffff)
}

/// The name and source location of one suite in a suite path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuiteName {
    /// The suite's name.
    pub name: String,
    /// The source file the suite was declared in.
    pub file: String,
    /// The line the suite was declared on.
    pub line: u32,
}

impl SuiteName {
    /// Creates a new suite name.
    pub fn new(name: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
        }
    }
}

/// The full identity of a test: its uid, the path of enclosing suites, its
/// own name, and its source location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestName {
    /// The test's uid.
    pub id: TestUid,
    /// The enclosing suites, outermost first.
    pub suites: Vec<SuiteName>,
    /// The test's own name.
    pub name: String,
    /// The source file the test was declared in.
    pub file: String,
    /// The line the test was declared on.
    pub line: u32,
}

impl TestName {
    /// The fully-qualified name, e.g. `outer suite > inner suite > my test`.
    pub fn full_name(&self) -> String {
        let mut out = String::new();
        for suite in &self.suites {
            out.push_str(&suite.name);
            out.push_str(" > ");
        }
        out.push_str(&self.name);
        out
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// The identity of a whole test executable in batch mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestFile {
    /// The file's uid block.
    pub id: TestUid,
    /// The path of the executable.
    pub path: Utf8PathBuf,
}
