// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture that dies before reporting anything.
//!
//! The batch runner must surface this as a whole-file failure instead of
//! hanging on the event stream.

fn main() {
    eprintln!("[aborting-file] going down");
    std::process::abort();
}
