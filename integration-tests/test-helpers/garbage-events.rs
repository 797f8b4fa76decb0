// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fixture that corrupts its event stream.
//!
//! It opens the inherited event pipe the way a real test executable would,
//! then writes bytes that are not a valid event record and exits cleanly.

use crucible_runner::driver::CRUCIBLE_EVENTS_FD;
use std::{fs::File, io::Write};

fn main() {
    let Some(value) = std::env::var_os(CRUCIBLE_EVENTS_FD) else {
        eprintln!("[garbage-events] not spawned by a batch runner, nothing to do");
        return;
    };
    let value = value.to_string_lossy();
    let mut pipe = open_pipe(&value);
    pipe.write_all(b"garbage that is not an event stream")
        .expect("event pipe is writable");
}

#[cfg(unix)]
fn open_pipe(value: &str) -> File {
    use std::os::fd::FromRawFd;

    let fd = value.parse().expect("event pipe fd is a number");
    unsafe { File::from_raw_fd(fd) }
}

#[cfg(windows)]
fn open_pipe(value: &str) -> File {
    use std::os::windows::io::{FromRawHandle, RawHandle};

    let handle = value.parse::<usize>().expect("event pipe handle is a number");
    unsafe { File::from_raw_handle(handle as RawHandle) }
}
