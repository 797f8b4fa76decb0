// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for crucible-runner.

use std::process::ExitStatus;

/// Returns the conventional name for a signal number, without the `SIG`
/// prefix.
#[cfg(unix)]
pub(crate) fn signal_str(signal: i32) -> Option<&'static str> {
    // These signal numbers are the same on at least Linux, macOS, FreeBSD and
    // illumos.
    match signal {
        1 => Some("HUP"),
        2 => Some("INT"),
        3 => Some("QUIT"),
        4 => Some("ILL"),
        5 => Some("TRAP"),
        6 => Some("ABRT"),
        8 => Some("FPE"),
        9 => Some("KILL"),
        11 => Some("SEGV"),
        13 => Some("PIPE"),
        14 => Some("ALRM"),
        15 => Some("TERM"),
        _ => None,
    }
}

/// Displays a signal as `signal 6 (SIGABRT)`, or `signal 33` if the number
/// has no conventional name.
#[cfg(unix)]
pub(crate) fn display_signal(signal: i32) -> String {
    match signal_str(signal) {
        Some(s) => format!("signal {signal} (SIG{s})"),
        None => format!("signal {signal}"),
    }
}

/// Converts a nix errno into a `std::io::Error`.
#[cfg(unix)]
pub(crate) fn nix_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

/// Describes how a child process ended, for failure messages.
///
/// Clean exits render as `Exited with status 3`; signal deaths render as
/// `Aborted with signal 6 (SIGABRT)`.
pub(crate) fn display_exited_with(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Aborted with {}", display_signal(signal));
        }
    }
    match status.code() {
        Some(code) => format!("Exited with status {code}"),
        None => "Exited with an unknown error".to_owned(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn signal_display() {
        assert_eq!(display_signal(6), "signal 6 (SIGABRT)");
        assert_eq!(display_signal(11), "signal 11 (SIGSEGV)");
        assert_eq!(display_signal(33), "signal 33");
    }
}
