// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time tracking for test runs.

use std::time::{Duration, Instant};

/// A stopwatch for measuring how long a test took to run.
///
/// Durations cross the wire as whole milliseconds, so elapsed times are
/// measured once and carried as [`Duration`] until encoding.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The absolute deadline `timeout` from the start, if a timeout is set.
    pub(crate) fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|t| self.start + t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_monotonic() {
        let sw = Stopwatch::start();
        let a = sw.elapsed();
        let b = sw.elapsed();
        assert!(b >= a);
    }

    #[test]
    fn deadline_offsets_from_start() {
        let sw = Stopwatch::start();
        assert_eq!(sw.deadline(None), None);
        let deadline = sw.deadline(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(deadline, sw.start + Duration::from_millis(500));
    }
}
