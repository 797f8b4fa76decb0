// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by crucible-runner.

use std::io;
use thiserror::Error;

/// An error that occurred while decoding an event stream.
///
/// Byte offsets are relative to the start of the stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Reading from the underlying stream failed.
    #[error("error reading event stream")]
    Read {
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The stream ended in the middle of a value.
    #[error("unexpected end of event stream at byte {offset}")]
    UnexpectedEof {
        /// The offset at which the stream ended.
        offset: u64,
    },

    /// A byte that cannot start or continue a value was encountered.
    #[error("invalid byte {byte:#04x} at offset {offset}")]
    InvalidToken {
        /// The offending byte.
        byte: u8,
        /// The offset of the offending byte.
        offset: u64,
    },

    /// An integer was empty, malformed, or out of range.
    #[error("invalid integer at offset {offset}")]
    InvalidInteger {
        /// The offset at which the integer started.
        offset: u64,
    },

    /// A byte string declared a length that was malformed or too large.
    #[error("invalid string length at offset {offset}")]
    InvalidLength {
        /// The offset at which the length started.
        offset: u64,
    },

    /// Containers were nested beyond the decoder's depth limit.
    #[error("values nested too deeply at offset {offset}")]
    NestingTooDeep {
        /// The offset of the container that exceeded the limit.
        offset: u64,
    },

    /// A record decoded cleanly but did not have the expected shape.
    #[error("malformed event record: {reason}")]
    MalformedEvent {
        /// Why the record was rejected.
        reason: String,
    },
}

impl ProtocolError {
    pub(crate) fn read(error: io::Error) -> Self {
        Self::Read { error }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }
}

/// An error that occurred while a reporter was recording an event.
///
/// Most reporters are infallible; the event stream writer surfaces pipe
/// write failures through this type.
#[derive(Debug, Error)]
#[error("error writing test event")]
pub struct ReportError {
    #[source]
    error: io::Error,
}

impl ReportError {
    pub(crate) fn new(error: io::Error) -> Self {
        Self { error }
    }

    /// Returns the underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        &self.error
    }
}

/// An error that occurred while setting up or tearing down an isolated test
/// process.
///
/// These fail the affected test, not the run. The rendered message names the
/// operation that failed, e.g. `fork failed: Resource temporarily
/// unavailable`.
#[derive(Debug, Error)]
#[error("{operation} failed: {error}")]
pub struct RunTestError {
    operation: &'static str,
    #[source]
    error: io::Error,
}

impl RunTestError {
    pub(crate) fn new(operation: &'static str, error: io::Error) -> Self {
        Self { operation, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_test_error_names_operation() {
        let err = RunTestError::new("fork", io::Error::from_raw_os_error(11));
        let msg = err.to_string();
        assert!(msg.starts_with("fork failed: "), "message was {msg:?}");
    }
}
