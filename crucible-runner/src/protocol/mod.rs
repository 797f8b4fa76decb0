// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The event stream between child test processes and the parent.
//!
//! In batch mode each test executable runs as a child process and encodes
//! its reporter events as bencode dictionaries on an inherited pipe. The
//! parent decodes the stream with [`read_file_events`], remaps test uids
//! into the file's uid block, and forwards the events to its own reporter.
//!
//! Every event is a dictionary with an `event` key naming its kind.
//! Unknown kinds are skipped so that the parent can read streams from
//! newer children. A stream that ends mid-value, or a record with the
//! wrong shape, poisons the whole file rather than the run.

use crate::{
    errors::{ProtocolError, ReportError},
    protocol::bencode::{Decoder, Value},
    reporter::{FileReporter, TestEventKind, TestOutput, TestReporter},
    test_name::{SuiteName, TestFile, TestName, TestUid, remap_uid},
};
use bstr::BString;
use std::{
    collections::BTreeMap,
    io::{Read, Write},
    time::Duration,
};

pub mod bencode;

/// Encodes reporter events onto a byte stream.
///
/// This is the child half of the wire protocol: a child process reports
/// into an `EventWriter` wrapping the pipe it inherited from the parent.
/// Each event is flushed as soon as it is written, so the parent sees
/// events as they happen and a crash loses at most the event in progress.
#[derive(Debug)]
pub struct EventWriter<W> {
    out: W,
}

impl<W: Write> EventWriter<W> {
    /// Creates a writer encoding onto `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_value(&mut self, value: &Value) -> Result<(), ReportError> {
        let encoded = value.encode();
        self.out.write_all(&encoded).map_err(ReportError::new)?;
        self.out.flush().map_err(ReportError::new)
    }
}

impl<W: Write> TestReporter for EventWriter<W> {
    fn started_run(&mut self) -> Result<(), ReportError> {
        self.write_value(&dict([("event", "started_run".into())]))
    }

    fn ended_run(&mut self) -> Result<(), ReportError> {
        self.write_value(&dict([("event", "ended_run".into())]))
    }

    fn started_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "started_suite".into()),
            ("suites", wrap_suites(suites)),
        ]))
    }

    fn ended_suite(&mut self, suites: &[SuiteName]) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "ended_suite".into()),
            ("suites", wrap_suites(suites)),
        ]))
    }

    fn started_test(&mut self, test: &TestName) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "started_test".into()),
            ("test", wrap_test(test)),
        ]))
    }

    fn passed_test(
        &mut self,
        test: &TestName,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "passed_test".into()),
            ("test", wrap_test(test)),
            ("duration", Value::Int(duration_ms(duration))),
            ("output", wrap_output(output)),
        ]))
    }

    fn failed_test(
        &mut self,
        test: &TestName,
        message: &str,
        output: &TestOutput,
        duration: Duration,
    ) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "failed_test".into()),
            ("test", wrap_test(test)),
            ("duration", Value::Int(duration_ms(duration))),
            ("message", message.into()),
            ("output", wrap_output(output)),
        ]))
    }

    fn skipped_test(&mut self, test: &TestName, message: &str) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "skipped_test".into()),
            ("test", wrap_test(test)),
            ("message", message.into()),
        ]))
    }
}

impl<W: Write> FileReporter for EventWriter<W> {
    fn started_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "started_file".into()),
            ("file", file.path.as_str().into()),
        ]))
    }

    fn ended_file(&mut self, file: &TestFile) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "ended_file".into()),
            ("file", file.path.as_str().into()),
        ]))
    }

    fn failed_file(&mut self, file: &TestFile, message: &str) -> Result<(), ReportError> {
        self.write_value(&dict([
            ("event", "failed_file".into()),
            ("file", file.path.as_str().into()),
            ("message", message.into()),
        ]))
    }
}

/// Decodes a child's event stream and forwards each event to `reporter`.
///
/// Test uids on the wire are local to the child; they are remapped into
/// `file`'s uid block before being reported. Run-level and file-level
/// bracketing events are dropped, since the parent emits its own.
///
/// The outer `Result` carries reporter failures, which abort the whole
/// run. The inner one carries the health of this one stream: decoding
/// stops at the first invalid record and the caller folds the error into
/// a file-level failure.
pub(crate) fn read_file_events<R: Read>(
    reader: R,
    file: &TestFile,
    reporter: &mut dyn FileReporter,
) -> Result<Result<(), ProtocolError>, ReportError> {
    let mut decoder = Decoder::new(reader);
    loop {
        let value = match decoder.next_value() {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Ok(())),
            Err(error) => return Ok(Err(error)),
        };
        match interpret_event(&value, file) {
            Ok(Some(event)) => forward_event(event, reporter)?,
            Ok(None) => {}
            Err(error) => return Ok(Err(error)),
        }
    }
}

/// Writes the result record a forked test child hands back to its parent.
pub(crate) fn write_result_record(out: &mut impl Write, message: &str) -> std::io::Result<()> {
    let record = dict([("message", message.into())]);
    out.write_all(&record.encode())?;
    out.flush()
}

/// Reads a forked test child's result record. Returns `Ok(None)` when the
/// child died before writing one.
pub(crate) fn read_result_record(reader: impl Read) -> Result<Option<String>, ProtocolError> {
    let mut decoder = Decoder::new(reader);
    let Some(record) = decoder.next_value()? else {
        return Ok(None);
    };
    let message = req_bytes(&record, "message")?;
    Ok(Some(String::from_utf8_lossy(&message).into_owned()))
}

fn dict<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(key, value)| (BString::from(key), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn wrap_suites(suites: &[SuiteName]) -> Value {
    Value::List(suites.iter().map(wrap_suite).collect())
}

fn wrap_suite(suite: &SuiteName) -> Value {
    dict([
        ("file", suite.file.as_str().into()),
        ("line", Value::Int(i64::from(suite.line))),
        ("name", suite.name.as_str().into()),
    ])
}

fn wrap_test(test: &TestName) -> Value {
    dict([
        ("file", test.file.as_str().into()),
        ("id", Value::Int(test.id as i64)),
        ("line", Value::Int(i64::from(test.line))),
        ("suites", wrap_suites(&test.suites)),
        ("test", test.name.as_str().into()),
    ])
}

fn wrap_output(output: &TestOutput) -> Value {
    dict([
        ("stderr_log", output.stderr.clone().into()),
        ("stdout_log", output.stdout.clone().into()),
    ])
}

/// Converts one decoded value into an owned event, or `None` for event
/// kinds the parent does not forward.
fn interpret_event(
    value: &Value,
    file: &TestFile,
) -> Result<Option<TestEventKind>, ProtocolError> {
    if value.as_dict().is_none() {
        return Err(ProtocolError::malformed("expected an event dictionary"));
    }
    let kind = req_str(value, "event")?;
    let event = match kind.as_str() {
        // The parent brackets runs and files itself.
        "started_run" | "ended_run" | "started_file" | "ended_file" => None,
        "started_suite" => Some(TestEventKind::StartedSuite {
            suites: read_suites(value)?,
        }),
        "ended_suite" => Some(TestEventKind::EndedSuite {
            suites: read_suites(value)?,
        }),
        "started_test" => Some(TestEventKind::StartedTest {
            test: read_test_name(value, file.id)?,
        }),
        "passed_test" => Some(TestEventKind::PassedTest {
            test: read_test_name(value, file.id)?,
            output: read_output(value)?,
            duration: read_duration(value)?,
        }),
        "failed_test" => Some(TestEventKind::FailedTest {
            test: read_test_name(value, file.id)?,
            message: req_str(value, "message")?,
            output: read_output(value)?,
            duration: read_duration(value)?,
        }),
        "skipped_test" => Some(TestEventKind::SkippedTest {
            test: read_test_name(value, file.id)?,
            message: req_str(value, "message")?,
        }),
        "failed_file" => Some(TestEventKind::FailedFile {
            // The parent's identity for the file wins over the wire's.
            file: file.clone(),
            message: req_str(value, "message")?,
        }),
        // Skip events from newer children rather than failing the file.
        _ => None,
    };
    Ok(event)
}

fn forward_event(
    event: TestEventKind,
    reporter: &mut dyn FileReporter,
) -> Result<(), ReportError> {
    match event {
        TestEventKind::StartedSuite { suites } => reporter.started_suite(&suites),
        TestEventKind::EndedSuite { suites } => reporter.ended_suite(&suites),
        TestEventKind::StartedTest { test } => reporter.started_test(&test),
        TestEventKind::PassedTest {
            test,
            output,
            duration,
        } => reporter.passed_test(&test, &output, duration),
        TestEventKind::FailedTest {
            test,
            message,
            output,
            duration,
        } => reporter.failed_test(&test, &message, &output, duration),
        TestEventKind::SkippedTest { test, message } => reporter.skipped_test(&test, &message),
        TestEventKind::FailedFile { file, message } => reporter.failed_file(&file, &message),
        _ => Ok(()),
    }
}

fn req<'a>(value: &'a Value, key: &str) -> Result<&'a Value, ProtocolError> {
    value
        .get(key)
        .ok_or_else(|| ProtocolError::malformed(format!("missing key \"{key}\"")))
}

fn req_str(value: &Value, key: &str) -> Result<String, ProtocolError> {
    req(value, key)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::malformed(format!("key \"{key}\" is not a UTF-8 string")))
}

fn req_bytes(value: &Value, key: &str) -> Result<BString, ProtocolError> {
    req(value, key)?
        .as_bytes()
        .map(BString::from)
        .ok_or_else(|| ProtocolError::malformed(format!("key \"{key}\" is not a byte string")))
}

fn req_int(value: &Value, key: &str) -> Result<i64, ProtocolError> {
    req(value, key)?
        .as_int()
        .ok_or_else(|| ProtocolError::malformed(format!("key \"{key}\" is not an integer")))
}

fn req_line(value: &Value) -> Result<u32, ProtocolError> {
    u32::try_from(req_int(value, "line")?)
        .map_err(|_| ProtocolError::malformed("key \"line\" is out of range"))
}

fn read_suites(value: &Value) -> Result<Vec<SuiteName>, ProtocolError> {
    req(value, "suites")?
        .as_list()
        .ok_or_else(|| ProtocolError::malformed("key \"suites\" is not a list"))?
        .iter()
        .map(read_suite_name)
        .collect()
}

fn read_suite_name(value: &Value) -> Result<SuiteName, ProtocolError> {
    Ok(SuiteName {
        name: req_str(value, "name")?,
        file: req_str(value, "file")?,
        line: req_line(value)?,
    })
}

fn read_test_name(value: &Value, file_uid: TestUid) -> Result<TestName, ProtocolError> {
    let test = req(value, "test")?;
    if test.as_dict().is_none() {
        return Err(ProtocolError::malformed("key \"test\" is not a dictionary"));
    }
    let local = u64::try_from(req_int(test, "id")?)
        .map_err(|_| ProtocolError::malformed("key \"id\" is negative"))?;
    Ok(TestName {
        id: remap_uid(file_uid, local),
        suites: read_suites(test)?,
        name: req_str(test, "test")?,
        file: req_str(test, "file")?,
        line: req_line(test)?,
    })
}

fn read_output(value: &Value) -> Result<TestOutput, ProtocolError> {
    let output = req(value, "output")?;
    Ok(TestOutput {
        stdout: req_bytes(output, "stdout_log")?,
        stderr: req_bytes(output, "stderr_log")?,
    })
}

fn read_duration(value: &Value) -> Result<Duration, ProtocolError> {
    let ms = u64::try_from(req_int(value, "duration")?)
        .map_err(|_| ProtocolError::malformed("key \"duration\" is negative"))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::test_helpers::{
        RecordingReporter, arb_duration, arb_test_name, arb_test_output,
    };
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn test_file(block: u64) -> TestFile {
        TestFile {
            id: block,
            path: Utf8PathBuf::from("tests/suite-bin"),
        }
    }

    fn sample_test(id: TestUid) -> TestName {
        TestName {
            id,
            suites: vec![SuiteName::new("outer", "suite.rs", 10)],
            name: "does the thing".to_owned(),
            file: "suite.rs".to_owned(),
            line: 14,
        }
    }

    #[test]
    fn events_round_trip_with_remapped_ids() {
        let file = test_file(7 << 32);
        let suites = vec![SuiteName::new("outer", "suite.rs", 10)];
        let test = sample_test(3);
        let output = TestOutput {
            stdout: "out".into(),
            stderr: "err".into(),
        };

        let mut encoded = Vec::new();
        {
            let mut writer = EventWriter::new(&mut encoded);
            writer.started_run().unwrap();
            writer.started_suite(&suites).unwrap();
            writer.started_test(&test).unwrap();
            writer
                .passed_test(&test, &output, Duration::from_millis(25))
                .unwrap();
            writer.ended_suite(&suites).unwrap();
            writer.ended_run().unwrap();
        }

        let mut reporter = RecordingReporter::new();
        let health = read_file_events(encoded.as_slice(), &file, &mut reporter).unwrap();
        health.unwrap();

        let remapped = TestName {
            id: (7 << 32) | 3,
            ..test
        };
        assert_eq!(
            reporter.events,
            vec![
                TestEventKind::StartedSuite {
                    suites: suites.clone()
                },
                TestEventKind::StartedTest {
                    test: remapped.clone()
                },
                TestEventKind::PassedTest {
                    test: remapped,
                    output,
                    duration: Duration::from_millis(25),
                },
                TestEventKind::EndedSuite { suites },
            ]
        );
    }

    #[test]
    fn local_ids_above_the_block_mask_are_truncated() {
        let file = test_file(1 << 32);
        let test = sample_test((9 << 32) | 5);

        let mut encoded = Vec::new();
        EventWriter::new(&mut encoded).started_test(&test).unwrap();

        let mut reporter = RecordingReporter::new();
        read_file_events(encoded.as_slice(), &file, &mut reporter)
            .unwrap()
            .unwrap();

        match &reporter.events[0] {
            TestEventKind::StartedTest { test } => assert_eq!(test.id, (1 << 32) | 5),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_reports_unexpected_eof() {
        let test = sample_test(1);
        let mut encoded = Vec::new();
        EventWriter::new(&mut encoded).started_test(&test).unwrap();
        encoded.truncate(encoded.len() - 4);

        let mut reporter = RecordingReporter::new();
        let health = read_file_events(encoded.as_slice(), &test_file(1 << 32), &mut reporter)
            .unwrap();
        assert!(matches!(health, Err(ProtocolError::UnexpectedEof { .. })));
        assert_eq!(reporter.events, vec![]);
    }

    #[test]
    fn unknown_events_are_skipped() {
        let mut encoded = Vec::new();
        dict([("event", "profiling_checkpoint".into()), ("at", Value::Int(9))])
            .encode_to(&mut encoded);
        let mut writer = EventWriter::new(&mut encoded);
        writer.skipped_test(&sample_test(2), "later").unwrap();

        let mut reporter = RecordingReporter::new();
        read_file_events(encoded.as_slice(), &test_file(4 << 32), &mut reporter)
            .unwrap()
            .unwrap();

        assert_eq!(reporter.events.len(), 1);
        assert!(matches!(
            &reporter.events[0],
            TestEventKind::SkippedTest { message, .. } if message == "later"
        ));
    }

    #[test]
    fn garbage_records_poison_the_stream() {
        let health = read_file_events(
            &b"i42e"[..],
            &test_file(1 << 32),
            &mut RecordingReporter::new(),
        )
        .unwrap();
        assert!(matches!(health, Err(ProtocolError::MalformedEvent { .. })));

        let missing_key = dict([("event", "failed_test".into())]).encode();
        let health = read_file_events(
            missing_key.as_slice(),
            &test_file(1 << 32),
            &mut RecordingReporter::new(),
        )
        .unwrap();
        match health {
            Err(ProtocolError::MalformedEvent { reason }) => {
                assert!(reason.contains("test"), "reason was {reason:?}");
            }
            other => panic!("unexpected health {other:?}"),
        }
    }

    #[test]
    fn in_band_failed_file_uses_the_parents_file_identity() {
        let file = test_file(2 << 32);
        let other = TestFile {
            id: 0,
            path: Utf8PathBuf::from("somewhere/else"),
        };

        let mut encoded = Vec::new();
        EventWriter::new(&mut encoded)
            .failed_file(&other, "could not set up")
            .unwrap();

        let mut reporter = RecordingReporter::new();
        read_file_events(encoded.as_slice(), &file, &mut reporter)
            .unwrap()
            .unwrap();

        assert_eq!(
            reporter.events,
            vec![TestEventKind::FailedFile {
                file,
                message: "could not set up".to_owned(),
            }]
        );
    }

    #[test]
    fn result_records_round_trip() {
        let mut encoded = Vec::new();
        write_result_record(&mut encoded, "left != right").unwrap();
        assert_eq!(
            read_result_record(encoded.as_slice()).unwrap(),
            Some("left != right".to_owned())
        );

        assert_eq!(read_result_record(&b""[..]).unwrap(), None);
        assert!(read_result_record(&b"d7:mess"[..]).is_err());
    }

    proptest! {
        #[test]
        fn failed_test_round_trips(
            test in arb_test_name(),
            message in "[ -~]{0,40}",
            output in arb_test_output(),
            duration in arb_duration(),
        ) {
            let file = test_file(3 << 32);
            let mut encoded = Vec::new();
            EventWriter::new(&mut encoded)
                .failed_test(&test, &message, &output, duration)
                .unwrap();

            let mut reporter = RecordingReporter::new();
            read_file_events(encoded.as_slice(), &file, &mut reporter)
                .unwrap()
                .unwrap();

            let expected = TestName {
                id: remap_uid(file.id, test.id),
                ..test
            };
            prop_assert_eq!(
                &reporter.events,
                &vec![TestEventKind::FailedTest {
                    test: expected,
                    message,
                    output,
                    duration,
                }]
            );
        }
    }
}
