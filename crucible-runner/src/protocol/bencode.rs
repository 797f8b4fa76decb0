// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An incremental bencode codec.
//!
//! Bencode has four value shapes: integers (`i42e`), byte strings
//! (`4:spam`), lists (`l...e`), and dictionaries with byte-string keys
//! (`d...e`). It is self-delimiting, which lets the parent process pull
//! complete event records off a child's pipe without any additional
//! framing.
//!
//! [`Decoder`] reads one byte at a time, so wrap the underlying stream in a
//! [`BufReader`](std::io::BufReader) when it is an unbuffered pipe or file.

use crate::errors::ProtocolError;
use bstr::{BStr, BString};
use std::{collections::BTreeMap, io, io::Read};

/// Byte strings above this length are rejected rather than allocated.
const MAX_BYTES_LEN: u64 = 64 * 1024 * 1024;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: u32 = 32;

/// A single bencode value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    /// A signed integer.
    Int(i64),
    /// A byte string. Not necessarily UTF-8.
    Bytes(BString),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte-string keys, encoded in key order.
    Dict(BTreeMap<BString, Value>),
}

impl Value {
    /// Returns the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&BStr> {
        match self {
            Value::Bytes(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8, if this is a valid UTF-8 byte
    /// string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }

    /// Returns the elements, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the entries, if this is a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<BString, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(BStr::new(key))
    }

    /// Appends the encoded form of `self` to `out`.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(v) => {
                out.extend_from_slice(v.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(v);
            }
            Value::List(v) => {
                out.push(b'l');
                for item in v {
                    item.encode_to(out);
                }
                out.push(b'e');
            }
            Value::Dict(v) => {
                out.push(b'd');
                for (key, value) in v {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_to(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Returns the encoded form of `self`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into())
    }
}

impl From<BString> for Value {
    fn from(v: BString) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Reads a stream of concatenated bencode values.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> Decoder<R> {
    /// Creates a decoder reading from `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// The number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decodes the next value from the stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly at a value boundary.
    /// End-of-stream in the middle of a value is an
    /// [`UnexpectedEof`](ProtocolError::UnexpectedEof) error.
    pub fn next_value(&mut self) -> Result<Option<Value>, ProtocolError> {
        match self.read_byte()? {
            None => Ok(None),
            Some(first) => self.parse_value(first, 0).map(Some),
        }
    }

    fn parse_value(&mut self, first: u8, depth: u32) -> Result<Value, ProtocolError> {
        match first {
            b'i' => self.parse_int(),
            b'0'..=b'9' => {
                let len = self.parse_length(first)?;
                self.read_payload(len).map(|bytes| Value::Bytes(bytes.into()))
            }
            b'l' => {
                if depth >= MAX_DEPTH {
                    return Err(ProtocolError::NestingTooDeep {
                        offset: self.offset - 1,
                    });
                }
                let mut items = Vec::new();
                loop {
                    match self.require_byte()? {
                        b'e' => return Ok(Value::List(items)),
                        other => items.push(self.parse_value(other, depth + 1)?),
                    }
                }
            }
            b'd' => {
                if depth >= MAX_DEPTH {
                    return Err(ProtocolError::NestingTooDeep {
                        offset: self.offset - 1,
                    });
                }
                let mut entries = BTreeMap::new();
                loop {
                    let key = match self.require_byte()? {
                        b'e' => return Ok(Value::Dict(entries)),
                        digit @ b'0'..=b'9' => {
                            let len = self.parse_length(digit)?;
                            BString::from(self.read_payload(len)?)
                        }
                        other => {
                            return Err(ProtocolError::InvalidToken {
                                byte: other,
                                offset: self.offset - 1,
                            });
                        }
                    };
                    let first = self.require_byte()?;
                    let value = self.parse_value(first, depth + 1)?;
                    entries.insert(key, value);
                }
            }
            other => Err(ProtocolError::InvalidToken {
                byte: other,
                offset: self.offset - 1,
            }),
        }
    }

    /// Parses the digits and `e` terminator of an integer, after the
    /// leading `i` has been consumed.
    fn parse_int(&mut self) -> Result<Value, ProtocolError> {
        let start = self.offset;
        let invalid = || ProtocolError::InvalidInteger { offset: start };

        let mut byte = self.require_byte()?;
        let negative = byte == b'-';
        if negative {
            byte = self.require_byte()?;
        }
        if !byte.is_ascii_digit() {
            return Err(invalid());
        }
        let leading_zero = byte == b'0';
        let mut first_digit = true;

        // Accumulate negated so that i64::MIN decodes without overflow.
        let mut value: i64 = 0;
        loop {
            if !first_digit && leading_zero {
                // Forbids i03e and i00e.
                return Err(invalid());
            }
            first_digit = false;
            let digit = i64::from(byte - b'0');
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_sub(digit))
                .ok_or_else(invalid)?;

            byte = self.require_byte()?;
            match byte {
                b'e' => break,
                b'0'..=b'9' => {}
                _ => return Err(invalid()),
            }
        }

        if negative {
            if value == 0 {
                // i-0e is not a valid encoding of zero.
                return Err(invalid());
            }
            Ok(Value::Int(value))
        } else {
            value.checked_neg().map(Value::Int).ok_or_else(invalid)
        }
    }

    /// Parses a byte string length whose first digit has been consumed,
    /// through the `:` separator.
    fn parse_length(&mut self, first: u8) -> Result<u64, ProtocolError> {
        let start = self.offset - 1;
        let invalid = || ProtocolError::InvalidLength { offset: start };
        let leading_zero = first == b'0';

        let mut len = u64::from(first - b'0');
        loop {
            match self.require_byte()? {
                b':' => break,
                digit @ b'0'..=b'9' => {
                    if leading_zero {
                        return Err(invalid());
                    }
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(u64::from(digit - b'0')))
                        .ok_or_else(invalid)?;
                }
                _ => return Err(invalid()),
            }
        }
        if len > MAX_BYTES_LEN {
            return Err(invalid());
        }
        Ok(len)
    }

    fn read_payload(&mut self, len: u64) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0; len as usize];
        self.reader.read_exact(&mut buf).map_err(|error| {
            if error.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::UnexpectedEof {
                    offset: self.offset,
                }
            } else {
                ProtocolError::read(error)
            }
        })?;
        self.offset += len;
        Ok(buf)
    }

    fn require_byte(&mut self) -> Result<u8, ProtocolError> {
        self.read_byte()?.ok_or(ProtocolError::UnexpectedEof {
            offset: self.offset,
        })
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(buf[0]));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(ProtocolError::read(error)),
            }
        }
    }
}
