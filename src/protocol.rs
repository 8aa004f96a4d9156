//! Message relay text protocol parser and response generator.
//!
//! Commands are newline-terminated lines of whitespace-separated fields:
//! - Messages: put, list, get
//! - Keys: store_key, get_key
//! - Other: reset
//!
//! `put` and `store_key` are followed by a raw payload whose length is
//! declared on the command line. The payload is not newline-terminated.

use bytes::{Bytes, BytesMut};
use std::str;

/// Parsed relay command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clear all messages and keys
    Reset,

    /// Store a message; `length` payload bytes follow the command line
    Put {
        user: String,
        subject: String,
        length: usize,
    },

    /// List message subjects for a user
    List { user: String },

    /// Fetch one message by 1-based index
    Get { user: String, index: i64 },

    /// Store a key; `length` payload bytes follow the command line
    StoreKey { user: String, length: usize },

    /// Fetch the stored key for a user
    GetKey { user: String },
}

/// Errors reported to the client as `error <message>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown verb, missing field or malformed number
    InvalidMessage,
    /// Malformed `store_key` command
    InvalidKey,
    /// Peer closed before a `put` payload arrived
    IncompleteMessage,
    /// Peer closed before a `store_key` payload arrived
    IncompleteKey,
    /// `get` for an unknown user or index
    NoSuchMessage,
    /// `get_key` for a user without a key
    UnknownUser,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ProtocolError::InvalidMessage => "invalid message",
            ProtocolError::InvalidKey => "invalid key",
            ProtocolError::IncompleteMessage => "could not read entire message",
            ProtocolError::IncompleteKey => "could not read entire key",
            ProtocolError::NoSuchMessage => "no such message for that user",
            ProtocolError::UnknownUser => "user does not exist",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ProtocolError {}

/// Parser for relay command lines
pub struct Parser;

impl Parser {
    /// Parse a single command line.
    ///
    /// The line may still carry its trailing `\n` (and `\r`); both are
    /// treated as field separators.
    pub fn parse(line: &[u8]) -> Result<Command, ProtocolError> {
        let line = str::from_utf8(line).map_err(|_| ProtocolError::InvalidMessage)?;
        let parts: Vec<&str> = line.split_ascii_whitespace().collect();

        let Some(&verb) = parts.first() else {
            return Err(ProtocolError::InvalidMessage);
        };

        match verb {
            "reset" => Ok(Command::Reset),
            "put" => Self::parse_put(&parts),
            "list" => Ok(Command::List {
                user: field(&parts, 1, ProtocolError::InvalidMessage)?.to_string(),
            }),
            "get" => Self::parse_get(&parts),
            "store_key" => Self::parse_store_key(&parts),
            "get_key" => Ok(Command::GetKey {
                user: field(&parts, 1, ProtocolError::InvalidMessage)?.to_string(),
            }),
            _ => Err(ProtocolError::InvalidMessage),
        }
    }

    fn parse_put(parts: &[&str]) -> Result<Command, ProtocolError> {
        let err = ProtocolError::InvalidMessage;
        Ok(Command::Put {
            user: field(parts, 1, err)?.to_string(),
            subject: field(parts, 2, err)?.to_string(),
            length: field(parts, 3, err)?.parse().map_err(|_| err)?,
        })
    }

    fn parse_get(parts: &[&str]) -> Result<Command, ProtocolError> {
        let err = ProtocolError::InvalidMessage;
        Ok(Command::Get {
            user: field(parts, 1, err)?.to_string(),
            index: field(parts, 2, err)?.parse().map_err(|_| err)?,
        })
    }

    fn parse_store_key(parts: &[&str]) -> Result<Command, ProtocolError> {
        let err = ProtocolError::InvalidKey;
        Ok(Command::StoreKey {
            user: field(parts, 1, err)?.to_string(),
            length: field(parts, 2, err)?.parse().map_err(|_| err)?,
        })
    }
}

fn field<'a>(parts: &[&'a str], idx: usize, err: ProtocolError) -> Result<&'a str, ProtocolError> {
    parts.get(idx).copied().ok_or(err)
}

/// Split the next newline-terminated frame off the front of `buffer`.
///
/// The returned frame includes the `\n`. Bytes after it stay buffered.
pub fn take_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let pos = find_newline(buffer)?;
    Some(buffer.split_to(pos + 1))
}

/// Split exactly `length` payload bytes off the front of `buffer`.
///
/// Returns `None` while fewer than `length` bytes are buffered.
pub fn take_payload(buffer: &mut BytesMut, length: usize) -> Option<Bytes> {
    if buffer.len() < length {
        return None;
    }
    Some(buffer.split_to(length).freeze())
}

/// Find `\n` in buffer
fn find_newline(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}

/// Response generator for the relay protocol
pub struct Response;

impl Response {
    /// Generate OK response
    pub fn ok() -> &'static [u8] {
        b"OK\n"
    }

    /// Generate an error response
    pub fn error(err: ProtocolError) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("error {}\n", err).as_bytes());
        response
    }

    /// Generate a list response from `(index, subject)` pairs
    pub fn list(entries: &[(usize, &str)]) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("list {}\n", entries.len()).as_bytes());
        for (index, subject) in entries {
            response.extend_from_slice(format!("{} {}\n", index, subject).as_bytes());
        }
        response
    }

    /// Generate a message response: header line followed by the raw body
    pub fn message(subject: &str, body: &[u8]) -> BytesMut {
        let header = format!("message {} {}\n", subject, body.len());
        let mut response = BytesMut::with_capacity(header.len() + body.len());
        response.extend_from_slice(header.as_bytes());
        response.extend_from_slice(body);
        response
    }

    /// Generate a key response: header line followed by the raw key
    pub fn key(key: &[u8]) -> BytesMut {
        let header = format!("key {}\n", key.len());
        let mut response = BytesMut::with_capacity(header.len() + key.len());
        response.extend_from_slice(header.as_bytes());
        response.extend_from_slice(key);
        response
    }
}
