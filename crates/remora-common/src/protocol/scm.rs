//! Session control messages.
//!
//! An SCM rides in the `scm` field of a [`Request`](super::Request) or
//! [`Response`](super::Response) that carries no ordinary body, and drives the
//! chunked blob sub-protocol. A `CHUNK` message is followed on the wire by one
//! raw data frame (`data ++ CHUNK_DELIMITER`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trailer appended to every raw chunk frame.
pub const CHUNK_DELIMITER: [u8; 2] = *b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Chunk,
    Ack,
    Reset,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    Continue,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScmErrorKind {
    InvalidSize,
    InvalidDelimiter,
    UnexpectedCommand,
    Producer,
    Aborted,
}

impl fmt::Display for ScmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScmErrorKind::InvalidSize => "INVALID_SIZE",
            ScmErrorKind::InvalidDelimiter => "INVALID_DELIMITER",
            ScmErrorKind::UnexpectedCommand => "UNEXPECTED_COMMAND",
            ScmErrorKind::Producer => "PRODUCER",
            ScmErrorKind::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Header of a `CHUNK` command. The bytes themselves follow as a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub sequence: u64,
    pub size_in_bytes: usize,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPayload {
    Empty,
    Chunk(ChunkHeader),
    Error { kind: ScmErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionControlMessage {
    pub command: Command,
    pub key: String,
    pub param: CommandPayload,
}

impl SessionControlMessage {
    pub fn ack(key: impl Into<String>) -> Self {
        Self {
            command: Command::Ack,
            key: key.into(),
            param: CommandPayload::Empty,
        }
    }

    pub fn reset(key: impl Into<String>) -> Self {
        Self {
            command: Command::Reset,
            key: key.into(),
            param: CommandPayload::Empty,
        }
    }

    pub fn chunk(key: impl Into<String>, header: ChunkHeader) -> Self {
        Self {
            command: Command::Chunk,
            key: key.into(),
            param: CommandPayload::Chunk(header),
        }
    }

    pub fn err(key: impl Into<String>, kind: ScmErrorKind, message: impl Into<String>) -> Self {
        Self {
            command: Command::Err,
            key: key.into(),
            param: CommandPayload::Error {
                kind,
                message: message.into(),
            },
        }
    }

    /// Chunk header, present only on well-formed `CHUNK` messages.
    pub fn chunk_header(&self) -> Option<&ChunkHeader> {
        match (&self.command, &self.param) {
            (Command::Chunk, CommandPayload::Chunk(header)) => Some(header),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_only_on_chunk_command() {
        let header = ChunkHeader {
            sequence: 3,
            size_in_bytes: 10,
            chunk_type: ChunkType::Last,
        };
        let chunk = SessionControlMessage::chunk("k", header);
        assert_eq!(chunk.chunk_header(), Some(&header));
        assert_eq!(SessionControlMessage::ack("k").chunk_header(), None);
    }

    #[test]
    fn test_wire_names() {
        let msg = SessionControlMessage::err("k", ScmErrorKind::InvalidSize, "short read");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command"], "ERR");
        assert_eq!(value["param"]["error"]["kind"], "INVALID_SIZE");

        let chunk = SessionControlMessage::chunk(
            "k",
            ChunkHeader {
                sequence: 0,
                size_in_bytes: 4,
                chunk_type: ChunkType::Continue,
            },
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["param"]["chunk"]["type"], "CONTINUE");
        assert_eq!(value["param"]["chunk"]["sizeInBytes"], 4);
    }
}
