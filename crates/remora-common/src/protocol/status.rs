//! Response status codes.
//!
//! Codes follow the HTTP numbering the handshake and dispatcher speak:
//! `200` means success, anything else carries a textual body.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric status carried in [`Response::code`](super::Response).
pub type StatusCode = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    Timeout,
    InternalServerError,
    NotImplemented,
    ChannelClosed,
}

impl Status {
    pub const fn code(self) -> StatusCode {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Timeout => 408,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
            Status::ChannelClosed => 510,
        }
    }

    pub fn from_code(code: StatusCode) -> Option<Self> {
        Some(match code {
            200 => Status::Ok,
            400 => Status::BadRequest,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            408 => Status::Timeout,
            500 => Status::InternalServerError,
            501 => Status::NotImplemented,
            510 => Status::ChannelClosed,
            _ => return None,
        })
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Status::Ok)
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::Timeout => "Timeout",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::ChannelClosed => "Channel Closed",
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        status.code()
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> std::result::Result<Self, Self::Error> {
        Status::from_code(code).ok_or_else(|| format!("unknown status code {}", code))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_from_code() {
        for status in [
            Status::Ok,
            Status::BadRequest,
            Status::Forbidden,
            Status::NotFound,
            Status::Timeout,
            Status::InternalServerError,
            Status::NotImplemented,
            Status::ChannelClosed,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(299), None);
    }

    #[test]
    fn test_only_ok_is_success() {
        assert!(Status::Ok.is_success());
        assert!(!Status::Timeout.is_success());
        assert!(!Status::ChannelClosed.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::NotFound.to_string(), "404 Not Found");
    }
}
