use std::io;
use thiserror::Error;

/// Errors that end a connection driver.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("bad request: {source}")]
    Request {
        #[from]
        source: ParseError,
    },

    #[error("bad frame: {source}")]
    Frame {
        #[from]
        source: FrameError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A request head or body that can't be accepted.
///
/// Head errors are answered with [`ParseError::status`] before the connection closes.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("request head of {current_size} bytes exceeds {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} headers")]
    TooManyHeaders { max_num: usize },

    #[error("malformed header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported http version 1.{0:?}")]
    InvalidVersion(Option<u8>),

    #[error("malformed method")]
    InvalidMethod,

    #[error("malformed request target")]
    InvalidUri,

    #[error("malformed content-length: {reason}")]
    InvalidContentLength { reason: String },

    #[error("malformed body: {reason}")]
    InvalidBody { reason: String },

    #[error("read failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    /// The status line a rejected request is answered with.
    pub fn status(&self) -> &'static str {
        match self {
            Self::TooLargeHeader { .. } | Self::TooManyHeaders { .. } => "431 Request Header Fields Too Large",
            Self::InvalidVersion(_) => "505 HTTP Version Not Supported",
            _ => "400 Bad Request",
        }
    }
}

/// Malformed or unacceptable websocket traffic.
///
/// Every variant maps to the close code sent to the peer, see [`FrameError::close_code`].
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("payload too large, current: {current_size} exceed the limit {max_size}")]
    PayloadTooLarge { current_size: u64, max_size: usize },

    #[error("text message is not valid utf-8")]
    InvalidUtf8,

    #[error("inflate failed: {reason}")]
    Inflate { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl FrameError {
    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }

    pub fn payload_too_large(current_size: u64, max_size: usize) -> Self {
        Self::PayloadTooLarge { current_size, max_size }
    }

    pub fn inflate<S: ToString>(str: S) -> Self {
        Self::Inflate { reason: str.to_string() }
    }

    /// The close code this error is reported with.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol { .. } | Self::Inflate { .. } => 1002,
            Self::PayloadTooLarge { .. } => 1009,
            Self::InvalidUtf8 => 1007,
            Self::Io { .. } => 1006,
        }
    }
}

/// Misuse of an [`HttpResponse`](crate::response::HttpResponse) handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// the request this handle belonged to has completed, aborted or upgraded
    #[error("response is gone")]
    Gone,

    #[error("response already finished")]
    Finished,

    #[error("headers already sent")]
    HeadersSent,

    #[error("write offset can't move backwards, current: {current} requested: {requested}")]
    OffsetRegression { current: u64, requested: u64 },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },
}

impl ResponseError {
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }
}

/// Loop level failures.
#[derive(Error, Debug)]
pub enum EngineError {
    /// the connection a token referred to is closed
    #[error("connection is gone")]
    Gone,

    #[error("event loop is closed")]
    LoopClosed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Rejected [`EngineConfig`](crate::config::EngineConfig) values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("cork buffer size {cork} exceed the send buffer limit {limit}")]
    CorkExceedsLimit { cork: usize, limit: usize },
}
