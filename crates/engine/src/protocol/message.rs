//! Items produced by the request decoder.

use bytes::Bytes;

use crate::protocol::RequestHeader;

/// One step of a request stream: a head, then its body chunks up to [`BodyChunk::End`].
#[derive(Debug)]
pub enum RequestItem {
    Head(RequestHeader, BodyFraming),
    Body(BodyChunk),
}

impl RequestItem {
    pub fn into_body(self) -> Option<BodyChunk> {
        match self {
            RequestItem::Body(chunk) => Some(chunk),
            RequestItem::Head(..) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyChunk {
    Data(Bytes),
    /// the body is complete, sent once per request even when it had no bytes
    End,
}

impl BodyChunk {
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            BodyChunk::Data(bytes) => Some(bytes),
            BodyChunk::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, BodyChunk::End)
    }
}

/// How the body after a request head is delimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    Empty,
}

impl BodyFraming {
    /// `Content-Length: 0` has no body to read
    pub fn from_length(length: u64) -> Self {
        if length == 0 { Self::Empty } else { Self::Length(length) }
    }

    pub fn has_body(self) -> bool {
        self != Self::Empty
    }
}
