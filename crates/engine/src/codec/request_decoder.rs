//! Streaming request decoder.
//!
//! Yields the head of a request once, then its body chunks ending in
//! [`BodyChunk::End`], then the next pipelined head. The connection driver
//! calls it directly on its read buffer instead of going through `FramedRead`
//! since it has to stop decoding while a handler has paused the request.

use crate::codec::body::BodyDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{BodyChunk, ParseError, RequestItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

#[derive(Debug, Default)]
pub struct RequestDecoder {
    head: HeaderDecoder,
    body: Option<BodyDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self { head: HeaderDecoder::with_max_header_bytes(max_header_bytes), body: None }
    }

    /// whether the decoder is in the middle of a request body
    pub fn in_body(&self) -> bool {
        self.body.is_some()
    }
}

impl Decoder for RequestDecoder {
    type Item = RequestItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(body) = &mut self.body else {
            return Ok(self.head.decode(src)?.map(|(header, framing)| {
                self.body = Some(framing.into());
                RequestItem::Head(header, framing)
            }));
        };

        let chunk = body.decode(src)?;
        if chunk.as_ref().is_some_and(BodyChunk::is_end) {
            self.body = None;
        }
        Ok(chunk.map(RequestItem::Body))
    }
}
