//! `Transfer-Encoding: chunked` request bodies.
//!
//! Works line by line: a size line (extensions ignored), the chunk data and its
//! CRLF, and after the zero sized chunk the trailer section up to the empty line.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, BodyChunk};
use crate::utils::ensure;

/// longest accepted size line, extensions included
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }
}

impl Decoder for ChunkedDecoder {
    type Item = BodyChunk;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line) = take_line(src, MAX_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    let size = parse_size(&line)?;
                    trace!(size, "read chunk size");
                    self.state = if size == 0 { State::Trailers } else { State::Data(size) };
                }
                State::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = usize::try_from(remaining).map_or(src.len(), |remaining| remaining.min(src.len()));
                    let bytes = src.split_to(len).freeze();
                    let remaining = remaining - bytes.len() as u64;
                    self.state = if remaining == 0 { State::DataEnd } else { State::Data(remaining) };
                    return Ok(Some(BodyChunk::Data(bytes)));
                }
                State::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    ensure!(&src[..2] == b"\r\n", ParseError::invalid_body("chunk data not followed by CRLF"));
                    src.advance(2);
                    self.state = State::Size;
                }
                State::Trailers => {
                    let Some(line) = take_line(src, MAX_SIZE_LINE)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(Some(BodyChunk::End)),
            }
        }
    }
}

/// Splits one CRLF terminated line off `src`, without the terminator.
fn take_line(src: &mut BytesMut, limit: usize) -> Result<Option<BytesMut>, ParseError> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = src.split_to(pos);
            src.advance(2);
            Ok(Some(line))
        }
        None => {
            ensure!(src.len() <= limit, ParseError::invalid_body("chunk size line too long"));
            Ok(None)
        }
    }
}

fn parse_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    ensure!(!digits.is_empty(), ParseError::invalid_body("empty chunk size"));

    digits.iter().try_fold(0u64, |size, b| {
        let digit = char::from(*b).to_digit(16).ok_or_else(|| ParseError::invalid_body("invalid chunk size"))?;
        size.checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflow"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut ChunkedDecoder, buf: &mut BytesMut) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        loop {
            match decoder.decode(buf).unwrap() {
                Some(BodyChunk::Data(bytes)) => body.extend_from_slice(&bytes),
                Some(BodyChunk::End) => return (body, true),
                None => return (body, false),
            }
        }
    }

    #[test]
    fn complete_body_with_extension_and_trailer() {
        let mut buf = BytesMut::from(&b"5;name=v\r\nhello\r\n6\r\n world\r\n0\r\nExpires: never\r\n\r\nNEXT"[..]);
        let (body, eof) = collect(&mut ChunkedDecoder::new(), &mut buf);
        assert!(eof);
        assert_eq!(body, b"hello world");
        assert_eq!(&buf[..], b"NEXT");
    }

    #[test]
    fn resumes_across_partial_reads() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"A\r\n01234"[..]);
        let (body, eof) = collect(&mut decoder, &mut buf);
        assert_eq!(body, b"01234");
        assert!(!eof);

        buf.extend_from_slice(b"56789\r\n0\r\n\r\n");
        let (body, eof) = collect(&mut decoder, &mut buf);
        assert_eq!(body, b"56789");
        assert!(eof);
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(ChunkedDecoder::new().decode(&mut buf), Err(ParseError::InvalidBody { .. })));

        let mut buf = BytesMut::from(&b"2\r\nabX\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_overflowing_size() {
        let mut buf = BytesMut::from(&b"fffffffffffffffffff\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }
}
