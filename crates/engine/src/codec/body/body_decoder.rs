use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::protocol::{BodyChunk, BodyFraming, ParseError};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Decodes one request body, as delimited by its head.
///
/// Never reads past the body, so the bytes of a pipelined request stay in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    Empty,
}

impl From<BodyFraming> for BodyDecoder {
    fn from(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Length(remaining) => Self::Length { remaining },
            BodyFraming::Chunked => Self::Chunked(ChunkedDecoder::new()),
            BodyFraming::Empty => Self::Empty,
        }
    }
}

impl Decoder for BodyDecoder {
    type Item = BodyChunk;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            Self::Chunked(chunked) => chunked.decode(src),
            Self::Empty | Self::Length { remaining: 0 } => Ok(Some(BodyChunk::End)),
            Self::Length { .. } if src.is_empty() => Ok(None),
            Self::Length { remaining } => {
                let take = usize::try_from(*remaining).map_or(src.len(), |left| left.min(src.len()));
                *remaining -= take as u64;
                Ok(Some(BodyChunk::Data(src.split_to(take).freeze())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_body_stops_at_the_next_request() {
        let mut buffer = BytesMut::from(&b"1012345678GET / HTTP/1.1"[..]);
        let mut decoder = BodyDecoder::from(BodyFraming::Length(10));

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.data(), Some(&b"1012345678"[..]));
        assert_eq!(&buffer[..], b"GET / HTTP/1.1");
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(BodyChunk::End));
    }

    #[test]
    fn length_body_split_across_reads() {
        let mut decoder = BodyDecoder::from(BodyFraming::Length(6));
        let mut buffer = BytesMut::from(&b"abc"[..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().data(), Some(&b"abc"[..]));
        assert_eq!(decoder, BodyDecoder::Length { remaining: 3 });
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"defGET");
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().data(), Some(&b"def"[..]));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_end());
        assert_eq!(&buffer[..], b"GET");
    }

    #[test]
    fn empty_body_ends_right_away() {
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1"[..]);
        let mut decoder = BodyDecoder::from(BodyFraming::from_length(0));
        assert_eq!(decoder, BodyDecoder::Empty);
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(BodyChunk::End));
        assert_eq!(buffer.len(), 14);
    }
}
