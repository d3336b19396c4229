//! Request head decoding on top of `httparse`.
//!
//! The decoder parses into a fixed array of headers, records where every name
//! and value lives in the source buffer and then splits the head off the buffer
//! once, so header values share the received allocation instead of being copied.

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Method, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{BodyFraming, ParseError, RequestHeader};
use crate::utils::ensure;

pub const MAX_HEADER_NUM: usize = 64;

pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// smallest complete request: `GET / HTTP/1.1\r\n\r\n` without the path
const MIN_REQUEST_LEN: usize = 14;

#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder {
    max_header_bytes: usize,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self { max_header_bytes: DEFAULT_MAX_HEADER_BYTES }
    }
}

impl HeaderDecoder {
    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, BodyFraming);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MIN_REQUEST_LEN {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let parsed_result = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            Error::Version => ParseError::InvalidVersion(None),
            e => ParseError::invalid_header(e.to_string()),
        });

        let body_offset = match parsed_result? {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
                return Ok(None);
            }
        };

        trace!(head_size = body_offset, "parsed request head");
        ensure!(body_offset <= self.max_header_bytes, ParseError::too_large_header(body_offset, self.max_header_bytes));

        let header_count = req.headers.len();
        let mut header_index = [HeaderIndex::EMPTY; MAX_HEADER_NUM];
        HeaderIndex::record(src, req.headers, &mut header_index);

        let version = match req.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            _ => return Err(ParseError::InvalidVersion(req.version)),
        };

        let raw_method = req.method.ok_or(ParseError::InvalidMethod)?;
        let method = Method::from_bytes(raw_method.to_ascii_uppercase().as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
        let raw_method: Box<str> = raw_method.into();

        let path = req.path.ok_or(ParseError::InvalidUri)?;
        let uri = path.parse::<http::Uri>().map_err(|_| ParseError::InvalidUri)?;

        let mut inner = Request::new(());
        *inner.method_mut() = method;
        *inner.uri_mut() = uri;
        *inner.version_mut() = version;
        inner.headers_mut().reserve(header_count);

        let mut ordered = Vec::with_capacity(header_count);
        let header_bytes = src.split_to(body_offset).freeze();
        for index in &header_index[..header_count] {
            let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
            let value =
                HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1)).map_err(ParseError::invalid_header)?;

            inner.headers_mut().append(name.clone(), value.clone());
            ordered.push((name, value));
        }

        let header = RequestHeader::new(inner, raw_method, ordered);
        let framing = parse_framing(&header)?;

        Ok(Some((header, framing)))
    }
}

#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    const EMPTY: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            indices.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            indices.value = (value_start, value_start + header.value.len());
        }
    }
}

fn parse_framing(header: &RequestHeader) -> Result<BodyFraming, ParseError> {
    let headers = header.headers();
    let transfer_encoding = headers.get(http::header::TRANSFER_ENCODING);
    let mut lengths = headers.get_all(http::header::CONTENT_LENGTH).iter();

    let Some(length) = lengths.next() else {
        return match transfer_encoding {
            None => Ok(BodyFraming::Empty),
            Some(coding) if is_chunked(coding) => Ok(BodyFraming::Chunked),
            Some(_) => Err(ParseError::invalid_header("transfer-encoding without a final chunked coding")),
        };
    };
    ensure!(transfer_encoding.is_none(), ParseError::invalid_content_length("both transfer-encoding and content-length are present"));

    let length = parse_length(length)?;
    for other in lengths {
        ensure!(parse_length(other)? == length, ParseError::invalid_content_length("conflicting content-length values"));
    }
    Ok(BodyFraming::from_length(length))
}

fn parse_length(value: &HeaderValue) -> Result<u64, ParseError> {
    let text = value.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?.trim();
    ensure!(!text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()), ParseError::invalid_content_length(format!("{text} is not a length")));
    text.parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("{text} is too large")))
}

fn is_chunked(header_value: &HeaderValue) -> bool {
    header_value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
