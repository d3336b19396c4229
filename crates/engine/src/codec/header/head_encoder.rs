//! Serialization of response heads.
//!
//! A response head is written piecewise as the handler calls `write_status`,
//! `write_header` and finally writes a body, so the encoder consumes
//! [`HeadPart`]s rather than a complete head.

use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
    /// no length header at all, used by `end_without_body`
    Omitted,
}

#[derive(Debug, Clone, Copy)]
pub enum HeadPart<'a> {
    /// `HTTP/1.1 {status}\r\n`, the status includes the reason phrase
    Status(&'a str),
    Header(&'a [u8], &'a [u8]),
    IntHeader(&'a [u8], u64),
    /// an interim `100 Continue` head
    Continue,
    /// engine headers plus the empty line ending the head
    Finish { date: Option<&'a [u8]>, framing: Framing, close: bool },
    /// a complete `101` websocket handshake response
    SwitchingProtocols { accept: &'a str, protocol: Option<&'a str>, extensions: Option<&'a str> },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeadEncoder;

impl Encoder<HeadPart<'_>> for HeadEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: HeadPart<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            HeadPart::Status(status) => {
                dst.put_slice(b"HTTP/1.1 ");
                dst.put_slice(status.as_bytes());
                dst.put_slice(b"\r\n");
            }
            HeadPart::Header(name, value) => put_header(dst, name, value),
            HeadPart::IntHeader(name, value) => {
                dst.put_slice(name);
                write!(FastWrite(dst), ": {value}\r\n")?;
            }
            HeadPart::Continue => dst.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n"),
            HeadPart::Finish { date, framing, close } => {
                if let Some(date) = date {
                    put_header(dst, b"Date", date);
                }
                match framing {
                    Framing::Length(length) => write!(FastWrite(dst), "Content-Length: {length}\r\n")?,
                    Framing::Chunked => dst.put_slice(b"Transfer-Encoding: chunked\r\n"),
                    Framing::Omitted => {}
                }
                if close {
                    dst.put_slice(b"Connection: close\r\n");
                }
                dst.put_slice(b"\r\n");
            }
            HeadPart::SwitchingProtocols { accept, protocol, extensions } => {
                dst.put_slice(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n");
                put_header(dst, b"Sec-WebSocket-Accept", accept.as_bytes());
                if let Some(protocol) = protocol {
                    put_header(dst, b"Sec-WebSocket-Protocol", protocol.as_bytes());
                }
                if let Some(extensions) = extensions {
                    put_header(dst, b"Sec-WebSocket-Extensions", extensions.as_bytes());
                }
                dst.put_slice(b"\r\n");
            }
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.reserve(name.len() + value.len() + 4);
    dst.put_slice(name);
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}

struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
