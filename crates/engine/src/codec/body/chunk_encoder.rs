use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::BodyChunk;

/// Frames response body writes for `Transfer-Encoding: chunked`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkEncoder;

impl Encoder<BodyChunk> for ChunkEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: BodyChunk, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            // an empty chunk would read as the terminator
            BodyChunk::Data(bytes) if bytes.is_empty() => {}
            BodyChunk::Data(bytes) => {
                dst.reserve(bytes.len() + 20);
                write!(Writer(dst), "{:X}\r\n", bytes.len())?;
                dst.put_slice(&bytes);
                dst.put_slice(b"\r\n");
            }
            BodyChunk::End => dst.put_slice(b"0\r\n\r\n"),
        }
        Ok(())
    }
}

struct Writer<'a>(&'a mut BytesMut);

impl io::Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
