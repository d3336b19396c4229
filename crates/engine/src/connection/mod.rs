//! Connection drivers.
//!
//! - [`HttpConnection`] decodes requests, dispatches them to the handler and
//!   writes whatever the handler queued on its response
//! - the websocket driver takes over the transport after a `101` was written
//!
//! Both drivers move bytes through a [`Transport`]: one `select!` that makes
//! write progress on the in-flight segment, reads more input, or wakes up
//! because a handle queued output from somewhere else on the loop.

mod http_connection;
mod ws_connection;

use std::future::pending;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

pub(crate) use http_connection::HttpConnection;
pub(crate) use ws_connection::pending_upgrade;

const READ_CHUNK: usize = 8 * 1024;

/// What ended one [`Transport::pump`] round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// new bytes are in the read buffer
    Read,
    /// the peer closed its side
    Eof,
    /// part of the segment was written, `true` once all of it was
    Wrote(bool),
    Notified,
    TimedOut,
}

pub(crate) struct Transport<R, W> {
    reader: R,
    writer: W,
    pub(crate) read_buf: BytesMut,
    segment: Option<Bytes>,
    eof: bool,
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(reader: R, writer: W, read_buf: BytesMut) -> Self {
        Self { reader, writer, read_buf, segment: None, eof: false }
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.segment.is_some()
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// Takes the next segment to write when nothing is in flight.
    pub(crate) fn load(&mut self, take: impl FnOnce() -> Option<Bytes>) {
        if self.segment.is_none() {
            self.segment = take();
        }
    }

    pub(crate) async fn pump(&mut self, notify: &Notify, read: bool, deadline: Option<Instant>) -> io::Result<Wake> {
        let writing = self.segment.is_some();
        let reading = read && !self.eof;
        if reading && self.read_buf.capacity() - self.read_buf.len() < READ_CHUNK / 2 {
            self.read_buf.reserve(READ_CHUNK);
        }

        let timer = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending().await,
            }
        };

        tokio::select! {
            biased;
            written = write_some(&mut self.writer, &mut self.segment), if writing => written.map(Wake::Wrote),
            read = self.reader.read_buf(&mut self.read_buf), if reading => match read? {
                0 => {
                    self.eof = true;
                    Ok(Wake::Eof)
                }
                _ => Ok(Wake::Read),
            },
            _ = notify.notified() => Ok(Wake::Notified),
            _ = timer => Ok(Wake::TimedOut),
        }
    }

    /// Flushes and closes the write side, errors only mean the peer is already gone.
    pub(crate) async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(cause = %e, "shutdown failed");
        }
    }

    pub(crate) fn into_parts(self) -> (R, W, BytesMut) {
        (self.reader, self.writer, self.read_buf)
    }
}

async fn write_some<W: AsyncWrite + Unpin>(writer: &mut W, segment: &mut Option<Bytes>) -> io::Result<bool> {
    let Some(bytes) = segment else {
        return Ok(false);
    };

    let written = writer.write(bytes).await?;
    if written == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    bytes.advance(written);

    if bytes.is_empty() {
        *segment = None;
        writer.flush().await?;
        return Ok(true);
    }
    Ok(false)
}
