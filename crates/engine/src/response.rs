//! The response side of one in-flight request.
//!
//! [`HttpResponse`] is a cheap, clonable handle onto the connection the request
//! arrived on, stamped with the request's generation. The connection bumps the
//! generation for every new request, so a handle kept past its request fails
//! every call with [`ResponseError::Gone`] instead of writing into somebody
//! else's response.
//!
//! ```text
//! Idle -> StatusWritten -> HeadersWritten -> BodyStreaming -> Ended
//!   \__________________________\_________________\_________-> Aborted
//! Idle -> Upgraded
//! ```
//!
//! Writes never block: bytes are queued on the connection. `write` reports
//! backpressure with `false` once the queue exceeds the send buffer limit,
//! `try_end` only takes what still fits. [`HttpResponse::on_writable`] fires
//! when queued bytes were handed to the transport while backpressured.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use futures::future::LocalBoxFuture;
use http::{HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_util::codec::Encoder;
use tracing::{debug, error};

use crate::codec::{ChunkEncoder, Framing, HeadEncoder, HeadPart};
use crate::config::EngineConfig;
use crate::connection::pending_upgrade;
use crate::outbound::Outbound;
use crate::protocol::{BodyChunk, ResponseError};
use crate::reactor::{LoopContext, ResponseToken, SocketId};
use crate::utils::ensure;
use crate::websocket::{UpgradeContext, accept_key, negotiate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    Idle,
    StatusWritten,
    HeadersWritten,
    BodyStreaming,
    Ended,
    Aborted,
    Upgraded,
}

impl ResponsePhase {
    fn is_head(self) -> bool {
        matches!(self, ResponsePhase::Idle | ResponsePhase::StatusWritten | ResponsePhase::HeadersWritten)
    }
}

#[derive(Debug)]
pub(crate) struct ResponseState {
    pub(crate) phase: ResponsePhase,
    write_offset: u64,
    total: Option<u64>,
    chunked: bool,
    pub(crate) backpressure: bool,
}

impl ResponseState {
    fn new(phase: ResponsePhase) -> Self {
        Self { phase, write_offset: 0, total: None, chunked: false, backpressure: false }
    }
}

#[derive(Debug, Default)]
pub(crate) struct BodyState {
    pub(crate) pending: VecDeque<Bytes>,
    pub(crate) pending_bytes: usize,
    /// the decoder reached the end of the body
    pub(crate) eof: bool,
    /// `on_data` saw `is_last`, or the body was discarded
    pub(crate) consumed: bool,
    pub(crate) paused: bool,
}

pub(crate) type WritableHandler = Box<dyn FnMut(&HttpResponse, u64) -> bool>;
pub(crate) type DataHandler = Box<dyn FnMut(&HttpResponse, &[u8], bool)>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) on_writable: Option<WritableHandler>,
    pub(crate) on_aborted: Option<Box<dyn FnOnce()>>,
    pub(crate) on_data: Option<DataHandler>,
}

impl Callbacks {
    fn clear(&mut self) {
        *self = Callbacks::default();
    }
}

/// The transport of an upgraded connection, handed from the HTTP driver to the websocket driver.
pub(crate) struct UpgradedIo<R = Box<dyn AsyncRead + Unpin>, W = Box<dyn AsyncWrite + Unpin>> {
    pub(crate) reader: R,
    pub(crate) writer: W,
    pub(crate) read_buf: BytesMut,
    pub(crate) remote: Option<SocketAddr>,
}

pub(crate) type PendingUpgrade = Box<dyn FnOnce(UpgradedIo) -> LocalBoxFuture<'static, ()>>;

/// Connection state shared between the HTTP driver and the response handles.
pub(crate) struct HttpSocket {
    pub(crate) id: SocketId,
    remote: Option<SocketAddr>,
    pub(crate) outbound: Outbound,
    pub(crate) generation: u64,
    pub(crate) state: ResponseState,
    pub(crate) body: BodyState,
    pub(crate) callbacks: Callbacks,
    pub(crate) keep_alive: bool,
    head_only: bool,
    pub(crate) close_requested: bool,
    pub(crate) upgrade: Option<PendingUpgrade>,
    pub(crate) notify: Rc<Notify>,
}

impl fmt::Debug for HttpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSocket")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

impl HttpSocket {
    pub(crate) fn new(id: SocketId, remote: Option<SocketAddr>, config: &EngineConfig) -> Self {
        Self {
            id,
            remote,
            outbound: Outbound::new(config.send_buffer_limit(), config.cork_buffer_size()),
            generation: 0,
            state: ResponseState::new(ResponsePhase::Ended),
            body: BodyState { eof: true, consumed: true, ..BodyState::default() },
            callbacks: Callbacks::default(),
            keep_alive: true,
            head_only: false,
            close_requested: false,
            upgrade: None,
            notify: Rc::new(Notify::new()),
        }
    }

    /// Starts the response of a freshly decoded request.
    pub(crate) fn begin(&mut self, keep_alive: bool, head_only: bool, has_body: bool) -> u64 {
        self.generation += 1;
        self.state = ResponseState::new(ResponsePhase::Idle);
        self.body = BodyState { eof: !has_body, ..BodyState::default() };
        self.callbacks.clear();
        self.keep_alive = keep_alive;
        self.head_only = head_only;
        self.generation
    }

    pub(crate) fn is_pending(&self) -> bool {
        !matches!(self.state.phase, ResponsePhase::Ended | ResponsePhase::Aborted | ResponsePhase::Upgraded)
    }

    fn write_head(&mut self, part: HeadPart<'_>) {
        let mut buf = BytesMut::with_capacity(128);
        match HeadEncoder.encode(part, &mut buf) {
            Ok(()) => self.outbound.push(buf.freeze()),
            Err(e) => error!(cause = %e, "failed to encode response head"),
        }
    }

    fn ensure_status(&mut self) {
        if self.state.phase == ResponsePhase::Idle {
            self.write_head(HeadPart::Status("200 OK"));
            self.state.phase = ResponsePhase::StatusWritten;
        }
    }

    fn finish_head(&mut self, date: &[u8], framing: Framing) {
        self.ensure_status();
        let date = (!date.is_empty()).then_some(date);
        self.write_head(HeadPart::Finish { date, framing, close: !self.keep_alive });
        self.state.phase = ResponsePhase::BodyStreaming;
        self.state.chunked = framing == Framing::Chunked;
        if let Framing::Length(total) = framing {
            self.state.total = Some(total);
        }
    }

    fn push_body(&mut self, data: &[u8]) {
        if !self.head_only && !data.is_empty() {
            self.outbound.push(Bytes::copy_from_slice(data));
        }
        self.state.write_offset += data.len() as u64;
    }

    fn push_chunk(&mut self, item: BodyChunk) {
        if let BodyChunk::Data(bytes) = &item {
            self.state.write_offset += bytes.len() as u64;
        }
        if self.head_only {
            return;
        }
        let mut buf = BytesMut::new();
        match ChunkEncoder.encode(item, &mut buf) {
            Ok(()) => self.outbound.push(buf.freeze()),
            Err(e) => error!(cause = %e, "failed to encode chunk"),
        }
    }

    fn complete(&mut self) {
        self.state.phase = ResponsePhase::Ended;
        self.callbacks.on_writable = None;
        self.callbacks.on_aborted = None;
        self.notify.notify_one();
    }

    /// Marks a pending response aborted and hands back its `on_aborted` callback.
    pub(crate) fn abort(&mut self) -> Option<Box<dyn FnOnce()>> {
        if !self.is_pending() {
            return None;
        }
        self.state.phase = ResponsePhase::Aborted;
        let on_aborted = self.callbacks.on_aborted.take();
        self.callbacks.clear();
        self.body.pending.clear();
        self.body.pending_bytes = 0;
        on_aborted
    }

    /// Answers `500` if nothing was written yet, otherwise gives up on the connection.
    pub(crate) fn recover_from_panic(&mut self, date: &[u8]) {
        self.keep_alive = false;
        self.outbound.reset_cork();
        if self.state.phase == ResponsePhase::Idle {
            self.write_head(HeadPart::Status("500 Internal Server Error"));
            self.state.phase = ResponsePhase::StatusWritten;
            self.finish_head(date, Framing::Length(0));
            self.complete();
        } else if self.is_pending() {
            self.close_requested = true;
            self.notify.notify_one();
        }
    }
}

/// Leaves a cork scope on drop, so a panicking handler can't leave the queue corked.
struct CorkScope<'a>(&'a RefCell<HttpSocket>);

impl Drop for CorkScope<'_> {
    fn drop(&mut self) {
        let mut socket = self.0.borrow_mut();
        if socket.outbound.uncork() {
            socket.notify.notify_one();
        }
    }
}

/// Handle onto the response of one request, see the [module docs](self).
#[derive(Clone)]
pub struct HttpResponse {
    socket: Rc<RefCell<HttpSocket>>,
    ctx: Rc<LoopContext>,
    generation: u64,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse").field("generation", &self.generation).field("phase", &self.phase()).finish()
    }
}

impl HttpResponse {
    pub(crate) fn new(socket: Rc<RefCell<HttpSocket>>, ctx: Rc<LoopContext>, generation: u64) -> Self {
        Self { socket, ctx, generation }
    }

    /// Runs `f` if this handle's request is still the connection's current one.
    fn with_current<T>(&self, f: impl FnOnce(&mut HttpSocket) -> Result<T, ResponseError>) -> Result<T, ResponseError> {
        let mut socket = self.socket.borrow_mut();
        ensure!(socket.generation == self.generation, ResponseError::Gone);
        f(&mut socket)
    }

    /// Like [`Self::with_current`] but also requires a response that can still be written to.
    fn with_live<T>(&self, f: impl FnOnce(&mut HttpSocket) -> Result<T, ResponseError>) -> Result<T, ResponseError> {
        self.with_current(|socket| match socket.state.phase {
            ResponsePhase::Ended => Err(ResponseError::Finished),
            ResponsePhase::Aborted | ResponsePhase::Upgraded => Err(ResponseError::Gone),
            _ => f(socket),
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        let socket = self.socket.borrow();
        socket.generation == self.generation && socket.is_pending()
    }

    /// current phase, `None` once the connection moved on to another request
    pub fn phase(&self) -> Option<ResponsePhase> {
        let socket = self.socket.borrow();
        (socket.generation == self.generation).then_some(socket.state.phase)
    }

    /// Writes the status line, e.g. `"404 Not Found"`. Defaults to `"200 OK"` when skipped.
    pub fn write_status(&self, status: &str) -> Result<&Self, ResponseError> {
        self.with_live(|socket| {
            ensure!(socket.state.phase == ResponsePhase::Idle, ResponseError::HeadersSent);
            ensure!(!status.contains(['\r', '\n']), ResponseError::invalid_header("status contains a line break"));
            socket.write_head(HeadPart::Status(status));
            socket.state.phase = ResponsePhase::StatusWritten;
            Ok(())
        })?;
        Ok(self)
    }

    pub fn write_header(&self, key: &str, value: impl AsRef<[u8]>) -> Result<&Self, ResponseError> {
        let value = value.as_ref();
        HeaderName::from_bytes(key.as_bytes()).map_err(ResponseError::invalid_header)?;
        HeaderValue::from_bytes(value).map_err(ResponseError::invalid_header)?;

        self.with_live(|socket| {
            ensure!(socket.state.phase.is_head(), ResponseError::HeadersSent);
            socket.ensure_status();
            socket.write_head(HeadPart::Header(key.as_bytes(), value));
            socket.state.phase = ResponsePhase::HeadersWritten;
            Ok(())
        })?;
        Ok(self)
    }

    pub fn write_header_int(&self, key: &str, value: u64) -> Result<&Self, ResponseError> {
        HeaderName::from_bytes(key.as_bytes()).map_err(ResponseError::invalid_header)?;

        self.with_live(|socket| {
            ensure!(socket.state.phase.is_head(), ResponseError::HeadersSent);
            socket.ensure_status();
            socket.write_head(HeadPart::IntHeader(key.as_bytes(), value));
            socket.state.phase = ResponsePhase::HeadersWritten;
            Ok(())
        })?;
        Ok(self)
    }

    /// Sends an interim `100 Continue`.
    pub fn write_continue(&self) -> Result<&Self, ResponseError> {
        self.with_live(|socket| {
            ensure!(socket.state.phase == ResponsePhase::Idle, ResponseError::HeadersSent);
            socket.write_head(HeadPart::Continue);
            socket.notify.notify_one();
            Ok(())
        })?;
        Ok(self)
    }

    /// Streams `data` with chunked transfer encoding.
    ///
    /// Never drops bytes. Returns `false` when the connection's queue now
    /// exceeds the send buffer limit; wait for [`Self::on_writable`] before
    /// writing more.
    pub fn write(&self, data: &[u8]) -> Result<bool, ResponseError> {
        let date = self.ctx.date();
        self.with_live(|socket| {
            if socket.state.phase.is_head() {
                socket.finish_head(&date, Framing::Chunked);
            } else {
                ensure!(socket.state.chunked, ResponseError::HeadersSent);
            }

            if !data.is_empty() {
                socket.push_chunk(BodyChunk::Data(Bytes::copy_from_slice(data)));
            }

            let ok = !socket.outbound.is_over_limit();
            if !ok {
                socket.state.backpressure = true;
            }
            socket.notify.notify_one();
            Ok(ok)
        })
    }

    /// Ends the response with `data` as the last (or only) body bytes.
    pub fn end(&self, data: &[u8], close_connection: bool) -> Result<(), ResponseError> {
        let date = self.ctx.date();
        self.with_live(|socket| {
            if close_connection {
                socket.keep_alive = false;
            }

            if socket.state.phase.is_head() {
                socket.finish_head(&date, Framing::Length(data.len() as u64));
                socket.push_body(data);
            } else if socket.state.chunked {
                if !data.is_empty() {
                    socket.push_chunk(BodyChunk::Data(Bytes::copy_from_slice(data)));
                }
                socket.push_chunk(BodyChunk::End);
            } else {
                let total = socket.state.total.unwrap_or_default();
                let remaining = usize::try_from(total.saturating_sub(socket.state.write_offset)).unwrap_or(usize::MAX);
                if data.len() > remaining {
                    debug!(total, extra = data.len() - remaining, "end data past the declared length truncated");
                }
                socket.push_body(&data[..data.len().min(remaining)]);
                if socket.state.write_offset < total {
                    // the peer is still waiting for body bytes that never come
                    socket.keep_alive = false;
                }
            }

            socket.complete();
            Ok(())
        })
    }

    /// Ends the response without a length header or body, for `HEAD` style answers.
    pub fn end_without_body(&self, close_connection: bool) -> Result<(), ResponseError> {
        let date = self.ctx.date();
        self.with_live(|socket| {
            if close_connection {
                socket.keep_alive = false;
            }
            if socket.state.phase.is_head() {
                socket.finish_head(&date, Framing::Omitted);
            } else if socket.state.chunked {
                socket.push_chunk(BodyChunk::End);
            }
            socket.complete();
            Ok(())
        })
    }

    /// Writes as much of `data` as fits, declaring `Content-Length: total` on the first call.
    ///
    /// Returns `(ok, has_responded)`: `ok` is `false` when only part of `data`
    /// was taken, `has_responded` once the write offset reached `total`.
    /// Callers retry the rest from [`Self::write_offset`] in [`Self::on_writable`].
    pub fn try_end(&self, data: &[u8], total: u64) -> Result<(bool, bool), ResponseError> {
        let date = self.ctx.date();
        self.with_live(|socket| {
            if socket.state.phase.is_head() {
                socket.finish_head(&date, Framing::Length(total));
            } else {
                ensure!(!socket.state.chunked, ResponseError::HeadersSent);
            }

            let declared = socket.state.total.unwrap_or(total);
            let remaining = declared.saturating_sub(socket.state.write_offset);
            let wanted = usize::try_from(remaining).map_or(data.len(), |remaining| remaining.min(data.len()));
            let take = if socket.head_only { wanted } else { wanted.min(socket.outbound.remaining_capacity()) };
            socket.push_body(&data[..take]);

            let ok = take == wanted;
            let has_responded = socket.state.write_offset >= declared;
            if has_responded {
                socket.complete();
            } else {
                if !ok {
                    socket.state.backpressure = true;
                }
                socket.notify.notify_one();
            }
            Ok((ok, has_responded))
        })
    }

    /// body bytes handed over so far
    pub fn write_offset(&self) -> Result<u64, ResponseError> {
        self.with_current(|socket| Ok(socket.state.write_offset))
    }

    /// Moves the write offset forward, for bodies written by other means.
    pub fn override_write_offset(&self, offset: u64) -> Result<(), ResponseError> {
        self.with_live(|socket| {
            let current = socket.state.write_offset;
            ensure!(offset >= current, ResponseError::OffsetRegression { current, requested: offset });
            socket.state.write_offset = offset;
            Ok(())
        })
    }

    /// `true` once the response ended, aborted or upgraded.
    pub fn has_responded(&self) -> bool {
        !self.is_live()
    }

    pub fn is_aborted(&self) -> bool {
        self.phase() == Some(ResponsePhase::Aborted)
    }

    /// Coalesces every write made by `f` into one transport write.
    pub fn cork<F: FnOnce()>(&self, f: F) -> Result<(), ResponseError> {
        self.with_current(|socket| {
            socket.outbound.cork();
            Ok(())
        })?;

        let _scope = CorkScope(&self.socket);
        f();
        Ok(())
    }

    /// Stops delivering request body chunks and reading from the socket.
    pub fn pause(&self) -> Result<(), ResponseError> {
        self.with_live(|socket| {
            socket.body.paused = true;
            Ok(())
        })
    }

    pub fn resume(&self) -> Result<(), ResponseError> {
        self.with_live(|socket| {
            socket.body.paused = false;
            socket.notify.notify_one();
            Ok(())
        })
    }

    /// Called with the write offset when backpressured bytes drained; return `true` to stay subscribed.
    pub fn on_writable<F>(&self, f: F) -> Result<&Self, ResponseError>
    where
        F: FnMut(&HttpResponse, u64) -> bool + 'static,
    {
        self.with_live(|socket| {
            socket.callbacks.on_writable = Some(Box::new(f));
            Ok(())
        })?;
        Ok(self)
    }

    /// Called at most once, when the peer goes away before the response ended.
    pub fn on_aborted<F: FnOnce() + 'static>(&self, f: F) -> Result<&Self, ResponseError> {
        self.with_live(|socket| {
            socket.callbacks.on_aborted = Some(Box::new(f));
            Ok(())
        })?;
        Ok(self)
    }

    /// Streams the request body, `is_last` marks the final chunk.
    pub fn on_data<F>(&self, f: F) -> Result<&Self, ResponseError>
    where
        F: FnMut(&HttpResponse, &[u8], bool) + 'static,
    {
        self.with_live(|socket| {
            socket.callbacks.on_data = Some(Box::new(f));
            socket.notify.notify_one();
            Ok(())
        })?;
        Ok(self)
    }

    /// Closes the connection right away, aborting the response if it didn't end.
    pub fn close(&self) -> Result<(), ResponseError> {
        self.with_current(|socket| {
            socket.close_requested = true;
            socket.notify.notify_one();
            Ok(())
        })
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.socket.borrow().remote
    }

    /// the peer's ip address as text, empty when unknown
    pub fn remote_address_as_text(&self) -> String {
        self.remote_address().map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    /// A `Send` token to find this response again from a deferred callback.
    pub fn token(&self) -> Result<ResponseToken, ResponseError> {
        self.with_current(|socket| Ok(ResponseToken { socket: socket.id, generation: self.generation }))
    }

    /// Answers the websocket handshake and hands the connection over to `context`'s behavior.
    ///
    /// `key`, `protocol` and `extensions` are the request's
    /// `sec-websocket-key`, `sec-websocket-protocol` and
    /// `sec-websocket-extensions` values; an empty protocol is not echoed.
    pub fn upgrade<U: 'static>(
        self,
        user_data: U,
        key: &str,
        protocol: &str,
        extensions: &str,
        context: &UpgradeContext<U>,
    ) -> Result<(), ResponseError> {
        ensure!(!key.trim().is_empty(), ResponseError::invalid_header("missing sec-websocket-key"));

        let accept = accept_key(key.trim());
        let negotiated = if extensions.is_empty() { None } else { negotiate(context.settings().compression, extensions) };
        let protocol = protocol.trim();

        self.with_live(|socket| {
            ensure!(socket.state.phase == ResponsePhase::Idle, ResponseError::HeadersSent);
            socket.write_head(HeadPart::SwitchingProtocols {
                accept: &accept,
                protocol: (!protocol.is_empty()).then_some(protocol),
                extensions: negotiated.as_ref().map(|negotiated| negotiated.response.as_str()),
            });
            socket.state.phase = ResponsePhase::Upgraded;
            socket.callbacks.clear();
            socket.upgrade = Some(pending_upgrade(Rc::clone(&self.ctx), context.clone(), user_data, negotiated));
            socket.notify.notify_one();
            Ok(())
        })
    }
}
