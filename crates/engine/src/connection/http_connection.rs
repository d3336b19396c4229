use std::cell::RefCell;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Framing, HeadEncoder, HeadPart, RequestDecoder};
use crate::connection::{Transport, Wake};
use crate::handler::HttpHandler;
use crate::protocol::{BodyChunk, BodyFraming, HttpError, HttpRequest, ParseError, RequestHeader, RequestItem};
use crate::reactor::table::SocketEntry;
use crate::reactor::{LoopContext, SocketId};
use crate::response::{HttpResponse, HttpSocket, ResponsePhase, UpgradedIo};

/// Drives one HTTP/1.1 connection: requests are handled one at a time,
/// pipelined requests wait in the read buffer until the current response
/// ended and its body was consumed.
pub(crate) struct HttpConnection<R, W> {
    ctx: Rc<LoopContext>,
    transport: Transport<R, W>,
    decoder: RequestDecoder,
    id: SocketId,
    socket: Rc<RefCell<HttpSocket>>,
    notify: Rc<Notify>,
    remote: Option<SocketAddr>,
}

/// How a request left the connection.
enum Next {
    KeepAlive,
    Close,
    Upgrade,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    pub(crate) fn new(ctx: Rc<LoopContext>, reader: R, writer: W, remote: Option<SocketAddr>) -> Self {
        let (id, socket) = ctx.sockets.borrow_mut().insert_with(|id| {
            let socket = Rc::new(RefCell::new(HttpSocket::new(id, remote, ctx.config())));
            (SocketEntry::Http(Rc::clone(&socket)), socket)
        });
        let notify = Rc::clone(&socket.borrow().notify);
        let read_buf = BytesMut::with_capacity(8 * 1024);

        Self {
            decoder: RequestDecoder::with_max_header_bytes(ctx.config().max_header_bytes()),
            transport: Transport::new(reader, writer, read_buf),
            ctx,
            id,
            socket,
            notify,
            remote,
        }
    }

    pub(crate) async fn process(mut self, handler: Rc<dyn HttpHandler>) -> Result<(), HttpError> {
        let result = self.serve(handler.as_ref()).await;

        let start = self.socket.borrow_mut().upgrade.take();
        self.abort_response();
        self.ctx.forget_socket(self.id);

        match (result, start) {
            (Ok(Next::Upgrade), Some(start)) => {
                let (reader, writer, read_buf) = self.transport.into_parts();
                let io: UpgradedIo = UpgradedIo { reader: Box::new(reader), writer: Box::new(writer), read_buf, remote: self.remote };
                start(io).await;
                Ok(())
            }
            (Ok(_), _) => Ok(()),
            (Err(e), _) => Err(e),
        }
    }

    async fn serve(&mut self, handler: &dyn HttpHandler) -> Result<Next, HttpError> {
        loop {
            let Some((header, framing)) = self.next_head().await? else {
                self.flush().await?;
                return Ok(Next::Close);
            };

            match self.run_request(header, framing, handler).await? {
                Next::KeepAlive => continue,
                Next::Upgrade => {
                    self.flush().await?;
                    return Ok(Next::Upgrade);
                }
                Next::Close => {
                    self.flush().await?;
                    self.transport.shutdown().await;
                    return Ok(Next::Close);
                }
            }
        }
    }

    /// Waits for the next request head, flushing the previous responses meanwhile.
    async fn next_head(&mut self) -> Result<Option<(RequestHeader, BodyFraming)>, HttpError> {
        let idle_timeout = self.ctx.config().http_idle_timeout();
        let mut deadline = Instant::now() + idle_timeout;

        loop {
            match self.decoder.decode(&mut self.transport.read_buf) {
                Ok(Some(RequestItem::Head(header, framing))) => return Ok(Some((header, framing))),
                Ok(Some(RequestItem::Body(_))) => {
                    return Err(ParseError::invalid_body("body bytes while waiting for a request head").into());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(remote = ?self.remote, cause = %e, "can't decode request head");
                    self.reject(&e).await?;
                    return Err(e.into());
                }
            }

            if self.transport.is_eof() {
                if !self.transport.read_buf.is_empty() {
                    debug!(remote = ?self.remote, "peer closed in the middle of a request head");
                }
                return Ok(None);
            }

            match self.pump(true, Some(deadline)).await? {
                Wake::TimedOut => {
                    info!(remote = ?self.remote, "http idle timeout, closing connection");
                    return Ok(None);
                }
                Wake::Read => deadline = Instant::now() + idle_timeout,
                _ => {}
            }

            if self.socket.borrow().close_requested {
                return Ok(None);
            }
        }
    }

    /// Answers an undecodable request head and stops reading.
    async fn reject(&mut self, e: &ParseError) -> Result<(), HttpError> {
        let date = self.ctx.date();
        let mut buf = BytesMut::new();
        HeadEncoder.encode(HeadPart::Status(e.status()), &mut buf)?;
        HeadEncoder.encode(HeadPart::Finish { date: Some(&date), framing: Framing::Length(0), close: true }, &mut buf)?;
        self.socket.borrow_mut().outbound.push(buf.freeze());
        self.flush().await
    }

    async fn run_request(
        &mut self,
        header: RequestHeader,
        framing: BodyFraming,
        handler: &dyn HttpHandler,
    ) -> Result<Next, HttpError> {
        trace!(method = %header.method(), uri = %header.uri(), "dispatching request");

        let keep_alive = header.keep_alive();
        let head_only = *header.method() == Method::HEAD;
        let generation = self.socket.borrow_mut().begin(keep_alive, head_only, framing.has_body());
        let response = HttpResponse::new(Rc::clone(&self.socket), Rc::clone(&self.ctx), generation);

        self.socket.borrow_mut().outbound.cork();
        let mut request = HttpRequest::new(&header);
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(response, &mut request)));
        drop(request);
        self.uncork();

        if outcome.is_err() {
            error!(remote = ?self.remote, method = %header.method(), uri = %header.uri(), "request handler panicked");
            let date = self.ctx.date();
            self.socket.borrow_mut().recover_from_panic(&date);
        }
        drop(header);

        loop {
            self.pull_body()?;
            self.deliver_body();

            let (phase, body_done, close_requested, keep_alive) = {
                let socket = self.socket.borrow();
                (socket.state.phase, socket.body.eof, socket.close_requested, socket.keep_alive)
            };

            if close_requested {
                return Ok(Next::Close);
            }
            match phase {
                ResponsePhase::Upgraded => return Ok(Next::Upgrade),
                ResponsePhase::Ended | ResponsePhase::Aborted if body_done => {
                    return Ok(if keep_alive && phase == ResponsePhase::Ended { Next::KeepAlive } else { Next::Close });
                }
                _ => {}
            }

            if self.transport.is_eof() {
                // the peer can't receive what is still pending
                debug!(remote = ?self.remote, "peer closed with a response pending");
                self.abort_response();
                return Ok(Next::Close);
            }

            // keep reading to notice a peer that goes away, within bounds
            let reading = {
                let max_pending = self.ctx.config().max_pending_body();
                let socket = self.socket.borrow();
                !socket.body.paused && socket.body.pending_bytes < max_pending && self.transport.read_buf.len() < max_pending
            };
            if let Err(e) = self.pump(reading, None).await {
                self.abort_response();
                return Err(e);
            }
        }
    }

    /// Decodes buffered body bytes into the pending queue.
    fn pull_body(&mut self) -> Result<(), HttpError> {
        let max_pending = self.ctx.config().max_pending_body();
        let mut socket = self.socket.borrow_mut();
        // a response that ended without reading the body discards it
        let discard = !socket.is_pending() && socket.callbacks.on_data.is_none();

        while !socket.body.eof && (discard || socket.body.pending_bytes < max_pending) {
            match self.decoder.decode(&mut self.transport.read_buf) {
                Ok(Some(RequestItem::Body(BodyChunk::Data(bytes)))) => {
                    if !discard {
                        socket.body.pending_bytes += bytes.len();
                        socket.body.pending.push_back(bytes);
                    }
                }
                Ok(Some(RequestItem::Body(BodyChunk::End))) => socket.body.eof = true,
                Ok(Some(RequestItem::Head(..))) => return Err(ParseError::invalid_body("request head inside a body").into()),
                Ok(None) => break,
                Err(e) => {
                    drop(socket);
                    self.abort_response();
                    return Err(e.into());
                }
            }
        }

        if discard {
            socket.body.pending.clear();
            socket.body.pending_bytes = 0;
        }
        Ok(())
    }

    /// Hands pending body chunks to `on_data`, the last one flagged.
    fn deliver_body(&mut self) {
        loop {
            let (chunk, is_last, callback, response) = {
                let mut socket = self.socket.borrow_mut();
                if socket.body.paused || socket.body.consumed || !socket.is_pending() {
                    return;
                }
                let Some(callback) = socket.callbacks.on_data.take() else {
                    return;
                };

                let chunk = match socket.body.pending.pop_front() {
                    Some(chunk) => {
                        socket.body.pending_bytes -= chunk.len();
                        chunk
                    }
                    None if socket.body.eof => Bytes::new(),
                    None => {
                        socket.callbacks.on_data = Some(callback);
                        return;
                    }
                };
                let is_last = socket.body.eof && socket.body.pending.is_empty();
                if is_last {
                    socket.body.consumed = true;
                }
                let response = HttpResponse::new(Rc::clone(&self.socket), Rc::clone(&self.ctx), socket.generation);
                socket.outbound.cork();
                (chunk, is_last, callback, response)
            };

            let mut callback = callback;
            if catch_unwind(AssertUnwindSafe(|| callback(&response, &chunk, is_last))).is_err() {
                error!(remote = ?self.remote, "data handler panicked");
                let date = self.ctx.date();
                self.socket.borrow_mut().recover_from_panic(&date);
            }
            self.uncork();

            let mut socket = self.socket.borrow_mut();
            if socket.callbacks.on_data.is_none() && socket.is_pending() && !is_last {
                socket.callbacks.on_data = Some(callback);
            }
        }
    }

    fn uncork(&self) {
        self.socket.borrow_mut().outbound.uncork();
    }

    /// One round of I/O, writes completing under backpressure fire `on_writable`.
    async fn pump(&mut self, read: bool, deadline: Option<Instant>) -> Result<Wake, HttpError> {
        self.transport.load(|| self.socket.borrow_mut().outbound.take());
        let wake = self.transport.pump(&self.notify, read, deadline).await?;

        if wake == Wake::Wrote(true) {
            self.socket.borrow_mut().outbound.complete();
            self.fire_writable();
        }
        Ok(wake)
    }

    fn fire_writable(&mut self) {
        let (callback, response) = {
            let mut socket = self.socket.borrow_mut();
            if !socket.state.backpressure || socket.outbound.is_over_limit() || !socket.is_pending() {
                return;
            }
            let Some(callback) = socket.callbacks.on_writable.take() else {
                return;
            };
            socket.state.backpressure = false;
            socket.outbound.cork();
            let response = HttpResponse::new(Rc::clone(&self.socket), Rc::clone(&self.ctx), socket.generation);
            (callback, response)
        };
        let offset = response.write_offset().unwrap_or_default();

        let mut callback = callback;
        let keep = match catch_unwind(AssertUnwindSafe(|| callback(&response, offset))) {
            Ok(keep) => keep,
            Err(_) => {
                error!(remote = ?self.remote, "writable handler panicked");
                self.socket.borrow_mut().close_requested = true;
                false
            }
        };
        self.uncork();

        let mut socket = self.socket.borrow_mut();
        if keep && socket.callbacks.on_writable.is_none() && socket.is_pending() {
            socket.callbacks.on_writable = Some(callback);
        }
    }

    /// Writes everything queued.
    async fn flush(&mut self) -> Result<(), HttpError> {
        loop {
            self.transport.load(|| self.socket.borrow_mut().outbound.take());
            if !self.transport.is_writing() {
                return Ok(());
            }
            self.pump(false, None).await?;
        }
    }

    /// Fires `on_aborted` if a response is still pending.
    fn abort_response(&self) {
        let on_aborted = self.socket.borrow_mut().abort();
        if let Some(on_aborted) = on_aborted {
            debug!(remote = ?self.remote, "response aborted");
            if catch_unwind(AssertUnwindSafe(on_aborted)).is_err() {
                error!(remote = ?self.remote, "aborted handler panicked");
            }
        }
    }
}
