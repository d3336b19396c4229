//! Per connection websocket state and the typed [`WebSocket`] handle.
//!
//! [`WsCore`] is the untyped state the loop keeps in its socket table: send
//! queue, deadlines, close state. Code that only knows a socket id (publish,
//! the sweep) works on the core and reaches the typed handlers through the
//! core's event function, which is monomorphized for the connection's user
//! data type at upgrade time.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::outbound::Outbound;
use crate::protocol::FrameError;
use crate::reactor::{LoopContext, SocketId, SocketToken};
use crate::websocket::behavior::{BackpressurePolicy, WebSocketBehavior, WsSettings};
use crate::websocket::compression::MessageDeflate;
use crate::websocket::frame::{Frame, MAX_CONTROL_PAYLOAD, OpCode, frame_bytes};

/// how long a started close handshake waits for the peer's close frame
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// queued, but the connection is above its backpressure limit
    Backpressure,
    Success,
    /// refused: closed connection, backpressure policy or misuse
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WsState {
    Open,
    /// our close frame is queued; `close_after_flush` once nothing more is expected from the peer
    Closing { close_after_flush: bool },
    /// the transport is dropped without flushing
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Idle,
    Lifetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shutdown {
    /// send a close frame and wait for the peer's
    Handshake,
    /// send a close frame and close once it is written
    Final,
    /// drop everything queued and close now
    Abrupt,
}

/// Events raised by code that doesn't know the connection's user data type.
pub(crate) enum WsEvent<'a> {
    Dropped(&'a [u8], OpCode),
    Close(u16, &'a [u8]),
    Subscription(&'a str, usize, usize),
}

type EventFn = fn(&Rc<RefCell<WsCore>>, &Rc<LoopContext>, WsEvent<'_>);

/// User data and behavior of one connection.
pub(crate) struct WsShared<U> {
    pub(crate) data: RefCell<U>,
    pub(crate) behavior: Rc<WebSocketBehavior<U>>,
}

pub(crate) struct WsCore {
    pub(crate) id: SocketId,
    remote: Option<SocketAddr>,
    settings: WsSettings,
    pub(crate) outbound: Outbound,
    deflate: Option<Box<dyn MessageDeflate>>,
    pub(crate) state: WsState,
    /// an outgoing fragmented message is unterminated
    fragment_open: bool,
    last_activity: Instant,
    opened_at: Instant,
    closing_since: Option<Instant>,
    ping_sent: bool,
    pub(crate) expired: Option<Expiry>,
    pub(crate) drain_armed: bool,
    pub(crate) notify: Rc<Notify>,
    shared: Rc<dyn Any>,
    events: EventFn,
}

impl fmt::Debug for WsCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsCore")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("outbound", &self.outbound)
            .field("compression", &self.deflate.is_some())
            .finish_non_exhaustive()
    }
}

impl WsCore {
    pub(crate) fn new<U: 'static>(
        id: SocketId,
        remote: Option<SocketAddr>,
        shared: Rc<WsShared<U>>,
        deflate: Option<Box<dyn MessageDeflate>>,
        notify: Rc<Notify>,
    ) -> Self {
        let settings = shared.behavior.settings.clone();
        let limit = if settings.max_backpressure == 0 { usize::MAX } else { settings.max_backpressure };
        let cork_size = limit.min(16 * 1024);
        let mut outbound = Outbound::new(limit, cork_size);
        outbound.split_messages(settings.backpressure_policy == BackpressurePolicy::DropOldest);
        let now = Instant::now();
        Self {
            id,
            remote,
            settings,
            outbound,
            deflate,
            state: WsState::Open,
            fragment_open: false,
            last_activity: now,
            opened_at: now,
            closing_since: None,
            ping_sent: false,
            expired: None,
            drain_armed: false,
            notify,
            shared,
            events: dispatch_event::<U>,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == WsState::Open
    }

    /// Records inbound traffic.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent = false;
    }

    pub(crate) fn inflate(&mut self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let max = self.settings.max_payload_length;
        match &mut self.deflate {
            Some(deflate) => deflate.decompress(payload, max),
            None => Err(FrameError::protocol("compressed message without negotiated compression")),
        }
    }

    /// Queues a control frame, bypassing the backpressure limit.
    pub(crate) fn push_control(&mut self, opcode: OpCode, payload: &[u8]) {
        let payload = &payload[..payload.len().min(MAX_CONTROL_PAYLOAD)];
        self.outbound.push(frame_bytes(&Frame::new(opcode, Bytes::copy_from_slice(payload))));
        self.notify.notify_one();
    }

    /// Sends automatic pings and marks expired deadlines, the driver acts on them.
    pub(crate) fn check_deadlines(&mut self, now: Instant) {
        if let WsState::Closing { .. } = self.state {
            if self.closing_since.is_some_and(|since| now.duration_since(since) >= CLOSE_HANDSHAKE_TIMEOUT) {
                debug!(id = ?self.id, "close handshake timed out");
                self.state = WsState::Closed;
                self.notify.notify_one();
            }
            return;
        }
        if self.state != WsState::Open || self.expired.is_some() {
            return;
        }

        let lifetime = self.settings.max_lifetime;
        if !lifetime.is_zero() && now.duration_since(self.opened_at) >= lifetime {
            self.expired = Some(Expiry::Lifetime);
            self.notify.notify_one();
            return;
        }

        let idle_timeout = self.settings.idle_timeout;
        if idle_timeout.is_zero() {
            return;
        }
        let idle = now.duration_since(self.last_activity);
        if idle >= idle_timeout {
            self.expired = Some(Expiry::Idle);
            self.notify.notify_one();
        } else if self.settings.send_pings_automatically && !self.ping_sent && idle >= idle_timeout / 2 {
            trace!(id = ?self.id, "sending automatic ping");
            self.ping_sent = true;
            self.push_control(OpCode::Ping, &[]);
        }
    }

    fn queue_message(&mut self, payload: &[u8], opcode: OpCode, compress: bool, fin: bool) -> Queued {
        if opcode.is_control() {
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Queued::Misuse("control frame payload too long");
            }
            self.push_control(opcode, payload);
            return Queued::Sent;
        }

        let continuing = self.fragment_open;
        match (opcode, continuing) {
            (OpCode::Continuation, false) => return Queued::Misuse("continuation without a first fragment"),
            (OpCode::Text | OpCode::Binary, true) => return Queued::Misuse("new message inside a fragmented one"),
            _ => {}
        }

        // fragments after the first are never dropped, the message would be corrupted
        if !continuing && self.outbound.is_over_limit() {
            match self.settings.backpressure_policy {
                BackpressurePolicy::DropNewest => return Queued::Refused,
                BackpressurePolicy::Close => return Queued::Close,
                BackpressurePolicy::DropOldest => {
                    let dropped = self.outbound.drop_oldest(payload.len());
                    debug!(id = ?self.id, dropped, "dropped queued messages");
                    if self.outbound.is_over_limit() {
                        return Queued::Refused;
                    }
                }
            }
        }

        let whole = fin && !continuing;
        let mut frame = Frame::new(opcode, Bytes::new()).with_fin(fin);
        frame.payload = match &mut self.deflate {
            Some(deflate) if compress && whole && deflate.can_compress() => match deflate.compress(payload) {
                Ok(compressed) => {
                    frame.rsv1 = true;
                    compressed
                }
                Err(e) => {
                    error!(id = ?self.id, cause = %e, "compression failed, sending uncompressed");
                    Bytes::copy_from_slice(payload)
                }
            },
            _ => Bytes::copy_from_slice(payload),
        };

        let bytes = frame_bytes(&frame);
        if whole {
            self.outbound.push_message(bytes);
        } else {
            self.outbound.push(bytes);
        }
        self.fragment_open = !fin;
        if self.settings.reset_idle_timeout_on_send {
            self.last_activity = Instant::now();
        }
        self.notify.notify_one();
        Queued::Sent
    }

    fn begin_shutdown(&mut self, code: u16, reason: &[u8], mode: Shutdown) -> bool {
        match (self.state, mode) {
            (WsState::Open, Shutdown::Abrupt) => {
                self.outbound.clear();
                self.state = WsState::Closed;
            }
            (WsState::Open, _) => {
                self.outbound.push(frame_bytes(&Frame::close(code, reason)));
                self.state = WsState::Closing { close_after_flush: mode == Shutdown::Final };
                self.closing_since = Some(Instant::now());
            }
            (WsState::Closing { .. }, Shutdown::Abrupt) => {
                self.outbound.clear();
                self.state = WsState::Closed;
                self.notify.notify_one();
                return false;
            }
            _ => return false,
        }
        self.notify.notify_one();
        true
    }
}

enum Queued {
    Sent,
    Refused,
    Close,
    Misuse(&'static str),
}

/// Sends one frame of a message through the connection's backpressure policy.
pub(crate) fn send_message(
    core: &Rc<RefCell<WsCore>>,
    ctx: &Rc<LoopContext>,
    payload: &[u8],
    opcode: OpCode,
    compress: bool,
    fin: bool,
) -> SendStatus {
    let queued = {
        let mut ws = core.borrow_mut();
        if !ws.is_open() {
            return SendStatus::Dropped;
        }
        match ws.queue_message(payload, opcode, compress, fin) {
            // the send that crosses the limit closes under the close policy
            Queued::Sent if ws.outbound.is_over_limit() && ws.settings.backpressure_policy == BackpressurePolicy::Close => {
                Queued::Close
            }
            Queued::Sent if ws.outbound.is_over_limit() => {
                ws.drain_armed = true;
                return SendStatus::Backpressure;
            }
            Queued::Sent => return SendStatus::Success,
            Queued::Misuse(reason) => {
                debug!(id = ?ws.id, reason, "send refused");
                return SendStatus::Dropped;
            }
            other => other,
        }
    };

    match queued {
        Queued::Close => {
            debug!("backpressure limit reached, closing");
            shutdown(core, ctx, 1006, b"", Shutdown::Abrupt);
        }
        _ => fire(core, ctx, WsEvent::Dropped(payload, opcode)),
    }
    SendStatus::Dropped
}

/// Closes the connection, firing the close handler exactly once and purging its topics.
pub(crate) fn shutdown(core: &Rc<RefCell<WsCore>>, ctx: &Rc<LoopContext>, code: u16, reason: &[u8], mode: Shutdown) {
    let (id, started) = {
        let mut ws = core.borrow_mut();
        (ws.id, ws.begin_shutdown(code, reason, mode))
    };
    if !started {
        return;
    }

    debug!(?id, code, ?mode, "websocket closing");
    fire(core, ctx, WsEvent::Close(code, reason));
    for (topic, (new, old)) in ctx.forget_socket(id) {
        fire(core, ctx, WsEvent::Subscription(&topic, new, old));
    }
}

fn fire(core: &Rc<RefCell<WsCore>>, ctx: &Rc<LoopContext>, event: WsEvent<'_>) {
    let events = core.borrow().events;
    events(core, ctx, event);
}

fn dispatch_event<U: 'static>(core: &Rc<RefCell<WsCore>>, ctx: &Rc<LoopContext>, event: WsEvent<'_>) {
    let Some(ws) = WebSocket::<U>::from_core(core, ctx) else {
        return;
    };
    let behavior = Rc::clone(&ws.shared.behavior);
    match event {
        WsEvent::Dropped(message, opcode) => {
            if let Some(dropped) = &behavior.dropped {
                guarded("dropped", || dropped(&ws, message, opcode));
            }
        }
        WsEvent::Close(code, reason) => {
            if let Some(close) = &behavior.close {
                guarded("close", || close(&ws, code, reason));
            }
        }
        WsEvent::Subscription(topic, new, old) => {
            if let Some(subscription) = &behavior.subscription {
                guarded("subscription", || subscription(&ws, topic, new, old));
            }
        }
    }
}

/// Runs a user handler, a panic is logged and swallowed.
pub(crate) fn guarded(handler: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(handler, "websocket handler panicked");
    }
}

/// Leaves a cork scope on drop, so a panicking handler can't leave the queue corked.
struct CorkScope<'a>(&'a RefCell<WsCore>);

impl Drop for CorkScope<'_> {
    fn drop(&mut self) {
        let mut ws = self.0.borrow_mut();
        if ws.outbound.uncork() {
            ws.notify.notify_one();
        }
    }
}

/// Handle onto an upgraded connection with user data `U`.
pub struct WebSocket<U> {
    core: Rc<RefCell<WsCore>>,
    shared: Rc<WsShared<U>>,
    ctx: Rc<LoopContext>,
}

impl<U> Clone for WebSocket<U> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core), shared: Rc::clone(&self.shared), ctx: Rc::clone(&self.ctx) }
    }
}

impl<U> fmt::Debug for WebSocket<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket").field("core", &self.core).finish_non_exhaustive()
    }
}

impl<U: 'static> WebSocket<U> {
    pub(crate) fn from_core(core: &Rc<RefCell<WsCore>>, ctx: &Rc<LoopContext>) -> Option<Self> {
        let shared = Rc::clone(&core.borrow().shared).downcast::<WsShared<U>>().ok()?;
        Some(Self { core: Rc::clone(core), shared, ctx: Rc::clone(ctx) })
    }
}

impl<U> WebSocket<U> {
    pub(crate) fn new(core: Rc<RefCell<WsCore>>, shared: Rc<WsShared<U>>, ctx: Rc<LoopContext>) -> Self {
        Self { core, shared, ctx }
    }

    pub(crate) fn core(&self) -> &Rc<RefCell<WsCore>> {
        &self.core
    }

    pub(crate) fn behavior(&self) -> &Rc<WebSocketBehavior<U>> {
        &self.shared.behavior
    }

    pub(crate) fn loop_context(&self) -> &Rc<LoopContext> {
        &self.ctx
    }

    pub fn send(&self, message: &[u8], opcode: OpCode) -> SendStatus {
        self.send_with_options(message, opcode, false, true)
    }

    /// `fin = false` starts a fragmented message, continue it with [`Self::send_fragment`].
    ///
    /// Only whole messages are compressed.
    pub fn send_with_options(&self, message: &[u8], opcode: OpCode, compress: bool, fin: bool) -> SendStatus {
        send_message(&self.core, &self.ctx, message, opcode, compress, fin)
    }

    pub fn send_first_fragment(&self, message: &[u8], compress: bool) -> SendStatus {
        self.send_first_fragment_with_opcode(message, OpCode::Binary, compress)
    }

    pub fn send_first_fragment_with_opcode(&self, message: &[u8], opcode: OpCode, compress: bool) -> SendStatus {
        self.send_with_options(message, opcode, compress, false)
    }

    pub fn send_fragment(&self, message: &[u8], compress: bool) -> SendStatus {
        self.send_with_options(message, OpCode::Continuation, compress, false)
    }

    pub fn send_last_fragment(&self, message: &[u8], compress: bool) -> SendStatus {
        self.send_with_options(message, OpCode::Continuation, compress, true)
    }

    /// Starts the close handshake with `code` and `message`.
    pub fn end(&self, code: u16, message: &[u8]) {
        shutdown(&self.core, &self.ctx, code, message, Shutdown::Handshake);
    }

    /// Closes the connection without a handshake, the close handler sees `1006`.
    pub fn close(&self) {
        shutdown(&self.core, &self.ctx, 1006, b"", Shutdown::Abrupt);
    }

    /// Coalesces every send made by `f` into one transport write.
    pub fn cork<F: FnOnce()>(&self, f: F) {
        self.core.borrow_mut().outbound.cork();
        let _scope = CorkScope(&self.core);
        f();
    }

    /// Subscribes to `topic`, `false` when already subscribed or closed.
    pub fn subscribe(&self, topic: &str) -> bool {
        let id = {
            let ws = self.core.borrow();
            if !ws.is_open() {
                return false;
            }
            ws.id
        };
        let changed = self.ctx.topics.borrow_mut().subscribe(id, topic);
        match changed {
            Some((new, old)) => {
                fire(&self.core, &self.ctx, WsEvent::Subscription(topic, new, old));
                true
            }
            None => false,
        }
    }

    /// Unsubscribes from `topic`, `false` when not subscribed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let id = self.core.borrow().id;
        let changed = self.ctx.topics.borrow_mut().unsubscribe(id, topic);
        match changed {
            Some((new, old)) => {
                fire(&self.core, &self.ctx, WsEvent::Subscription(topic, new, old));
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        let id = self.core.borrow().id;
        self.ctx.topics.borrow().is_subscribed(id, topic)
    }

    /// Calls `f` with every topic of this connection in lexical order.
    pub fn iterate_topics<F: FnMut(&str)>(&self, mut f: F) {
        for topic in self.topics() {
            f(&topic);
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let id = self.core.borrow().id;
        self.ctx.topics.borrow().topics_of(id).map(str::to_string).collect()
    }

    /// Publishes to every subscriber of `topic` except this connection.
    ///
    /// Returns `false` when this connection is closed.
    pub fn publish(&self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> bool {
        let (id, open) = {
            let ws = self.core.borrow();
            (ws.id, ws.is_open())
        };
        if !open {
            return false;
        }
        self.ctx.publish(topic, message, opcode, compress, Some(id));
        true
    }

    /// bytes queued but not yet written to the transport
    pub fn buffered_amount(&self) -> usize {
        self.core.borrow().outbound.buffered()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.core.borrow().remote
    }

    pub fn remote_address_as_text(&self) -> String {
        self.remote_address().map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    pub fn user_data(&self) -> Ref<'_, U> {
        self.shared.data.borrow()
    }

    pub fn user_data_mut(&self) -> RefMut<'_, U> {
        self.shared.data.borrow_mut()
    }

    /// A `Send` token to find this connection again from a deferred callback.
    pub fn token(&self) -> SocketToken {
        SocketToken { socket: self.core.borrow().id }
    }

    pub fn is_closed(&self) -> bool {
        !self.core.borrow().is_open()
    }
}
