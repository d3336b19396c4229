//! The event loop.
//!
//! One [`Loop`] runs on one thread: a tokio current-thread runtime with a
//! `LocalSet`, so every connection, response and websocket is `Rc`/`RefCell`
//! state owned by that thread. Other threads only get a [`LoopHandle`], whose
//! [`defer`](LoopHandle::defer) queues a closure that later runs on the loop
//! with a [`LoopRef`]. Through the `LoopRef` a deferred closure turns a
//! [`ResponseToken`] or [`SocketToken`] back into a live handle.
//!
//! A sweep task ticks every [`EngineConfig::sweep_interval`]: it refreshes the
//! cached `Date` value and enforces websocket idle and lifetime deadlines.

pub(crate) mod table;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::LocalSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::connection::HttpConnection;
use crate::handler::HttpHandler;
use crate::protocol::EngineError;
use crate::response::HttpResponse;
use crate::topic::TopicRegistry;
use crate::websocket::{OpCode, WebSocket, WsCore, send_message};

pub(crate) use table::SocketTable;
pub use table::SocketId;

type Deferred = Box<dyn FnOnce(&LoopRef) + Send>;

/// Loop owned state shared by every connection of the loop.
pub(crate) struct LoopContext {
    config: EngineConfig,
    pub(crate) sockets: RefCell<SocketTable>,
    pub(crate) topics: RefCell<TopicRegistry>,
    date: RefCell<Bytes>,
    connections: Cell<usize>,
    idle: Notify,
    closing: Cell<bool>,
    close_notify: Notify,
    sender: mpsc::UnboundedSender<Deferred>,
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopContext")
            .field("sockets", &self.sockets)
            .field("connections", &self.connections.get())
            .field("closing", &self.closing.get())
            .finish_non_exhaustive()
    }
}

impl LoopContext {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn date(&self) -> Bytes {
        self.date.borrow().clone()
    }

    fn refresh_date(&self) {
        let mut date = faf_http_date::get_date_buff_no_key();
        faf_http_date::get_date_no_key(&mut date);
        *self.date.borrow_mut() = Bytes::from_owner(date);
    }

    /// Removes a socket from the table and from all of its topics.
    pub(crate) fn forget_socket(&self, id: SocketId) -> Vec<(String, (usize, usize))> {
        self.sockets.borrow_mut().remove(id);
        self.topics.borrow_mut().remove_socket(id)
    }

    /// Sends to every subscriber of `topic` but `exclude`, returns the number of sends attempted.
    pub(crate) fn publish(self: &Rc<Self>, topic: &str, message: &[u8], opcode: OpCode, compress: bool, exclude: Option<SocketId>) -> usize {
        let subscribers: Vec<SocketId> = self.topics.borrow().subscribers(topic).filter(|id| Some(*id) != exclude).collect();

        let mut sent = 0;
        for id in subscribers {
            // a subscriber closed by an earlier send in this loop is already gone
            let core = self.sockets.borrow().websocket(id);
            if let Some(core) = core {
                send_message(&core, self, message, opcode, compress, true);
                sent += 1;
            }
        }
        sent
    }

    fn sweep(&self) {
        self.refresh_date();
        let now = Instant::now();
        let cores = self.sockets.borrow().websockets();
        for core in cores {
            core.borrow_mut().check_deadlines(now);
        }
    }

    fn connection_opened(&self) {
        self.connections.set(self.connections.get() + 1);
    }

    fn connection_closed(&self) {
        let remaining = self.connections.get().saturating_sub(1);
        self.connections.set(remaining);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// A single threaded event loop, see the [module docs](self).
pub struct Loop {
    ctx: Rc<LoopContext>,
    receiver: mpsc::UnboundedReceiver<Deferred>,
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl Default for Loop {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Loop {
    pub fn new(config: EngineConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = Rc::new(LoopContext {
            config,
            sockets: RefCell::new(SocketTable::new()),
            topics: RefCell::new(TopicRegistry::new()),
            date: RefCell::new(Bytes::new()),
            connections: Cell::new(0),
            idle: Notify::new(),
            closing: Cell::new(false),
            close_notify: Notify::new(),
            sender,
        });
        ctx.refresh_date();
        Self { ctx, receiver }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { sender: self.ctx.sender.clone() }
    }

    pub fn loop_ref(&self) -> LoopRef {
        LoopRef { ctx: Rc::clone(&self.ctx) }
    }

    /// Drives deferred callbacks and the sweep while `fut` runs.
    ///
    /// Must be awaited inside a [`LocalSet`]. Once `fut` completes the queue is
    /// closed and every callback accepted before that still runs.
    pub async fn run_until<F: Future>(self, fut: F) -> F::Output {
        let Loop { ctx, mut receiver } = self;

        let loop_ref = LoopRef { ctx: Rc::clone(&ctx) };
        let (stop, mut stopped) = oneshot::channel::<()>();
        let deferred = tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    callback = receiver.recv() => match callback {
                        Some(callback) => run_deferred(callback, &loop_ref),
                        None => break,
                    },
                    _ = &mut stopped => break,
                }
            }
            receiver
        });

        let sweep_ctx = Rc::clone(&ctx);
        let sweep = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(sweep_ctx.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweep_ctx.sweep();
            }
        });

        let output = fut.await;
        sweep.abort();
        drop(stop);
        match deferred.await {
            Ok(mut receiver) => {
                receiver.close();
                let loop_ref = LoopRef { ctx };
                while let Ok(callback) = receiver.try_recv() {
                    run_deferred(callback, &loop_ref);
                }
            }
            Err(e) => error!(cause = %e, "deferred callback task failed"),
        }
        output
    }

    /// Builds a current-thread runtime and runs the loop on the calling thread.
    pub fn block_on<F: Future>(self, fut: F) -> Result<F::Output, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let local = LocalSet::new();
        Ok(local.block_on(&runtime, self.run_until(fut)))
    }
}

fn run_deferred(callback: Deferred, loop_ref: &LoopRef) {
    if catch_unwind(AssertUnwindSafe(|| callback(loop_ref))).is_err() {
        error!("deferred callback panicked");
    }
}

/// The cross-thread entry point into a loop.
#[derive(Clone)]
pub struct LoopHandle {
    sender: mpsc::UnboundedSender<Deferred>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").field("closed", &self.sender.is_closed()).finish()
    }
}

impl LoopHandle {
    /// Queues `callback` to run on the loop thread.
    ///
    /// Callbacks run in the order they were deferred. Fails with
    /// [`EngineError::LoopClosed`] once the loop stopped running.
    pub fn defer<F>(&self, callback: F) -> Result<(), EngineError>
    where
        F: FnOnce(&LoopRef) + Send + 'static,
    {
        self.sender.send(Box::new(callback)).map_err(|_| EngineError::LoopClosed)
    }
}

/// Continuation token of an in-flight response, safe to send to other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseToken {
    pub(crate) socket: SocketId,
    pub(crate) generation: u64,
}

/// Continuation token of a websocket connection, safe to send to other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketToken {
    pub(crate) socket: SocketId,
}

/// Loop thread access to the loop, handed to deferred callbacks.
#[derive(Clone)]
pub struct LoopRef {
    pub(crate) ctx: Rc<LoopContext>,
}

impl fmt::Debug for LoopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRef").field("ctx", &self.ctx).finish()
    }
}

impl LoopRef {
    pub fn config(&self) -> &EngineConfig {
        self.ctx.config()
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { sender: self.ctx.sender.clone() }
    }

    /// Publishes to every subscriber of `topic`, returns how many sends were attempted.
    pub fn publish(&self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> usize {
        self.ctx.publish(topic, message, opcode, compress, None)
    }

    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.ctx.topics.borrow().num_subscribers(topic)
    }

    /// Resolves a token into its response, [`EngineError::Gone`] once that response completed or aborted.
    pub fn response(&self, token: ResponseToken) -> Result<HttpResponse, EngineError> {
        let socket = self.ctx.sockets.borrow().http(token.socket).ok_or(EngineError::Gone)?;
        let response = HttpResponse::new(socket, Rc::clone(&self.ctx), token.generation);
        if response.is_live() { Ok(response) } else { Err(EngineError::Gone) }
    }

    /// Resolves a token into its websocket, [`EngineError::Gone`] once it closed.
    ///
    /// `U` has to be the user data type the connection was upgraded with.
    pub fn websocket<U: 'static>(&self, token: SocketToken) -> Result<WebSocket<U>, EngineError> {
        let core = self.ctx.sockets.borrow().websocket(token.socket).ok_or(EngineError::Gone)?;
        WebSocket::from_core(&core, &self.ctx).ok_or(EngineError::Gone)
    }

    /// Serves HTTP on an accepted stream; must be called inside the loop's `LocalSet`.
    pub fn serve<R, W>(&self, reader: R, writer: W, remote: Option<SocketAddr>, handler: Rc<dyn HttpHandler>)
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let connection = HttpConnection::new(Rc::clone(&self.ctx), reader, writer, remote);
        let guard = ConnectionGuard::new(Rc::clone(&self.ctx));

        tokio::task::spawn_local(async move {
            let _guard = guard;
            match connection.process(handler).await {
                Ok(()) => debug!(?remote, "connection closed"),
                Err(e) => warn!(?remote, cause = %e, "connection closed with error"),
            }
        });
    }

    /// number of open connections, websockets included
    pub fn connections(&self) -> usize {
        self.ctx.connections.get()
    }

    /// Completes once no connection is left.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.ctx.idle.notified();
            if self.ctx.connections.get() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Asks every listener of this loop to stop accepting; open connections stay.
    pub fn close(&self) {
        self.ctx.closing.set(true);
        self.ctx.close_notify.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.ctx.closing.get()
    }

    /// Completes once [`LoopRef::close`] was called.
    pub async fn closed(&self) {
        loop {
            let notified = self.ctx.close_notify.notified();
            if self.ctx.closing.get() {
                return;
            }
            notified.await;
        }
    }
}

struct ConnectionGuard {
    ctx: Rc<LoopContext>,
}

impl ConnectionGuard {
    fn new(ctx: Rc<LoopContext>) -> Self {
        ctx.connection_opened();
        Self { ctx }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.ctx.connection_closed();
    }
}
