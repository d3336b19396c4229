//! Listen sockets and their accept loops.
//!
//! Binding happens synchronously when the app asks to listen, so a taken port
//! is reported right away. Accepting starts once the loop runs and ends when
//! either the socket or the whole loop is closed; connections accepted before
//! that keep being served.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::rc::Rc;

use micro_engine::{HttpHandler, LoopRef};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::tls::SecureContext;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("can't bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(Default)]
struct ListenState {
    closed: Cell<bool>,
    notify: Notify,
}

/// Handle of one bound port, closing it stops accepting on that port only.
#[derive(Clone)]
pub struct ListenSocket {
    local_addr: SocketAddr,
    state: Rc<ListenState>,
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSocket").field("local_addr", &self.local_addr).field("closed", &self.state.closed.get()).finish()
    }
}

impl ListenSocket {
    /// the bound address, with the actual port when port `0` was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn close(&self) {
        self.state.closed.set(true);
        self.state.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    async fn closed(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.state.closed.get() {
                return;
            }
            notified.await;
        }
    }
}

/// A bound socket waiting for the loop to start.
pub(crate) struct PendingListener {
    listener: StdTcpListener,
    socket: ListenSocket,
}

impl fmt::Debug for PendingListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingListener").field("socket", &self.socket).finish_non_exhaustive()
    }
}

impl PendingListener {
    pub(crate) fn bind(host: &str, port: u16) -> Result<Self, ListenError> {
        let bind_error = |source| ListenError::Bind { host: host.to_string(), port, source };

        let listener = StdTcpListener::bind((host, port)).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let socket = ListenSocket { local_addr, state: Rc::new(ListenState::default()) };
        Ok(Self { listener, socket })
    }

    pub(crate) fn socket(&self) -> &ListenSocket {
        &self.socket
    }

    /// Accepts until the socket or the loop is closed, must run inside the loop's `LocalSet`.
    pub(crate) async fn accept_loop(self, loop_ref: LoopRef, handler: Rc<dyn HttpHandler>, tls: Option<SecureContext>) {
        let PendingListener { listener, socket } = self;
        let addr = socket.local_addr;
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, cause = %e, "can't register listener");
                return;
            }
        };

        info!(%addr, tls = tls.is_some(), "start listening");
        loop {
            let accepted = tokio::select! {
                () = socket.closed() => break,
                () = loop_ref.closed() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%remote, cause = %e, "can't set TCP_NODELAY");
            }
            match &tls {
                Some(context) => serve_tls(&loop_ref, context, stream, remote, Rc::clone(&handler)),
                None => {
                    let (reader, writer) = stream.into_split();
                    loop_ref.serve(reader, writer, Some(remote), Rc::clone(&handler));
                }
            }
        }
        socket.close();
        info!(%addr, "stop listening");
    }
}

fn serve_tls(loop_ref: &LoopRef, context: &SecureContext, stream: TcpStream, remote: SocketAddr, handler: Rc<dyn HttpHandler>) {
    let acceptor = context.acceptor();
    let loop_ref = loop_ref.clone();
    tokio::task::spawn_local(async move {
        match acceptor.accept(stream).await {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                loop_ref.serve(reader, writer, Some(remote), handler);
            }
            Err(e) => warn!(%remote, cause = %e, "tls handshake failed"),
        }
    });
}
