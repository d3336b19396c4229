//! A single threaded HTTP/1.1 and WebSocket connection engine.
//!
//! Every connection of a [`Loop`] lives on the loop's thread. Handlers are
//! plain synchronous callbacks: they get an [`HttpResponse`] handle and a
//! borrowed [`HttpRequest`] view, and either answer right away or keep the
//! response to finish it later. Output is never written behind the caller's
//! back: a response or websocket queues what it can and reports backpressure,
//! the caller decides what to do about it.
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use micro_engine::{Loop, make_handler};
//! use tokio::net::TcpListener;
//!
//! let lp = Loop::default();
//! let loop_ref = lp.loop_ref();
//! lp.block_on(async move {
//!     let handler = Rc::new(make_handler(|res, _req| {
//!         let _ = res.end(b"Hello World!", false);
//!     }));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     loop {
//!         let (stream, remote) = listener.accept().await.unwrap();
//!         let (reader, writer) = stream.into_split();
//!         loop_ref.serve(reader, writer, Some(remote), handler.clone());
//!     }
//! })
//! .unwrap();
//! ```
//!
//! # Architecture
//!
//! - [`reactor`]: the loop, cross-thread deferral and continuation tokens
//! - [`protocol`]: request views and error types
//! - [`codec`]: request decoding and response head encoding
//! - [`response`]: the streaming response and its backpressure rules
//! - [`websocket`]: framing, compression, handshake and the socket handle
//! - [`topic`]: the pub/sub registry of one loop

pub mod codec;
pub mod config;
mod connection;
pub mod handler;
mod outbound;
pub mod protocol;
pub mod reactor;
pub mod response;
pub mod topic;
pub mod websocket;

mod utils;

pub use config::EngineConfig;
pub use handler::{HttpHandler, make_handler};
pub use protocol::{EngineError, HttpRequest};
pub use reactor::{Loop, LoopHandle, LoopRef, ResponseToken, SocketToken};
pub use response::HttpResponse;
pub use websocket::{BackpressurePolicy, CompressOptions, OpCode, SendStatus, UpgradeContext, WebSocket, WebSocketBehavior};
