//! Routing, listening and TLS on top of [`micro_engine`].
//!
//! ```no_run
//! use micro_app::App;
//! use micro_engine::{OpCode, WebSocketBehavior};
//!
//! let echo = WebSocketBehavior::<()>::builder()
//!     .message(|ws, message, opcode| {
//!         ws.send(message, opcode);
//!     })
//!     .build();
//!
//! App::new()
//!     .get("/hello/:name", |res, req| {
//!         let body = format!("Hello {}!", req.parameter(0).unwrap_or("world"));
//!         let _ = res.end(body.as_bytes(), false);
//!     })
//!     .ws("/echo", echo)
//!     .listen(3000, |socket| match socket {
//!         Ok(socket) => println!("listening on {}", socket.local_addr()),
//!         Err(e) => eprintln!("{e}"),
//!     })
//!     .run()
//!     .unwrap();
//! ```

mod app;
mod config;
mod listener;
mod router;
mod tls;

pub use app::App;
pub use config::{AppConfig, AppConfigBuilder};
pub use listener::{ListenError, ListenSocket};
pub use router::Router;
pub use tls::{SecureContext, SslOptions, TlsError};
