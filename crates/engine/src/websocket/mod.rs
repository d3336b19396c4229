//! WebSocket connections after the upgrade.
//!
//! - `frame`: the RFC 6455 frame codec
//! - `compression`: permessage-deflate negotiation and the [`MessageDeflate`] seam
//! - `behavior`: per route settings and handlers
//! - [`WebSocket`]: the typed handle handlers send, subscribe and close through

mod behavior;
mod compression;
mod frame;
mod handshake;
mod socket;

pub use behavior::BackpressurePolicy;
pub use behavior::CloseHandler;
pub use behavior::DEFAULT_IDLE_TIMEOUT;
pub use behavior::DEFAULT_MAX_BACKPRESSURE;
pub use behavior::DEFAULT_MAX_PAYLOAD_LENGTH;
pub use behavior::MessageHandler;
pub use behavior::OpenHandler;
pub use behavior::PayloadHandler;
pub use behavior::SubscriptionHandler;
pub use behavior::UpgradeHandler;
pub use behavior::WebSocketBehavior;
pub use behavior::WebSocketBehaviorBuilder;
pub use behavior::WsSettings;

pub use compression::CodecMode;
pub use compression::CompressOptions;
pub use compression::DeflateCodec;
pub use compression::DeflateParams;
pub use compression::MessageDeflate;
pub use compression::Negotiated;
pub use compression::negotiate;

pub use frame::Frame;
pub use frame::FrameCodec;
pub use frame::MAX_CONTROL_PAYLOAD;
pub use frame::OpCode;
pub use frame::Role;
pub use frame::parse_close;

pub use handshake::UpgradeContext;
pub use handshake::accept_key;

pub use socket::SendStatus;
pub use socket::WebSocket;

pub(crate) use socket::{Expiry, Shutdown, WsCore, WsShared, WsState, guarded, send_message, shutdown};

#[cfg(test)]
pub(crate) use compression::MockMessageDeflate;
