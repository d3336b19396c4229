//! Wire codecs for HTTP/1.1.
//!
//! - [`RequestDecoder`] turns bytes into request heads and body items
//! - [`HeadEncoder`] writes response heads piece by piece
//! - [`ChunkEncoder`] frames streamed response bodies
//!
//! The websocket frame codec lives in [`crate::websocket`].

mod body;
mod header;
mod request_decoder;

pub use body::ChunkEncoder;
pub use body::BodyDecoder;
pub use header::DEFAULT_MAX_HEADER_BYTES;
pub use header::Framing;
pub use header::HeadEncoder;
pub use header::HeadPart;
pub use header::HeaderDecoder;
pub use request_decoder::RequestDecoder;
