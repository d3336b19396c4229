//! Request side protocol types and the error hierarchy.
//!
//! - [`RequestHeader`] owns one parsed request head
//! - [`HttpRequest`] is the borrowed view handed to handlers
//! - [`RequestItem`] and [`BodyChunk`] are what the request decoder yields

mod error;
mod message;
mod request;

pub use error::ConfigError;
pub use error::EngineError;
pub use error::FrameError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::ResponseError;

pub use message::BodyChunk;
pub use message::BodyFraming;
pub use message::RequestItem;

pub use request::HttpRequest;
pub use request::RequestHeader;
pub use request::RouteParams;
