//! Request head decoding and response head encoding.

mod head_encoder;
mod header_decoder;

pub use head_encoder::Framing;
pub use head_encoder::HeadEncoder;
pub use head_encoder::HeadPart;
pub use header_decoder::DEFAULT_MAX_HEADER_BYTES;
pub use header_decoder::HeaderDecoder;
pub use header_decoder::MAX_HEADER_NUM;
