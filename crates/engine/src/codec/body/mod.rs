//! Request body decoding and chunked response framing.

mod body_decoder;
mod chunk_encoder;
mod chunked_decoder;

pub use body_decoder::BodyDecoder;
pub use chunk_encoder::ChunkEncoder;
pub use chunked_decoder::ChunkedDecoder;
