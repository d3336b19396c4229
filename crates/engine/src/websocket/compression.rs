//! permessage-deflate (RFC 7692) support.
//!
//! [`CompressOptions`] keeps the classic bit layout: the low byte selects the
//! compressor (`1` shared, otherwise `window_bits << 4 | mem_level`), bits
//! 8..12 select the decompressor (`1` shared, otherwise its window bits).
//! A shared codec is realised as a codec without context takeover.

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::protocol::FrameError;
use crate::utils::ensure;

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_WINDOW_BITS: u8 = 15;
const MIN_WINDOW_BITS: u8 = 9;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompressOptions(u16);

impl CompressOptions {
    pub const DISABLED: Self = Self(0);
    pub const SHARED_COMPRESSOR: Self = Self(1);
    pub const SHARED_DECOMPRESSOR: Self = Self(1 << 8);

    pub const DEDICATED_DECOMPRESSOR_32KB: Self = Self(15 << 8);
    pub const DEDICATED_DECOMPRESSOR_16KB: Self = Self(14 << 8);
    pub const DEDICATED_DECOMPRESSOR_8KB: Self = Self(13 << 8);
    pub const DEDICATED_DECOMPRESSOR_4KB: Self = Self(12 << 8);
    pub const DEDICATED_DECOMPRESSOR_2KB: Self = Self(11 << 8);
    pub const DEDICATED_DECOMPRESSOR_1KB: Self = Self(10 << 8);
    pub const DEDICATED_DECOMPRESSOR_512B: Self = Self(9 << 8);
    pub const DEDICATED_DECOMPRESSOR: Self = Self::DEDICATED_DECOMPRESSOR_32KB;

    pub const DEDICATED_COMPRESSOR_3KB: Self = Self(9 << 4 | 1);
    pub const DEDICATED_COMPRESSOR_4KB: Self = Self(9 << 4 | 2);
    pub const DEDICATED_COMPRESSOR_8KB: Self = Self(10 << 4 | 3);
    pub const DEDICATED_COMPRESSOR_16KB: Self = Self(11 << 4 | 4);
    pub const DEDICATED_COMPRESSOR_32KB: Self = Self(12 << 4 | 5);
    pub const DEDICATED_COMPRESSOR_64KB: Self = Self(13 << 4 | 6);
    pub const DEDICATED_COMPRESSOR_128KB: Self = Self(14 << 4 | 7);
    pub const DEDICATED_COMPRESSOR_256KB: Self = Self(15 << 4 | 8);
    pub const DEDICATED_COMPRESSOR: Self = Self::DEDICATED_COMPRESSOR_256KB;

    const COMPRESSOR_MASK: u16 = 0x00FF;
    const DECOMPRESSOR_MASK: u16 = 0x0F00;

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn is_disabled(self) -> bool {
        self.0 & (Self::COMPRESSOR_MASK | Self::DECOMPRESSOR_MASK) == 0
    }

    pub fn compressor(self) -> Option<CodecMode> {
        match self.0 & Self::COMPRESSOR_MASK {
            0 => None,
            1 => Some(CodecMode::Shared),
            bits => Some(CodecMode::Dedicated { window_bits: clamp_window((bits >> 4) as u8) }),
        }
    }

    pub fn decompressor(self) -> Option<CodecMode> {
        match (self.0 & Self::DECOMPRESSOR_MASK) >> 8 {
            0 => None,
            1 => Some(CodecMode::Shared),
            bits => Some(CodecMode::Dedicated { window_bits: clamp_window(bits as u8) }),
        }
    }
}

impl BitOr for CompressOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for CompressOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressOptions")
            .field("compressor", &self.compressor())
            .field("decompressor", &self.decompressor())
            .finish()
    }
}

fn clamp_window(bits: u8) -> u8 {
    bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// stateless between messages
    Shared,
    Dedicated { window_bits: u8 },
}

/// Parameters of one direction of a negotiated extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub window_bits: u8,
    pub no_context_takeover: bool,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// server to client, `None` when this side never compresses
    pub compress: Option<DeflateParams>,
    /// client to server
    pub decompress: DeflateParams,
    /// value of the `Sec-WebSocket-Extensions` response header
    pub response: String,
}

#[derive(Debug, Default)]
struct Offer {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    /// `Some(None)` when offered without a value
    client_max_window_bits: Option<Option<u8>>,
}

impl Offer {
    fn parse(params: &str) -> Option<Self> {
        let mut offer = Offer::default();
        for param in params.split(';').map(str::trim).filter(|param| !param.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            let bits = || value.and_then(|value| value.parse::<u8>().ok()).filter(|bits| (8..=15).contains(bits));
            match name {
                "server_no_context_takeover" if value.is_none() => offer.server_no_context_takeover = true,
                "client_no_context_takeover" if value.is_none() => offer.client_no_context_takeover = true,
                "server_max_window_bits" => offer.server_max_window_bits = Some(bits()?),
                "client_max_window_bits" => {
                    offer.client_max_window_bits = Some(match value {
                        Some(_) => Some(bits()?),
                        None => None,
                    });
                }
                _ => return None,
            }
        }
        Some(offer)
    }
}

/// Picks the first acceptable `permessage-deflate` offer of a `Sec-WebSocket-Extensions` header.
pub fn negotiate(options: CompressOptions, header: &str) -> Option<Negotiated> {
    if options.is_disabled() {
        return None;
    }

    header
        .split(',')
        .filter_map(|extension| {
            let extension = extension.trim();
            let (name, params) = extension.split_once(';').unwrap_or((extension, ""));
            (name.trim() == "permessage-deflate").then_some(params)
        })
        .find_map(|params| accept(options, &Offer::parse(params)?))
}

fn accept(options: CompressOptions, offer: &Offer) -> Option<Negotiated> {
    let mut response = vec!["permessage-deflate".to_string()];

    let compress = match options.compressor() {
        None => None,
        Some(mode) => {
            let (mut window_bits, mut no_context_takeover) = match mode {
                CodecMode::Shared => (MAX_WINDOW_BITS, true),
                CodecMode::Dedicated { window_bits } => (window_bits, false),
            };
            if let Some(max) = offer.server_max_window_bits {
                // zlib's raw deflate can't go below 9 bits
                if max < MIN_WINDOW_BITS {
                    return None;
                }
                window_bits = window_bits.min(max);
            }
            no_context_takeover |= offer.server_no_context_takeover;
            Some(DeflateParams { window_bits, no_context_takeover })
        }
    };

    if let Some(params) = compress {
        if params.no_context_takeover {
            response.push("server_no_context_takeover".to_string());
        }
        if params.window_bits < MAX_WINDOW_BITS {
            response.push(format!("server_max_window_bits={}", params.window_bits));
        }
    } else if offer.server_no_context_takeover {
        response.push("server_no_context_takeover".to_string());
    }

    let mut decompress = DeflateParams { window_bits: MAX_WINDOW_BITS, no_context_takeover: offer.client_no_context_takeover };
    match options.decompressor() {
        None | Some(CodecMode::Shared) => decompress.no_context_takeover = true,
        Some(CodecMode::Dedicated { window_bits }) => {
            if let Some(offered) = offer.client_max_window_bits {
                decompress.window_bits = offered.map_or(window_bits, |offered| window_bits.min(offered)).max(MIN_WINDOW_BITS);
            }
        }
    }
    if decompress.no_context_takeover {
        response.push("client_no_context_takeover".to_string());
    }
    if decompress.window_bits < MAX_WINDOW_BITS {
        response.push(format!("client_max_window_bits={}", decompress.window_bits));
    }

    Some(Negotiated { compress, decompress, response: response.join("; ") })
}

/// The compression seam of a websocket connection.
#[cfg_attr(test, mockall::automock)]
pub trait MessageDeflate {
    /// whether outgoing messages may be compressed at all
    fn can_compress(&self) -> bool;

    fn compress(&mut self, payload: &[u8]) -> Result<Bytes, FrameError>;

    fn decompress(&mut self, payload: &[u8], max_len: usize) -> Result<Bytes, FrameError>;
}

/// [`MessageDeflate`] on top of `flate2` raw deflate streams.
pub struct DeflateCodec {
    compressor: Option<(Compress, bool)>,
    decompressor: Decompress,
    reset_decompressor: bool,
}

impl fmt::Debug for DeflateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeflateCodec").field("compress", &self.compressor.is_some()).finish_non_exhaustive()
    }
}

impl DeflateCodec {
    pub fn new(negotiated: &Negotiated) -> Self {
        let compressor = negotiated.compress.map(|params| {
            (Compress::new_with_window_bits(Compression::default(), false, params.window_bits), params.no_context_takeover)
        });
        Self {
            compressor,
            decompressor: Decompress::new_with_window_bits(false, negotiated.decompress.window_bits),
            reset_decompressor: negotiated.decompress.no_context_takeover,
        }
    }
}

impl MessageDeflate for DeflateCodec {
    fn can_compress(&self) -> bool {
        self.compressor.is_some()
    }

    fn compress(&mut self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let Some((compressor, reset)) = &mut self.compressor else {
            return Ok(Bytes::copy_from_slice(payload));
        };
        if *reset {
            compressor.reset();
        }

        let mut out = Vec::with_capacity(payload.len() / 2 + 64);
        let start = compressor.total_in();
        loop {
            let consumed = consumed_since(compressor.total_in(), start);
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            compressor.compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync).map_err(FrameError::inflate)?;
            // a sync flush is complete once it stops filling the output
            if consumed_since(compressor.total_in(), start) >= payload.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        Ok(Bytes::from(out))
    }

    fn decompress(&mut self, payload: &[u8], max_len: usize) -> Result<Bytes, FrameError> {
        if self.reset_decompressor {
            self.decompressor.reset(false);
        }

        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity((payload.len() * 2).clamp(64, max_len.max(64)));
        let start = self.decompressor.total_in();
        loop {
            let consumed = consumed_since(self.decompressor.total_in(), start);
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let before = (self.decompressor.total_in(), self.decompressor.total_out());
            let status =
                self.decompressor.decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync).map_err(FrameError::inflate)?;
            ensure!(out.len() <= max_len, FrameError::payload_too_large(out.len() as u64, max_len));

            let done = consumed_since(self.decompressor.total_in(), start) >= input.len() && out.len() < out.capacity();
            let stalled = before == (self.decompressor.total_in(), self.decompressor.total_out());
            if done || status == Status::StreamEnd || (stalled && out.len() < out.capacity()) {
                break;
            }
        }
        Ok(Bytes::from(out))
    }
}

fn consumed_since(total: u64, start: u64) -> usize {
    usize::try_from(total - start).unwrap_or(usize::MAX)
}
