//! RFC 6455 frame codec.
//!
//! The codec works on single frames. Reassembly of fragmented messages,
//! decompression and UTF-8 checks happen one level up in the connection driver.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::protocol::FrameError;
use crate::utils::ensure;

/// largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }

    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Continuation),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            other => Err(FrameError::protocol(format!("reserved opcode {other:#x}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// the permessage-deflate bit
    pub rsv1: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self { fin: true, rsv1: false, opcode, payload: payload.into() }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// A close frame, the reason is cut to fit the control frame limit.
    ///
    /// Code `0` and `1005` produce an empty payload.
    pub fn close(code: u16, reason: &[u8]) -> Self {
        if code == 0 || code == 1005 {
            return Frame::new(OpCode::Close, Bytes::new());
        }
        let reason = truncate_utf8(reason, MAX_CONTROL_PAYLOAD - 2);
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason);
        Frame::new(OpCode::Close, payload.freeze())
    }
}

/// Splits a close payload into code and reason, `1005` when the payload is empty.
pub fn parse_close(payload: &[u8]) -> Result<(u16, &[u8]), FrameError> {
    match payload.len() {
        0 => Ok((1005, &[])),
        1 => Err(FrameError::protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            ensure!(is_valid_close_code(code), FrameError::protocol(format!("invalid close code {code}")));
            let reason = &payload[2..];
            ensure!(std::str::from_utf8(reason).is_ok(), FrameError::InvalidUtf8);
            Ok((code, reason))
        }
    }
}

fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

fn truncate_utf8(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() <= max {
        return bytes;
    }
    let mut end = max;
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    &bytes[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// expects masked frames, writes unmasked ones
    Server,
    /// writes masked frames, expects unmasked ones
    Client,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
    allow_rsv1: bool,
}

impl FrameCodec {
    pub fn server(max_payload: usize) -> Self {
        Self { role: Role::Server, max_payload, allow_rsv1: false }
    }

    pub fn client(max_payload: usize) -> Self {
        Self { role: Role::Client, max_payload, allow_rsv1: false }
    }

    /// accept the rsv1 bit on data frames, set once permessage-deflate is negotiated
    pub fn allow_rsv1(mut self, allow_rsv1: bool) -> Self {
        self.allow_rsv1 = allow_rsv1;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        ensure!(first & 0x30 == 0, FrameError::protocol("rsv2 or rsv3 set"));
        let opcode = OpCode::try_from(first & 0x0F)?;

        let masked = second & 0x80 != 0;
        match self.role {
            Role::Server => ensure!(masked, FrameError::protocol("client frame is not masked")),
            Role::Client => ensure!(!masked, FrameError::protocol("server frame is masked")),
        }

        if opcode.is_control() {
            ensure!(fin, FrameError::protocol("fragmented control frame"));
            ensure!(!rsv1, FrameError::protocol("rsv1 set on control frame"));
        }
        ensure!(!rsv1 || (self.allow_rsv1 && opcode != OpCode::Continuation), FrameError::protocol("unexpected rsv1"));

        let (payload_len, mut header_len) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(len);
                ensure!(len >> 63 == 0, FrameError::protocol("payload length with the most significant bit set"));
                (len, 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            ensure!(payload_len <= MAX_CONTROL_PAYLOAD as u64, FrameError::protocol("control frame payload too long"));
        }
        ensure!(payload_len <= self.max_payload as u64, FrameError::payload_too_large(payload_len, self.max_payload));
        // bounded by max_payload above
        let payload_len = usize::try_from(payload_len).map_err(|_| FrameError::payload_too_large(payload_len, self.max_payload))?;

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let mut mask = [0u8; 4];
            mask.copy_from_slice(&src[header_len..header_len + 4]);
            header_len += 4;
            Some(mask)
        } else {
            None
        };

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        trace!(?opcode, fin, len = payload_len, "decoded frame");
        Ok(Some(Frame { fin, rsv1, opcode, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Server => None,
            Role::Client => Some(fastrand::u32(..).to_be_bytes()),
        };
        encode_frame(&item, mask, dst);
        Ok(())
    }
}

/// Writes one frame, masking the payload when a key is given.
pub(crate) fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let len = frame.payload.len();
    dst.reserve(len + 14);

    let mut first = frame.opcode as u8;
    if frame.fin {
        first |= 0x80;
    }
    if frame.rsv1 {
        first |= 0x40;
    }
    dst.put_u8(first);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        // fits in seven bits
        dst.put_u8(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(mask) => {
            dst.put_slice(&mask);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], mask);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// Encodes a frame into its own buffer.
pub(crate) fn frame_bytes(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(frame.payload.len() + 10);
    encode_frame(frame, None, &mut dst);
    dst.freeze()
}

fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
