//! Per-connection send queue.
//!
//! Handlers never write to the socket directly: bytes are queued here and the
//! connection driver hands them to the transport one segment at a time.
//! Inside a cork scope small writes are appended to one bounded buffer, which
//! becomes a single segment when the outermost scope ends.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
struct Segment {
    bytes: Bytes,
    /// a complete websocket data message that may be discarded under pressure
    droppable: bool,
}

#[derive(Debug)]
pub(crate) struct Outbound {
    queue: VecDeque<Segment>,
    queued: usize,
    in_flight: usize,
    cork: BytesMut,
    cork_depth: usize,
    cork_size: usize,
    limit: usize,
    handed: u64,
    /// droppable messages bypass the cork buffer so they stay droppable
    split_messages: bool,
}

impl Outbound {
    pub(crate) fn new(limit: usize, cork_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: 0,
            in_flight: 0,
            cork: BytesMut::new(),
            cork_depth: 0,
            cork_size,
            limit,
            handed: 0,
            split_messages: false,
        }
    }

    pub(crate) fn split_messages(&mut self, split: bool) {
        self.split_messages = split;
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// bytes accepted but not yet written by the transport
    pub(crate) fn buffered(&self) -> usize {
        self.queued + self.cork.len() + self.in_flight
    }

    pub(crate) fn remaining_capacity(&self) -> usize {
        self.limit.saturating_sub(self.buffered())
    }

    pub(crate) fn is_over_limit(&self) -> bool {
        self.buffered() > self.limit
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.buffered() == 0
    }

    /// total bytes the transport has completed writing
    pub(crate) fn handed(&self) -> u64 {
        self.handed
    }

    pub(crate) fn push(&mut self, bytes: Bytes) {
        self.push_segment(Segment { bytes, droppable: false });
    }

    pub(crate) fn push_message(&mut self, bytes: Bytes) {
        self.push_segment(Segment { bytes, droppable: true });
    }

    fn push_segment(&mut self, segment: Segment) {
        if segment.bytes.is_empty() {
            return;
        }

        let corkable = !(segment.droppable && self.split_messages);
        if self.cork_depth > 0 && corkable && segment.bytes.len() <= self.cork_size {
            if self.cork.len() + segment.bytes.len() > self.cork_size {
                self.flush_cork();
            }
            self.cork.extend_from_slice(&segment.bytes);
            return;
        }

        self.flush_cork();
        self.queued += segment.bytes.len();
        self.queue.push_back(segment);
    }

    pub(crate) fn cork(&mut self) {
        self.cork_depth += 1;
    }

    /// Leaves one cork scope, returns `true` when the outermost scope ended.
    pub(crate) fn uncork(&mut self) -> bool {
        self.cork_depth = self.cork_depth.saturating_sub(1);
        if self.cork_depth == 0 {
            self.flush_cork();
            return true;
        }
        false
    }

    /// Leaves every open cork scope at once.
    pub(crate) fn reset_cork(&mut self) {
        self.cork_depth = 0;
        self.flush_cork();
    }

    pub(crate) fn is_corked(&self) -> bool {
        self.cork_depth > 0
    }

    fn flush_cork(&mut self) {
        if self.cork.is_empty() {
            return;
        }
        let bytes = self.cork.split().freeze();
        self.queued += bytes.len();
        self.queue.push_back(Segment { bytes, droppable: false });
    }

    /// Takes the next segment for the transport; it counts as in flight until [`Outbound::complete`].
    pub(crate) fn take(&mut self) -> Option<Bytes> {
        if self.in_flight > 0 {
            return None;
        }
        if self.queue.is_empty() && self.cork_depth == 0 {
            self.flush_cork();
        }
        let segment = self.queue.pop_front()?;
        self.queued -= segment.bytes.len();
        self.in_flight = segment.bytes.len();
        Some(segment.bytes)
    }

    pub(crate) fn complete(&mut self) {
        self.handed += self.in_flight as u64;
        self.in_flight = 0;
    }

    /// Discards queued droppable messages, oldest first, until `needed` more bytes fit under the limit.
    ///
    /// Returns the number of messages discarded.
    pub(crate) fn drop_oldest(&mut self, needed: usize) -> usize {
        let mut dropped = 0;
        let mut index = 0;
        while self.buffered() + needed > self.limit && index < self.queue.len() {
            if self.queue[index].droppable {
                if let Some(segment) = self.queue.remove(index) {
                    self.queued -= segment.bytes.len();
                    dropped += 1;
                }
            } else {
                index += 1;
            }
        }
        dropped
    }

    /// Discards everything not yet written.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.queued = 0;
        self.cork.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_flow_in_order() {
        let mut outbound = Outbound::new(16, 8);
        outbound.push(Bytes::from_static(b"abc"));
        outbound.push(Bytes::from_static(b"defgh"));
        assert_eq!(outbound.buffered(), 8);

        assert_eq!(outbound.take().unwrap().as_ref(), b"abc");
        assert!(outbound.take().is_none(), "one segment in flight at a time");
        assert_eq!(outbound.buffered(), 8);
        outbound.complete();

        assert_eq!(outbound.take().unwrap().as_ref(), b"defgh");
        outbound.complete();
        assert!(outbound.is_drained());
        assert_eq!(outbound.handed(), 8);
    }

    #[test]
    fn cork_coalesces_writes() {
        let mut outbound = Outbound::new(64, 8);
        outbound.cork();
        outbound.cork();
        outbound.push(Bytes::from_static(b"ab"));
        outbound.push(Bytes::from_static(b"cd"));
        assert!(!outbound.uncork(), "nested scopes are flattened");
        outbound.push(Bytes::from_static(b"ef"));
        assert!(outbound.uncork());

        assert_eq!(outbound.take().unwrap().as_ref(), b"abcdef");
        outbound.complete();
        assert!(outbound.take().is_none());
    }

    #[test]
    fn cork_buffer_is_bounded() {
        let mut outbound = Outbound::new(64, 4);
        outbound.cork();
        outbound.push(Bytes::from_static(b"abc"));
        outbound.push(Bytes::from_static(b"de"));
        outbound.push(Bytes::from_static(b"0123456789"));
        outbound.uncork();

        let mut segments = Vec::new();
        while let Some(bytes) = outbound.take() {
            segments.push(bytes);
            outbound.complete();
        }
        assert_eq!(segments, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de"), Bytes::from_static(b"0123456789")]);
    }

    #[test]
    fn drop_oldest_keeps_control_frames() {
        let mut outbound = Outbound::new(10, 4);
        outbound.push_message(Bytes::from_static(b"1111"));
        outbound.push(Bytes::from_static(b"cc"));
        outbound.push_message(Bytes::from_static(b"2222"));
        assert_eq!(outbound.buffered(), 10);

        assert_eq!(outbound.drop_oldest(4), 1);
        assert_eq!(outbound.buffered(), 6);
        assert_eq!(outbound.take().unwrap().as_ref(), b"cc");
    }
}
