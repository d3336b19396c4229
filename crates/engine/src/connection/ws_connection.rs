use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::connection::{Transport, Wake};
use crate::protocol::FrameError;
use crate::reactor::LoopContext;
use crate::reactor::table::SocketEntry;
use crate::response::{PendingUpgrade, UpgradedIo};
use crate::utils::ensure;
use crate::websocket::{
    DeflateCodec, Expiry, Frame, FrameCodec, MessageDeflate, Negotiated, OpCode, Shutdown, UpgradeContext, WebSocket,
    WebSocketBehavior, WsCore, WsShared, WsState, guarded, parse_close, shutdown,
};

/// Builds the continuation that runs a connection once its `101` was written.
pub(crate) fn pending_upgrade<U: 'static>(
    ctx: Rc<LoopContext>,
    context: UpgradeContext<U>,
    user_data: U,
    negotiated: Option<Negotiated>,
) -> PendingUpgrade {
    Box::new(move |io: UpgradedIo| {
        let behavior = Rc::clone(context.behavior());
        let deflate = negotiated.as_ref().map(|negotiated| Box::new(DeflateCodec::new(negotiated)) as Box<dyn MessageDeflate>);
        WsConnection::new(ctx, behavior, user_data, deflate, io).process().boxed_local()
    })
}

/// A data message being reassembled from fragments.
struct Assembly {
    opcode: OpCode,
    compressed: bool,
    payload: BytesMut,
}

pub(crate) struct WsConnection<U, R, W> {
    ctx: Rc<LoopContext>,
    ws: WebSocket<U>,
    transport: Transport<R, W>,
    codec: FrameCodec,
    message: Option<Assembly>,
    notify: Rc<Notify>,
}

impl<U, R, W> WsConnection<U, R, W>
where
    U: 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Registers the connection in the loop's socket table.
    pub(crate) fn new(
        ctx: Rc<LoopContext>,
        behavior: Rc<WebSocketBehavior<U>>,
        user_data: U,
        deflate: Option<Box<dyn MessageDeflate>>,
        io: UpgradedIo<R, W>,
    ) -> Self {
        let UpgradedIo { reader, writer, read_buf, remote } = io;
        let codec = FrameCodec::server(behavior.settings.max_payload_length).allow_rsv1(deflate.is_some());
        let notify = Rc::new(Notify::new());
        let shared = Rc::new(WsShared { data: RefCell::new(user_data), behavior });

        let (_, core) = ctx.sockets.borrow_mut().insert_with(|id| {
            let core = Rc::new(RefCell::new(WsCore::new(id, remote, Rc::clone(&shared), deflate, Rc::clone(&notify))));
            (SocketEntry::WebSocket(Rc::clone(&core)), core)
        });

        Self {
            ws: WebSocket::new(core, shared, Rc::clone(&ctx)),
            ctx,
            transport: Transport::new(reader, writer, read_buf),
            codec,
            message: None,
            notify,
        }
    }

    pub(crate) async fn process(mut self) {
        debug!(id = ?self.ws.core().borrow().id, "websocket opened");
        let behavior = Rc::clone(self.ws.behavior());
        if let Some(open) = &behavior.open {
            guarded("open", || self.ws.cork(|| open(&self.ws)));
        }

        loop {
            if let Err(e) = self.read_frames() {
                self.fail(&e);
            }
            self.handle_expiry();

            let state = self.ws.core().borrow().state;
            match state {
                WsState::Closed => break,
                WsState::Closing { close_after_flush: true } if !self.has_output() => {
                    self.transport.shutdown().await;
                    break;
                }
                _ => {}
            }

            if self.transport.is_eof() {
                match state {
                    WsState::Open => {
                        debug!("peer went away without a close frame");
                        shutdown(self.ws.core(), &self.ctx, 1006, b"", Shutdown::Abrupt);
                    }
                    // nothing more will arrive, write what is left
                    WsState::Closing { close_after_flush: false } => {
                        self.ws.core().borrow_mut().state = WsState::Closing { close_after_flush: true };
                    }
                    _ => {}
                }
                if self.ws.core().borrow().state == WsState::Closed {
                    break;
                }
            }

            let reading = matches!(state, WsState::Open | WsState::Closing { close_after_flush: false });
            if let Err(e) = self.pump(reading).await {
                debug!(cause = %e, "websocket transport failed");
                shutdown(self.ws.core(), &self.ctx, 1006, b"", Shutdown::Abrupt);
                break;
            }
        }

        // no-op unless the loop ended with the connection still open
        shutdown(self.ws.core(), &self.ctx, 1006, b"", Shutdown::Abrupt);
        debug!(id = ?self.ws.core().borrow().id, "websocket closed");
    }

    fn has_output(&self) -> bool {
        self.transport.is_writing() || !self.ws.core().borrow().outbound.is_drained()
    }

    async fn pump(&mut self, read: bool) -> std::io::Result<()> {
        let core = Rc::clone(self.ws.core());
        self.transport.load(|| core.borrow_mut().outbound.take());

        if self.transport.pump(&self.notify, read, None).await? == Wake::Wrote(true) {
            core.borrow_mut().outbound.complete();
            self.fire_drain();
        }
        Ok(())
    }

    fn fire_drain(&self) {
        {
            let mut core = self.ws.core().borrow_mut();
            if !core.drain_armed || core.outbound.is_over_limit() || !core.is_open() {
                return;
            }
            core.drain_armed = false;
        }

        let behavior = Rc::clone(self.ws.behavior());
        if let Some(drain) = &behavior.drain {
            guarded("drain", || self.ws.cork(|| drain(&self.ws)));
        }
    }

    fn handle_expiry(&self) {
        let expired = self.ws.core().borrow_mut().expired.take();
        match expired {
            Some(Expiry::Idle) => {
                info!(remote = ?self.ws.remote_address(), "websocket idle timeout");
                shutdown(self.ws.core(), &self.ctx, 1006, b"", Shutdown::Abrupt);
            }
            Some(Expiry::Lifetime) => {
                debug!(remote = ?self.ws.remote_address(), "websocket reached its max lifetime");
                shutdown(self.ws.core(), &self.ctx, 1001, b"", Shutdown::Handshake);
            }
            None => {}
        }
    }

    /// Closes the connection over a malformed or unacceptable frame.
    fn fail(&mut self, e: &FrameError) {
        warn!(remote = ?self.ws.remote_address(), cause = %e, "closing websocket");
        self.message = None;
        let mode = if matches!(e, FrameError::Io { .. }) { Shutdown::Abrupt } else { Shutdown::Final };
        let reason = e.to_string();
        shutdown(self.ws.core(), &self.ctx, e.close_code(), reason.as_bytes(), mode);

        // a failure during our own close handshake ends it
        let mut core = self.ws.core().borrow_mut();
        if core.state == (WsState::Closing { close_after_flush: false }) {
            core.state = WsState::Closing { close_after_flush: true };
        }
    }

    fn read_frames(&mut self) -> Result<(), FrameError> {
        loop {
            let state = self.ws.core().borrow().state;
            if !matches!(state, WsState::Open | WsState::Closing { close_after_flush: false }) {
                return Ok(());
            }
            let Some(frame) = self.codec.decode(&mut self.transport.read_buf)? else {
                return Ok(());
            };
            self.on_frame(frame)?;
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        let open = {
            let mut core = self.ws.core().borrow_mut();
            core.touch(Instant::now());
            core.is_open()
        };
        let behavior = Rc::clone(self.ws.behavior());

        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                // data after our close frame is discarded
                if open {
                    self.on_data_frame(frame)?;
                }
            }
            OpCode::Ping => {
                // no pong once our close frame is queued
                if open {
                    self.ws.core().borrow_mut().push_control(OpCode::Pong, &frame.payload);
                }
                if let (true, Some(ping)) = (open, &behavior.ping) {
                    guarded("ping", || self.ws.cork(|| ping(&self.ws, &frame.payload)));
                }
            }
            OpCode::Pong => {
                if let (true, Some(pong)) = (open, &behavior.pong) {
                    guarded("pong", || self.ws.cork(|| pong(&self.ws, &frame.payload)));
                }
            }
            OpCode::Close => {
                let (code, reason) = parse_close(&frame.payload)?;
                if open {
                    debug!(code, "peer started the close handshake");
                    shutdown(self.ws.core(), &self.ctx, code, reason, Shutdown::Final);
                } else {
                    self.ws.core().borrow_mut().state = WsState::Closing { close_after_flush: true };
                }
            }
        }
        Ok(())
    }

    fn on_data_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        let max = self.ws.behavior().settings.max_payload_length;

        match (frame.opcode, self.message.take()) {
            (OpCode::Continuation, None) => Err(FrameError::protocol("continuation frame without a message")),
            (_, Some(_)) if frame.opcode != OpCode::Continuation => Err(FrameError::protocol("expected a continuation frame")),
            (opcode, None) if frame.fin => self.deliver(opcode, frame.rsv1, frame.payload),
            (opcode, None) => {
                self.message = Some(Assembly { opcode, compressed: frame.rsv1, payload: BytesMut::from(&frame.payload[..]) });
                Ok(())
            }
            (_, Some(mut message)) => {
                let size = message.payload.len() + frame.payload.len();
                ensure!(size <= max, FrameError::payload_too_large(size as u64, max));
                message.payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(message.opcode, message.compressed, message.payload.freeze())
                } else {
                    self.message = Some(message);
                    Ok(())
                }
            }
        }
    }

    fn deliver(&mut self, opcode: OpCode, compressed: bool, payload: Bytes) -> Result<(), FrameError> {
        let payload = if compressed { self.ws.core().borrow_mut().inflate(&payload)? } else { payload };
        if opcode == OpCode::Text {
            ensure!(std::str::from_utf8(&payload).is_ok(), FrameError::InvalidUtf8);
        }

        let behavior = Rc::clone(self.ws.behavior());
        if let Some(message) = &behavior.message {
            guarded("message", || self.ws.cork(|| message(&self.ws, &payload, opcode)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::Encoder;

    use crate::config::EngineConfig;
    use crate::reactor::{Loop, LoopRef};
    use crate::websocket::{BackpressurePolicy, MockMessageDeflate, SendStatus};

    use super::*;

    type ServerIo = UpgradedIo<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    struct Peer {
        stream: DuplexStream,
        codec: FrameCodec,
        buf: BytesMut,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let mut out = BytesMut::new();
            self.codec.encode(frame, &mut out).unwrap();
            self.stream.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }
    }

    fn pair() -> (Peer, ServerIo) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let peer = Peer { stream: client, codec: FrameCodec::client(1 << 20), buf: BytesMut::new() };
        (peer, UpgradedIo { reader, writer, read_buf: BytesMut::new(), remote: None })
    }

    fn open<U: Default + 'static>(loop_ref: &LoopRef, behavior: WebSocketBehavior<U>) -> Peer {
        open_with(loop_ref, behavior, None)
    }

    fn open_with<U: Default + 'static>(
        loop_ref: &LoopRef,
        behavior: WebSocketBehavior<U>,
        deflate: Option<Box<dyn MessageDeflate>>,
    ) -> Peer {
        let (mut peer, io) = pair();
        peer.codec = FrameCodec::client(1 << 20).allow_rsv1(deflate.is_some());
        let connection = WsConnection::new(Rc::clone(&loop_ref.ctx), Rc::new(behavior), U::default(), deflate, io);
        tokio::task::spawn_local(connection.process());
        peer
    }

    fn run<F: std::future::Future<Output = ()>>(config: EngineConfig, f: impl FnOnce(LoopRef) -> F) {
        let lp = Loop::new(config);
        let loop_ref = lp.loop_ref();
        lp.block_on(f(loop_ref)).unwrap();
    }

    fn text(payload: &str) -> Frame {
        Frame::new(OpCode::Text, Bytes::copy_from_slice(payload.as_bytes()))
    }

    #[test]
    fn echoes_messages() {
        run(EngineConfig::default(), |loop_ref| async move {
            let behavior = WebSocketBehavior::<()>::builder()
                .message(|ws, message, opcode| {
                    assert_eq!(ws.send(message, opcode), SendStatus::Success);
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(text("hi there")).await;
            let frame = peer.recv().await.unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(&frame.payload[..], b"hi there");
        });
    }

    #[test]
    fn panic_inside_cork_keeps_sending() {
        run(EngineConfig::default(), |loop_ref| async move {
            let behavior = WebSocketBehavior::<()>::builder()
                .message(|ws, message, _| {
                    if message == b"boom" {
                        ws.cork(|| panic!("boom"));
                    } else {
                        ws.send(b"echo", OpCode::Text);
                    }
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(text("boom")).await;
            peer.send(text("hi")).await;
            let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv()).await.unwrap().unwrap();
            assert_eq!(&frame.payload[..], b"echo");
        });
    }

    #[test]
    fn reassembles_fragments() {
        run(EngineConfig::default(), |loop_ref| async move {
            let received = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&received);
            let behavior = WebSocketBehavior::<()>::builder()
                .message(move |ws, message, opcode| {
                    sink.borrow_mut().push((message.to_vec(), opcode));
                    ws.send_first_fragment_with_opcode(b"He", OpCode::Text, false);
                    ws.send(b"interleaved", OpCode::Ping);
                    ws.send_fragment(b"ll", false);
                    ws.send_last_fragment(b"o", false);
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(text("He").with_fin(false)).await;
            peer.send(Frame::new(OpCode::Ping, Bytes::from_static(b"p"))).await;
            peer.send(Frame::new(OpCode::Continuation, Bytes::from_static(b"ll")).with_fin(false)).await;
            peer.send(Frame::new(OpCode::Continuation, Bytes::from_static(b"o"))).await;

            let pong = peer.recv().await.unwrap();
            assert_eq!((pong.opcode, &pong.payload[..]), (OpCode::Pong, &b"p"[..]));

            let mut assembled = Vec::new();
            let mut opcodes = Vec::new();
            while let Some(frame) = peer.recv().await {
                opcodes.push(frame.opcode);
                if frame.opcode != OpCode::Ping {
                    assembled.extend_from_slice(&frame.payload);
                }
                if frame.fin && frame.opcode == OpCode::Continuation {
                    break;
                }
            }

            assert_eq!(*received.borrow(), vec![(b"Hello".to_vec(), OpCode::Text)]);
            assert_eq!(assembled, b"Hello");
            assert_eq!(opcodes, vec![OpCode::Text, OpCode::Ping, OpCode::Continuation, OpCode::Continuation]);
        });
    }

    #[test]
    fn close_handshake_fires_close_once() {
        run(EngineConfig::default(), |loop_ref| async move {
            let closes = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&closes);
            let behavior = WebSocketBehavior::<()>::builder()
                .close(move |ws, code, reason| {
                    assert!(ws.is_closed());
                    assert_eq!(ws.send(b"too late", OpCode::Text), SendStatus::Dropped);
                    sink.borrow_mut().push((code, reason.to_vec()));
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(Frame::close(1000, b"bye")).await;
            let echo = peer.recv().await.unwrap();
            assert_eq!(echo.opcode, OpCode::Close);
            assert_eq!(parse_close(&echo.payload).unwrap(), (1000, &b"bye"[..]));
            assert!(peer.recv().await.is_none());

            assert_eq!(*closes.borrow(), vec![(1000, b"bye".to_vec())]);
        });
    }

    #[test]
    fn server_end_waits_for_peer_close() {
        run(EngineConfig::default(), |loop_ref| async move {
            let closes = Rc::new(Cell::new(0));
            let counter = Rc::clone(&closes);
            let behavior = WebSocketBehavior::<()>::builder()
                .open(|ws| ws.end(4000, b"done"))
                .close(move |_, code, _| {
                    assert_eq!(code, 4000);
                    counter.set(counter.get() + 1);
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            let close = peer.recv().await.unwrap();
            assert_eq!(parse_close(&close.payload).unwrap(), (4000, &b"done"[..]));
            peer.send(Frame::close(4000, b"")).await;
            assert!(peer.recv().await.is_none());
            assert_eq!(closes.get(), 1);
        });
    }

    #[test]
    fn ping_after_our_close_gets_no_pong() {
        run(EngineConfig::default(), |loop_ref| async move {
            let behavior = WebSocketBehavior::<()>::builder().open(|ws| ws.end(1000, b"")).build();
            let mut peer = open(&loop_ref, behavior);

            let close = peer.recv().await.unwrap();
            assert_eq!(close.opcode, OpCode::Close);
            peer.send(Frame::new(OpCode::Ping, Bytes::from_static(b"late"))).await;
            peer.send(Frame::close(1000, b"")).await;
            assert!(peer.recv().await.is_none());
        });
    }

    #[test]
    fn invalid_utf8_closes_with_1007() {
        run(EngineConfig::default(), |loop_ref| async move {
            let code = Rc::new(Cell::new(0));
            let seen = Rc::clone(&code);
            let behavior = WebSocketBehavior::<()>::builder().close(move |_, code, _| seen.set(code)).build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(Frame::new(OpCode::Text, Bytes::from_static(&[0xff, 0xfe]))).await;
            let close = peer.recv().await.unwrap();
            assert_eq!(parse_close(&close.payload).unwrap().0, 1007);
            assert!(peer.recv().await.is_none());
            assert_eq!(code.get(), 1007);
        });
    }

    #[test]
    fn oversized_message_closes_with_1009() {
        run(EngineConfig::default(), |loop_ref| async move {
            let behavior = WebSocketBehavior::<()>::builder().max_payload_length(8).build();
            let mut peer = open(&loop_ref, behavior);

            peer.send(text("four").with_fin(false)).await;
            peer.send(Frame::new(OpCode::Continuation, Bytes::from_static(b"more bytes"))).await;
            let close = peer.recv().await.unwrap();
            assert_eq!(parse_close(&close.payload).unwrap().0, 1009);
        });
    }

    #[test]
    fn unmasked_client_frame_is_a_protocol_error() {
        run(EngineConfig::default(), |loop_ref| async move {
            let mut peer = open(&loop_ref, WebSocketBehavior::<()>::default());
            peer.codec = FrameCodec::server(1 << 20);

            peer.send(text("plain")).await;
            peer.codec = FrameCodec::client(1 << 20);
            let close = peer.recv().await.unwrap();
            assert_eq!(parse_close(&close.payload).unwrap().0, 1002);
        });
    }

    #[test]
    fn close_policy_closes_within_one_send() {
        run(EngineConfig::default(), |loop_ref| async move {
            let statuses = Rc::new(RefCell::new(Vec::new()));
            let closes = Rc::new(RefCell::new(Vec::new()));
            let (sink, close_sink) = (Rc::clone(&statuses), Rc::clone(&closes));
            let behavior = WebSocketBehavior::<()>::builder()
                .max_backpressure(1024)
                .backpressure_policy(BackpressurePolicy::Close)
                .open(move |ws| {
                    let big = vec![b'x'; 2048];
                    for _ in 0..3 {
                        sink.borrow_mut().push(ws.send(&big, OpCode::Binary));
                    }
                })
                .close(move |_, code, _| close_sink.borrow_mut().push(code))
                .build();
            let mut peer = open(&loop_ref, behavior);

            assert!(peer.recv().await.is_none());
            assert_eq!(*statuses.borrow(), vec![SendStatus::Dropped, SendStatus::Dropped, SendStatus::Dropped]);
            assert_eq!(*closes.borrow(), vec![1006]);
        });
    }

    #[test]
    fn drop_newest_reports_dropped_and_drains() {
        run(EngineConfig::default(), |loop_ref| async move {
            let dropped = Rc::new(RefCell::new(Vec::new()));
            let drained = Rc::new(Cell::new(0));
            let (sink, drain_count) = (Rc::clone(&dropped), Rc::clone(&drained));
            let behavior = WebSocketBehavior::<()>::builder()
                .max_backpressure(1024)
                .open(|ws| {
                    assert_eq!(ws.send(&[1; 2048], OpCode::Binary), SendStatus::Backpressure);
                    assert_eq!(ws.send(b"second", OpCode::Binary), SendStatus::Dropped);
                    assert!(ws.buffered_amount() >= 2048);
                })
                .dropped(move |_, message, _| sink.borrow_mut().push(message.to_vec()))
                .drain(move |ws| {
                    drain_count.set(drain_count.get() + 1);
                    ws.send(b"after drain", OpCode::Text);
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            let first = peer.recv().await.unwrap();
            assert_eq!(first.payload.len(), 2048);
            let next = peer.recv().await.unwrap();
            assert_eq!(&next.payload[..], b"after drain");
            assert_eq!(*dropped.borrow(), vec![b"second".to_vec()]);
            assert_eq!(drained.get(), 1);
        });
    }

    #[test]
    fn drop_oldest_discards_queued_messages() {
        run(EngineConfig::default(), |loop_ref| async move {
            let behavior = WebSocketBehavior::<()>::builder()
                .max_backpressure(1024)
                .backpressure_policy(BackpressurePolicy::DropOldest)
                .open(|ws| {
                    assert_eq!(ws.send(&[1; 600], OpCode::Binary), SendStatus::Success);
                    assert_eq!(ws.send(&[2; 600], OpCode::Binary), SendStatus::Backpressure);
                    // both queued messages make room for the third
                    assert_eq!(ws.send(&[3; 600], OpCode::Binary), SendStatus::Success);
                    assert_eq!(ws.send(b"end", OpCode::Binary), SendStatus::Success);
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            let mut seen = Vec::new();
            for _ in 0..2 {
                seen.push(peer.recv().await.unwrap().payload[0]);
            }
            assert_eq!(seen, vec![3, b'e']);
        });
    }

    #[test]
    fn topics_publish_and_purge() {
        run(EngineConfig::default(), |loop_ref| async move {
            let events = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&events);
            let behavior = || {
                let sink = Rc::clone(&sink);
                WebSocketBehavior::<()>::builder()
                    .open(|ws| {
                        assert!(ws.subscribe("room"));
                        assert!(!ws.subscribe("room"));
                    })
                    .message(|ws, message, opcode| {
                        assert!(ws.publish("room", message, opcode, false));
                    })
                    .subscription(move |_, topic, new, old| sink.borrow_mut().push((topic.to_string(), new, old)))
                    .build()
            };

            let mut alice = open(&loop_ref, behavior());
            let mut bob = open(&loop_ref, behavior());
            while loop_ref.num_subscribers("room") != 2 {
                tokio::task::yield_now().await;
            }

            alice.send(text("hello room")).await;
            let frame = bob.recv().await.unwrap();
            assert_eq!(&frame.payload[..], b"hello room");

            assert_eq!(loop_ref.publish("room", b"from app", OpCode::Text, false), 2);
            assert_eq!(&alice.recv().await.unwrap().payload[..], b"from app");
            assert_eq!(&bob.recv().await.unwrap().payload[..], b"from app");

            drop(alice);
            while loop_ref.num_subscribers("room") != 1 {
                tokio::task::yield_now().await;
            }
            assert_eq!(
                *events.borrow(),
                vec![("room".to_string(), 1, 0), ("room".to_string(), 2, 1), ("room".to_string(), 1, 2)]
            );
        });
    }

    #[test]
    fn idle_timeout_pings_then_closes() {
        let config = EngineConfig::builder().sweep_interval(Duration::from_millis(10)).build().unwrap();
        run(config, |loop_ref| async move {
            let code = Rc::new(Cell::new(0));
            let seen = Rc::clone(&code);
            let behavior = WebSocketBehavior::<()>::builder()
                .idle_timeout(Duration::from_millis(100))
                .close(move |_, code, _| seen.set(code))
                .build();
            let mut peer = open(&loop_ref, behavior);

            let ping = peer.recv().await.unwrap();
            assert_eq!(ping.opcode, OpCode::Ping);
            assert!(peer.recv().await.is_none());
            assert_eq!(code.get(), 1006);
        });
    }

    #[test]
    fn max_lifetime_closes_an_active_connection() {
        let config = EngineConfig::builder().sweep_interval(Duration::from_millis(10)).build().unwrap();
        run(config, |loop_ref| async move {
            let code = Rc::new(Cell::new(0));
            let seen = Rc::clone(&code);
            let behavior = WebSocketBehavior::<()>::builder()
                .max_lifetime(Duration::from_millis(150))
                .close(move |_, code, _| seen.set(code))
                .build();
            let mut peer = open(&loop_ref, behavior);

            let close = loop {
                peer.send(Frame::new(OpCode::Ping, Bytes::from_static(b"alive"))).await;
                let frame = peer.recv().await.unwrap();
                if frame.opcode == OpCode::Close {
                    break frame;
                }
                assert_eq!(frame.opcode, OpCode::Pong);
                tokio::time::sleep(Duration::from_millis(20)).await;
            };
            assert_eq!(parse_close(&close.payload).unwrap().0, 1001);
            peer.send(Frame::close(1001, b"")).await;
            assert!(peer.recv().await.is_none());
            assert_eq!(code.get(), 1001);
        });
    }

    #[test]
    fn sending_resets_the_idle_timeout() {
        let config = EngineConfig::builder().sweep_interval(Duration::from_millis(10)).build().unwrap();
        run(config, |loop_ref| async move {
            let token = Rc::new(Cell::new(None));
            let slot = Rc::clone(&token);
            let behavior = WebSocketBehavior::<()>::builder()
                .idle_timeout(Duration::from_millis(100))
                .reset_idle_timeout_on_send(true)
                .send_pings_automatically(false)
                .open(move |ws| slot.set(Some(ws.token())))
                .build();
            let mut peer = open(&loop_ref, behavior);

            while token.get().is_none() {
                tokio::task::yield_now().await;
            }
            let token = token.get().unwrap();
            // well past the idle timeout, the peer itself stays silent
            for i in 0..10u8 {
                let ws = loop_ref.websocket::<()>(token).unwrap();
                assert_eq!(ws.send(&[i], OpCode::Binary), SendStatus::Success);
                let frame = peer.recv().await.unwrap();
                assert_eq!(&frame.payload[..], &[i]);
                tokio::time::sleep(Duration::from_millis(30)).await;
            }

            assert!(peer.recv().await.is_none());
            assert!(loop_ref.websocket::<()>(token).is_err());
        });
    }

    #[test]
    fn slow_subscriber_does_not_hold_back_others() {
        run(EngineConfig::default(), |loop_ref| async move {
            let subscriber = |max_backpressure| {
                WebSocketBehavior::<()>::builder()
                    .max_backpressure(max_backpressure)
                    .backpressure_policy(BackpressurePolicy::Close)
                    .open(|ws| {
                        ws.subscribe("feed");
                    })
                    .build()
            };
            let mut slow = open(&loop_ref, subscriber(16));
            let mut fast = open(&loop_ref, subscriber(0));
            while loop_ref.num_subscribers("feed") != 2 {
                tokio::task::yield_now().await;
            }

            assert_eq!(loop_ref.publish("feed", &[7; 64], OpCode::Binary, false), 2);
            assert_eq!(fast.recv().await.unwrap().payload.len(), 64);
            assert!(slow.recv().await.is_none());

            assert_eq!(loop_ref.num_subscribers("feed"), 1);
            assert_eq!(loop_ref.publish("feed", b"next", OpCode::Binary, false), 1);
            assert_eq!(&fast.recv().await.unwrap().payload[..], b"next");
        });
    }

    #[test]
    fn compressed_messages_go_through_the_codec() {
        run(EngineConfig::default(), |loop_ref| async move {
            let mut deflate = MockMessageDeflate::new();
            deflate.expect_decompress().returning(|payload, _| Ok(Bytes::from(payload.to_ascii_uppercase())));
            deflate.expect_can_compress().return_const(true);
            deflate.expect_compress().times(1).returning(|payload| Ok(Bytes::from(payload.iter().rev().copied().collect::<Vec<_>>())));

            let behavior = WebSocketBehavior::<()>::builder()
                .message(|ws, message, opcode| {
                    assert_eq!(message, b"SQUEEZED");
                    ws.send_with_options(message, opcode, true, true);
                    // fragments are never compressed
                    ws.send_with_options(b"ab", opcode, true, false);
                    ws.send_last_fragment(b"c", true);
                })
                .build();
            let mut peer = open_with(&loop_ref, behavior, Some(Box::new(deflate)));

            peer.send(text("squeezed").with_rsv1(true)).await;
            let compressed = peer.recv().await.unwrap();
            assert!(compressed.rsv1);
            assert_eq!(&compressed.payload[..], b"DEZEEUQS");
            let fragment = peer.recv().await.unwrap();
            assert!(!fragment.rsv1);
            assert_eq!(&fragment.payload[..], b"ab");
        });
    }

    #[test]
    fn token_resolves_until_close() {
        run(EngineConfig::default(), |loop_ref| async move {
            let token = Rc::new(Cell::new(None));
            let slot = Rc::clone(&token);
            let behavior = WebSocketBehavior::<u32>::builder()
                .open(move |ws| {
                    *ws.user_data_mut() = 7;
                    slot.set(Some(ws.token()));
                })
                .build();
            let mut peer = open(&loop_ref, behavior);

            while token.get().is_none() {
                tokio::task::yield_now().await;
            }
            let token = token.get().unwrap();
            let ws = loop_ref.websocket::<u32>(token).unwrap();
            assert_eq!(*ws.user_data(), 7);
            assert!(loop_ref.websocket::<String>(token).is_err());

            ws.close();
            assert!(peer.recv().await.is_none());
            assert!(loop_ref.websocket::<u32>(token).is_err());
        });
    }
}
