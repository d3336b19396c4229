//! Per-route websocket settings and event handlers.

use std::fmt;
use std::time::Duration;

use crate::protocol::HttpRequest;
use crate::response::HttpResponse;
use crate::websocket::compression::CompressOptions;
use crate::websocket::frame::OpCode;
use crate::websocket::handshake::UpgradeContext;
use crate::websocket::socket::WebSocket;

pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 16 * 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_BACKPRESSURE: usize = 64 * 1024;

/// What a send does once a connection's buffered bytes exceed `max_backpressure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// refuse the new message
    #[default]
    DropNewest,
    /// discard queued, unsent messages oldest first to make room
    DropOldest,
    /// close the connection
    Close,
}

/// The non generic part of a behavior, shared with every connection of the route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsSettings {
    pub compression: CompressOptions,
    pub max_payload_length: usize,
    /// `Duration::ZERO` disables the idle timeout
    pub idle_timeout: Duration,
    /// `0` means unlimited
    pub max_backpressure: usize,
    pub backpressure_policy: BackpressurePolicy,
    pub reset_idle_timeout_on_send: bool,
    pub send_pings_automatically: bool,
    /// `Duration::ZERO` disables the lifetime limit
    pub max_lifetime: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            compression: CompressOptions::DISABLED,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_backpressure: DEFAULT_MAX_BACKPRESSURE,
            backpressure_policy: BackpressurePolicy::DropNewest,
            reset_idle_timeout_on_send: true,
            send_pings_automatically: true,
            max_lifetime: Duration::ZERO,
        }
    }
}

pub type UpgradeHandler<U> = Box<dyn Fn(HttpResponse, &mut HttpRequest<'_>, &UpgradeContext<U>)>;
pub type OpenHandler<U> = Box<dyn Fn(&WebSocket<U>)>;
pub type MessageHandler<U> = Box<dyn Fn(&WebSocket<U>, &[u8], OpCode)>;
pub type PayloadHandler<U> = Box<dyn Fn(&WebSocket<U>, &[u8])>;
pub type CloseHandler<U> = Box<dyn Fn(&WebSocket<U>, u16, &[u8])>;
pub type SubscriptionHandler<U> = Box<dyn Fn(&WebSocket<U>, &str, usize, usize)>;

/// Settings and handlers of one websocket route.
///
/// `U` is the per connection user data handed to `upgrade`.
pub struct WebSocketBehavior<U> {
    pub(crate) settings: WsSettings,
    pub(crate) upgrade: Option<UpgradeHandler<U>>,
    pub(crate) open: Option<OpenHandler<U>>,
    pub(crate) message: Option<MessageHandler<U>>,
    pub(crate) dropped: Option<MessageHandler<U>>,
    pub(crate) drain: Option<OpenHandler<U>>,
    pub(crate) ping: Option<PayloadHandler<U>>,
    pub(crate) pong: Option<PayloadHandler<U>>,
    pub(crate) close: Option<CloseHandler<U>>,
    pub(crate) subscription: Option<SubscriptionHandler<U>>,
}

impl<U> fmt::Debug for WebSocketBehavior<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketBehavior")
            .field("settings", &self.settings)
            .field("upgrade", &self.upgrade.is_some())
            .field("message", &self.message.is_some())
            .finish_non_exhaustive()
    }
}

impl<U> Default for WebSocketBehavior<U> {
    fn default() -> Self {
        Self {
            settings: WsSettings::default(),
            upgrade: None,
            open: None,
            message: None,
            dropped: None,
            drain: None,
            ping: None,
            pong: None,
            close: None,
            subscription: None,
        }
    }
}

impl<U> WebSocketBehavior<U> {
    pub fn builder() -> WebSocketBehaviorBuilder<U> {
        WebSocketBehaviorBuilder { behavior: WebSocketBehavior::default() }
    }

    pub fn settings(&self) -> &WsSettings {
        &self.settings
    }

    pub fn has_upgrade_handler(&self) -> bool {
        self.upgrade.is_some()
    }
}

pub struct WebSocketBehaviorBuilder<U> {
    behavior: WebSocketBehavior<U>,
}

impl<U> fmt::Debug for WebSocketBehaviorBuilder<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketBehaviorBuilder").field("behavior", &self.behavior).finish()
    }
}

impl<U> WebSocketBehaviorBuilder<U> {
    pub fn compression(mut self, compression: CompressOptions) -> Self {
        self.behavior.settings.compression = compression;
        self
    }

    pub fn max_payload_length(mut self, max_payload_length: usize) -> Self {
        self.behavior.settings.max_payload_length = max_payload_length;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.behavior.settings.idle_timeout = idle_timeout;
        self
    }

    pub fn max_backpressure(mut self, max_backpressure: usize) -> Self {
        self.behavior.settings.max_backpressure = max_backpressure;
        self
    }

    pub fn backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.behavior.settings.backpressure_policy = policy;
        self
    }

    /// shorthand for [`BackpressurePolicy::Close`]
    pub fn close_on_backpressure_limit(self, close: bool) -> Self {
        let policy = if close { BackpressurePolicy::Close } else { BackpressurePolicy::DropNewest };
        self.backpressure_policy(policy)
    }

    pub fn reset_idle_timeout_on_send(mut self, reset: bool) -> Self {
        self.behavior.settings.reset_idle_timeout_on_send = reset;
        self
    }

    pub fn send_pings_automatically(mut self, send_pings: bool) -> Self {
        self.behavior.settings.send_pings_automatically = send_pings;
        self
    }

    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.behavior.settings.max_lifetime = max_lifetime;
        self
    }

    pub fn upgrade<F>(mut self, f: F) -> Self
    where
        F: Fn(HttpResponse, &mut HttpRequest<'_>, &UpgradeContext<U>) + 'static,
    {
        self.behavior.upgrade = Some(Box::new(f));
        self
    }

    pub fn open<F: Fn(&WebSocket<U>) + 'static>(mut self, f: F) -> Self {
        self.behavior.open = Some(Box::new(f));
        self
    }

    pub fn message<F: Fn(&WebSocket<U>, &[u8], OpCode) + 'static>(mut self, f: F) -> Self {
        self.behavior.message = Some(Box::new(f));
        self
    }

    /// called with every message refused by the backpressure policy
    pub fn dropped<F: Fn(&WebSocket<U>, &[u8], OpCode) + 'static>(mut self, f: F) -> Self {
        self.behavior.dropped = Some(Box::new(f));
        self
    }

    pub fn drain<F: Fn(&WebSocket<U>) + 'static>(mut self, f: F) -> Self {
        self.behavior.drain = Some(Box::new(f));
        self
    }

    pub fn ping<F: Fn(&WebSocket<U>, &[u8]) + 'static>(mut self, f: F) -> Self {
        self.behavior.ping = Some(Box::new(f));
        self
    }

    pub fn pong<F: Fn(&WebSocket<U>, &[u8]) + 'static>(mut self, f: F) -> Self {
        self.behavior.pong = Some(Box::new(f));
        self
    }

    pub fn close<F: Fn(&WebSocket<U>, u16, &[u8]) + 'static>(mut self, f: F) -> Self {
        self.behavior.close = Some(Box::new(f));
        self
    }

    /// `(topic, new_count, old_count)` on every membership change of this connection
    pub fn subscription<F: Fn(&WebSocket<U>, &str, usize, usize) + 'static>(mut self, f: F) -> Self {
        self.behavior.subscription = Some(Box::new(f));
        self
    }

    pub fn build(self) -> WebSocketBehavior<U> {
        self.behavior
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_settings() {
        let behavior = WebSocketBehavior::<()>::builder()
            .compression(CompressOptions::SHARED_COMPRESSOR)
            .idle_timeout(Duration::from_secs(8))
            .max_backpressure(1024)
            .close_on_backpressure_limit(true)
            .message(|_, _, _| {})
            .build();

        assert_eq!(behavior.settings().idle_timeout, Duration::from_secs(8));
        assert_eq!(behavior.settings().max_backpressure, 1024);
        assert_eq!(behavior.settings().backpressure_policy, BackpressurePolicy::Close);
        assert!(behavior.message.is_some());
        assert!(!behavior.has_upgrade_handler());
        assert!(behavior.settings().send_pings_automatically);
    }
}
