//! The HTTP side of a websocket upgrade.

use std::fmt;
use std::rc::Rc;

use crate::protocol::HttpRequest;
use crate::response::HttpResponse;
use crate::websocket::behavior::{WebSocketBehavior, WsSettings};

/// length of a base64 encoded 16 byte nonce
const KEY_LEN: usize = 24;

/// The `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    tungstenite::handshake::derive_accept_key(key.as_bytes())
}

/// Hands an upgrade request to a websocket route's behavior.
///
/// Passed to the behavior's `upgrade` handler, which completes the handshake
/// with [`HttpResponse::upgrade`].
pub struct UpgradeContext<U> {
    behavior: Rc<WebSocketBehavior<U>>,
}

impl<U> Clone for UpgradeContext<U> {
    fn clone(&self) -> Self {
        Self { behavior: Rc::clone(&self.behavior) }
    }
}

impl<U> fmt::Debug for UpgradeContext<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeContext").field("behavior", &self.behavior).finish()
    }
}

impl<U> UpgradeContext<U> {
    pub fn new(behavior: WebSocketBehavior<U>) -> Self {
        Self { behavior: Rc::new(behavior) }
    }

    pub fn settings(&self) -> &WsSettings {
        self.behavior.settings()
    }

    pub(crate) fn behavior(&self) -> &Rc<WebSocketBehavior<U>> {
        &self.behavior
    }
}

impl<U: Default + 'static> UpgradeContext<U> {
    /// Answers an upgrade request: through the behavior's `upgrade` handler
    /// if it has one, otherwise by upgrading with `U::default()`.
    ///
    /// Requests without a well formed `sec-websocket-key` are yielded back to
    /// the router.
    pub fn handle(&self, res: HttpResponse, req: &mut HttpRequest<'_>) {
        let key = req.header("sec-websocket-key").map(str::trim).unwrap_or_default();
        if key.len() != KEY_LEN {
            req.set_yield(true);
            return;
        }

        if let Some(upgrade) = &self.behavior.upgrade {
            upgrade(res, req, self);
            return;
        }

        let key = key.to_string();
        let protocol = req.header("sec-websocket-protocol").unwrap_or_default().to_string();
        let extensions = req.header("sec-websocket-extensions").unwrap_or_default().to_string();
        if let Err(e) = res.upgrade(U::default(), &key, &protocol, &extensions, self) {
            tracing::warn!(cause = %e, "websocket upgrade failed");
        }
    }
}
