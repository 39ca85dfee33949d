//! Bookkeeping for `x11-req` channel requests: display allocation and
//! the authentication cookie registry. Talking to an actual X server is
//! left to the embedder.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelRequestHandler, RequestResult};
use crate::error::Result;

/// Parameters of one accepted `x11-req` (RFC 4254 §6.3.1).
#[derive(Debug, Clone)]
pub struct X11Request {
    /// Only a single connection should be forwarded.
    pub single_connection: bool,
    /// X11 authentication protocol name.
    pub auth_protocol: String,
    /// Hex-encoded authentication cookie.
    pub auth_cookie: String,
    /// Requested screen number.
    pub screen: u32,
}

const FIRST_DISPLAY: u32 = 10;

/// Display-number registry for a session's X11 forwarding.
#[derive(Debug, Default)]
pub struct X11Forward {
    displays: Mutex<HashMap<u32, X11Request>>,
}

impl X11Forward {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an accepted request and allocate a display number.
    pub fn register(&self, request: X11Request) -> u32 {
        let mut displays = self.displays.lock();
        let mut display = FIRST_DISPLAY;
        while displays.contains_key(&display) {
            display += 1;
        }
        displays.insert(display, request);
        display
    }

    /// The request registered for `display`, if any.
    pub fn lookup(&self, display: u32) -> Option<X11Request> {
        self.displays.lock().get(&display).cloned()
    }

    /// Number of active display registrations.
    pub fn active(&self) -> usize {
        self.displays.lock().len()
    }

    /// Drop all registrations during session teardown.
    pub fn close(&self) {
        self.displays.lock().clear();
    }
}

/// Channel request handler accepting `x11-req` on session channels and
/// registering the parameters with the session's [`X11Forward`].
#[derive(Debug)]
pub struct X11RequestHandler {
    forward: std::sync::Weak<crate::connection::ConnectionService>,
}

impl X11RequestHandler {
    /// Handler registering against `service`'s X11 registry.
    pub fn new(service: &Arc<crate::connection::ConnectionService>) -> Self {
        X11RequestHandler {
            forward: Arc::downgrade(service),
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for X11RequestHandler {
    async fn process(
        &mut self,
        _channel: &Arc<Channel>,
        name: &str,
        _want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult> {
        if name != "x11-req" {
            return Ok(RequestResult::Unsupported);
        }
        let single_connection = buf.get_bool()?;
        let auth_protocol = buf.get_str()?;
        let auth_cookie = buf.get_str()?;
        let screen = buf.get_u32()?;
        match self.forward.upgrade() {
            Some(service) => {
                service.x11_forward().register(X11Request {
                    single_connection,
                    auth_protocol,
                    auth_cookie,
                    screen,
                });
                Ok(RequestResult::ReplySuccess)
            }
            None => Ok(RequestResult::ReplyFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_are_allocated_sequentially() {
        let fwd = X11Forward::new();
        let req = X11Request {
            single_connection: false,
            auth_protocol: "MIT-MAGIC-COOKIE-1".into(),
            auth_cookie: "c0ffee".into(),
            screen: 0,
        };
        assert_eq!(fwd.register(req.clone()), 10);
        assert_eq!(fwd.register(req.clone()), 11);
        assert_eq!(fwd.active(), 2);
        assert_eq!(fwd.lookup(11).unwrap().auth_cookie, "c0ffee");
        fwd.close();
        assert_eq!(fwd.active(), 0);
    }
}
