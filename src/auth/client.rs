//! Client-side driver for the `ssh-userauth` service: issues
//! `USERAUTH_REQUEST`s and tracks the server's verdicts.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::future::Awaitable;
use crate::msg;
use crate::transport::Transport;

/// Terminal result of a client authentication exchange.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AuthOutcome {
    /// `USERAUTH_SUCCESS` arrived; the requested service is running.
    Success,
    /// The server rejected every attempted method.
    Failure {
        /// Methods the server would still accept.
        remaining: Vec<String>,
    },
}

/// Client side of the `ssh-userauth` service for one session.
///
/// One request is outstanding at a time; the caller inspects
/// [`last_failure`](Self::last_failure) to pick the next method, and
/// [`outcome`](Self::outcome) completes when the server sends its final
/// verdict.
pub struct ClientAuthService {
    transport: Arc<dyn Transport>,
    username: String,
    service: String,
    outcome: Awaitable<AuthOutcome>,
    last_failure: Mutex<Option<(Vec<String>, bool)>>,
    banners: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ClientAuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthService")
            .field("username", &self.username)
            .field("service", &self.service)
            .finish()
    }
}

impl ClientAuthService {
    /// A driver authenticating `username` for `service` (normally
    /// `"ssh-connection"`).
    pub fn new(transport: Arc<dyn Transport>, username: &str, service: &str) -> Self {
        ClientAuthService {
            transport,
            username: username.to_owned(),
            service: service.to_owned(),
            outcome: Awaitable::new(),
            last_failure: Mutex::new(None),
            banners: Mutex::new(Vec::new()),
        }
    }

    /// Completes with the final verdict.
    pub fn outcome(&self) -> &Awaitable<AuthOutcome> {
        &self.outcome
    }

    /// Banner lines the server sent so far.
    pub fn banners(&self) -> Vec<String> {
        self.banners.lock().clone()
    }

    /// The most recent `USERAUTH_FAILURE`: the methods that can still
    /// continue and whether it was a partial success.
    pub fn last_failure(&self) -> Option<(Vec<String>, bool)> {
        self.last_failure.lock().clone()
    }

    fn request<F>(&self, method: &str, body: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer),
    {
        let mut buf = Buffer::for_packet(msg::USERAUTH_REQUEST);
        buf.put_str(&self.username);
        buf.put_str(&self.service);
        buf.put_str(method);
        body(&mut buf);
        self.transport.write_packet(buf)
    }

    /// Probe with the `none` method to learn the server's method list.
    pub fn request_none(&self) -> Result<()> {
        self.request("none", |_| {})
    }

    /// Attempt password authentication.
    pub fn request_password(&self, password: &str) -> Result<()> {
        self.request("password", |buf| {
            buf.put_bool(false);
            buf.put_str(password);
        })
    }

    /// Attempt publickey authentication. Without `signature` this is the
    /// probe the server answers with `PK_OK`.
    pub fn request_publickey(
        &self,
        algorithm: &str,
        key_blob: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<()> {
        self.request("publickey", |buf| {
            buf.put_bool(signature.is_some());
            buf.put_str(algorithm);
            buf.put_public_key(key_blob);
            if let Some(signature) = signature {
                buf.put_string(signature);
            }
        })
    }

    /// Dispatch one `ssh-userauth` message from the server.
    pub fn process(&self, cmd: u8, buf: &mut Buffer) -> Result<()> {
        match cmd {
            msg::USERAUTH_SUCCESS => {
                debug!("authentication succeeded for {:?}", self.username);
                self.outcome.set(AuthOutcome::Success);
                Ok(())
            }
            msg::USERAUTH_FAILURE => {
                let remaining = buf.get_name_list()?;
                let partial = buf.get_bool()?;
                debug!(
                    "authentication continues: methods={:?} partial={}",
                    remaining, partial
                );
                *self.last_failure.lock() = Some((remaining, partial));
                Ok(())
            }
            msg::USERAUTH_BANNER => {
                let text = buf.get_str()?;
                let _language = buf.get_str()?;
                self.banners.lock().push(text);
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected message {} during client authentication",
                other
            ))),
        }
    }

    /// Give up: complete the outcome with the latest failure.
    pub fn abandon(&self) {
        let remaining = self
            .last_failure
            .lock()
            .as_ref()
            .map(|(methods, _)| methods.clone())
            .unwrap_or_default();
        self.outcome.set(AuthOutcome::Failure { remaining });
    }
}
