//! User authentication (RFC 4252): the server-side method-chain state
//! machine and a client-side driver.
//!
//! The configured methods form a disjunction of chains: each chain is a
//! sequence that must succeed in full, and completing any one chain
//! authenticates the session. `"publickey,password password"` therefore
//! reads "publickey then password, or password alone".

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::future::Awaitable;
use crate::msg;
use crate::transport::Transport;

mod client;
pub use client::{AuthOutcome, ClientAuthService};

mod methods;
pub use methods::{
    InteractiveAuthenticator, InteractiveChallenge, KbdInteractiveFactory, NoneFactory,
    PasswordAuthenticator, PasswordFactory, PublickeyAuthenticator, PublickeyFactory,
    SignatureVerifier,
};

/// What a method did with the message it was handed: still in progress,
/// accepted, or rejected.
pub type MethodProgress = Option<bool>;

/// Context handed to a method while it runs.
pub struct AuthContext<'a> {
    /// The username the peer is claiming.
    pub username: &'a str,
    /// The service to start after authentication.
    pub service: &'a str,
    transport: &'a Arc<dyn Transport>,
}

impl std::fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("username", &self.username)
            .field("service", &self.service)
            .finish()
    }
}

impl AuthContext<'_> {
    /// Send a method-specific message (`PK_OK`, `INFO_REQUEST`, ...).
    pub fn send(&self, buf: Buffer) -> Result<()> {
        self.transport.write_packet(buf)
    }
}

/// One in-flight authentication method.
#[async_trait]
pub trait AuthMethod: Send {
    /// Handle the `USERAUTH_REQUEST` that named this method. `buf` is
    /// positioned at the method-specific fields.
    async fn auth(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress>;

    /// Handle a follow-up method-specific message. `buf` is rewound so
    /// the message-type byte is visible to the method.
    async fn next(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress>;
}

/// Creates fresh [`AuthMethod`] state per `USERAUTH_REQUEST`.
pub trait AuthMethodFactory: Send + Sync {
    /// The method name as it appears on the wire (lower case).
    fn name(&self) -> &str;

    /// A fresh method state.
    fn create(&self) -> Box<dyn AuthMethod>;
}

/// Per-user session accounting used to cap concurrent sessions.
pub trait SessionLimiter: Send + Sync {
    /// How many sessions `user` currently has open.
    fn active_sessions(&self, user: &str) -> usize;
}

/// Server-side authentication configuration.
pub struct ServerAuthConfig {
    /// The OR-of-AND method chains.
    pub chains: Vec<Vec<String>>,
    /// Available method implementations, looked up case-insensitively.
    pub factories: Vec<Arc<dyn AuthMethodFactory>>,
    /// Disconnect after this many `USERAUTH_REQUEST`s.
    pub max_attempts: u32,
    /// Welcome text sent as `USERAUTH_BANNER` just before success.
    pub banner: Option<String>,
    /// Optional concurrent-session cap per user.
    pub max_sessions_per_user: Option<usize>,
    /// Session accounting for the cap.
    pub session_limiter: Option<Arc<dyn SessionLimiter>>,
}

impl std::fmt::Debug for ServerAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAuthConfig")
            .field("chains", &self.chains)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl ServerAuthConfig {
    /// Configuration accepting `methods` in OpenSSH
    /// `AuthenticationMethods` syntax: whitespace separates alternative
    /// chains, commas sequence the methods of one chain.
    pub fn new(methods: &str, factories: Vec<Arc<dyn AuthMethodFactory>>) -> Result<Self> {
        let chains = parse_method_chains(methods)?;
        Ok(ServerAuthConfig {
            chains,
            factories,
            max_attempts: 20,
            banner: None,
            max_sessions_per_user: None,
            session_limiter: None,
        })
    }
}

/// Parse OpenSSH `AuthenticationMethods` syntax into chains.
pub fn parse_method_chains(methods: &str) -> Result<Vec<Vec<String>>> {
    let mut chains = Vec::new();
    for chain in methods.split_whitespace() {
        let members: Vec<String> = chain
            .split(',')
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        if members.is_empty() {
            return Err(Error::Config(format!("empty method chain in {:?}", methods)));
        }
        chains.push(members);
    }
    if chains.is_empty() {
        return Err(Error::Config("no authentication methods configured".into()));
    }
    Ok(chains)
}

/// Server side of the `ssh-userauth` service for one session.
///
/// The `(username, service)` pair is pinned by the first request; the
/// attempt counter and the method chains advance with every request.
/// Once a chain empties the session is authenticated and no further
/// `USERAUTH_REQUEST` is accepted.
pub struct ServerAuthService {
    transport: Arc<dyn Transport>,
    config: ServerAuthConfig,
    identity: Option<(String, String)>,
    chains: Vec<Vec<String>>,
    current: Option<(String, Box<dyn AuthMethod>)>,
    attempts: u32,
    authenticated: bool,
    outcome: Awaitable<String>,
}

impl std::fmt::Debug for ServerAuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAuthService")
            .field("identity", &self.identity)
            .field("attempts", &self.attempts)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl ServerAuthService {
    /// A fresh state machine for one session.
    pub fn new(transport: Arc<dyn Transport>, config: ServerAuthConfig) -> Self {
        let chains = config.chains.clone();
        ServerAuthService {
            transport,
            config,
            identity: None,
            chains,
            current: None,
            attempts: 0,
            authenticated: false,
            outcome: Awaitable::new(),
        }
    }

    /// Completed with the username once authentication succeeds; the
    /// session driver starts the requested service from its listener.
    pub fn auth_result(&self) -> &Awaitable<String> {
        &self.outcome
    }

    /// Whether a chain has been completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Dispatch one `ssh-userauth` message. Must be invoked serially per
    /// session. Errors are fatal: the session driver disconnects with
    /// `PROTOCOL_ERROR`.
    pub async fn process(&mut self, cmd: u8, buf: &mut Buffer) -> Result<()> {
        match cmd {
            msg::USERAUTH_REQUEST => self.handle_request(buf).await,
            _ if self.current.is_some() => {
                // Method-specific message: rewind one byte so the method
                // sees the message-type byte itself.
                buf.set_rpos(buf.rpos().saturating_sub(1));
                let (method_name, mut method) = self.current.take().ok_or(Error::Disconnected)?;
                let (username, service) = self
                    .identity
                    .clone()
                    .ok_or_else(|| Error::Auth("method message before any request".into()))?;
                let ctx = AuthContext {
                    username: &username,
                    service: &service,
                    transport: &self.transport,
                };
                let progress = match method.next(&ctx, buf).await {
                    Ok(progress) => progress,
                    Err(e) => {
                        warn!("auth method failed: {}", e);
                        Some(false)
                    }
                };
                if progress.is_none() {
                    self.current = Some((method_name.clone(), method));
                }
                if progress == Some(true) {
                    self.consume_method(&method_name);
                }
                self.advance(progress, &username).await
            }
            other => Err(Error::Protocol(format!(
                "unexpected message {} during authentication",
                other
            ))),
        }
    }

    async fn handle_request(&mut self, buf: &mut Buffer) -> Result<()> {
        if self.authenticated {
            return Err(Error::Auth("request after successful authentication".into()));
        }
        self.attempts += 1;
        if self.attempts > self.config.max_attempts {
            return Err(Error::Auth(format!(
                "too many authentication attempts ({})",
                self.attempts
            )));
        }

        let username = buf.get_str()?;
        let service = buf.get_str()?;
        let method_name = buf.get_str()?.to_ascii_lowercase();
        debug!(
            "USERAUTH_REQUEST user={:?} service={:?} method={:?}",
            username, service, method_name
        );

        match &self.identity {
            None => self.identity = Some((username.clone(), service.clone())),
            Some((u, s)) if *u != username || *s != service => {
                return Err(Error::Auth(format!(
                    "identity changed mid-authentication: {:?}/{:?} -> {:?}/{:?}",
                    u, s, username, service
                )));
            }
            Some(_) => {}
        }

        // A method may only be attempted while it heads at least one
        // chain; `none` is always allowed through so clients can probe
        // the method list.
        let is_head = self
            .chains
            .iter()
            .any(|chain| chain.first().map(String::as_str) == Some(method_name.as_str()));
        if method_name != "none" && !is_head {
            debug!("method {:?} is not currently acceptable", method_name);
            self.current = None;
            return self.send_failure();
        }

        let factory = self
            .config
            .factories
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(&method_name))
            .cloned();
        let factory = match factory {
            Some(factory) => factory,
            None => {
                debug!("no factory for auth method {:?}", method_name);
                self.current = None;
                return self.send_failure();
            }
        };

        let mut method = factory.create();
        let ctx = AuthContext {
            username: &username,
            service: &service,
            transport: &self.transport,
        };
        let progress = match method.auth(&ctx, buf).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!("auth method {:?} failed: {}", method_name, e);
                Some(false)
            }
        };
        self.current = match progress {
            None => Some((method_name.clone(), method)),
            Some(_) => None,
        };
        if progress == Some(true) {
            self.consume_method(&method_name);
        }
        self.advance(progress, &username).await
    }

    /// An accepted method is consumed from the head of every chain it
    /// currently leads, exactly once per chain.
    fn consume_method(&mut self, method_name: &str) {
        for chain in &mut self.chains {
            if chain.first().map(String::as_str) == Some(method_name) {
                chain.remove(0);
            }
        }
    }

    async fn advance(&mut self, progress: MethodProgress, username: &str) -> Result<()> {
        match progress {
            None => Ok(()),
            Some(true) => {
                if self.chains.iter().any(|chain| chain.is_empty()) {
                    self.succeed(username)
                } else {
                    self.send_partial_success()
                }
            }
            Some(false) => self.send_failure(),
        }
    }

    fn succeed(&mut self, username: &str) -> Result<()> {
        if let (Some(max), Some(limiter)) = (
            self.config.max_sessions_per_user,
            self.config.session_limiter.as_ref(),
        ) {
            if limiter.active_sessions(username) >= max {
                return Err(Error::Auth(format!(
                    "too many concurrent sessions for {:?}",
                    username
                )));
            }
        }
        if let Some(banner) = &self.config.banner {
            let mut buf = Buffer::for_packet(msg::USERAUTH_BANNER);
            buf.put_str(banner);
            buf.put_str("en");
            self.transport.write_packet(buf)?;
        }
        self.transport
            .write_packet(Buffer::for_packet(msg::USERAUTH_SUCCESS))?;
        self.authenticated = true;
        self.current = None;
        self.outcome.set(username.to_owned());
        Ok(())
    }

    fn remaining_heads(&self, exclude_none: bool) -> Vec<String> {
        let mut heads = Vec::new();
        for chain in &self.chains {
            if let Some(head) = chain.first() {
                if exclude_none && head == "none" {
                    continue;
                }
                if !heads.contains(head) {
                    heads.push(head.clone());
                }
            }
        }
        heads
    }

    fn send_partial_success(&self) -> Result<()> {
        let mut buf = Buffer::for_packet(msg::USERAUTH_FAILURE);
        buf.put_name_list(&self.remaining_heads(false));
        buf.put_bool(true);
        self.transport.write_packet(buf)
    }

    fn send_failure(&self) -> Result<()> {
        let mut buf = Buffer::for_packet(msg::USERAUTH_FAILURE);
        buf.put_name_list(&self.remaining_heads(true));
        buf.put_bool(false);
        self.transport.write_packet(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_syntax() {
        let chains = parse_method_chains("publickey,password password").unwrap();
        assert_eq!(
            chains,
            vec![
                vec!["publickey".to_string(), "password".to_string()],
                vec!["password".to_string()],
            ]
        );

        let chains = parse_method_chains("Publickey").unwrap();
        assert_eq!(chains, vec![vec!["publickey".to_string()]]);

        assert!(parse_method_chains("").is_err());
        assert!(parse_method_chains(",,").is_err());
    }
}
