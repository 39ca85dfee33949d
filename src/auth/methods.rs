//! Built-in authentication methods: `none`, `password`, `publickey` and
//! `keyboard-interactive`. The cryptographic work behind `publickey` is
//! delegated to an opaque verifying capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{AuthContext, AuthMethod, AuthMethodFactory, MethodProgress};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::msg;

/// Validates a username/password pair.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    /// Whether `password` is valid for `username`.
    async fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Decides which keys may log a user in.
#[async_trait]
pub trait PublickeyAuthenticator: Send + Sync {
    /// Whether `key_blob` (of algorithm `algorithm`) is authorized for
    /// `username`.
    async fn is_authorized(&self, username: &str, algorithm: &str, key_blob: &[u8]) -> bool;
}

/// Opaque signature-verification capability; the actual cryptography
/// lives with the transport's key code.
pub trait SignatureVerifier: Send + Sync {
    /// Whether `signature` is a valid signature by `key_blob` over the
    /// session's authentication digest for `username`.
    fn verify(&self, username: &str, algorithm: &str, key_blob: &[u8], signature: &[u8]) -> bool;
}

/// One round of keyboard-interactive prompts.
#[derive(Debug, Clone)]
pub struct InteractiveChallenge {
    /// Challenge title.
    pub name: String,
    /// Instruction text shown before the prompts.
    pub instruction: String,
    /// Prompt text and whether the answer should be echoed.
    pub prompts: Vec<(String, bool)>,
}

/// Produces and validates keyboard-interactive challenges.
#[async_trait]
pub trait InteractiveAuthenticator: Send + Sync {
    /// The challenge to present to `username`.
    async fn challenge(&self, username: &str) -> InteractiveChallenge;

    /// Whether the peer's `responses` answer the challenge.
    async fn verify(&self, username: &str, responses: &[String]) -> bool;
}

/// The `none` method. Rejects by default; it exists so clients can
/// probe which methods the server will accept.
#[derive(Debug, Default)]
pub struct NoneFactory {
    /// Accept the request outright (an open server).
    pub allow: bool,
}

impl AuthMethodFactory for NoneFactory {
    fn name(&self) -> &str {
        "none"
    }

    fn create(&self) -> Box<dyn AuthMethod> {
        Box::new(NoneMethod { allow: self.allow })
    }
}

struct NoneMethod {
    allow: bool,
}

#[async_trait]
impl AuthMethod for NoneMethod {
    async fn auth(&mut self, _ctx: &AuthContext<'_>, _buf: &mut Buffer) -> Result<MethodProgress> {
        Ok(Some(self.allow))
    }

    async fn next(&mut self, _ctx: &AuthContext<'_>, _buf: &mut Buffer) -> Result<MethodProgress> {
        Err(Error::Auth("none has no follow-up messages".into()))
    }
}

/// The `password` method (RFC 4252 §8).
pub struct PasswordFactory {
    authenticator: Arc<dyn PasswordAuthenticator>,
}

impl std::fmt::Debug for PasswordFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordFactory")
    }
}

impl PasswordFactory {
    /// A factory validating against `authenticator`.
    pub fn new(authenticator: Arc<dyn PasswordAuthenticator>) -> Self {
        PasswordFactory { authenticator }
    }
}

impl AuthMethodFactory for PasswordFactory {
    fn name(&self) -> &str {
        "password"
    }

    fn create(&self) -> Box<dyn AuthMethod> {
        Box::new(PasswordMethod {
            authenticator: Arc::clone(&self.authenticator),
        })
    }
}

struct PasswordMethod {
    authenticator: Arc<dyn PasswordAuthenticator>,
}

#[async_trait]
impl AuthMethod for PasswordMethod {
    async fn auth(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress> {
        let change_request = buf.get_bool()?;
        if change_request {
            // Password changing is not offered.
            return Ok(Some(false));
        }
        let password = buf.get_str()?;
        Ok(Some(
            self.authenticator.authenticate(ctx.username, &password).await,
        ))
    }

    async fn next(&mut self, _ctx: &AuthContext<'_>, _buf: &mut Buffer) -> Result<MethodProgress> {
        Err(Error::Auth("password has no follow-up messages".into()))
    }
}

/// The `publickey` method (RFC 4252 §7), including the signatureless
/// probe answered with `PK_OK`.
pub struct PublickeyFactory {
    authenticator: Arc<dyn PublickeyAuthenticator>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl std::fmt::Debug for PublickeyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PublickeyFactory")
    }
}

impl PublickeyFactory {
    /// A factory checking authorization with `authenticator` and
    /// signatures with `verifier`.
    pub fn new(
        authenticator: Arc<dyn PublickeyAuthenticator>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        PublickeyFactory {
            authenticator,
            verifier,
        }
    }
}

impl AuthMethodFactory for PublickeyFactory {
    fn name(&self) -> &str {
        "publickey"
    }

    fn create(&self) -> Box<dyn AuthMethod> {
        Box::new(PublickeyMethod {
            authenticator: Arc::clone(&self.authenticator),
            verifier: Arc::clone(&self.verifier),
        })
    }
}

struct PublickeyMethod {
    authenticator: Arc<dyn PublickeyAuthenticator>,
    verifier: Arc<dyn SignatureVerifier>,
}

#[async_trait]
impl AuthMethod for PublickeyMethod {
    async fn auth(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress> {
        let has_signature = buf.get_bool()?;
        let algorithm = buf.get_str()?;
        let key_blob = buf.get_string()?;

        if !self
            .authenticator
            .is_authorized(ctx.username, &algorithm, &key_blob)
            .await
        {
            return Ok(Some(false));
        }
        if !has_signature {
            // Tell the client this key would be acceptable; it will try
            // again with a signature.
            let mut reply = Buffer::for_packet(msg::USERAUTH_PK_OK);
            reply.put_str(&algorithm);
            reply.put_public_key(&key_blob);
            ctx.send(reply)?;
            return Ok(None);
        }
        let signature = buf.get_string()?;
        Ok(Some(self.verifier.verify(
            ctx.username,
            &algorithm,
            &key_blob,
            &signature,
        )))
    }

    async fn next(&mut self, _ctx: &AuthContext<'_>, _buf: &mut Buffer) -> Result<MethodProgress> {
        // The signed retry arrives as a fresh USERAUTH_REQUEST, never as
        // a method-specific message.
        Err(Error::Auth("unexpected publickey follow-up".into()))
    }
}

/// The `keyboard-interactive` method (RFC 4256).
pub struct KbdInteractiveFactory {
    authenticator: Arc<dyn InteractiveAuthenticator>,
}

impl std::fmt::Debug for KbdInteractiveFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KbdInteractiveFactory")
    }
}

impl KbdInteractiveFactory {
    /// A factory challenging through `authenticator`.
    pub fn new(authenticator: Arc<dyn InteractiveAuthenticator>) -> Self {
        KbdInteractiveFactory { authenticator }
    }
}

impl AuthMethodFactory for KbdInteractiveFactory {
    fn name(&self) -> &str {
        "keyboard-interactive"
    }

    fn create(&self) -> Box<dyn AuthMethod> {
        Box::new(KbdInteractiveMethod {
            authenticator: Arc::clone(&self.authenticator),
            prompts: 0,
        })
    }
}

struct KbdInteractiveMethod {
    authenticator: Arc<dyn InteractiveAuthenticator>,
    prompts: usize,
}

#[async_trait]
impl AuthMethod for KbdInteractiveMethod {
    async fn auth(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress> {
        let _language = buf.get_str()?;
        let _submethods = buf.get_str()?;

        let challenge = self.authenticator.challenge(ctx.username).await;
        self.prompts = challenge.prompts.len();

        let mut request = Buffer::for_packet(msg::USERAUTH_INFO_REQUEST);
        request.put_str(&challenge.name);
        request.put_str(&challenge.instruction);
        request.put_str("en");
        request.put_u32(challenge.prompts.len() as u32);
        for (prompt, echo) in &challenge.prompts {
            request.put_str(prompt);
            request.put_bool(*echo);
        }
        ctx.send(request)?;
        Ok(None)
    }

    async fn next(&mut self, ctx: &AuthContext<'_>, buf: &mut Buffer) -> Result<MethodProgress> {
        let cmd = buf.get_u8()?;
        if cmd != msg::USERAUTH_INFO_RESPONSE {
            return Err(Error::Auth(format!(
                "expected INFO_RESPONSE, got message {}",
                cmd
            )));
        }
        let count = buf.get_u32()? as usize;
        if count != self.prompts {
            return Ok(Some(false));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(buf.get_str()?);
        }
        Ok(Some(
            self.authenticator.verify(ctx.username, &responses).await,
        ))
    }
}
