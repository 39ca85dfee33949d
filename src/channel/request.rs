use std::sync::Arc;

use async_trait::async_trait;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::Result;

/// What a request handler did with a `CHANNEL_REQUEST` (or a handler in
/// the global chain with a `GLOBAL_REQUEST`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestResult {
    /// The handler recognized the request and already sent whatever reply
    /// was needed; the dispatcher stays out of it.
    Replied,
    /// The handler recognized the request and succeeded; the dispatcher
    /// sends `CHANNEL_SUCCESS` / `REQUEST_SUCCESS` when a reply was asked
    /// for.
    ReplySuccess,
    /// The handler recognized the request but it failed; the dispatcher
    /// sends `CHANNEL_FAILURE` / `REQUEST_FAILURE` when a reply was asked
    /// for.
    ReplyFailure,
    /// Not this handler's request; the dispatcher keeps walking the
    /// chain.
    Unsupported,
}

/// One link in a channel's ordered request-handler chain.
///
/// The dispatcher walks the chain in registration order and stops at the
/// first handler that does not return [`RequestResult::Unsupported`].
#[async_trait]
pub trait ChannelRequestHandler: Send {
    /// Handle `name` for `channel`. `buf` is positioned at the first byte
    /// of the request-specific payload.
    async fn process(
        &mut self,
        channel: &Arc<Channel>,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult>;
}

/// Stores `env` name/value pairs sent before a shell or subsystem starts.
///
/// Accepting the variables is all most embedders need; anything that
/// actually spawns a process can read them back out of the channel later.
#[derive(Debug, Default)]
pub struct EnvCollector {
    vars: Vec<(String, String)>,
}

impl EnvCollector {
    /// The variables collected so far, in arrival order.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

#[async_trait]
impl ChannelRequestHandler for EnvCollector {
    async fn process(
        &mut self,
        _channel: &Arc<Channel>,
        name: &str,
        _want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult> {
        if name != "env" {
            return Ok(RequestResult::Unsupported);
        }
        let name = buf.get_str()?;
        let value = buf.get_str()?;
        self.vars.push((name, value));
        Ok(RequestResult::ReplySuccess)
    }
}
