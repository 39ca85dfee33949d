//! Authentication-agent forwarding: a per-session unix listener whose
//! accepted connections are relayed to the peer over
//! `auth-agent@openssh.com` channels.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelRequestHandler, RequestResult};
use crate::connection::ConnectionService;
use crate::error::{Error, Result};
use crate::forward::spawn_stream_pump;
use crate::future::Completion;

struct AgentListener {
    // Removes the socket directory on drop.
    _dir: TempDir,
    path: PathBuf,
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Session-scoped agent relay. Started on demand, closed after the
/// tcpip forwarder and before the session's channels.
pub struct AgentForward {
    service: Weak<ConnectionService>,
    listener: Mutex<Option<AgentListener>>,
}

impl std::fmt::Debug for AgentForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentForward")
            .field("active", &self.listener.lock().is_some())
            .finish()
    }
}

impl AgentForward {
    pub(crate) fn new(service: Weak<ConnectionService>) -> Self {
        AgentForward {
            service,
            listener: Mutex::new(None),
        }
    }

    /// Path of the forwarded agent socket, while forwarding is active.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.listener.lock().as_ref().map(|l| l.path.clone())
    }

    /// Bind the agent socket and start relaying connections. Returns the
    /// socket path to expose as `SSH_AUTH_SOCK`.
    pub async fn start(&self) -> Result<PathBuf> {
        if let Some(path) = self.socket_path() {
            return Ok(path);
        }
        let dir = TempDir::new()?;
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path)?;
        debug!("agent forwarding socket at {}", path.display());

        let token = CancellationToken::new();
        let accept_token = token.clone();
        let service = self.service.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => relay_agent_connection(&service, stream),
                        Err(e) => {
                            warn!("agent socket accept failed: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        let mut slot = self.listener.lock();
        if slot.is_some() {
            // Lost a start race; keep the first listener.
            token.cancel();
            return slot
                .as_ref()
                .map(|l| l.path.clone())
                .ok_or(Error::Disconnected);
        }
        *slot = Some(AgentListener {
            _dir: dir,
            path: path.clone(),
            token,
            task,
        });
        Ok(path)
    }

    /// Stop relaying and remove the socket.
    pub async fn close(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.token.cancel();
            let _ = listener.task.await;
        }
    }
}

/// Channel request handler accepting `auth-agent-req@openssh.com` on
/// session channels by starting the session's agent relay.
#[derive(Debug)]
pub struct AgentForwardRequestHandler {
    service: Weak<ConnectionService>,
}

impl AgentForwardRequestHandler {
    /// Handler starting `service`'s agent relay on request.
    pub fn new(service: &Arc<ConnectionService>) -> Self {
        AgentForwardRequestHandler {
            service: Arc::downgrade(service),
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for AgentForwardRequestHandler {
    async fn process(
        &mut self,
        _channel: &Arc<Channel>,
        name: &str,
        _want_reply: bool,
        _buf: &mut Buffer,
    ) -> Result<RequestResult> {
        if name != "auth-agent-req@openssh.com" {
            return Ok(RequestResult::Unsupported);
        }
        match self.service.upgrade() {
            Some(service) => match service.agent_forward().start().await {
                Ok(path) => {
                    debug!("agent forwarding enabled at {}", path.display());
                    Ok(RequestResult::ReplySuccess)
                }
                Err(e) => {
                    warn!("agent forwarding failed to start: {}", e);
                    Ok(RequestResult::ReplyFailure)
                }
            },
            None => Ok(RequestResult::ReplyFailure),
        }
    }
}

fn relay_agent_connection(service: &Weak<ConnectionService>, stream: tokio::net::UnixStream) {
    let service = match service.upgrade() {
        Some(service) => service,
        None => return,
    };
    let channel = match service.open_channel("auth-agent@openssh.com") {
        Ok(channel) => channel,
        Err(e) => {
            warn!("could not open agent channel: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        match channel.open_result().wait().await {
            Completion::Value(Ok(())) => spawn_stream_pump(channel, stream),
            outcome => debug!("agent channel refused: {:?}", outcome),
        }
    });
}
