//! Per-session channel registry, global-request dispatch and
//! `SSH_MSG_CHANNEL_*` demultiplexer (RFC 4254).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::agent::AgentForward;
use crate::buffer::Buffer;
use crate::channel::{Channel, OpenRejection, RequestResult};
use crate::error::{Error, OpenFailureReason, Result};
use crate::forward::TcpipForwarder;
use crate::future::{Awaitable, Completion};
use crate::msg;
use crate::transport::Transport;
use crate::x11::X11Forward;

/// Tunables for a session's connection service.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial receive-window size advertised for new channels.
    pub window_size: u32,
    /// Maximum packet size advertised for new channels.
    pub packet_size: u32,
    /// Upper bound on concurrently registered channels.
    pub max_channels: usize,
    /// How long [`ConnectionService::close`] waits for each channel's
    /// close handshake.
    pub channel_close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            window_size: 2 * 1024 * 1024,
            packet_size: 32 * 1024,
            max_channels: 256,
            channel_close_timeout: Duration::from_secs(5),
        }
    }
}

/// Whether a factory finished wiring an inbound channel synchronously.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FactorySetup {
    /// The channel is ready; the service confirms the open immediately.
    Ready,
    /// The factory completes the channel's open future itself (for
    /// example after an outbound connect finishes).
    Deferred,
}

/// Creates and wires channels for one inbound `CHANNEL_OPEN` type.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// The channel type this factory accepts (`"session"`,
    /// `"direct-tcpip"`, ...).
    fn channel_type(&self) -> &str;

    /// Attach handlers and consumers to a freshly registered channel.
    /// `open_payload` is positioned at the type-specific fields of the
    /// `CHANNEL_OPEN` message.
    async fn setup(
        &self,
        channel: &Arc<Channel>,
        open_payload: &mut Buffer,
    ) -> std::result::Result<FactorySetup, OpenRejection>;
}

/// One link in the session's global-request chain.
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    /// Handle `name`; `buf` is positioned at the request-specific
    /// payload. Handlers that send their own reply (for example to carry
    /// a bound port) return [`RequestResult::Replied`].
    async fn process(
        &self,
        service: &ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult>;
}

/// Reply to a global request we sent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GlobalReply {
    /// `REQUEST_SUCCESS`, with any reply-specific payload.
    Success(Vec<u8>),
    /// `REQUEST_FAILURE`.
    Failure,
}

/// The connection layer of one authenticated session.
///
/// Owns the channel registry and the forwarding subordinates; dispatches
/// every `SSH_MSG_GLOBAL_*` / `SSH_MSG_CHANNEL_*` message handed to
/// [`process`](Self::process). Created on the transport's behalf once
/// user authentication completes; the transport drives it and must call
/// `process` serially.
pub struct ConnectionService {
    weak_self: Weak<ConnectionService>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,

    channels: RwLock<HashMap<u32, Arc<Channel>>>,
    next_channel_id: AtomicU32,
    allow_more_sessions: AtomicBool,
    closing: AtomicBool,

    factories: RwLock<Vec<Arc<dyn ChannelFactory>>>,
    global_handlers: RwLock<Vec<Arc<dyn GlobalRequestHandler>>>,
    pending_global: Mutex<VecDeque<Awaitable<GlobalReply>>>,

    forwarder: TcpipForwarder,
    agent: AgentForward,
    x11: X11Forward,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("channels", &self.channels.read().len())
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionService {
    /// A service bound to `transport` with the given tunables.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ConnectionService>| ConnectionService {
            weak_self: weak.clone(),
            transport,
            config,
            channels: RwLock::new(HashMap::new()),
            next_channel_id: AtomicU32::new(0),
            allow_more_sessions: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            factories: RwLock::new(Vec::new()),
            global_handlers: RwLock::new(Vec::new()),
            pending_global: Mutex::new(VecDeque::new()),
            forwarder: TcpipForwarder::new(weak.clone()),
            agent: AgentForward::new(weak.clone()),
            x11: X11Forward::new(),
        })
    }

    /// The transport this session writes through.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The tunables the service was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The port-forwarding subordinate.
    pub fn forwarder(&self) -> &TcpipForwarder {
        &self.forwarder
    }

    /// The agent-forwarding subordinate.
    pub fn agent_forward(&self) -> &AgentForward {
        &self.agent
    }

    /// The X11-forwarding subordinate.
    pub fn x11_forward(&self) -> &X11Forward {
        &self.x11
    }

    /// Register a factory for one inbound channel type.
    pub fn register_channel_factory(&self, factory: Arc<dyn ChannelFactory>) {
        self.factories.write().push(factory);
    }

    /// Append a handler to the global-request chain.
    pub fn register_global_handler(&self, handler: Arc<dyn GlobalRequestHandler>) {
        self.global_handlers.write().push(handler);
    }

    /// Refuse (or re-allow) further inbound channel opens.
    pub fn set_allow_more_sessions(&self, allow: bool) {
        self.allow_more_sessions.store(allow, Ordering::SeqCst);
    }

    /// Look up a registered channel by our identifier for it.
    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.read().get(&id).cloned()
    }

    /// Number of currently registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub(crate) fn unregister(&self, id: u32) {
        self.channels.write().remove(&id);
    }

    fn alloc_channel_id(&self) -> Result<u32> {
        if self.channels.read().len() >= self.config.max_channels {
            return Err(Error::OpenChannel {
                code: OpenFailureReason::ResourceShortage as u32,
                message: format!("too many channels (max {})", self.config.max_channels),
            });
        }
        Ok(self.next_channel_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Open an outbound channel of `channel_type`. The caller decides the
    /// outcome by awaiting the channel's open future.
    pub fn open_channel(&self, channel_type: &str) -> Result<Arc<Channel>> {
        self.open_channel_ext(channel_type, |_| {})
    }

    /// Like [`open_channel`](Self::open_channel), appending type-specific
    /// fields to the `CHANNEL_OPEN` message.
    pub fn open_channel_ext<F>(&self, channel_type: &str, extra: F) -> Result<Arc<Channel>>
    where
        F: FnOnce(&mut Buffer),
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let local_id = self.alloc_channel_id()?;
        let channel = Channel::new(
            local_id,
            channel_type,
            Arc::downgrade(&self.transport),
            self.config.window_size,
            self.config.packet_size,
        );
        self.channels.write().insert(local_id, Arc::clone(&channel));

        let mut buf = Buffer::for_packet(msg::CHANNEL_OPEN);
        buf.put_str(channel_type);
        buf.put_u32(local_id);
        buf.put_u32(self.config.window_size);
        buf.put_u32(self.config.packet_size);
        extra(&mut buf);
        if let Err(e) = self.transport.write_packet(buf) {
            self.unregister(local_id);
            return Err(e);
        }
        Ok(channel)
    }

    /// Send a `GLOBAL_REQUEST`. With `want_reply` the call suspends until
    /// the paired `REQUEST_SUCCESS` / `REQUEST_FAILURE` arrives.
    pub async fn global_request<F>(
        &self,
        name: &str,
        want_reply: bool,
        body: F,
    ) -> Result<Option<GlobalReply>>
    where
        F: FnOnce(&mut Buffer),
    {
        let mut buf = Buffer::for_packet(msg::GLOBAL_REQUEST);
        buf.put_str(name);
        buf.put_bool(want_reply);
        body(&mut buf);

        let reply = if want_reply {
            let reply = Awaitable::new();
            self.pending_global.lock().push_back(reply.clone());
            Some(reply)
        } else {
            None
        };
        self.transport.write_packet(buf)?;

        match reply {
            None => Ok(None),
            Some(reply) => match reply.wait().await {
                Completion::Value(outcome) => Ok(Some(outcome)),
                Completion::Canceled => Err(Error::Disconnected),
            },
        }
    }

    /// Dispatch one incoming connection-layer message. Must be invoked
    /// serially per session.
    pub async fn process(&self, cmd: u8, buf: &mut Buffer) -> Result<()> {
        match cmd {
            msg::CHANNEL_OPEN => self.handle_channel_open(buf).await,
            msg::GLOBAL_REQUEST => self.handle_global_request(buf).await,
            msg::REQUEST_SUCCESS => {
                let payload = buf.get_raw(buf.available())?;
                self.resolve_global(GlobalReply::Success(payload));
                Ok(())
            }
            msg::REQUEST_FAILURE => {
                self.resolve_global(GlobalReply::Failure);
                Ok(())
            }
            msg::CHANNEL_OPEN_CONFIRMATION
            | msg::CHANNEL_OPEN_FAILURE
            | msg::CHANNEL_WINDOW_ADJUST
            | msg::CHANNEL_DATA
            | msg::CHANNEL_EXTENDED_DATA
            | msg::CHANNEL_EOF
            | msg::CHANNEL_CLOSE
            | msg::CHANNEL_REQUEST
            | msg::CHANNEL_SUCCESS
            | msg::CHANNEL_FAILURE => {
                let id = buf.get_u32()?;
                let channel = self
                    .channel(id)
                    .ok_or_else(|| Error::unknown_channel(cmd, id))?;
                self.dispatch_channel(cmd, &channel, buf).await
            }
            other => Err(Error::Protocol(format!(
                "unexpected message {} for the connection service",
                other
            ))),
        }
    }

    async fn dispatch_channel(&self, cmd: u8, channel: &Arc<Channel>, buf: &mut Buffer) -> Result<()> {
        match cmd {
            msg::CHANNEL_OPEN_CONFIRMATION => channel.handle_open_confirmation(buf),
            msg::CHANNEL_OPEN_FAILURE => {
                let result = channel.handle_open_failure(buf);
                self.unregister(channel.local_id());
                result
            }
            msg::CHANNEL_WINDOW_ADJUST => channel.handle_window_adjust(buf),
            msg::CHANNEL_DATA => channel.handle_data(buf),
            msg::CHANNEL_EXTENDED_DATA => channel.handle_extended_data(buf),
            msg::CHANNEL_EOF => channel.handle_eof(),
            msg::CHANNEL_CLOSE => {
                let result = channel.handle_close();
                self.unregister(channel.local_id());
                result
            }
            msg::CHANNEL_REQUEST => channel.handle_request(buf).await,
            msg::CHANNEL_SUCCESS => {
                channel.handle_reply_success();
                Ok(())
            }
            msg::CHANNEL_FAILURE => {
                channel.handle_reply_failure();
                Ok(())
            }
            _ => unreachable!("dispatch_channel called for {}", cmd),
        }
    }

    fn send_open_failure(&self, peer_id: u32, code: u32, message: &str) -> Result<()> {
        let mut buf = Buffer::for_packet(msg::CHANNEL_OPEN_FAILURE);
        buf.put_u32(peer_id);
        buf.put_u32(code);
        buf.put_str(message);
        buf.put_str("en");
        self.transport.write_packet(buf)
    }

    async fn handle_channel_open(&self, buf: &mut Buffer) -> Result<()> {
        let channel_type = buf.get_str()?;
        let peer_id = buf.get_u32()?;
        let remote_window = buf.get_u32()?;
        let remote_packet = buf.get_u32()?;
        debug!(
            "CHANNEL_OPEN {:?} peer={} window={} packet={}",
            channel_type, peer_id, remote_window, remote_packet
        );

        if self.closing.load(Ordering::SeqCst) || !self.allow_more_sessions.load(Ordering::SeqCst) {
            return self.send_open_failure(
                peer_id,
                OpenFailureReason::AdministrativelyProhibited as u32,
                "no more sessions accepted",
            );
        }

        let factory = {
            let factories = self.factories.read();
            factories
                .iter()
                .find(|f| f.channel_type() == channel_type)
                .cloned()
        };
        let factory = match factory {
            Some(f) => f,
            None => {
                return self.send_open_failure(
                    peer_id,
                    OpenFailureReason::UnknownChannelType as u32,
                    &format!("unknown channel type: {}", channel_type),
                );
            }
        };

        let local_id = match self.alloc_channel_id() {
            Ok(id) => id,
            Err(Error::OpenChannel { code, message }) => {
                return self.send_open_failure(peer_id, code, &message);
            }
            Err(e) => return Err(e),
        };

        let channel = Channel::new(
            local_id,
            &channel_type,
            Arc::downgrade(&self.transport),
            self.config.window_size,
            self.config.packet_size,
        );
        channel.attach_remote(peer_id, remote_window, remote_packet)?;
        self.channels.write().insert(local_id, Arc::clone(&channel));

        // The reply goes out whenever the open future completes, whether
        // the factory finishes synchronously or later.
        let transport = Arc::clone(&self.transport);
        let service = self.weak_self.clone();
        let window_size = self.config.window_size;
        let packet_size = self.config.packet_size;
        channel.open_result().add_listener(move |outcome| {
            match outcome {
                Completion::Value(Ok(())) => {
                    let mut reply = Buffer::for_packet(msg::CHANNEL_OPEN_CONFIRMATION);
                    reply.put_u32(peer_id);
                    reply.put_u32(local_id);
                    reply.put_u32(window_size);
                    reply.put_u32(packet_size);
                    let _ = transport.write_packet(reply);
                }
                Completion::Value(Err(rejection)) => {
                    let mut reply = Buffer::for_packet(msg::CHANNEL_OPEN_FAILURE);
                    reply.put_u32(peer_id);
                    reply.put_u32(rejection.code);
                    reply.put_str(&rejection.message);
                    reply.put_str("en");
                    let _ = transport.write_packet(reply);
                    if let Some(service) = service.upgrade() {
                        service.unregister(local_id);
                    }
                }
                Completion::Canceled => {
                    let mut reply = Buffer::for_packet(msg::CHANNEL_OPEN_FAILURE);
                    reply.put_u32(peer_id);
                    reply.put_u32(0);
                    reply.put_str("Error opening channel");
                    reply.put_str("en");
                    let _ = transport.write_packet(reply);
                    if let Some(service) = service.upgrade() {
                        service.unregister(local_id);
                    }
                }
            }
        });

        match factory.setup(&channel, buf).await {
            Ok(FactorySetup::Ready) => channel.mark_open(),
            Ok(FactorySetup::Deferred) => {}
            Err(rejection) => channel.mark_open_failed(rejection),
        }
        Ok(())
    }

    async fn handle_global_request(&self, buf: &mut Buffer) -> Result<()> {
        let name = buf.get_str()?;
        let want_reply = buf.get_bool()?;
        debug!("GLOBAL_REQUEST {:?} want_reply={}", name, want_reply);

        let handlers: Vec<_> = self.global_handlers.read().iter().cloned().collect();
        let mut outcome = RequestResult::Unsupported;
        for handler in handlers {
            let rewind = buf.rpos();
            match handler.process(self, &name, want_reply, buf).await? {
                RequestResult::Unsupported => buf.set_rpos(rewind),
                result => {
                    outcome = result;
                    break;
                }
            }
        }

        match outcome {
            RequestResult::Replied => Ok(()),
            RequestResult::ReplySuccess => {
                if want_reply {
                    self.transport
                        .write_packet(Buffer::for_packet(msg::REQUEST_SUCCESS))?;
                }
                Ok(())
            }
            RequestResult::ReplyFailure | RequestResult::Unsupported => {
                if outcome == RequestResult::Unsupported {
                    debug!("no handler for global request {:?}", name);
                }
                if want_reply {
                    self.transport
                        .write_packet(Buffer::for_packet(msg::REQUEST_FAILURE))?;
                }
                Ok(())
            }
        }
    }

    fn resolve_global(&self, reply: GlobalReply) {
        match self.pending_global.lock().pop_front() {
            Some(pending) => {
                pending.set(reply);
            }
            None => warn!("global reply with no request outstanding"),
        }
    }

    /// Tear the session's connection layer down: forwarders first
    /// (tcpip, then agent, then x11), then all channels in parallel. The
    /// registry is drained afterwards no matter how individual channels
    /// fared, and outstanding global requests are canceled.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.close().await;
        self.agent.close().await;
        self.x11.close();

        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        let timeout = self.config.channel_close_timeout;
        let mut closing = JoinSet::new();
        for channel in channels {
            closing.spawn(async move {
                if let Err(e) = channel.close(Some(timeout)).await {
                    debug!("channel {} close: {}", channel.local_id(), e);
                }
            });
        }
        while closing.join_next().await.is_some() {}

        self.channels.write().clear();
        for pending in self.pending_global.lock().drain(..) {
            pending.cancel();
        }
    }
}
