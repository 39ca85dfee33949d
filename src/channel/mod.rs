//! One logical channel multiplexed over a session (RFC 4254 §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::future::Awaitable;
use crate::msg;
use crate::transport::Transport;
use crate::window::Window;

mod request;
pub use request::{ChannelRequestHandler, EnvCollector, RequestResult};

/// Lifecycle of a channel. `Closed` is terminal; a closed channel is
/// unregistered from its session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    /// `CHANNEL_OPEN` sent or received, confirmation outstanding.
    Opening,
    /// Both sides confirmed; data may flow.
    Open,
    /// We signalled end of our outbound stream.
    EofSent,
    /// The peer signalled end of its stream.
    EofReceived,
    /// Close handshake done (or open failed).
    Closed,
}

bitflags! {
    /// Condition bits for [`Channel::wait_for`].
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct ChannelEvents: u32 {
        /// Open confirmation arrived.
        const OPENED = 1 << 0;
        /// The channel reached its terminal state.
        const CLOSED = 1 << 1;
        /// The peer sent `CHANNEL_EOF`.
        const EOF = 1 << 2;
        /// An `exit-status` notification arrived.
        const EXIT_STATUS = 1 << 3;
        /// An `exit-signal` notification arrived.
        const EXIT_SIGNAL = 1 << 4;
        /// Returned by `wait_for` when the deadline expired; never stored.
        const TIMEOUT = 1 << 5;
        /// The peer refused the open; set together with `CLOSED` so a
        /// refused channel can be told apart from one closed after use.
        const OPEN_FAILED = 1 << 6;
    }
}

/// Why the peer (or a local factory) refused to open a channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenRejection {
    /// RFC 4254 §5.1 reason code; 0 when unknown.
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

/// Outcome stored in a channel's open future.
pub type OpenOutcome = std::result::Result<(), OpenRejection>;

/// Inbound traffic and lifecycle notifications, delivered in arrival
/// order to whoever holds the channel's receiver.
#[derive(Debug)]
pub enum ChannelMsg {
    /// `CHANNEL_DATA` payload.
    Data(Bytes),
    /// `CHANNEL_EXTENDED_DATA` payload with its type code
    /// (1 = stderr).
    ExtendedData {
        /// The extended-data type code.
        ext: u32,
        /// The payload.
        data: Bytes,
    },
    /// The peer finished writing.
    Eof,
    /// The close handshake completed; no further messages follow.
    Close,
    /// Remote process exit code.
    ExitStatus(u32),
    /// Remote process terminated by signal.
    ExitSignal {
        /// Signal name without the "SIG" prefix.
        signal: String,
        /// Whether a core dump was produced.
        core_dumped: bool,
        /// Server-supplied detail.
        message: String,
        /// RFC 3066 language tag.
        lang: String,
    },
}

struct RemoteState {
    id: u32,
    window: Window,
}

/// A bidirectional multiplexed stream within a session.
///
/// Created either by [`ConnectionService::open_channel`]
/// (outbound) or by the service when the peer sends `CHANNEL_OPEN`
/// (inbound). The service exclusively owns registered channels; a channel
/// only keeps a weak reference to the session transport for emitting
/// messages.
///
/// [`ConnectionService::open_channel`]: crate::connection::ConnectionService::open_channel
pub struct Channel {
    local_id: u32,
    channel_type: String,
    transport: Weak<dyn Transport>,

    state: Mutex<ChannelState>,
    events: Mutex<ChannelEvents>,
    events_notify: Notify,

    local_window: Window,
    remote: OnceCell<RemoteState>,
    open_result: Awaitable<OpenOutcome>,

    eof_sent: AtomicBool,
    close_sent: AtomicBool,
    exit_status_sent: AtomicBool,
    exit_status: Mutex<Option<u32>>,

    handlers: tokio::sync::Mutex<Vec<Box<dyn ChannelRequestHandler>>>,
    pending_replies: Mutex<std::collections::VecDeque<Awaitable<bool>>>,

    inbound_tx: mpsc::UnboundedSender<ChannelMsg>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelMsg>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("type", &self.channel_type)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        local_id: u32,
        channel_type: &str,
        transport: Weak<dyn Transport>,
        window_size: u32,
        packet_size: u32,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Channel {
            local_id,
            channel_type: channel_type.to_owned(),
            transport,
            state: Mutex::new(ChannelState::Opening),
            events: Mutex::new(ChannelEvents::empty()),
            events_notify: Notify::new(),
            local_window: Window::new(window_size, packet_size),
            remote: OnceCell::new(),
            open_result: Awaitable::new(),
            eof_sent: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            exit_status_sent: AtomicBool::new(false),
            exit_status: Mutex::new(None),
            handlers: tokio::sync::Mutex::new(Vec::new()),
            pending_replies: Mutex::new(std::collections::VecDeque::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Identifier of this channel on our side of the session.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's identifier for this channel; set exactly once when the
    /// open is confirmed.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote.get().map(|r| r.id)
    }

    /// The channel type it was opened with (`"session"`,
    /// `"direct-tcpip"`, ...).
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// The window the peer draws from when sending to us.
    pub fn local_window(&self) -> &Window {
        &self.local_window
    }

    /// The window we draw from when sending to the peer; absent until the
    /// open is confirmed.
    pub fn remote_window(&self) -> Option<&Window> {
        self.remote.get().map(|r| &r.window)
    }

    /// Completion of the open handshake.
    pub fn open_result(&self) -> &Awaitable<OpenOutcome> {
        &self.open_result
    }

    /// Stored `exit-status`, if one arrived.
    pub fn exit_status(&self) -> Option<u32> {
        *self.exit_status.lock()
    }

    /// Take the inbound stream. The first caller gets it; subsequent
    /// calls return `None`.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMsg>> {
        self.inbound_rx.lock().take()
    }

    /// Append `handler` to the request-handler chain.
    pub async fn add_request_handler(&self, handler: Box<dyn ChannelRequestHandler>) {
        self.handlers.lock().await.push(handler);
    }

    fn send(&self, buf: Buffer) -> Result<()> {
        match self.transport.upgrade() {
            Some(t) => t.write_packet(buf),
            None => Err(Error::Disconnected),
        }
    }

    fn remote(&self) -> Result<&RemoteState> {
        self.remote
            .get()
            .ok_or_else(|| Error::Protocol("channel is not open yet".into()))
    }

    fn set_events(&self, bits: ChannelEvents) {
        self.events.lock().insert(bits);
        self.events_notify.notify_waiters();
    }

    /// Currently-set condition bits.
    pub fn events(&self) -> ChannelEvents {
        *self.events.lock()
    }

    /// Wait until any bit of `mask` is set, or the timeout expires.
    /// Returns the satisfied bits; on expiry the result contains
    /// [`ChannelEvents::TIMEOUT`] instead of raising.
    pub async fn wait_for(
        &self,
        mask: ChannelEvents,
        timeout: Option<Duration>,
    ) -> ChannelEvents {
        let wait = async {
            loop {
                let notified = self.events_notify.notified();
                let hit = self.events() & mask;
                if !hit.is_empty() {
                    return hit;
                }
                notified.await;
            }
        };
        match timeout {
            None => wait.await,
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .unwrap_or(ChannelEvents::TIMEOUT),
        }
    }

    fn deliver(&self, msg: ChannelMsg) {
        // The consumer may have dropped its receiver; that only means
        // nobody is listening anymore.
        let _ = self.inbound_tx.send(msg);
    }

    // -- inbound message handling (called serially by the service) -------

    pub(crate) fn attach_remote(&self, id: u32, window_size: u32, packet_size: u32) -> Result<()> {
        self.remote
            .set(RemoteState {
                id,
                window: Window::new(window_size, packet_size),
            })
            .map_err(|_| Error::Protocol("duplicate channel open confirmation".into()))
    }

    pub(crate) fn mark_open(&self) {
        *self.state.lock() = ChannelState::Open;
        self.set_events(ChannelEvents::OPENED);
        self.open_result.set(Ok(()));
    }

    pub(crate) fn mark_open_failed(&self, rejection: OpenRejection) {
        *self.state.lock() = ChannelState::Closed;
        self.set_events(ChannelEvents::CLOSED | ChannelEvents::OPEN_FAILED);
        self.open_result.set(Err(rejection));
    }

    pub(crate) fn handle_open_confirmation(&self, buf: &mut Buffer) -> Result<()> {
        let remote_id = buf.get_u32()?;
        let window_size = buf.get_u32()?;
        let packet_size = buf.get_u32()?;
        self.attach_remote(remote_id, window_size, packet_size)?;
        debug!(
            "channel {}: open confirmed by peer as {} (window {}, packet {})",
            self.local_id, remote_id, window_size, packet_size
        );
        self.mark_open();
        Ok(())
    }

    pub(crate) fn handle_open_failure(&self, buf: &mut Buffer) -> Result<()> {
        let code = buf.get_u32()?;
        let message = buf.get_str().unwrap_or_default();
        debug!("channel {}: open failed ({}): {}", self.local_id, code, message);
        self.mark_open_failed(OpenRejection { code, message });
        Ok(())
    }

    fn consume_and_adjust(&self, len: u32) -> Result<()> {
        if self.local_window.check_consume(len)? {
            // Refill the peer's view of our receive window back to its
            // initial size.
            let grant = self.local_window.initial() - self.local_window.size();
            if grant > 0 {
                self.local_window.expand(grant);
                let mut buf = Buffer::for_packet(msg::CHANNEL_WINDOW_ADJUST);
                buf.put_u32(self.remote()?.id);
                buf.put_u32(grant);
                self.send(buf)?;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_data(&self, buf: &mut Buffer) -> Result<()> {
        let data = buf.get_string()?;
        if self.state() == ChannelState::Closed {
            // Late data racing our close is dropped, not an error.
            return Ok(());
        }
        self.consume_and_adjust(data.len() as u32)?;
        self.deliver(ChannelMsg::Data(Bytes::from(data)));
        Ok(())
    }

    pub(crate) fn handle_extended_data(&self, buf: &mut Buffer) -> Result<()> {
        let ext = buf.get_u32()?;
        let data = buf.get_string()?;
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        self.consume_and_adjust(data.len() as u32)?;
        self.deliver(ChannelMsg::ExtendedData {
            ext,
            data: Bytes::from(data),
        });
        Ok(())
    }

    pub(crate) fn handle_eof(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Open {
                *state = ChannelState::EofReceived;
            }
        }
        self.set_events(ChannelEvents::EOF);
        self.deliver(ChannelMsg::Eof);
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&self, buf: &mut Buffer) -> Result<()> {
        let n = buf.get_u32()?;
        self.remote()?.window.expand(n);
        Ok(())
    }

    /// Peer closed the channel. Replies with our own `CHANNEL_CLOSE` if we
    /// have not sent one yet, then moves to the terminal state. The caller
    /// (the service) unregisters us afterwards.
    pub(crate) fn handle_close(&self) -> Result<()> {
        if !self.close_sent.swap(true, Ordering::SeqCst) {
            if let Ok(remote) = self.remote() {
                let mut buf = Buffer::for_packet(msg::CHANNEL_CLOSE);
                buf.put_u32(remote.id);
                // The transport may already be gone during teardown.
                let _ = self.send(buf);
            }
        }
        self.finish_close();
        Ok(())
    }

    fn finish_close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.set_events(ChannelEvents::CLOSED);
        // The handshake is complete before consumers observe Close, so
        // inverted streams are shut down only after it.
        self.deliver(ChannelMsg::Close);
    }

    pub(crate) fn handle_reply_success(&self) {
        match self.pending_replies.lock().pop_front() {
            Some(reply) => {
                reply.set(true);
            }
            None => warn!("channel {}: CHANNEL_SUCCESS with no request outstanding", self.local_id),
        }
    }

    pub(crate) fn handle_reply_failure(&self) {
        match self.pending_replies.lock().pop_front() {
            Some(reply) => {
                reply.set(false);
            }
            None => warn!("channel {}: CHANNEL_FAILURE with no request outstanding", self.local_id),
        }
    }

    pub(crate) async fn handle_request(self: &Arc<Self>, buf: &mut Buffer) -> Result<()> {
        let name = buf.get_str()?;
        let want_reply = buf.get_bool()?;

        // exit-status / exit-signal are part of the channel core rather
        // than the pluggable chain (RFC 4254 §6.10; want-reply is always
        // false for them).
        match name.as_str() {
            "exit-status" => {
                let status = buf.get_u32()?;
                *self.exit_status.lock() = Some(status);
                self.set_events(ChannelEvents::EXIT_STATUS);
                self.deliver(ChannelMsg::ExitStatus(status));
                return Ok(());
            }
            "exit-signal" => {
                let signal = buf.get_str()?;
                let core_dumped = buf.get_bool()?;
                let message = buf.get_str()?;
                let lang = buf.get_str()?;
                self.set_events(ChannelEvents::EXIT_SIGNAL);
                self.deliver(ChannelMsg::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                    lang,
                });
                return Ok(());
            }
            _ => {}
        }

        let mut outcome = RequestResult::Unsupported;
        {
            let mut handlers = self.handlers.lock().await;
            for handler in handlers.iter_mut() {
                let rewind = buf.rpos();
                match handler.process(self, &name, want_reply, buf).await? {
                    RequestResult::Unsupported => buf.set_rpos(rewind),
                    result => {
                        outcome = result;
                        break;
                    }
                }
            }
        }

        match outcome {
            RequestResult::Replied => {}
            RequestResult::ReplySuccess => {
                if want_reply {
                    let mut reply = Buffer::for_packet(msg::CHANNEL_SUCCESS);
                    reply.put_u32(self.remote()?.id);
                    self.send(reply)?;
                }
            }
            RequestResult::ReplyFailure | RequestResult::Unsupported => {
                if outcome == RequestResult::Unsupported {
                    debug!("channel {}: unhandled request {:?}", self.local_id, name);
                }
                if want_reply {
                    let mut reply = Buffer::for_packet(msg::CHANNEL_FAILURE);
                    reply.put_u32(self.remote()?.id);
                    self.send(reply)?;
                }
            }
        }
        Ok(())
    }

    // -- outbound operations ---------------------------------------------

    fn writable(&self) -> Result<()> {
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        match self.state() {
            ChannelState::Open | ChannelState::EofReceived => Ok(()),
            ChannelState::Closed => Err(Error::Disconnected),
            state => Err(Error::Protocol(format!(
                "cannot write on channel in state {:?}",
                state
            ))),
        }
    }

    async fn write_stream(&self, ext: Option<u32>, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            self.writable()?;
            let remote = self.remote()?;
            let max = remote.window.packet_size().min(data.len() as u32);
            let n = remote.window.reserve(max).await as usize;

            let cmd = if ext.is_some() {
                msg::CHANNEL_EXTENDED_DATA
            } else {
                msg::CHANNEL_DATA
            };
            let mut buf = Buffer::for_packet(cmd);
            buf.put_u32(remote.id);
            if let Some(code) = ext {
                buf.put_u32(code);
            }
            buf.put_string(&data[..n]);
            self.send(buf)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Write to the channel's main stream, chunking by the remote packet
    /// size and suspending while the peer's window is exhausted.
    pub async fn write_data(&self, data: &[u8]) -> Result<()> {
        self.write_stream(None, data).await
    }

    /// Write to an extended stream (1 = stderr).
    pub async fn write_extended_data(&self, ext: u32, data: &[u8]) -> Result<()> {
        self.write_stream(Some(ext), data).await
    }

    /// Signal the end of our outbound stream. Idempotent.
    pub fn send_eof(&self) -> Result<()> {
        if self.eof_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut buf = Buffer::for_packet(msg::CHANNEL_EOF);
        buf.put_u32(self.remote()?.id);
        self.send(buf)?;
        let mut state = self.state.lock();
        if *state == ChannelState::Open {
            *state = ChannelState::EofSent;
        }
        Ok(())
    }

    /// Send a `CHANNEL_REQUEST`. Returns the reply future when a reply
    /// was asked for; completing `true` for `CHANNEL_SUCCESS`.
    pub fn request<F>(&self, name: &str, want_reply: bool, body: F) -> Result<Option<Awaitable<bool>>>
    where
        F: FnOnce(&mut Buffer),
    {
        let remote_id = self.remote()?.id;
        let mut buf = Buffer::for_packet(msg::CHANNEL_REQUEST);
        buf.put_u32(remote_id);
        buf.put_str(name);
        buf.put_bool(want_reply);
        body(&mut buf);

        let reply = if want_reply {
            let reply = Awaitable::new();
            self.pending_replies.lock().push_back(reply.clone());
            Some(reply)
        } else {
            None
        };
        self.send(buf)?;
        Ok(reply)
    }

    /// Send the one-shot `exit-status` notification (server side).
    /// Duplicates are suppressed; want-reply is never set.
    pub fn send_exit_status(&self, status: u32) -> Result<()> {
        if self.exit_status_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.request("exit-status", false, |buf| buf.put_u32(status))?;
        Ok(())
    }

    /// Send the `exit-signal` notification (server side).
    pub fn send_exit_signal(&self, signal: &str, core_dumped: bool, message: &str) -> Result<()> {
        self.request("exit-signal", false, |buf| {
            buf.put_str(signal);
            buf.put_bool(core_dumped);
            buf.put_str(message);
            buf.put_str("en");
        })?;
        Ok(())
    }

    /// Start the close handshake; the channel reaches `Closed` when the
    /// peer's `CHANNEL_CLOSE` comes back. Safe to call repeatedly and
    /// while I/O is in flight.
    pub fn start_close(&self) -> Result<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.remote.get() {
            Some(remote) => {
                let mut buf = Buffer::for_packet(msg::CHANNEL_CLOSE);
                buf.put_u32(remote.id);
                self.send(buf)
            }
            // Never confirmed; nothing to hand-shake.
            None => {
                self.finish_close();
                Ok(())
            }
        }
    }

    /// Close and wait for the handshake to complete. On timeout the
    /// channel is forced into the terminal state locally.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        self.start_close()?;
        let got = self.wait_for(ChannelEvents::CLOSED, timeout).await;
        if got.contains(ChannelEvents::TIMEOUT) {
            warn!("channel {}: close handshake timed out", self.local_id);
            self.finish_close();
        }
        Ok(())
    }
}
