//! Session channels: the inverted-shell interface and the request
//! handler wiring `shell` / `exec` / `subsystem` / `pty-req` / `env`
//! onto a channel.
//!
//! "Inverted" means the streams point at us: we write the shell's stdin
//! and read its stdout/stderr. How the shell actually runs (a process, a
//! PTY, something in-process) is the embedder's business.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelMsg, ChannelRequestHandler, RequestResult};
use crate::connection::{ChannelFactory, FactorySetup};
use crate::error::Result;
use crate::future::{Awaitable, Completion};
use crate::msg;

/// The streams of a started shell or command.
pub struct ShellStreams {
    /// Where channel data is written.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read and forwarded as channel data.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Read and forwarded as extended (stderr) data, when present.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Completed with the exit code once the shell terminates.
    pub exit_status: Awaitable<u32>,
}

impl std::fmt::Debug for ShellStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellStreams")
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Something that can run a login shell or a single command on behalf of
/// a session channel.
#[async_trait]
pub trait InvertedShell: Send + Sync {
    /// Start the login shell (`command` is `None`) or `command`, with the
    /// accumulated `env` vars.
    async fn spawn(
        &self,
        command: Option<&str>,
        env: &[(String, String)],
    ) -> io::Result<ShellStreams>;
}

/// Starts a named subsystem (`sftp`, ...) on a session channel.
#[async_trait]
pub trait SubsystemFactory: Send + Sync {
    /// The subsystem name requested by the peer.
    fn name(&self) -> &str;

    /// Take over the channel's inbound stream and serve the subsystem.
    async fn start(&self, channel: &Arc<Channel>) -> Result<()>;
}

/// Terminal parameters from a `pty-req` (RFC 4254 §6.2).
#[derive(Debug, Clone)]
pub struct PtyRequest {
    /// TERM environment variable value.
    pub term: String,
    /// Terminal width, characters.
    pub cols: u32,
    /// Terminal height, rows.
    pub rows: u32,
    /// Terminal width, pixels.
    pub pix_width: u32,
    /// Terminal height, pixels.
    pub pix_height: u32,
    /// Encoded terminal modes, opaque to this layer.
    pub modes: Vec<u8>,
}

/// Factory accepting inbound `session` channels.
#[derive(Default)]
pub struct SessionChannelFactory {
    shell: Option<Arc<dyn InvertedShell>>,
    subsystems: Vec<Arc<dyn SubsystemFactory>>,
}

impl std::fmt::Debug for SessionChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannelFactory")
            .field("shell", &self.shell.is_some())
            .field(
                "subsystems",
                &self.subsystems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SessionChannelFactory {
    /// A factory with no shell and no subsystems.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `shell` and `exec` requests with this shell.
    pub fn with_shell(mut self, shell: Arc<dyn InvertedShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Serve `subsystem` requests for `factory.name()`.
    pub fn with_subsystem(mut self, factory: Arc<dyn SubsystemFactory>) -> Self {
        self.subsystems.push(factory);
        self
    }
}

#[async_trait]
impl ChannelFactory for SessionChannelFactory {
    fn channel_type(&self) -> &str {
        "session"
    }

    async fn setup(
        &self,
        channel: &Arc<Channel>,
        _open_payload: &mut Buffer,
    ) -> std::result::Result<FactorySetup, crate::channel::OpenRejection> {
        channel
            .add_request_handler(Box::new(SessionChannelHandler {
                shell: self.shell.clone(),
                subsystems: self.subsystems.clone(),
                env: Vec::new(),
                pty: None,
                started: false,
            }))
            .await;
        Ok(FactorySetup::Ready)
    }
}

/// Request handler for one session channel.
struct SessionChannelHandler {
    shell: Option<Arc<dyn InvertedShell>>,
    subsystems: Vec<Arc<dyn SubsystemFactory>>,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    started: bool,
}

impl SessionChannelHandler {
    async fn start_shell(
        &mut self,
        channel: &Arc<Channel>,
        command: Option<String>,
    ) -> RequestResult {
        if self.started {
            return RequestResult::ReplyFailure;
        }
        let shell = match &self.shell {
            Some(shell) => Arc::clone(shell),
            None => return RequestResult::ReplyFailure,
        };
        match shell.spawn(command.as_deref(), &self.env).await {
            Ok(streams) => {
                self.started = true;
                spawn_shell_pump(Arc::clone(channel), streams);
                RequestResult::ReplySuccess
            }
            Err(e) => {
                warn!("channel {}: shell failed to start: {}", channel.local_id(), e);
                RequestResult::ReplyFailure
            }
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for SessionChannelHandler {
    async fn process(
        &mut self,
        channel: &Arc<Channel>,
        name: &str,
        _want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult> {
        match name {
            "pty-req" => {
                self.pty = Some(PtyRequest {
                    term: buf.get_str()?,
                    cols: buf.get_u32()?,
                    rows: buf.get_u32()?,
                    pix_width: buf.get_u32()?,
                    pix_height: buf.get_u32()?,
                    modes: buf.get_string()?,
                });
                Ok(RequestResult::ReplySuccess)
            }
            "env" => {
                let name = buf.get_str()?;
                let value = buf.get_str()?;
                self.env.push((name, value));
                Ok(RequestResult::ReplySuccess)
            }
            "shell" => Ok(self.start_shell(channel, None).await),
            "exec" => {
                let command = buf.get_str()?;
                Ok(self.start_shell(channel, Some(command)).await)
            }
            "subsystem" => {
                let requested = buf.get_str()?;
                if self.started {
                    return Ok(RequestResult::ReplyFailure);
                }
                let factory = self.subsystems.iter().find(|s| s.name() == requested);
                match factory {
                    Some(factory) => {
                        factory.start(channel).await?;
                        self.started = true;
                        Ok(RequestResult::ReplySuccess)
                    }
                    None => {
                        warn!("no subsystem {:?} configured", requested);
                        Ok(RequestResult::ReplyFailure)
                    }
                }
            }
            "window-change" => {
                if let Some(pty) = self.pty.as_mut() {
                    pty.cols = buf.get_u32()?;
                    pty.rows = buf.get_u32()?;
                    pty.pix_width = buf.get_u32()?;
                    pty.pix_height = buf.get_u32()?;
                }
                Ok(RequestResult::ReplySuccess)
            }
            "signal" => {
                // Accepted but meaningless without a real process table.
                let _ = buf.get_str()?;
                Ok(RequestResult::ReplySuccess)
            }
            _ => Ok(RequestResult::Unsupported),
        }
    }
}

/// Pump channel data into the shell's stdin and its stdout/stderr back
/// out. After the shell finishes writing: exit-status, EOF, close — and
/// the streams are dropped only once the close handshake is done.
fn spawn_shell_pump(channel: Arc<Channel>, streams: ShellStreams) {
    let ShellStreams {
        mut stdin,
        mut stdout,
        mut stderr,
        exit_status,
    } = streams;

    let mut rx = match channel.take_receiver() {
        Some(rx) => rx,
        None => return,
    };

    tokio::spawn(async move {
        let mut out_buf = vec![0u8; 32 * 1024];
        let mut err_buf = vec![0u8; 32 * 1024];
        let mut stdout_open = true;
        loop {
            tokio::select! {
                inbound = rx.recv() => match inbound {
                    Some(ChannelMsg::Data(data)) => {
                        if stdin.write_all(&data).await.is_err() {
                            warn!("channel {}: shell stdin is gone", channel.local_id());
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = stdin.shutdown().await;
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                read = stdout.read(&mut out_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => {
                        stdout_open = false;
                        if let Completion::Value(status) = exit_status.wait().await {
                            let _ = channel.send_exit_status(status);
                        }
                        let _ = channel.send_eof();
                        let _ = channel.start_close();
                    }
                    Ok(n) => {
                        if channel.write_data(&out_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                read = read_opt(&mut stderr, &mut err_buf) => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => {
                        if channel
                            .write_extended_data(msg::EXTENDED_DATA_STDERR, &err_buf[..n])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                },
            }
        }
    });
}

async fn read_opt(
    stream: &mut Option<Box<dyn AsyncRead + Send + Unpin>>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}
