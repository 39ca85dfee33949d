//! The connection layer of an SSH-2 implementation (**only works on
//! unix**).
//!
//! Once the transport has encrypted the link and the user is
//! authenticated, everything interesting in SSH happens here: many
//! logical [channels](Channel) are multiplexed over the single byte
//! stream, each with its own sliding-window flow control; session-wide
//! [global requests](ConnectionService::global_request) set up port
//! forwarding; and subsystems such as [SFTP](sftp) run on top of
//! individual channels.
//!
//! The transport itself — key exchange, ciphers, MACs, rekeying — is
//! deliberately *not* here. This crate talks to it through the small
//! [`Transport`] trait: a non-blocking `write_packet` downstream, and a
//! serial stream of decoded packets handed to
//! [`ConnectionService::process`] (and, before that, to
//! [`auth::ServerAuthService::process`]) upstream. Anything that frames
//! packets that way can host a session: a real encrypted socket, a
//! proxy, or the in-memory pair the test suite uses.
//!
//! # Server sessions
//!
//! A server builds a [`ConnectionService`] per authenticated session and
//! registers what it is willing to serve:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sshmux::sftp::SftpSubsystemFactory;
//! use sshmux::{
//!     CancelTcpipForwardHandler, ConnectionConfig, ConnectionService, SessionChannelFactory,
//!     TcpipForwardHandler, Transport,
//! };
//!
//! # fn wire_up(transport: Arc<dyn Transport>) {
//! let service = ConnectionService::new(transport, ConnectionConfig::default());
//! service.register_channel_factory(Arc::new(
//!     SessionChannelFactory::new().with_subsystem(Arc::new(SftpSubsystemFactory)),
//! ));
//! service.register_global_handler(Arc::new(TcpipForwardHandler));
//! service.register_global_handler(Arc::new(CancelTcpipForwardHandler));
//! # }
//! ```
//!
//! From then on the transport feeds every `SSH_MSG_GLOBAL_*` and
//! `SSH_MSG_CHANNEL_*` payload to [`ConnectionService::process`].
//!
//! # Client channels
//!
//! A client opens channels directly and drives them through their
//! futures and streams:
//!
//! ```rust,no_run
//! # async fn demo(service: &sshmux::ConnectionService) -> sshmux::Result<()> {
//! let channel = service.open_channel("session")?;
//! channel.open_result().wait().await;
//! channel.write_data(b"hello").await?;
//! # Ok(()) }
//! ```
//!
//! # Authentication
//!
//! User authentication (RFC 4252) runs before the connection service
//! exists. The [`auth`] module has both sides: a server-side
//! method-chain state machine with pluggable methods, and a thin client
//! driver.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rust_2018_idioms,
    unreachable_pub
)]

#[cfg(not(unix))]
compile_error!("This crate can only be used on unix");

pub mod msg;

pub mod buffer;
pub use buffer::{Buffer, GrowthPolicy};

mod error;
pub use error::{DisconnectReason, Error, OpenFailureReason, Result};

mod future;
pub use future::{Awaitable, Completion, ListenerToken};

pub mod window;
pub use window::Window;

mod transport;
pub use transport::Transport;

pub mod channel;
pub use channel::{
    Channel, ChannelEvents, ChannelMsg, ChannelRequestHandler, ChannelState, EnvCollector,
    OpenRejection, RequestResult,
};

mod connection;
pub use connection::{
    ChannelFactory, ConnectionConfig, ConnectionService, FactorySetup, GlobalReply,
    GlobalRequestHandler,
};

pub mod auth;

mod forward;
pub use forward::{
    CancelTcpipForwardHandler, DirectTcpipFactory, TcpipForwardHandler, TcpipForwarder,
};

mod agent;
pub use agent::{AgentForward, AgentForwardRequestHandler};

mod x11;
pub use x11::{X11Forward, X11Request, X11RequestHandler};

mod shell;
pub use shell::{
    InvertedShell, PtyRequest, SessionChannelFactory, ShellStreams, SubsystemFactory,
};

pub mod sftp;

pub mod hostconfig;

pub mod authorized_keys;

#[cfg(test)]
pub(crate) mod testutil;
