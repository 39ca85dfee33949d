//! TCP/IP port forwarding (RFC 4254 §7): listener management for
//! `tcpip-forward`, the `forwarded-tcpip` accept path and the
//! `direct-tcpip` connect path.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelMsg, OpenRejection, RequestResult};
use crate::connection::{ChannelFactory, ConnectionService, FactorySetup, GlobalRequestHandler};
use crate::error::{Error, OpenFailureReason, Result};
use crate::future::Completion;
use crate::msg;

/// Copy bytes between a channel and a byte stream in both directions
/// until either side closes. Socket EOF becomes `CHANNEL_EOF`; channel
/// close shuts the stream down.
pub(crate) fn spawn_stream_pump<S>(channel: Arc<Channel>, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let mut rx = match channel.take_receiver() {
            Some(rx) => rx,
            None => return,
        };
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut buf = vec![0u8; 32 * 1024];
        let mut stream_eof = false;
        loop {
            tokio::select! {
                inbound = rx.recv() => match inbound {
                    Some(ChannelMsg::Data(data)) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = write_half.shutdown().await;
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                read = read_half.read(&mut buf), if !stream_eof => match read {
                    Ok(0) => {
                        stream_eof = true;
                        let _ = channel.send_eof();
                    }
                    Ok(n) => {
                        if channel.write_data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        let _ = channel.start_close();
    });
}

struct ListenerHandle {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Listener registry for remote port forwarding.
///
/// Each bound address runs an accept loop that opens a
/// `forwarded-tcpip` channel back to the peer for every accepted
/// connection. Closed before the session's channels during teardown.
pub struct TcpipForwarder {
    service: Weak<ConnectionService>,
    bound: Mutex<HashMap<SocketAddr, ListenerHandle>>,
    root_token: CancellationToken,
}

impl std::fmt::Debug for TcpipForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpipForwarder")
            .field("bound", &self.bound.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TcpipForwarder {
    pub(crate) fn new(service: Weak<ConnectionService>) -> Self {
        TcpipForwarder {
            service,
            bound: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
        }
    }

    /// Bind a listener for `addr` and start forwarding accepted
    /// connections to the peer. Returns the address actually bound;
    /// port 0 resolves to an OS-assigned port.
    pub async fn local_port_forwarding_requested(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.root_token.is_cancelled() {
            return Err(Error::Disconnected);
        }
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        debug!("forwarding listener bound on {}", bound);

        let token = self.root_token.child_token();
        let service = self.service.clone();
        let accept_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => forward_accepted(&service, bound, peer, stream),
                        Err(e) => {
                            warn!("accept on {} failed: {}", bound, e);
                            break;
                        }
                    },
                }
            }
        });

        self.bound
            .lock()
            .insert(bound, ListenerHandle { token, task });
        Ok(bound)
    }

    /// Stop and unregister the listener for `address`:`port`. An
    /// unspecified address matches any listener on that port. Returns
    /// the address that was actually bound, if one was found.
    pub async fn cancel(&self, address: IpAddr, port: u16) -> Option<SocketAddr> {
        let handle = {
            let mut bound = self.bound.lock();
            let key = bound
                .keys()
                .find(|a| a.port() == port && (address.is_unspecified() || a.ip() == address))
                .copied()?;
            bound.remove_entry(&key)
        };
        let (addr, handle) = handle?;
        handle.token.cancel();
        let _ = handle.task.await;
        Some(addr)
    }

    /// Addresses with an active listener.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.bound.lock().keys().copied().collect()
    }

    /// Stop every listener.
    pub async fn close(&self) {
        self.root_token.cancel();
        let handles: Vec<ListenerHandle> = {
            let mut bound = self.bound.lock();
            bound.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.task.await;
        }
    }
}

fn forward_accepted(
    service: &Weak<ConnectionService>,
    bound: SocketAddr,
    peer: SocketAddr,
    stream: TcpStream,
) {
    let service = match service.upgrade() {
        Some(service) => service,
        None => return,
    };
    let channel = match service.open_channel_ext("forwarded-tcpip", |buf| {
        buf.put_str(&bound.ip().to_string());
        buf.put_u32(bound.port() as u32);
        buf.put_str(&peer.ip().to_string());
        buf.put_u32(peer.port() as u32);
    }) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("could not open forwarded-tcpip channel: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        match channel.open_result().wait().await {
            Completion::Value(Ok(())) => spawn_stream_pump(channel, stream),
            outcome => debug!("forwarded-tcpip open refused: {:?}", outcome),
        }
    });
}

fn parse_bind_address(address: &str, port: u32) -> SocketAddr {
    // "" and "localhost" are the RFC 4254 §7.1 wildcard spellings.
    let ip = address
        .parse::<IpAddr>()
        .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, port as u16)
}

/// Stateless dispatcher for the `tcpip-forward` global request. The
/// reply carries the bound port as a `uint32` when a reply was asked
/// for, so the handler sends it itself.
#[derive(Debug, Default)]
pub struct TcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for TcpipForwardHandler {
    async fn process(
        &self,
        service: &ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult> {
        if name != "tcpip-forward" {
            return Ok(RequestResult::Unsupported);
        }
        let address = buf.get_str()?;
        let port = buf.get_u32()?;
        match service
            .forwarder()
            .local_port_forwarding_requested(parse_bind_address(&address, port))
            .await
        {
            Ok(bound) => {
                if want_reply {
                    let mut reply = Buffer::for_packet(msg::REQUEST_SUCCESS);
                    reply.put_u32(bound.port() as u32);
                    service.transport().write_packet(reply)?;
                }
                Ok(RequestResult::Replied)
            }
            Err(e) => {
                warn!("tcpip-forward for {}:{} failed: {}", address, port, e);
                Ok(RequestResult::ReplyFailure)
            }
        }
    }
}

/// Stateless dispatcher for `cancel-tcpip-forward`; echoes the canceled
/// port on success.
#[derive(Debug, Default)]
pub struct CancelTcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for CancelTcpipForwardHandler {
    async fn process(
        &self,
        service: &ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult> {
        if name != "cancel-tcpip-forward" {
            return Ok(RequestResult::Unsupported);
        }
        let address = buf.get_str()?;
        let port = buf.get_u32()?;
        let target = parse_bind_address(&address, port);
        match service.forwarder().cancel(target.ip(), target.port()).await {
            Some(canceled) => {
                if want_reply {
                    let mut reply = Buffer::for_packet(msg::REQUEST_SUCCESS);
                    reply.put_u32(canceled.port() as u32);
                    service.transport().write_packet(reply)?;
                }
                Ok(RequestResult::Replied)
            }
            None => Ok(RequestResult::ReplyFailure),
        }
    }
}

/// Accepts inbound `direct-tcpip` channels by connecting to the
/// requested target and pumping the two byte streams into each other.
#[derive(Debug, Default)]
pub struct DirectTcpipFactory;

#[async_trait]
impl ChannelFactory for DirectTcpipFactory {
    fn channel_type(&self) -> &str {
        "direct-tcpip"
    }

    async fn setup(
        &self,
        channel: &Arc<Channel>,
        open_payload: &mut Buffer,
    ) -> std::result::Result<FactorySetup, OpenRejection> {
        let decode = |buf: &mut Buffer| -> Result<(String, u32)> {
            let host = buf.get_str()?;
            let port = buf.get_u32()?;
            Ok((host, port))
        };
        let (host, port) = decode(open_payload).map_err(|e| OpenRejection {
            code: OpenFailureReason::ConnectFailed as u32,
            message: format!("malformed direct-tcpip request: {}", e),
        })?;
        // Originator address and port follow; only useful for logging.
        let _ = decode(open_payload);

        let channel = Arc::clone(channel);
        tokio::spawn(async move {
            match TcpStream::connect((host.as_str(), port as u16)).await {
                Ok(stream) => {
                    channel.mark_open();
                    spawn_stream_pump(channel, stream);
                }
                Err(e) => {
                    channel.mark_open_failed(OpenRejection {
                        code: OpenFailureReason::ConnectFailed as u32,
                        message: format!("connect to {}:{} failed: {}", host, port, e),
                    });
                }
            }
        });
        Ok(FactorySetup::Deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_parsing() {
        let addr = parse_bind_address("", 0);
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 0);

        let addr = parse_bind_address("127.0.0.1", 2222);
        assert_eq!(addr, "127.0.0.1:2222".parse().unwrap());
    }
}
