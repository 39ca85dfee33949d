//! End-to-end connection-layer scenarios over an in-memory transport
//! pair: session open/echo/close, global port forwarding, and window
//! flow control.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use common::{spawn_pump, wait_until, EchoShell, TestTransport};
use sshmux::{
    Buffer, CancelTcpipForwardHandler, Channel, ChannelEvents, ChannelFactory, ChannelMsg,
    Completion, ConnectionConfig, ConnectionService, FactorySetup, GlobalReply, OpenRejection,
    SessionChannelFactory, TcpipForwardHandler,
};

struct Peers {
    client: Arc<ConnectionService>,
    server: Arc<ConnectionService>,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for Peers {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn connect_peers(server_config: ConnectionConfig) -> Peers {
    let client_transport = TestTransport::new();
    let server_transport = TestTransport::new();
    let client = ConnectionService::new(client_transport.clone(), ConnectionConfig::default());
    let server = ConnectionService::new(server_transport.clone(), server_config);
    server.register_channel_factory(Arc::new(
        SessionChannelFactory::new().with_shell(Arc::new(EchoShell)),
    ));
    server.register_global_handler(Arc::new(TcpipForwardHandler));
    server.register_global_handler(Arc::new(CancelTcpipForwardHandler));
    let pump = spawn_pump(
        client_transport,
        client.clone(),
        server_transport,
        server.clone(),
    );
    Peers {
        client,
        server,
        pump,
    }
}

#[tokio::test]
async fn session_open_echo_close() {
    let peers = connect_peers(ConnectionConfig::default());

    let channel = peers.client.open_channel("session").unwrap();
    assert!(matches!(
        channel.open_result().wait().await,
        Completion::Value(Ok(()))
    ));
    assert!(channel.remote_id().is_some());
    assert_eq!(peers.server.channel_count(), 1);

    let mut rx = channel.take_receiver().unwrap();

    let shell = channel.request("shell", true, |_| {}).unwrap().unwrap();
    assert_eq!(shell.wait().await, Completion::Value(true));

    channel.write_data(b"hi\n").await.unwrap();
    let echoed = loop {
        match rx.recv().await.expect("channel stream ended early") {
            ChannelMsg::Data(data) => break data,
            _ => continue,
        }
    };
    assert_eq!(&echoed[..], b"hi\n");

    // Closing our stream ends the shell; it reports its exit status
    // before the close handshake.
    channel.send_eof().unwrap();
    let events = channel
        .wait_for(ChannelEvents::EXIT_STATUS, Some(Duration::from_secs(5)))
        .await;
    assert!(events.contains(ChannelEvents::EXIT_STATUS));
    assert_eq!(channel.exit_status(), Some(0));

    channel.close(Some(Duration::from_secs(2))).await.unwrap();
    let events = channel.wait_for(ChannelEvents::CLOSED, None).await;
    assert!(events.contains(ChannelEvents::CLOSED));

    wait_until(|| peers.client.channel_count() == 0).await;
    wait_until(|| peers.server.channel_count() == 0).await;
}

#[tokio::test]
async fn unknown_channel_type_is_refused() {
    let peers = connect_peers(ConnectionConfig::default());

    let channel = peers.client.open_channel("nonsense").unwrap();
    match channel.open_result().wait().await {
        Completion::Value(Err(OpenRejection { code, message })) => {
            assert_eq!(code, sshmux::OpenFailureReason::UnknownChannelType as u32);
            assert!(message.contains("nonsense"));
        }
        other => panic!("open should have been refused, got {:?}", other),
    }

    // The refusal is visible through the event mask, distinct from an
    // ordinary close.
    let events = channel
        .wait_for(ChannelEvents::OPEN_FAILED, Some(Duration::from_secs(2)))
        .await;
    assert!(events.contains(ChannelEvents::OPEN_FAILED));

    wait_until(|| peers.client.channel_count() == 0).await;
}

/// Captures inbound `forwarded-tcpip` channels on the client side.
struct CaptureFactory {
    tx: mpsc::UnboundedSender<Arc<Channel>>,
}

#[async_trait]
impl ChannelFactory for CaptureFactory {
    fn channel_type(&self) -> &str {
        "forwarded-tcpip"
    }

    async fn setup(
        &self,
        channel: &Arc<Channel>,
        _open_payload: &mut Buffer,
    ) -> Result<FactorySetup, OpenRejection> {
        self.tx.send(Arc::clone(channel)).ok();
        Ok(FactorySetup::Ready)
    }
}

#[tokio::test]
async fn global_port_forwarding_round_trip() {
    let peers = connect_peers(ConnectionConfig::default());
    let (tx, mut forwarded) = mpsc::unbounded_channel();
    peers
        .client
        .register_channel_factory(Arc::new(CaptureFactory { tx }));

    // Ask the peer to listen on an ephemeral port; the reply carries the
    // port it actually bound.
    let reply = peers
        .client
        .global_request("tcpip-forward", true, |buf| {
            buf.put_str("");
            buf.put_u32(0);
        })
        .await
        .unwrap();
    let port = match reply {
        Some(GlobalReply::Success(payload)) => {
            let mut buf = Buffer::from_vec(payload);
            buf.get_u32().unwrap()
        }
        other => panic!("expected success with a port, got {:?}", other),
    };
    assert_ne!(port, 0);

    // Connect to the listener and exchange a ping across the forwarded
    // channel.
    let mut socket = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
    socket.write_all(b"ping").await.unwrap();

    let channel = tokio::time::timeout(Duration::from_secs(5), forwarded.recv())
        .await
        .expect("no forwarded channel arrived")
        .unwrap();
    let mut rx = channel.take_receiver().unwrap();
    let data = loop {
        match rx.recv().await.expect("forwarded channel closed early") {
            ChannelMsg::Data(data) => break data,
            _ => continue,
        }
    };
    assert_eq!(&data[..], b"ping");

    channel.write_data(b"pong").await.unwrap();
    let mut reply = [0u8; 4];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");
    drop(socket);

    // Canceling echoes the bound port and stops the listener.
    let reply = peers
        .client
        .global_request("cancel-tcpip-forward", true, |buf| {
            buf.put_str("");
            buf.put_u32(port);
        })
        .await
        .unwrap();
    match reply {
        Some(GlobalReply::Success(payload)) => {
            let mut buf = Buffer::from_vec(payload);
            assert_eq!(buf.get_u32().unwrap(), port);
        }
        other => panic!("expected cancel success, got {:?}", other),
    }
    assert!(peers.server.forwarder().bound_addresses().is_empty());

    // A second cancel has nothing left to cancel.
    let reply = peers
        .client
        .global_request("cancel-tcpip-forward", true, |buf| {
            buf.put_str("");
            buf.put_u32(port);
        })
        .await
        .unwrap();
    assert_eq!(reply, Some(GlobalReply::Failure));
}

#[tokio::test]
async fn unhandled_global_request_fails_cleanly() {
    let peers = connect_peers(ConnectionConfig::default());
    let reply = peers
        .client
        .global_request("no-such-request@example.com", true, |_| {})
        .await
        .unwrap();
    assert_eq!(reply, Some(GlobalReply::Failure));
}

#[tokio::test]
async fn flow_control_carries_large_writes_through_a_small_window() {
    // A deliberately tiny receive window on the server side forces the
    // client writer to block and resume on WINDOW_ADJUST refills.
    let peers = connect_peers(ConnectionConfig {
        window_size: 4096,
        ..ConnectionConfig::default()
    });

    let channel = peers.client.open_channel("session").unwrap();
    assert!(matches!(
        channel.open_result().wait().await,
        Completion::Value(Ok(()))
    ));
    assert_eq!(channel.remote_window().unwrap().size(), 4096);

    let mut rx = channel.take_receiver().unwrap();
    let shell = channel.request("shell", true, |_| {}).unwrap().unwrap();
    assert_eq!(shell.wait().await, Completion::Value(true));

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| i as u8).collect();
    let writer = {
        let channel = Arc::clone(&channel);
        let payload = payload.clone();
        tokio::spawn(async move { channel.write_data(&payload).await })
    };

    let mut echoed = Vec::with_capacity(payload.len());
    while echoed.len() < payload.len() {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("echo stalled")
            .expect("channel closed early")
        {
            ChannelMsg::Data(data) => echoed.extend_from_slice(&data),
            _ => {}
        }
    }
    writer.await.unwrap().unwrap();
    assert_eq!(echoed, payload);

    channel.send_eof().unwrap();
    channel.close(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn teardown_drains_the_registry() {
    let peers = connect_peers(ConnectionConfig::default());

    for _ in 0..3 {
        let channel = peers.client.open_channel("session").unwrap();
        assert!(matches!(
            channel.open_result().wait().await,
            Completion::Value(Ok(()))
        ));
    }
    assert_eq!(peers.client.channel_count(), 3);
    wait_until(|| peers.server.channel_count() == 3).await;

    peers.client.close().await;
    assert_eq!(peers.client.channel_count(), 0);
    wait_until(|| peers.server.channel_count() == 0).await;

    // A closing service refuses new channels.
    assert!(peers.client.open_channel("session").is_err());
}
