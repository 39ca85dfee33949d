//! Shared harness: an in-memory transport pair and a message pump that
//! stands in for the encrypted byte stream between two peers.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use sshmux::buffer::PACKET_HEADER_LEN;
use sshmux::{
    Awaitable, Buffer, ConnectionService, DisconnectReason, InvertedShell, Result, ShellStreams,
    Transport,
};

/// Queues outgoing packets as `(command, payload)` pairs for the test
/// (or the pump) to hand to the peer.
#[derive(Default)]
pub struct TestTransport {
    outbox: Mutex<VecDeque<(u8, Vec<u8>)>>,
    disconnects: Mutex<Vec<(DisconnectReason, String)>>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        // Surface the crate's log lines when a test runs with RUST_LOG.
        let _ = env_logger::try_init();
        Arc::new(Self::default())
    }

    /// The oldest unsent packet as `(command, full payload)`; the
    /// payload still starts with the command byte, as a real transport
    /// would deliver it.
    pub fn pop(&self) -> Option<(u8, Vec<u8>)> {
        self.outbox.lock().pop_front()
    }

    /// The payload of the oldest unsent packet as a read-positioned
    /// buffer, asserting its command byte.
    #[allow(dead_code)]
    pub fn expect(&self, cmd: u8) -> Buffer {
        let (got, payload) = self.pop().expect("no packet queued");
        assert_eq!(got, cmd, "unexpected message type");
        let mut buf = Buffer::from_vec(payload);
        buf.set_rpos(1);
        buf
    }

    #[allow(dead_code)]
    pub fn disconnects(&self) -> Vec<(DisconnectReason, String)> {
        self.disconnects.lock().clone()
    }
}

impl Transport for TestTransport {
    fn write_packet(&self, packet: Buffer) -> Result<()> {
        let written = packet.written();
        assert!(written.len() > PACKET_HEADER_LEN, "empty packet");
        self.outbox.lock().push_back((
            written[PACKET_HEADER_LEN],
            written[PACKET_HEADER_LEN..].to_vec(),
        ));
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason, message: &str) {
        self.disconnects.lock().push((reason, message.to_owned()));
    }
}

/// Continuously deliver each side's outgoing packets to the other
/// side's connection service, like the two encrypted byte streams
/// would. Aborts with the returned handle.
#[allow(dead_code)]
pub fn spawn_pump(
    a_transport: Arc<TestTransport>,
    a_service: Arc<ConnectionService>,
    b_transport: Arc<TestTransport>,
    b_service: Arc<ConnectionService>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut idle = true;
            while let Some((cmd, payload)) = a_transport.pop() {
                idle = false;
                let mut buf = Buffer::from_vec(payload);
                buf.set_rpos(1);
                if let Err(e) = b_service.process(cmd, &mut buf).await {
                    log::debug!("b side dropped message {}: {}", cmd, e);
                }
            }
            while let Some((cmd, payload)) = b_transport.pop() {
                idle = false;
                let mut buf = Buffer::from_vec(payload);
                buf.set_rpos(1);
                if let Err(e) = a_service.process(cmd, &mut buf).await {
                    log::debug!("a side dropped message {}: {}", cmd, e);
                }
            }
            if idle {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    })
}

/// Poll `cond` until it holds or the timeout expires.
#[allow(dead_code)]
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

/// A shell that copies its stdin to its stdout and exits 0 when stdin
/// closes.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct EchoShell;

#[async_trait]
impl InvertedShell for EchoShell {
    async fn spawn(
        &self,
        _command: Option<&str>,
        _env: &[(String, String)],
    ) -> io::Result<ShellStreams> {
        let (session_stdin, mut shell_stdin) = tokio::io::duplex(64 * 1024);
        let (mut shell_stdout, session_stdout) = tokio::io::duplex(64 * 1024);
        let exit_status = Awaitable::new();

        let exit = exit_status.clone();
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut shell_stdin, &mut shell_stdout).await;
            let _ = shell_stdout.shutdown().await;
            exit.set(0);
        });

        Ok(ShellStreams {
            stdin: Box::new(session_stdin),
            stdout: Box::new(session_stdout),
            stderr: None,
            exit_status,
        })
    }
}
