//! In-memory transport doubles shared by the unit tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Buffer, PACKET_HEADER_LEN};
use crate::error::{DisconnectReason, Result};
use crate::transport::Transport;

/// One captured outgoing packet, split into command byte and payload.
pub(crate) struct RecordedPacket {
    pub(crate) cmd: u8,
    payload: Vec<u8>,
}

impl RecordedPacket {
    /// The payload after the command byte, ready for `get_*` calls.
    pub(crate) fn payload(&self) -> Buffer {
        Buffer::from_vec(self.payload.clone())
    }
}

/// A [`Transport`] that records instead of sending.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<RecordedPacket>>,
    disconnects: Mutex<Vec<(DisconnectReason, String)>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything captured so far.
    pub(crate) fn take(&self) -> Vec<RecordedPacket> {
        std::mem::take(&mut *self.sent.lock())
    }

    #[allow(dead_code)]
    pub(crate) fn disconnects(&self) -> Vec<(DisconnectReason, String)> {
        self.disconnects.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn write_packet(&self, packet: Buffer) -> Result<()> {
        let written = packet.written();
        assert!(
            written.len() > PACKET_HEADER_LEN,
            "packet without a command byte"
        );
        self.sent.lock().push(RecordedPacket {
            cmd: written[PACKET_HEADER_LEN],
            payload: written[PACKET_HEADER_LEN + 1..].to_vec(),
        });
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason, message: &str) {
        self.disconnects.lock().push((reason, message.to_owned()));
    }
}
