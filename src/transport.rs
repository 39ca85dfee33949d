use crate::buffer::Buffer;
use crate::error::{DisconnectReason, Result};

/// The encrypted packet transport this layer runs on top of.
///
/// The transport owns key exchange, encryption, MAC and rekeying; the
/// connection layer only ever sees framed payloads. Implementations must
/// make [`write_packet`](Self::write_packet) non-blocking (enqueue and
/// return) and must deliver incoming packets to the session serially.
///
/// Outgoing buffers are produced by [`Buffer::for_packet`]: the first
/// [`PACKET_HEADER_LEN`](crate::buffer::PACKET_HEADER_LEN) bytes are left
/// for the transport to stamp the `packet_length`/`padding_length` header
/// in place, and the payload starts right after.
///
/// Incoming packets are handed upstream as `(cmd, buffer)` where the
/// buffer holds the whole payload — message-type byte included — with
/// the read cursor positioned just past that byte. Some consumers (the
/// auth service's multi-message methods) rewind to re-read it.
pub trait Transport: Send + Sync {
    /// Queue one payload for sending. Packets go out in call order.
    fn write_packet(&self, packet: Buffer) -> Result<()>;

    /// Tear the session down with an `SSH_MSG_DISCONNECT`.
    fn disconnect(&self, reason: DisconnectReason, message: &str);
}
