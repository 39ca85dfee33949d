use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Smallest packet size a channel will advertise.
pub const MIN_PACKET_SIZE: u32 = 32 * 1024;
/// Largest packet size a channel will advertise.
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Flow-control credit for one direction of a channel, measured in bytes
/// (RFC 4254 §5.2).
///
/// A send window is drained with [`consume`](Self::consume) /
/// [`reserve`](Self::reserve), which suspend the writer when the peer has
/// not granted enough credit, and refilled by `CHANNEL_WINDOW_ADJUST`
/// via [`expand`](Self::expand). A receive window is drained with
/// [`check_consume`](Self::check_consume), which treats overdraft as a
/// protocol violation by the peer.
#[derive(Debug)]
pub struct Window {
    size: Mutex<u32>,
    initial: u32,
    packet_size: u32,
    notify: Notify,
}

impl Window {
    /// A window holding `initial` bytes of credit. `packet_size` is
    /// clamped to `[MIN_PACKET_SIZE, MAX_PACKET_SIZE]`.
    pub fn new(initial: u32, packet_size: u32) -> Self {
        Window {
            size: Mutex::new(initial),
            initial,
            packet_size: packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE),
            notify: Notify::new(),
        }
    }

    /// Current credit.
    pub fn size(&self) -> u32 {
        *self.size.lock()
    }

    /// The credit the window started with.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Largest payload a single `CHANNEL_DATA` may carry in this
    /// direction.
    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Take exactly `n` bytes of credit, suspending until the peer has
    /// granted enough.
    pub async fn consume(&self, n: u32) {
        loop {
            let notified = self.notify.notified();
            {
                let mut size = self.size.lock();
                if *size >= n {
                    *size -= n;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Take up to `max` bytes of credit (at least one), suspending while
    /// the window is empty. Returns the amount actually taken; writers use
    /// this to chunk large payloads against a shrinking window.
    pub async fn reserve(&self, max: u32) -> u32 {
        loop {
            let notified = self.notify.notified();
            {
                let mut size = self.size.lock();
                if *size > 0 && max > 0 {
                    let taken = max.min(*size);
                    *size -= taken;
                    return taken;
                }
                if max == 0 {
                    return 0;
                }
            }
            notified.await;
        }
    }

    /// Take `n` bytes of credit from a receive window. Overdraft is a
    /// protocol error (the peer wrote past the window we granted).
    /// `Ok(true)` signals that credit dropped below one packet and a
    /// `CHANNEL_WINDOW_ADJUST` should be sent to refill the peer's view.
    pub fn check_consume(&self, n: u32) -> Result<bool> {
        let mut size = self.size.lock();
        if n > *size {
            return Err(Error::Protocol(format!(
                "peer exceeded window: wrote {} with {} remaining",
                n, *size
            )));
        }
        *size -= n;
        Ok(*size < self.packet_size)
    }

    /// Grant `n` more bytes of credit and wake blocked writers. Credit
    /// saturates at `u32::MAX`.
    pub fn expand(&self, n: u32) {
        {
            let mut size = self.size.lock();
            *size = size.saturating_add(n);
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn packet_size_is_clamped() {
        assert_eq!(Window::new(0, 1024).packet_size(), MIN_PACKET_SIZE);
        assert_eq!(Window::new(0, u32::MAX).packet_size(), MAX_PACKET_SIZE);
        assert_eq!(Window::new(0, 65536).packet_size(), 65536);
    }

    #[tokio::test]
    async fn consume_to_zero_succeeds_and_one_more_blocks() {
        let w = Arc::new(Window::new(4096, MIN_PACKET_SIZE));
        w.consume(4096).await;
        assert_eq!(w.size(), 0);

        let blocked = {
            let w = Arc::clone(&w);
            tokio::spawn(async move { w.consume(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        w.expand(1);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("writer did not wake")
            .unwrap();
        assert_eq!(w.size(), 0);
    }

    #[tokio::test]
    async fn reserve_takes_partial_credit() {
        let w = Window::new(100, MIN_PACKET_SIZE);
        assert_eq!(w.reserve(1000).await, 100);
        w.expand(5);
        assert_eq!(w.reserve(3).await, 3);
        assert_eq!(w.size(), 2);
    }

    #[test]
    fn receive_overdraft_is_a_protocol_error() {
        let w = Window::new(10, MIN_PACKET_SIZE);
        assert!(w.check_consume(10).unwrap());
        assert!(matches!(w.check_consume(1), Err(Error::Protocol(_))));
    }

    #[test]
    fn check_consume_reports_low_water() {
        let w = Window::new(MIN_PACKET_SIZE * 2, MIN_PACKET_SIZE);
        assert!(!w.check_consume(MIN_PACKET_SIZE).unwrap());
        assert!(w.check_consume(1).unwrap());
    }

    #[test]
    fn expand_saturates() {
        let w = Window::new(u32::MAX - 1, MIN_PACKET_SIZE);
        w.expand(100);
        assert_eq!(w.size(), u32::MAX);
    }
}
