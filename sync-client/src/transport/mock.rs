//! Mock peer channel for testing.
//!
//! Allows queueing inbound frames, capturing sent frames and injecting
//! faults.

use super::{PeerChannel, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock peer channel for testing.
///
/// Starts connected. Clones share state, so a test can keep one handle
/// while the code under test owns another.
#[derive(Debug)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
}

#[derive(Debug)]
struct MockChannelInner {
    connected: bool,
    sent_frames: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    fail_next_send: Option<String>,
    fail_sends_after: Option<usize>,
    fail_next_recv: Option<String>,
    send_delay: Option<Duration>,
    close_count: usize,
}

impl Default for MockChannelInner {
    fn default() -> Self {
        Self {
            connected: true,
            sent_frames: Vec::new(),
            receive_queue: VecDeque::new(),
            fail_next_send: None,
            fail_sends_after: None,
            fail_next_recv: None,
            send_delay: None,
            close_count: 0,
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockChannelInner::default())),
        }
    }
}

impl MockChannel {
    /// Create a new, connected mock channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by the next `recv()` call.
    pub fn queue_frame(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.receive_queue.push_back(data);
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.clone()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.last().cloned()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Let `n` more sends succeed, then fail every send after that.
    pub fn fail_sends_after(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_sends_after = Some(inner.sent_frames.len() + n);
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }

    /// Sleep this long inside every send (simulates a slow link).
    pub fn set_send_delay(&self, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.send_delay = Some(delay);
    }

    /// How many times close() was called.
    pub fn close_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.close_count
    }
}

impl Clone for MockChannel {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl PeerChannel for MockChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let delay = self.inner.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }
        if inner
            .fail_sends_after
            .is_some_and(|limit| inner.sent_frames.len() >= limit)
        {
            return Err(TransportError::SendFailed("link down".to_string()));
        }

        inner.sent_frames.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_recv.take() {
            return Err(TransportError::ReceiveFailed(error));
        }

        inner
            .receive_queue
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.close_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_channel_sends_frames() {
        let channel = MockChannel::new();

        channel.send(b"frame 1").await.unwrap();
        channel.send(b"frame 2").await.unwrap();

        let sent = channel.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"frame 1");
        assert_eq!(channel.last_sent(), Some(b"frame 2".to_vec()));
    }

    #[tokio::test]
    async fn mock_channel_receives_queued_frames() {
        let channel = MockChannel::new();
        channel.queue_frame(b"one".to_vec());
        channel.queue_frame(b"two".to_vec());

        assert_eq!(channel.recv().await.unwrap(), b"one");
        assert_eq!(channel.recv().await.unwrap(), b"two");
        assert!(matches!(
            channel.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn closed_channel_rejects_io() {
        let channel = MockChannel::new();
        channel.close().await.unwrap();

        assert!(!channel.is_connected());
        assert!(matches!(
            channel.send(b"x").await,
            Err(TransportError::NotConnected)
        ));
        assert_eq!(channel.close_count(), 1);
    }

    #[tokio::test]
    async fn forced_send_failure_is_one_shot() {
        let channel = MockChannel::new();
        channel.fail_next_send("buffer full");

        assert!(matches!(
            channel.send(b"data").await,
            Err(TransportError::SendFailed(_))
        ));
        channel.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn fail_sends_after_counts_successes() {
        let channel = MockChannel::new();
        channel.send(b"before").await.unwrap();
        channel.fail_sends_after(2);

        channel.send(b"a").await.unwrap();
        channel.send(b"b").await.unwrap();
        assert!(channel.send(b"c").await.is_err());
        assert!(channel.send(b"d").await.is_err());
        assert_eq!(channel.sent_frames().len(), 3);
    }

    #[tokio::test]
    async fn forced_recv_failure_keeps_queue() {
        let channel = MockChannel::new();
        channel.queue_frame(b"data".to_vec());
        channel.fail_next_recv("timeout");

        assert!(matches!(
            channel.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));
        assert_eq!(channel.recv().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let a = MockChannel::new();
        let b = a.clone();

        a.send(b"from a").await.unwrap();
        b.send(b"from b").await.unwrap();
        assert_eq!(a.sent_frames().len(), 2);
    }
}
