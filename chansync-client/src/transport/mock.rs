//! Mock push transport for testing.
//!
//! Allows queueing server events, capturing sent commands, forcing failures
//! and dropping the session from the "server" side.

use super::{Credential, PushTransport, TransportError};
use async_trait::async_trait;
use chansync_types::{ClientCommand, ServerEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while the engine owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connect_count: u32,
    last_credential: Option<Credential>,
    sent_frames: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    failing_connects: Vec<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a raw frame to be returned by `recv()`.
    pub fn queue_frame(&self, frame: Vec<u8>) {
        self.lock().receive_queue.push_back(frame);
        self.wake.notify_waiters();
    }

    /// Queue a server event to be returned by `recv()`.
    pub fn queue_event(&self, event: &ServerEvent) {
        if let Ok(frame) = event.to_bytes() {
            self.queue_frame(frame);
        }
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent_frames.clone()
    }

    /// Get all sent frames decoded as commands. Undecodable frames are skipped.
    pub fn sent_commands(&self) -> Vec<ClientCommand> {
        self.lock()
            .sent_frames
            .iter()
            .filter_map(|frame| ClientCommand::from_bytes(frame).ok())
            .collect()
    }

    /// Forget everything sent so far.
    pub fn clear_sent(&self) {
        self.lock().sent_frames.clear();
    }

    /// How many times `connect()` was called.
    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    /// The credential of the most recent connect attempt.
    pub fn last_credential(&self) -> Option<Credential> {
        self.lock().last_credential.clone()
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().failing_connects.push(error.to_string());
    }

    /// Cause the next `count` connect() calls to fail.
    pub fn fail_connects(&self, count: usize, error: &str) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner.failing_connects.push(error.to_string());
        }
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
        self.wake.notify_waiters();
    }

    /// Simulate the server dropping the session.
    pub fn drop_connection(&self) {
        self.lock().connected = false;
        self.wake.notify_waiters();
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.connect_count += 1;
        inner.last_credential = Some(credential.clone());

        // Check for forced failure
        if !inner.failing_connects.is_empty() {
            let error = inner.failing_connects.remove(0);
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_frames.push(frame.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            // Register before checking so a wake between check and await is not lost.
            let woken = self.wake.notified();
            {
                let mut inner = self.lock();
                if !inner.connected {
                    return Err(TransportError::ConnectionClosed);
                }
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }
                if let Some(frame) = inner.receive_queue.pop_front() {
                    return Ok(frame);
                }
            }
            woken.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        self.wake.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn token() -> Credential {
        Credential::new("token")
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect(&token()).await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.last_credential(), Some(token()));
    }

    #[tokio::test]
    async fn mock_transport_records_commands() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();

        let join = ClientCommand::join("general".into());
        transport.send(&join.to_bytes().unwrap()).await.unwrap();
        transport.send(b"not json").await.unwrap();

        assert_eq!(transport.sent_frames().len(), 2);
        assert_eq!(transport.sent_commands(), vec![join]);

        transport.clear_sent();
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn mock_transport_receives_queued_events() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();

        transport.queue_event(&ServerEvent::HeartbeatAck);
        let frame = transport.recv().await.unwrap();

        assert_eq!(ServerEvent::from_bytes(&frame).unwrap(), ServerEvent::HeartbeatAck);
    }

    #[tokio::test]
    async fn recv_waits_for_late_frame() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();

        let producer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.queue_event(&ServerEvent::HeartbeatAck);
        });

        let frame = tokio::time::timeout(Duration::from_secs(1), transport.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());
    }

    #[tokio::test]
    async fn drop_connection_ends_pending_recv() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();

        let server = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.drop_connection();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), transport.recv())
            .await
            .unwrap();
        assert_eq!(result, Err(TransportError::ConnectionClosed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn forced_connect_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.fail_connects(2, "refused");

        assert!(transport.connect(&token()).await.is_err());
        assert!(transport.connect(&token()).await.is_err());
        transport.connect(&token()).await.unwrap();

        assert_eq!(transport.connect_count(), 3);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let transport = MockTransport::new();
        transport.connect(&token()).await.unwrap();
        transport.queue_frame(b"data".to_vec());
        transport.fail_next_recv("timeout");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        // Next recv should work (and get the queued data)
        let data = transport.recv().await.unwrap();
        assert_eq!(data, b"data");
    }

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect(&token()).await.unwrap();
        assert!(transport2.is_connected());

        transport1.send(b"from t1").await.unwrap();
        transport2.send(b"from t2").await.unwrap();

        assert_eq!(transport1.sent_frames().len(), 2);
    }
}
