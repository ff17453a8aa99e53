//! Mock transport for deterministic testing of reader dialects.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Reader protocols also push data nobody asked for
//! (heartbeats, continuous inventory lines), so every mock hands out a
//! [`MockLink`] that keeps working after the transport has been boxed and
//! moved into a reader's IO task: it injects unsolicited bytes, simulates a
//! peer hang-up, and exposes the log of sent data.
//!
//! # Example
//!
//! ```
//! use rfidlib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine sends this request, the reader answers with these lines.
//! mock.expect(b"ATI\r", b"ATI\r\n+SW: PULSAR_LR 0102\r\nOK\r\n");
//! let link = mock.link();
//! link.inject(b"+HBT\r\n");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to make readable when the matching request is received.
    response: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be returned by `receive()`.
    incoming: VecDeque<u8>,
    connected: bool,
    /// The simulated peer closed the connection.
    hung_up: bool,
    sent_log: Vec<Vec<u8>>,
}

/// A mock [`Transport`] for testing reader dialects without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; the
/// corresponding response is appended to the receive buffer. Data that does
/// not match, or arrives after the expectations ran out, is an error.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    readable: Arc<Notify>,
}

/// Handle to a [`MockTransport`] that stays usable after the transport moved.
#[derive(Debug, Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    readable: Arc<Notify>,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                expectations: VecDeque::new(),
                incoming: VecDeque::new(),
                connected: true,
                hung_up: false,
                sent_log: Vec::new(),
            })),
            readable: Arc::new(Notify::new()),
        }
    }

    /// Add an expected request/response pair.
    ///
    /// An empty `response` models a command the reader does not answer.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.link().expect(request, response);
    }

    /// A handle for injecting data and inspecting the transport later.
    pub fn link(&self) -> MockLink {
        MockLink {
            state: Arc::clone(&self.state),
            readable: Arc::clone(&self.readable),
        }
    }

    /// Return all data that has been sent through this transport.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.link().sent_data()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.link().remaining_expectations()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.state.lock().connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Add an expected request/response pair.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.state.lock().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Make bytes readable as if the reader had sent them unprompted.
    pub fn inject(&self, data: &[u8]) {
        self.state.lock().incoming.extend(data.iter().copied());
        self.readable.notify_one();
    }

    /// Simulate the peer closing the connection.
    pub fn hang_up(&self) {
        self.state.lock().hung_up = true;
        self.readable.notify_one();
    }

    /// All data sent through the transport, one entry per `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent_log.clone()
    }

    /// The sent data decoded as text, for readable assertions.
    pub fn sent_text(&self) -> Vec<String> {
        self.state
            .lock()
            .sent_log
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    pub fn remaining_expectations(&self) -> usize {
        self.state.lock().expectations.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        let Some(expectation) = state.expectations.pop_front() else {
            return Err(Error::Protocol(format!(
                "no more expectations in mock transport, got {:?}",
                String::from_utf8_lossy(data)
            )));
        };
        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }
        if !expectation.response.is_empty() {
            state.incoming.extend(expectation.response);
            drop(state);
            self.readable.notify_one();
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.state.lock();
                if !state.connected {
                    return Err(Error::NotConnected);
                }
                if !state.incoming.is_empty() {
                    let n = state.incoming.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                if state.hung_up {
                    return Err(Error::ConnectionLost);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.incoming.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATI\r", b"+SW: PULSAR_LR 0102\r\nOK\r\n");

        mock.send(b"ATI\r").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"+SW: PULSAR_LR 0102\r\nOK\r\n");
    }

    #[tokio::test]
    async fn mock_transport_tracks_sent_data() {
        let mut mock = MockTransport::new();
        mock.expect(b"A\r", b"");
        mock.expect(b"B\r", b"");

        mock.send(b"A\r").await.unwrap();
        mock.send(b"B\r").await.unwrap();

        let link = mock.link();
        assert_eq!(link.sent_data().len(), 2);
        assert_eq!(link.sent_text(), vec!["A\r".to_string(), "B\r".to_string()]);
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATI\r", b"OK\r\n");

        let result = mock.send(b"AT+INV\r").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();
        let result = mock.send(b"x").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_receive_without_data_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn injected_data_wakes_receiver() {
        let mut mock = MockTransport::new();
        let link = mock.link();
        let injector = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            link.inject(b"+HBT\r\n");
        });

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf[..n], b"+HBT\r\n");
        injector.await.unwrap();
    }

    #[tokio::test]
    async fn hang_up_reports_connection_lost() {
        let mut mock = MockTransport::new();
        let link = mock.link();
        link.inject(b"OK\r\n");
        link.hang_up();

        let mut buf = [0u8; 64];
        // Buffered data is delivered before the hang-up.
        assert!(mock.receive(&mut buf, Duration::from_millis(10)).await.is_ok());
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::ConnectionLost));
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let mut mock = MockTransport::new();
        let link = mock.link();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());
        assert!(!link.is_connected());

        let result = mock.send(b"x").await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_set_connected() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_remaining_expectations() {
        let mut mock = MockTransport::new();
        mock.expect(b"1", b"");
        mock.expect(b"2", b"");
        assert_eq!(mock.remaining_expectations(), 2);

        mock.send(b"1").await.unwrap();
        assert_eq!(mock.remaining_expectations(), 1);
    }

    #[tokio::test]
    async fn mock_transport_partial_receive() {
        let mut mock = MockTransport::new();
        mock.expect(b"q", b"ABCD");
        mock.send(b"q").await.unwrap();

        let mut buf = [0u8; 2];
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"AB");
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"CD");
    }
}
