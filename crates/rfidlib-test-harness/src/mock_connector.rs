//! Mock connector handing out prepared transports.
//!
//! Readers open their transport through a [`Connector`] on every connect
//! and reconnect. [`MockConnector`] serves pre-built [`MockTransport`]s in
//! order and counts open attempts, so tests can assert how often a reader
//! tried to (re)connect. When the queue is empty, `open()` fails as if the
//! reader were unreachable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::transport::{Connector, Transport};

use crate::mock_transport::MockTransport;

/// A [`Connector`] serving queued [`MockTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    transports: Arc<Mutex<VecDeque<MockTransport>>>,
    opens: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose first `open()` yields `transport`.
    pub fn with(transport: MockTransport) -> Self {
        let connector = Self::new();
        connector.push(transport);
        connector
    }

    /// Queue a transport for a later `open()`.
    pub fn push(&self, transport: MockTransport) {
        self.transports.lock().push_back(transport);
    }

    /// Number of `open()` calls so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.transports.lock().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(Error::Transport("connection refused: mock".into())),
        }
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_transports_in_order_and_counts() {
        let connector = MockConnector::new();
        let first = MockTransport::new();
        let first_link = first.link();
        connector.push(first);
        connector.push(MockTransport::new());

        let mut t = connector.open().await.unwrap();
        first_link.expect(b"x", b"");
        t.send(b"x").await.unwrap();
        assert_eq!(first_link.sent_text(), vec!["x".to_string()]);

        assert!(connector.open().await.is_ok());
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn empty_queue_fails() {
        let connector = MockConnector::new();
        let result = connector.open().await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(connector.open_count(), 1);
    }
}
