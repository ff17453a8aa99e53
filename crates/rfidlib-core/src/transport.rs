//! Transport and connector traits for reader communication.
//!
//! The [`Transport`] trait abstracts over the physical byte pipe to a reader
//! (serial line, TCP socket, or a mock in tests). A [`Connector`] knows how
//! to open a fresh transport; readers hold a connector rather than a
//! transport so they can reconnect after the link is lost.
//!
//! Line framing is not a transport concern: the engine's IO task splits the
//! byte stream on the active separator.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a reader.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the reader.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the reader into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline, and
    /// [`Error::ConnectionLost`](crate::error::Error::ConnectionLost) when the
    /// peer has gone away.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Opens transports to one particular reader.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport.
    async fn open(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable endpoint description, used in log output.
    fn describe(&self) -> String;
}
