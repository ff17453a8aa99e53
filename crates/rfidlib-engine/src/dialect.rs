//! The seam between the shared engine and a wire dialect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rfidlib_core::error::Result;

use crate::session::Session;

/// One reader wire dialect: framing, handshake and line classification.
///
/// The engine drives the connection lifecycle and calls into the dialect
/// for everything that depends on the protocol. Dialects keep their own
/// per-connection parser state (for example whether antenna errors are
/// tolerated) and publish results through the [`Session`].
#[async_trait]
pub trait Dialect: Send + Sync + 'static {
    /// Line separator in effect right after the transport opens.
    fn initial_separator(&self) -> u8;

    /// Handle a line received while the reader is being configured.
    ///
    /// Only reply lines should reach the reply queue; event lines the
    /// device may still be pushing from an earlier session are dropped.
    fn route_config_line(&self, session: &Session, line: &str);

    /// Handle a line received while the reader is running: dispatch
    /// asynchronous events, queue everything else as a reply.
    fn route_line(&self, session: &Session, line: &str, timestamp: DateTime<Utc>);

    /// Handshake, identity check and dialect specific setup.
    async fn configure(&self, session: &Session) -> Result<()>;

    /// Program the device heartbeat interval (seconds, 0 = off).
    async fn set_heartbeat(&self, session: &Session, seconds: u32) -> Result<()>;

    /// Enable or disable input change events. Fails with
    /// [`Error::Unsupported`](rfidlib_core::Error::Unsupported) when the
    /// device has no such events.
    async fn enable_input_events(&self, session: &Session, enable: bool) -> Result<()>;

    /// Stop every continuous operation before the connection is closed.
    async fn stop_activity(&self, session: &Session) -> Result<()>;
}
