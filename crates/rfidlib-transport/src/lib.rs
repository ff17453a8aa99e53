//! Transport implementations for rfidlib.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](rfidlib_core::Transport) and [`Connector`](rfidlib_core::Connector)
//! traits from `rfidlib-core`:
//!
//! - [`SerialTransport`] / [`SerialConnector`]: USB virtual COM ports and RS-232
//! - [`TcpTransport`] / [`TcpConnector`]: Ethernet readers on a raw TCP port
//!
//! # Example
//!
//! ```no_run
//! use rfidlib_transport::TcpConnector;
//! use rfidlib_core::transport::Connector;
//!
//! # async fn example() -> rfidlib_core::Result<()> {
//! let connector = TcpConnector::new("192.168.2.239", 10001);
//! let transport = connector.open().await?;
//! assert!(transport.is_connected());
//! # Ok(())
//! # }
//! ```

pub mod serial;
pub mod tcp;

pub use serial::{
    DEFAULT_BAUD_RATE, DataBits, FlowControl, Parity, SerialConfig, SerialConnector,
    SerialTransport, StopBits,
};
pub use tcp::{DEFAULT_PORT, TcpConnector, TcpTransport};
