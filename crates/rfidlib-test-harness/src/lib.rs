//! rfidlib-test-harness: Mock transports and connectors for rfidlib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! reader dialects without real hardware, [`MockLink`] for pushing
//! unsolicited reader output into a running reader, and [`MockConnector`]
//! for exercising connect and reconnect paths.

pub mod mock_connector;
pub mod mock_transport;

pub use mock_connector::MockConnector;
pub use mock_transport::{MockLink, MockTransport};
