//! AsciiReaderBuilder -- fluent builder for constructing [`HfReader`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use rfidlib_ascii::builder::AsciiReaderBuilder;
//! use rfidlib_ascii::models::deskid_iso;
//! use rfidlib_core::Reader;
//! use std::time::Duration;
//!
//! # async fn example() -> rfidlib_core::Result<()> {
//! let reader = AsciiReaderBuilder::new(deskid_iso())
//!     .serial_port("/dev/ttyUSB0")
//!     .build()?;
//! reader.connect(Duration::from_secs(5)).await?;
//! let tags = reader.get_inventory().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use rfidlib_core::config::ReaderConfig;
use rfidlib_core::error::{Error, Result};
use rfidlib_core::transport::Connector;
use rfidlib_engine::{Engine, EngineConfig};
use rfidlib_transport::{SerialConnector, TcpConnector};

use crate::dialect::AsciiDialect;
use crate::models::AsciiModel;
use crate::reader::HfReader;

/// Fluent builder for [`HfReader`].
pub struct AsciiReaderBuilder {
    model: AsciiModel,
    instance: Option<String>,
    serial_port: Option<String>,
    baud_rate: Option<u32>,
    tcp: Option<(String, u16)>,
    connector: Option<Box<dyn Connector>>,
    heartbeat: Option<u32>,
    check_identity: bool,
    engine: EngineConfig,
}

impl AsciiReaderBuilder {
    pub fn new(model: AsciiModel) -> Self {
        AsciiReaderBuilder {
            model,
            instance: None,
            serial_port: None,
            baud_rate: None,
            tcp: None,
            connector: None,
            heartbeat: None,
            check_identity: true,
            engine: EngineConfig::default(),
        }
    }

    /// Name used in log output and status records (default: the model
    /// name).
    pub fn instance(mut self, name: &str) -> Self {
        self.instance = Some(name.to_string());
        self
    }

    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = Some(baud);
        self
    }

    /// Connect over TCP. Takes precedence over a serial port.
    pub fn tcp(mut self, host: &str, port: u16) -> Self {
        self.tcp = Some((host.to_string(), port));
        self
    }

    /// Connect over TCP on the model's default port.
    pub fn host(self, host: &str) -> Self {
        let port = self.model.default_tcp_port;
        self.tcp(host, port)
    }

    /// Connect through a caller-provided [`Connector`]; takes precedence
    /// over everything else.
    pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.engine.command_timeout = timeout;
        self
    }

    /// Heartbeat interval in seconds; 0 disables liveness checking
    /// (default: the model's).
    pub fn heartbeat(mut self, seconds: u32) -> Self {
        self.heartbeat = Some(seconds);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.engine.retry_delay = delay;
        self
    }

    /// Reject devices whose identity does not match the model (default:
    /// true).
    pub fn check_identity(mut self, check: bool) -> Self {
        self.check_identity = check;
        self
    }

    fn resolve_connector(&mut self) -> Result<Box<dyn Connector>> {
        if let Some(connector) = self.connector.take() {
            return Ok(connector);
        }
        if let Some((host, port)) = self.tcp.take() {
            return Ok(Box::new(TcpConnector::new(&host, port)));
        }
        if let Some(port) = self.serial_port.take() {
            let baud = self.baud_rate.unwrap_or(self.model.default_baud_rate);
            return Ok(Box::new(SerialConnector::new(&port, baud)));
        }
        Err(Error::InvalidParameter(
            "IP address or serial port must be set".into(),
        ))
    }

    pub fn build(mut self) -> Result<HfReader> {
        let connector = self.resolve_connector()?;
        let instance = self
            .instance
            .clone()
            .unwrap_or_else(|| self.model.name.to_string());
        tracing::debug!(
            instance = %instance,
            model = self.model.name,
            endpoint = %connector.describe(),
            "building reader"
        );

        let expected = self.check_identity.then(|| self.model.expected.clone());
        let reader_config = ReaderConfig {
            heartbeat: self.heartbeat.unwrap_or(self.model.default_heartbeat),
            ..Default::default()
        };
        let engine = Engine::new(
            instance,
            AsciiDialect::new(expected),
            connector,
            reader_config,
            self.engine,
        );
        Ok(HfReader::new(engine, self.model.multiplex_delay))
    }
}
