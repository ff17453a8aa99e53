//! AtReaderBuilder -- fluent builder for constructing [`AtReader`] instances.
//!
//! Separates configuration from construction so that callers can choose the
//! connection, timing and identity checks before the reader exists. The
//! reader is returned unconnected; [`connect()`](rfidlib_core::Reader::connect)
//! opens the transport and configures the device.
//!
//! # Example
//!
//! ```no_run
//! use rfidlib_at::builder::AtReaderBuilder;
//! use rfidlib_at::models::pulsar_lr;
//! use rfidlib_core::Reader;
//! use std::time::Duration;
//!
//! # async fn example() -> rfidlib_core::Result<()> {
//! let reader = AtReaderBuilder::new(pulsar_lr())
//!     .instance("gate-1")
//!     .tcp("192.168.2.239", 10001)
//!     .command_timeout(Duration::from_secs(2))
//!     .build_uhf()?;
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

use crate::dialect::AtDialect;
use crate::models::AtModel;
use crate::reader::{AtReader, NfcReader, ReaderFamily, UhfReader};

/// Fluent builder for [`AtReader`].
///
/// Defaults come from the [`AtModel`] and [`EngineConfig`], so the simplest
/// usage is:
///
/// ```ignore
/// let reader = AtReaderBuilder::new(deskid_nfc())
///     .serial_port("/dev/ttyUSB0")
///     .build_nfc()?;
/// ```
pub struct AtReaderBuilder {
    model: AtModel,
    instance: Option<String>,
    serial_port: Option<String>,
    baud_rate: Option<u32>,
    tcp: Option<(String, u16)>,
    connector: Option<Box<dyn Connector>>,
    heartbeat: Option<u32>,
    check_identity: bool,
    engine: EngineConfig,
}

impl AtReaderBuilder {
    /// Create a new builder for the given model.
    pub fn new(model: AtModel) -> Self {
        AtReaderBuilder {
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

    /// Connect over a serial port (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the default baud rate of the model.
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = Some(baud);
        self
    }

    /// Connect over TCP. Takes precedence over a serial port.
    pub fn tcp(mut self, host: &str, port: u16) -> Self {
        self.tcp = Some((host.to_string(), port));
        self
    }

    /// Connect through a caller-provided [`Connector`]. This is the entry
    /// point for testing (pass a `MockConnector` from
    /// `rfidlib-test-harness`) and takes precedence over everything else.
    pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Timeout for the reply of a single command (default: 2 s).
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

    /// Delay before a failed configuration is retried (default: 5 s).
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

    /// Capacity of the event channel handed out by `subscribe()`.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.engine.event_capacity = capacity;
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
            "serial_port, tcp or connector is required for build()".into(),
        ))
    }

    /// Build a reader of family `F`, which must match the model.
    pub fn build<F: ReaderFamily>(mut self) -> Result<AtReader<F>> {
        if self.model.family != F::FAMILY {
            return Err(Error::InvalidParameter(format!(
                "{} is not a {:?} reader",
                self.model.name,
                F::FAMILY
            )));
        }
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
        let dialect = AtDialect::new(self.model.family, expected);
        let reader_config = ReaderConfig {
            heartbeat: self.heartbeat.unwrap_or(self.model.default_heartbeat),
            antenna: 1,
            ..Default::default()
        };
        let engine = Engine::new(instance, dialect, connector, reader_config, self.engine);
        Ok(AtReader::new(engine))
    }

    /// Build a UHF reader.
    pub fn build_uhf(self) -> Result<UhfReader> {
        self.build()
    }

    /// Build an NFC reader.
    pub fn build_nfc(self) -> Result<NfcReader> {
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rfidlib_core::status::Status;
    use rfidlib_core::tag::Tag;
    use rfidlib_core::Reader;
    use rfidlib_test_harness::{MockConnector, MockLink, MockTransport};

    use crate::inventory::NfcMode;
    use crate::models::{deskid_nfc, deskid_uhf_v2, pulsar_lr};
    use crate::settings::{Mask, MemoryBank};

    /// Expect `command` and answer with its echo, `lines` and `OK`.
    fn ok(mock: &mut MockTransport, command: &str, lines: &[&str]) {
        let mut reply = format!("{command}\r\n");
        for line in lines {
            reply.push_str(line);
            reply.push_str("\r\n");
        }
        reply.push_str("OK\r\n");
        mock.expect(format!("{command}\r").as_bytes(), reply.as_bytes());
    }

    /// Expect `command` and answer with its echo, `message` and `ERROR`.
    fn error(mock: &mut MockTransport, command: &str, message: &str) {
        let reply = format!("{command}\r\n{message}\r\nERROR\r\n");
        mock.expect(format!("{command}\r").as_bytes(), reply.as_bytes());
    }

    fn configure_uhf(mock: &mut MockTransport, hardware: &str) {
        mock.expect(b"ATE1\r", b"OK\r\n");
        error(mock, "AT+BINV", "+BINV: <is not running>");
        error(mock, "AT+BINVR", "+BINVR: <is not running>");
        ok(mock, "AT+INVS?", &["+INVS: 0,1,0"]);
        ok(
            mock,
            "ATI",
            &[
                &format!("+SW: {hardware} 0104"),
                &format!("+HW: {hardware} 0100"),
                "+SERIAL: 2020090817420000",
            ],
        );
        ok(mock, "AT+ANT?", &["+ANT: 1"]);
        ok(mock, "AT+HBT=0", &[]);
        ok(mock, "AT+IEV=0", &[]);
    }

    async fn connected_uhf() -> (UhfReader, MockLink) {
        let mut mock = MockTransport::new();
        configure_uhf(&mut mock, "PULSAR_LR");
        let link = mock.link();
        let reader = AtReaderBuilder::new(pulsar_lr())
            .instance("test")
            .heartbeat(0)
            .connector(Box::new(MockConnector::with(mock)))
            .build_uhf()
            .unwrap();
        reader.connect(Duration::from_secs(5)).await.unwrap();
        (reader, link)
    }

    fn link_ok(link: &MockLink, command: &str, lines: &[&str]) {
        let mut reply = format!("{command}\r\n");
        for line in lines {
            reply.push_str(line);
            reply.push_str("\r\n");
        }
        reply.push_str("OK\r\n");
        link.expect(format!("{command}\r").as_bytes(), reply.as_bytes());
    }

    // =======================================================================
    // Construction
    // =======================================================================

    #[test]
    fn connection_is_required() {
        let result = AtReaderBuilder::new(pulsar_lr()).build_uhf();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn family_must_match_model() {
        let result = AtReaderBuilder::new(deskid_nfc())
            .connector(Box::new(MockConnector::new()))
            .build_uhf();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn defaults_come_from_model() {
        let reader = AtReaderBuilder::new(pulsar_lr())
            .tcp("192.168.2.239", 10001)
            .build_uhf()
            .unwrap();
        assert_eq!(reader.instance(), "PULSAR LR");
        assert_eq!(reader.session().with_config(|c| c.heartbeat), 10);
        assert!(!reader.is_connected());

        let reader = AtReaderBuilder::new(deskid_uhf_v2())
            .serial_port("/dev/ttyUSB0")
            .build_uhf()
            .unwrap();
        assert_eq!(reader.session().with_config(|c| c.heartbeat), 0);
    }

    // =======================================================================
    // Configuration
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn connect_configures_uhf_reader() {
        let (reader, link) = connected_uhf().await;

        assert!(reader.is_running());
        let info = reader.reader_info();
        assert_eq!(info.hardware_name, "PULSAR_LR");
        assert_eq!(info.serial_number.as_deref(), Some("2020090817420000"));
        let fields = reader.session().with_config(|c| c.inventory);
        assert!(fields.rssi && !fields.tid);
        assert_eq!(link.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_reader_is_rejected() {
        let mut mock = MockTransport::new();
        configure_uhf(&mut mock, "DESKID_UHF_V2");
        let reader = AtReaderBuilder::new(pulsar_lr())
            .heartbeat(0)
            .connector(Box::new(MockConnector::with(mock)))
            .build_uhf()
            .unwrap();

        let err = reader.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m == "Wrong reader type!"));
        assert!(reader.status().status.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn identity_check_can_be_disabled() {
        let mut mock = MockTransport::new();
        configure_uhf(&mut mock, "DESKID_UHF_V2");
        let reader = AtReaderBuilder::new(pulsar_lr())
            .heartbeat(0)
            .check_identity(false)
            .connector(Box::new(MockConnector::with(mock)))
            .build_uhf()
            .unwrap();

        reader.connect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reader.reader_info().hardware_name, "DESKID_UHF_V2");
    }

    #[tokio::test(start_paused = true)]
    async fn nfc_configuration_forces_tag_details() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATE1\r", b"OK\r\n");
        ok(&mut mock, "AT+BINV", &[]);
        ok(
            &mut mock,
            "ATI",
            &["+SW: DeskID_NFC 0101", "+HW: DeskID_NFC 0100", "+SERIAL: 1"],
        );
        error(&mut mock, "AT+ANT?", "");
        ok(&mut mock, "AT+MOD?", &["+MOD: ISO15"]);
        ok(&mut mock, "AT+INVS?", &["+INVS: 0,0,0"]);
        ok(&mut mock, "AT+INVS=1,0,0", &[]);
        ok(&mut mock, "AT+HBT=0", &[]);
        ok(&mut mock, "AT+IEV=0", &[]);
        let reader = AtReaderBuilder::new(deskid_nfc())
            .connector(Box::new(MockConnector::with(mock)))
            .build_nfc()
            .unwrap();

        reader.connect(Duration::from_secs(5)).await.unwrap();
        assert!(reader.session().with_config(|c| c.inventory.tag_details));
        assert_eq!(reader.dialect().nfc_mode(), NfcMode::Iso15);
        assert_eq!(reader.session().with_config(|c| c.antenna), 1);
    }

    // =======================================================================
    // Commands
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn inventory_fires_callback() {
        let (reader, link) = connected_uhf().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reader.set_cb_inventory(Some(Arc::new(move |tags: &[Tag]| {
            sink.lock().push(tags.len())
        })));

        link_ok(
            &link,
            "AT+INV",
            &[
                "+INV: 3034257BF468D480000003EB,-55",
                "+INV: 3034257BF468D480000003EC,-60",
                "+INV: <ROUND FINISHED, ANT=1>",
            ],
        );
        let tags = reader.get_inventory().await.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].rssi, Some(-55));
        assert_eq!(tags[0].antenna, Some(1));
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_antenna_error_fails() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+INV", &["+INV: <Antenna Error>"]);

        let err = reader.get_inventory().await.unwrap_err();
        assert!(matches!(err, Error::Antenna { antenna: 1, .. }));
        assert_eq!(err.to_string(), "Antenna Error - Antenna 1");
    }

    #[tokio::test(start_paused = true)]
    async fn multi_inventory_collects_errors_when_ignored() {
        let (reader, link) = connected_uhf().await;
        link_ok(
            &link,
            "AT+MINV",
            &[
                "+MINV: 3034257BF468D480000003EB,-55",
                "+MINV: <ROUND FINISHED, ANT=1>",
                "+MINV: <Antenna Error>",
                "+MINV: <ROUND FINISHED, ANT=2>",
            ],
        );

        let tags = reader.get_inventory_multi(true).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].antenna, Some(1));
        assert!(reader.session().config().errors.contains_key("Antenna 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_antennas_reports_failed_antenna() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+ANT?", &["+ANT: 2"]);
        for antenna in 1..=4 {
            link_ok(&link, &format!("AT+ANT={antenna}"), &[]);
            if antenna == 3 {
                link_ok(&link, "AT+INV", &["+INV: <Antenna Error>"]);
            } else {
                link_ok(&link, "AT+INV", &["+INV: <NO TAGS FOUND>"]);
            }
        }
        link_ok(&link, "AT+ANT=2", &[]);

        let err = reader.check_antennas().await.unwrap_err();
        assert!(matches!(err, Error::Reader(ref m) if m == "Antenna error: 3"));
        assert_eq!(link.remaining_expectations(), 0);
        assert_eq!(reader.session().with_config(|c| c.antenna), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn check_antennas_restores_antenna_after_error() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+ANT?", &["+ANT: 1"]);
        link_ok(&link, "AT+ANT=1", &[]);
        link_ok(&link, "AT+INV", &["+INV: <NO TAGS FOUND>"]);
        link.expect(b"AT+ANT=2\r", b"AT+ANT=2\r\n<Antenna not available>\r\nERROR\r\n");
        link_ok(&link, "AT+ANT=1", &[]);

        assert!(reader.check_antennas().await.is_err());
        assert_eq!(link.remaining_expectations(), 0);
        assert_eq!(link.sent_text().last().map(String::as_str), Some("AT+ANT=1\r"));
        assert_eq!(reader.session().with_config(|c| c.antenna), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_reports_per_tag_errors() {
        let (reader, link) = connected_uhf().await;
        link_ok(
            &link,
            "AT+READ=TID,0,4",
            &[
                "+READ: 3034257BF468D480000003EB,OK,E2003412",
                "+READ: 3034257BF468D480000003EC,ACCESS ERROR",
                "+READ: <ROUND FINISHED, ANT=1>",
            ],
        );

        let tags = reader.read_tag_tid(0, 4, None).await.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tid.as_deref(), Some("E2003412"));
        assert_eq!(tags[1].error_message(), Some("ACCESS ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_epc_restores_mask() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+BMSK?", &["+BMSK: EPC,0,3034,16"]);
        link_ok(&link, "AT+MSK=TID,0,E2003412", &[]);
        link_ok(&link, "AT+READ=PC,0,2", &["+READ: 3034257BF468D480000003EB,OK,3000"]);
        link_ok(&link, "AT+WRT=EPC,0,AAAABBBBCCCC", &["+WRT: 3034257BF468D480000003EB,OK"]);
        link_ok(&link, "AT+WRT=PC,0,1800", &["+WRT: 3034257BF468D480000003EB,OK"]);
        link_ok(&link, "AT+BMSK=EPC,0,3034,16", &[]);

        let tags = reader
            .write_tag_epc(Some("E2003412"), "AAAABBBBCCCC", 0)
            .await
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id(), "AAAABBBBCCCC");
        assert_eq!(tags[0].previous_id.as_deref(), Some("3034257BF468D480000003EB"));
        assert!(!tags[0].has_error());
        assert_eq!(link.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_epc_reports_partial_success() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+READ=PC,0,2", &["+READ: 3034257BF468D480000003EB,OK,3000"]);
        link_ok(&link, "AT+WRT=EPC,0,AAAABBBBCCCC", &["+WRT: 3034257BF468D480000003EB,OK"]);
        link_ok(&link, "AT+WRT=PC,0,1800", &["+WRT: 3034257BF468D480000003EB,ACCESS ERROR"]);

        let tags = reader.write_tag_epc(None, "AAAABBBBCCCC", 0).await.unwrap();
        assert_eq!(tags[0].error_message(), Some("epc written, epc length not updated!"));
    }

    #[tokio::test(start_paused = true)]
    async fn mask_round_trip() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+MSK=EPC,0,3034", &[]);
        link_ok(&link, "AT+BMSK?", &["+BMSK: OFF"]);
        reader.set_mask(&Mask::new(MemoryBank::Epc, "3034")).await.unwrap();
        assert_eq!(reader.get_mask().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn outputs_merge_cached_levels() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+OUT?", &["+OUT: 1,LOW", "+OUT: 2,HIGH", "+OUT: 3,LOW", "+OUT: 4,LOW"]);
        link_ok(&link, "AT+OUT=,,HIGH,", &[]);
        link_ok(&link, "AT+OUT=HIGH,HIGH,HIGH,LOW", &[]);

        reader.set_output(3, true).await.unwrap();
        reader.set_outputs(&[Some(true)]).await.unwrap();
        assert_eq!(link.remaining_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_succeeds() {
        let (reader, link) = connected_uhf().await;
        link.expect(b"AT+BINV\r", b"AT+BINV\r\n+BINV: <is not running>\r\nERROR\r\n");
        link.expect(b"AT+BINV\r", b"AT+BINV\r\n+BINV: <busy>\r\nERROR\r\n");

        reader.stop_inventory().await.unwrap();
        let err = reader.stop_inventory().await.unwrap_err();
        assert!(matches!(err, Error::Reader(ref m) if m == "busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_activity() {
        let (reader, link) = connected_uhf().await;
        link_ok(&link, "AT+BINV", &[]);
        link_ok(&link, "AT+BINVR", &[]);

        reader.disconnect().await.unwrap();
        assert!(!reader.is_connected());
        assert_eq!(reader.status().status, Status::Error("disconnected".into()));
        assert_eq!(link.remaining_expectations(), 0);
    }
}
