//! The AT dialect: command exchange, handshake and line demultiplexing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use rfidlib_core::config::{ExpectedReader, InventoryFields};
use rfidlib_core::error::{Error, Result};
use rfidlib_engine::framing::trim_cr;
use rfidlib_engine::{CommandParam, Dialect, Session};

use crate::inventory::{EntryFormat, NfcMode, parse_rounds, settle_group};
use crate::protocol::{
    self, ContinuousKind, ErrorMapper, Line, ReplyCollector, SEPARATOR, TERMINATOR,
};
use crate::settings::{NfcInventorySettings, UhfInventorySettings};

/// The two reader families speaking the AT protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Uhf,
    Nfc,
}

#[derive(Debug, Default)]
struct AtState {
    /// Record antenna faults of inventories instead of failing them.
    ignore_errors: bool,
    uhf_settings: Option<UhfInventorySettings>,
    nfc_mode: NfcMode,
    /// Last known output levels.
    outputs: Option<BTreeMap<u8, bool>>,
    /// TID of the selected NFC transponder.
    selected: Option<String>,
}

/// AT protocol dialect for one reader connection.
pub struct AtDialect {
    family: Family,
    expected: Option<ExpectedReader>,
    /// Replies start with an echo of the command (`ATE1`).
    echo: AtomicBool,
    state: Mutex<AtState>,
}

impl AtDialect {
    /// `expected` is checked against the identity the reader reports during
    /// configuration; `None` accepts any device.
    pub fn new(family: Family, expected: Option<ExpectedReader>) -> Self {
        Self {
            family,
            expected,
            echo: AtomicBool::new(false),
            state: Mutex::new(AtState::default()),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn error_mapper(&self) -> ErrorMapper {
        match self.family {
            Family::Uhf => reader_error,
            Family::Nfc => Error::from_device_message,
        }
    }

    // -----------------------------------------------------------------------
    // Command exchange
    // -----------------------------------------------------------------------

    /// Send a command and collect its reply entries with the default
    /// command timeout.
    pub async fn command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<Vec<String>> {
        self.command_with_timeout(session, name, params, session.command_timeout())
            .await
    }

    /// Send a command and collect its reply entries. The whole reply must
    /// arrive within `timeout`.
    pub async fn command_with_timeout(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let wire = protocol::prepare_command(name, params);
        let mut exchange = session.exchange().await;
        exchange.send(&format!("{wire}{TERMINATOR}")).await?;

        let mut collector = ReplyCollector::new(
            &wire,
            name,
            self.echo.load(Ordering::Acquire),
            self.error_mapper(),
        );
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(line) = exchange.next_line(remaining).await else {
                break;
            };
            if let Some(entries) = collector.feed(&line)? {
                return Ok(entries);
            }
        }
        debug!(instance = %session.instance(), cmd = %wire, "reply incomplete");
        Err(collector.timed_out(session.silence_error()))
    }

    /// Collect the rest of a reply an earlier command gave up on, up to
    /// its `OK` or `ERROR`.
    async fn drain_reply(&self, session: &Session) {
        let mut exchange = session.resume().await;
        while let Some(line) = exchange.next_line(session.command_timeout()).await {
            trace!(instance = %session.instance(), line = ?line, "drained");
            if line == "OK" || line == "ERROR" {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parser state
    // -----------------------------------------------------------------------

    pub fn ignore_errors(&self) -> bool {
        self.state.lock().ignore_errors
    }

    pub fn set_ignore_errors(&self, ignore: bool) {
        self.state.lock().ignore_errors = ignore;
    }

    pub fn nfc_mode(&self) -> NfcMode {
        self.state.lock().nfc_mode
    }

    pub(crate) fn set_nfc_mode(&self, mode: NfcMode) {
        self.state.lock().nfc_mode = mode;
    }

    pub(crate) fn selected(&self) -> Option<String> {
        self.state.lock().selected.clone()
    }

    pub(crate) fn set_selected(&self, tid: Option<String>) {
        self.state.lock().selected = tid;
    }

    pub(crate) fn cached_outputs(&self) -> Option<BTreeMap<u8, bool>> {
        self.state.lock().outputs.clone()
    }

    pub(crate) fn cache_outputs(&self, outputs: BTreeMap<u8, bool>) {
        self.state.lock().outputs = Some(outputs);
    }

    pub(crate) fn uhf_settings(&self) -> Option<UhfInventorySettings> {
        self.state.lock().uhf_settings.clone()
    }

    /// Field layout of inventory entries under the current settings.
    pub fn entry_format(&self, session: &Session, report: bool) -> EntryFormat {
        let fields = session.with_config(|c| c.inventory);
        match self.family {
            Family::Uhf => EntryFormat::Uhf { fields, report },
            Family::Nfc => EntryFormat::Nfc {
                mode: self.nfc_mode(),
                details: fields.tag_details,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Commands shared by configuration and the readers
    // -----------------------------------------------------------------------

    /// Stop a continuous inventory. Stopping an inventory that is not
    /// running succeeds.
    pub async fn stop_inventory(&self, session: &Session) -> Result<()> {
        match self.command(session, "AT+BINV", &[]).await {
            Ok(_) => Ok(()),
            Err(Error::Reader(message)) if message.contains("is not running") => Ok(()),
            // The asynchronous stop acknowledgment of NFC readers can
            // arrive in place of the echo.
            Err(Error::Protocol(message))
                if self.family == Family::Nfc && message.contains("Not expected response") =>
            {
                debug!(instance = %session.instance(), message, "draining stop acknowledgment");
                self.drain_reply(session).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop a continuous inventory report (UHF).
    pub async fn stop_inventory_report(&self, session: &Session) -> Result<()> {
        match self.command(session, "AT+BINVR", &[]).await {
            Ok(_) => Ok(()),
            Err(Error::Reader(message))
                if message.is_empty() || message.contains("is not running") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn query_antenna(&self, session: &Session) -> Result<u8> {
        let entries = match self.command(session, "AT+ANT?", &[]).await {
            Ok(entries) => entries,
            Err(Error::Reader(message)) if message.contains("ERROR") => {
                return Err(Error::Unsupported("Multiple antennas not supported".into()));
            }
            Err(e) => return Err(e),
        };
        protocol::first_number(&entries, "AT+ANT?")
    }

    /// Read the UHF inventory settings and derive the inventory fields.
    pub async fn query_uhf_settings(&self, session: &Session) -> Result<UhfInventorySettings> {
        let entries = self.command(session, "AT+INVS?", &[]).await?;
        let settings = protocol::first_payload(&entries, "AT+INVS?")
            .ok()
            .and_then(UhfInventorySettings::parse)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Not expected response for command AT+INVS? - {entries:?}"
                ))
            })?;
        self.store_uhf_settings(session, settings.clone());
        Ok(settings)
    }

    pub async fn apply_uhf_settings(
        &self,
        session: &Session,
        settings: UhfInventorySettings,
    ) -> Result<()> {
        let params = settings.params();
        let refs: Vec<&dyn CommandParam> = params.iter().map(|p| p as &dyn CommandParam).collect();
        self.command(session, "AT+INVS", &refs).await?;
        self.store_uhf_settings(session, settings.effective());
        Ok(())
    }

    fn store_uhf_settings(&self, session: &Session, settings: UhfInventorySettings) {
        let fields = settings.fields();
        session.update_config(|c| c.inventory = fields);
        self.state.lock().uhf_settings = Some(settings);
    }

    pub async fn query_nfc_mode(&self, session: &Session) -> Result<NfcMode> {
        let entries = self.command(session, "AT+MOD?", &[]).await?;
        let mode = protocol::first_payload(&entries, "AT+MOD?")
            .ok()
            .and_then(NfcMode::parse)
            .ok_or_else(|| {
                Error::Protocol(format!("Not expected response for command AT+MOD? - {entries:?}"))
            })?;
        self.set_nfc_mode(mode);
        Ok(mode)
    }

    pub async fn query_nfc_settings(&self, session: &Session) -> Result<NfcInventorySettings> {
        let entries = self.command(session, "AT+INVS?", &[]).await?;
        let settings = protocol::first_payload(&entries, "AT+INVS?")
            .ok()
            .and_then(NfcInventorySettings::parse)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Not expected response for command AT+INVS? - {entries:?}"
                ))
            })?;
        store_nfc_settings(session, settings);
        Ok(settings)
    }

    pub async fn apply_nfc_settings(
        &self,
        session: &Session,
        settings: NfcInventorySettings,
    ) -> Result<()> {
        let [details, only_new, single_slot] = settings.params();
        self.command(session, "AT+INVS", &[&details, &only_new, &single_slot])
            .await?;
        store_nfc_settings(session, settings);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Continuous inventory events
    // -----------------------------------------------------------------------

    fn handle_inventory_event(
        &self,
        session: &Session,
        kind: ContinuousKind,
        line: &str,
        timestamp: DateTime<Utc>,
    ) {
        let format = self.entry_format(session, kind == ContinuousKind::Report);
        let entries: Vec<&str> = line.split(TERMINATOR).filter(|e| !e.is_empty()).collect();
        // A single antenna inventory without round marker ran on the
        // selected antenna.
        let fallback = match kind {
            ContinuousKind::Single => Some(session.with_config(|c| c.antenna)).filter(|a| *a > 0),
            ContinuousKind::Multi | ContinuousKind::Report => None,
        };
        let mut tags = Vec::new();
        let mut settled = false;
        for group in parse_rounds(&entries, format, timestamp) {
            match settle_group(session, group, fallback, self.ignore_errors()) {
                Ok(round) => {
                    tags.extend(round);
                    settled = true;
                }
                Err(e) => session.warn_inventory(&e.to_string()),
            }
        }
        if !settled {
            return;
        }
        match kind {
            ContinuousKind::Report => session.fire_inventory_report(tags, true),
            _ => session.fire_inventory(tags, true),
        }
    }
}

fn reader_error(message: &str) -> Error {
    Error::Reader(message.to_string())
}

fn store_nfc_settings(session: &Session, settings: NfcInventorySettings) {
    session.update_config(|c| {
        c.inventory = InventoryFields {
            tag_details: settings.tag_details,
            ..Default::default()
        }
    });
}

#[async_trait]
impl Dialect for AtDialect {
    fn initial_separator(&self) -> u8 {
        SEPARATOR
    }

    fn route_config_line(&self, session: &Session, line: &str) {
        let line = trim_cr(line);
        trace!(instance = %session.instance(), line = ?line, "recv");
        if protocol::is_config_reply(line) {
            session.push_reply(line);
        }
    }

    fn route_line(&self, session: &Session, line: &str, timestamp: DateTime<Utc>) {
        let line = trim_cr(line);
        trace!(instance = %session.instance(), line = ?line, "recv");
        match protocol::classify(line) {
            Line::Empty | Line::Heartbeat => {}
            Line::Inventory(kind, text) => {
                self.handle_inventory_event(session, kind, text, timestamp)
            }
            Line::InputChanged { pin, high } => session.fire_input_changed(pin, high),
            Line::Reply(text) => session.push_reply(text),
        }
    }

    async fn configure(&self, session: &Session) -> Result<()> {
        self.echo.store(false, Ordering::Release);
        self.command(session, "ATE1", &[]).await?;
        self.echo.store(true, Ordering::Release);

        self.stop_inventory(session).await?;
        if self.family == Family::Uhf {
            self.stop_inventory_report(session).await?;
            self.query_uhf_settings(session).await?;
        }

        let entries = self.command(session, "ATI", &[]).await?;
        let identity = protocol::parse_identity(&entries)?;
        if let Some(expected) = &self.expected {
            expected.validate(&identity)?;
        }
        info!(
            instance = %session.instance(),
            hardware = %identity.hardware_name,
            firmware = %identity.firmware_name,
            version = ?identity.firmware_version,
            "reader identified"
        );
        session.update_config(|c| c.identity = identity);

        let antenna = match self.query_antenna(session).await {
            Ok(antenna) => antenna,
            Err(e) if e.is_connection_error() => return Err(e),
            Err(e) => {
                debug!(instance = %session.instance(), error = %e, "antenna query failed, using antenna 1");
                1
            }
        };
        session.update_config(|c| c.antenna = antenna);

        if self.family == Family::Nfc {
            self.query_nfc_mode(session).await?;
            let settings = self.query_nfc_settings(session).await?;
            if !settings.tag_details {
                let settings = NfcInventorySettings {
                    tag_details: true,
                    ..settings
                };
                self.apply_nfc_settings(session, settings).await?;
            }
        }
        Ok(())
    }

    async fn set_heartbeat(&self, session: &Session, seconds: u32) -> Result<()> {
        self.command(session, "AT+HBT", &[&seconds]).await?;
        Ok(())
    }

    async fn enable_input_events(&self, session: &Session, enable: bool) -> Result<()> {
        let value: u8 = enable.into();
        match self.command(session, "AT+IEV", &[&value]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => {
                debug!(instance = %session.instance(), error = %e, "input events rejected");
                Err(Error::Unsupported("input events not available".into()))
            }
        }
    }

    async fn stop_activity(&self, session: &Session) -> Result<()> {
        let stopped = self.stop_inventory(session).await;
        if self.family == Family::Uhf {
            self.stop_inventory_report(session).await?;
        }
        stopped
    }
}
