//! AtReader -- the [`Reader`] trait implementation for AT protocol readers.
//!
//! UHF and NFC readers share the command exchange, the handshake, the
//! event demultiplexer and most of the reader API. The family marker type
//! parameter ([`Uhf`] or [`Nfc`]) selects which device specific inherent
//! methods are available; see [`crate::uhf`] and [`crate::nfc`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use rfidlib_core::config::{AntennaMode, ReaderIdentity};
use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
use rfidlib_core::reader::Reader;
use rfidlib_core::status::StatusRecord;
use rfidlib_core::tag::Tag;
use rfidlib_engine::{CommandParam, Engine, Session};

use crate::dialect::{AtDialect, Family};
use crate::inventory::{parse_group, parse_rounds, settle_group};
use crate::protocol;

/// Compile-time reader family of an [`AtReader`].
pub trait ReaderFamily: Send + Sync + 'static {
    const FAMILY: Family;
}

/// UHF (EPC Gen2) readers: PULSAR LR, DeskID UHF v2.
#[derive(Debug)]
pub enum Uhf {}

/// NFC (ISO 15693 / ISO 14443-A) readers: DeskID NFC.
#[derive(Debug)]
pub enum Nfc {}

impl ReaderFamily for Uhf {
    const FAMILY: Family = Family::Uhf;
}

impl ReaderFamily for Nfc {
    const FAMILY: Family = Family::Nfc;
}

/// A UHF reader speaking the AT protocol.
pub type UhfReader = AtReader<Uhf>;

/// An NFC reader speaking the AT protocol.
pub type NfcReader = AtReader<Nfc>;

/// A reader speaking the AT protocol.
///
/// Constructed via [`AtReaderBuilder`](crate::builder::AtReaderBuilder). The
/// reader is not connected until [`connect()`](Reader::connect) is called.
pub struct AtReader<F: ReaderFamily> {
    engine: Engine<AtDialect>,
    _family: PhantomData<F>,
}

impl<F: ReaderFamily> AtReader<F> {
    pub(crate) fn new(engine: Engine<AtDialect>) -> Self {
        Self {
            engine,
            _family: PhantomData,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        self.engine.session()
    }

    pub(crate) fn dialect(&self) -> &AtDialect {
        self.engine.dialect()
    }

    /// Connection description, e.g. `tcp://192.168.2.239:10001`.
    pub fn endpoint(&self) -> String {
        self.engine.endpoint()
    }

    pub(crate) async fn command(
        &self,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<Vec<String>> {
        self.dialect().command(self.session(), name, params).await
    }

    pub(crate) async fn command_with_timeout(
        &self,
        name: &str,
        params: &[&dyn CommandParam],
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.dialect()
            .command_with_timeout(self.session(), name, params, timeout)
            .await
    }

    /// The antenna selected during configuration or by `set_antenna`.
    pub(crate) fn current_antenna(&self) -> u8 {
        self.session().with_config(|c| c.antenna).max(1)
    }

    /// Run a raw command with its own reply timeout.
    pub async fn send_custom_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.command_with_timeout(command, &[], timeout).await
    }

    /// Run one inventory on every antenna in turn and report the faulty
    /// ones. The inventory callback is suspended and the selected antenna
    /// restored afterwards.
    pub async fn check_antennas(&self) -> Result<()> {
        let callback = self.engine.set_cb_inventory(None);
        let result = self.inventory_each_antenna().await;
        self.engine.set_cb_inventory(callback);
        let failed = result?;
        if failed.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = failed.iter().map(u8::to_string).collect();
        Err(Error::Reader(format!("Antenna error: {}", list.join(" "))))
    }

    async fn inventory_each_antenna(&self) -> Result<Vec<u8>> {
        let current = self.get_antenna().await?;
        let result = self.try_each_antenna().await;
        let restored = self.set_antenna(current).await;
        let failed = result?;
        restored?;
        Ok(failed)
    }

    async fn try_each_antenna(&self) -> Result<Vec<u8>> {
        let mut failed = Vec::new();
        for antenna in 1..=4 {
            self.set_antenna(antenna).await?;
            match self.get_inventory().await {
                Ok(_) => {}
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => {
                    debug!(instance = %self.instance(), antenna, error = %e, "antenna check failed");
                    failed.push(antenna);
                }
            }
        }
        Ok(failed)
    }

    fn level(high: bool) -> &'static str {
        if high { "HIGH" } else { "LOW" }
    }

    /// Render the four positional output fields of `AT+OUT`.
    fn output_fields(levels: impl Fn(u8) -> Option<bool>) -> String {
        (1..=4)
            .map(|pin| levels(pin).map(Self::level).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl<F: ReaderFamily> Reader for AtReader<F> {
    fn instance(&self) -> &str {
        self.session().instance()
    }

    async fn connect(&self, timeout: Duration) -> Result<()> {
        self.engine.connect(timeout).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.engine.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    fn status(&self) -> StatusRecord {
        self.engine.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.engine.subscribe()
    }

    fn set_cb_status(&self, callback: Option<StatusCallback>) -> Option<StatusCallback> {
        self.engine.set_cb_status(callback)
    }

    fn set_cb_inventory(&self, callback: Option<InventoryCallback>) -> Option<InventoryCallback> {
        self.engine.set_cb_inventory(callback)
    }

    fn set_cb_input_changed(&self, callback: Option<InputCallback>) -> Option<InputCallback> {
        self.engine.set_cb_input_changed(callback)
    }

    fn set_fire_empty_inventories(&self, enable: bool) {
        self.engine.set_fire_empty_inventories(enable);
    }

    async fn fetch_inventory(&self, wait_for_tags: bool) -> Vec<Tag> {
        self.engine.fetch_inventory(wait_for_tags).await
    }

    async fn set_heartbeat(&self, seconds: u32) -> Result<()> {
        self.engine.set_heartbeat(seconds).await
    }

    fn reader_info(&self) -> ReaderIdentity {
        self.session().with_config(|c| c.identity.clone())
    }

    async fn send_custom_command(&self, command: &str) -> Result<Vec<String>> {
        self.command(command, &[]).await
    }

    async fn get_inventory(&self) -> Result<Vec<Tag>> {
        let entries = self.command("AT+INV", &[]).await?;
        let session = self.session();
        let antenna = self.current_antenna();
        let format = self.dialect().entry_format(session, false);
        let mut group = parse_group(entries.iter().map(String::as_str), format, Utc::now());
        for tag in &mut group.tags {
            tag.antenna = Some(antenna);
        }
        let tags = settle_group(session, group, Some(antenna), self.dialect().ignore_errors())?;
        session.fire_inventory(tags.clone(), false);
        Ok(tags)
    }

    async fn start_inventory(&self) -> Result<()> {
        self.dialect().set_ignore_errors(false);
        self.command("AT+CINV", &[]).await?;
        Ok(())
    }

    async fn stop_inventory(&self) -> Result<()> {
        self.dialect().stop_inventory(self.session()).await
    }

    async fn get_inventory_multi(&self, ignore_errors: bool) -> Result<Vec<Tag>> {
        if F::FAMILY == Family::Nfc {
            return self.get_inventory().await;
        }
        self.dialect().set_ignore_errors(ignore_errors);
        let entries = self.command("AT+MINV", &[]).await?;
        let session = self.session();
        let format = self.dialect().entry_format(session, false);
        let timestamp = Utc::now();
        let mut tags = Vec::new();
        for group in parse_rounds(&entries, format, timestamp) {
            tags.extend(settle_group(session, group, None, ignore_errors)?);
        }
        session.fire_inventory(tags.clone(), false);
        Ok(tags)
    }

    async fn start_inventory_multi(&self, ignore_errors: bool) -> Result<()> {
        self.dialect().set_ignore_errors(ignore_errors);
        self.command("AT+CMINV", &[]).await?;
        Ok(())
    }

    async fn stop_inventory_multi(&self) -> Result<()> {
        self.stop_inventory().await
    }

    async fn set_antenna(&self, antenna: u8) -> Result<()> {
        self.command("AT+ANT", &[&antenna]).await?;
        self.session().update_config(|c| {
            c.antenna = antenna;
            c.antenna_mode = AntennaMode::Single;
        });
        Ok(())
    }

    async fn get_antenna(&self) -> Result<u8> {
        self.dialect().query_antenna(self.session()).await
    }

    async fn set_antenna_multiplex(&self, count: u8) -> Result<()> {
        self.command("AT+MUX", &[&count]).await?;
        self.session().update_config(|c| {
            c.antenna_count = count;
            c.antenna_mode = if count > 1 {
                AntennaMode::Multiplex
            } else {
                AntennaMode::Single
            };
        });
        Ok(())
    }

    async fn get_antenna_multiplex(&self) -> Result<u8> {
        let entries = self.command("AT+MUX?", &[]).await?;
        protocol::first_number(&entries, "AT+MUX?")
    }

    async fn get_inputs(&self) -> Result<BTreeMap<u8, bool>> {
        let entries = self.command("AT+IN?", &[]).await?;
        Ok(protocol::parse_pins(&entries).into_iter().collect())
    }

    async fn get_input(&self, pin: u8) -> Result<bool> {
        self.get_inputs()
            .await?
            .get(&pin)
            .copied()
            .ok_or_else(|| Error::InvalidParameter(format!("Input pin {pin} not available")))
    }

    async fn get_outputs(&self) -> Result<BTreeMap<u8, bool>> {
        let entries = self.command("AT+OUT?", &[]).await?;
        let outputs: BTreeMap<u8, bool> = protocol::parse_pins(&entries).into_iter().collect();
        self.dialect().cache_outputs(outputs.clone());
        Ok(outputs)
    }

    async fn get_output(&self, pin: u8) -> Result<bool> {
        self.get_outputs()
            .await?
            .get(&pin)
            .copied()
            .ok_or_else(|| Error::InvalidParameter(format!("Output pin {pin} not available")))
    }

    async fn set_output(&self, pin: u8, high: bool) -> Result<()> {
        let mut outputs = match self.dialect().cached_outputs() {
            Some(outputs) => outputs,
            None => self.get_outputs().await?,
        };
        let fields = Self::output_fields(|p| (p == pin).then_some(high));
        self.command("AT+OUT", &[&fields]).await?;
        outputs.insert(pin, high);
        self.dialect().cache_outputs(outputs);
        Ok(())
    }

    async fn set_outputs(&self, levels: &[Option<bool>]) -> Result<()> {
        let mut outputs = match self.dialect().cached_outputs() {
            Some(outputs) => outputs,
            None => self.get_outputs().await?,
        };
        for (pin, level) in (1u8..).zip(levels) {
            if let Some(high) = level {
                outputs.insert(pin, *high);
            }
        }
        let fields = Self::output_fields(|p| outputs.get(&p).copied());
        self.command("AT+OUT", &[&fields]).await?;
        self.dialect().cache_outputs(outputs);
        Ok(())
    }

    async fn enable_input_events(&self, enable: bool) -> Result<()> {
        self.engine.enable_input_events(enable).await
    }
}
