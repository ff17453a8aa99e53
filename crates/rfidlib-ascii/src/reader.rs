//! HfReader -- the [`Reader`] trait implementation for legacy ASCII HF
//! readers (QuasarMX, DeskID ISO, QuasarLR).
//!
//! The reader does not multiplex: while a continuous inventory runs it only
//! listens for `BRK`, so every other command fails until
//! [`stop_inventory()`](Reader::stop_inventory) was called.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use rfidlib_core::config::{AntennaMode, ReaderIdentity};
use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
use rfidlib_core::reader::Reader;
use rfidlib_core::status::StatusRecord;
use rfidlib_core::tag::Tag;
use rfidlib_engine::{CommandParam, Engine, Hex2, Session};

use crate::dialect::{AsciiDialect, InventoryOptions, RequestCallback, SubCarrier};
use crate::protocol::{PART_SEPARATOR, TagResponse};

/// Input pins of the readers.
const INPUT_PINS: std::ops::Range<u8> = 0..2;

/// Delay after `RST` before the reader is connected again.
const RESET_DELAY: Duration = Duration::from_millis(100);

/// Tag protocol of the RF interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HfMode {
    /// ISO 15693.
    #[default]
    Iso15693,
    /// ISO 14443-A.
    Iso14a,
    /// ISO 14443-B.
    Iso14b,
}

impl HfMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HfMode::Iso15693 => "156",
            HfMode::Iso14a => "14A",
            HfMode::Iso14b => "14B",
        }
    }
}

/// ISO 15693 command codes used by the tag requests.
mod iso15693 {
    pub const READ_SINGLE_BLOCK: &str = "20";
    pub const WRITE_SINGLE_BLOCK: &str = "21";
    pub const WRITE_AFI: &str = "27";
    pub const LOCK_AFI: &str = "28";
    pub const WRITE_DSFID: &str = "29";
    pub const LOCK_DSFID: &str = "2A";
    pub const GET_SYSTEM_INFORMATION: &str = "2B";
}

/// A legacy ASCII HF reader.
///
/// Constructed via [`AsciiReaderBuilder`](crate::builder::AsciiReaderBuilder).
/// The reader is not connected until [`connect()`](Reader::connect) is
/// called.
pub struct HfReader {
    engine: Engine<AsciiDialect>,
    /// `SAP AUT` takes a switch delay parameter.
    multiplex_delay: bool,
}

impl HfReader {
    pub(crate) fn new(engine: Engine<AsciiDialect>, multiplex_delay: bool) -> Self {
        Self {
            engine,
            multiplex_delay,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        self.engine.session()
    }

    pub(crate) fn dialect(&self) -> &AsciiDialect {
        self.engine.dialect()
    }

    /// Connection description, e.g. `serial:///dev/ttyUSB0@115200`.
    pub fn endpoint(&self) -> String {
        self.engine.endpoint()
    }

    async fn get_command(&self, name: &str, params: &[&dyn CommandParam]) -> Result<String> {
        self.dialect().get_command(self.session(), name, params).await
    }

    async fn set_command(&self, name: &str, params: &[&dyn CommandParam]) -> Result<()> {
        self.dialect().set_command(self.session(), name, params).await
    }

    fn firmware(&self) -> String {
        self.session()
            .with_config(|c| c.identity.firmware_name.clone())
    }

    /// `SAP` commands fail with `NOS` on readers without antenna ports.
    fn antenna_error(&self, e: Error) -> Error {
        match e {
            Error::Reader(message) if message.contains("NOS") => Error::Unsupported(format!(
                "Set antenna not supported by {}",
                self.firmware()
            )),
            e => e,
        }
    }

    // -----------------------------------------------------------------------
    // RF interface
    // -----------------------------------------------------------------------

    /// Switch the RF interface on. `modulation_depth` is 10 or 100 (%).
    pub async fn enable_rf_interface(
        &self,
        sub_carrier: SubCarrier,
        modulation_depth: u8,
    ) -> Result<()> {
        self.dialect()
            .enable_rf_interface(self.session(), sub_carrier, modulation_depth)
            .await
    }

    pub async fn disable_rf_interface(&self) -> Result<()> {
        self.set_command("SRI", &[&"OFF"]).await?;
        self.dialect()
            .set_rf_interface(false, SubCarrier::Single, 100);
        Ok(())
    }

    pub async fn set_mode(&self, mode: HfMode) -> Result<()> {
        self.set_command("MOD", &[&mode.as_str()]).await
    }

    /// Output power in mW: 500 to 4000 in steps of 250, newer ISO 15693
    /// readers also accept 100 and 200.
    pub async fn set_power(&self, power: u16) -> Result<()> {
        match self.set_command("SET", &[&"PWR", &power]).await {
            Err(Error::Reader(message)) if message.contains("UPA") => {
                let version = self
                    .session()
                    .with_config(|c| c.identity.firmware_version)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Err(Error::Unsupported(format!(
                    "Set power not supported by {} version {version}",
                    self.firmware()
                )))
            }
            result => result,
        }
    }

    // -----------------------------------------------------------------------
    // Antennas
    // -----------------------------------------------------------------------

    /// Add `ARP nn` antenna reports to inventories and tag requests.
    pub async fn enable_antenna_report(&self, enable: bool) -> Result<()> {
        let value = if enable { "ON" } else { "OFF" };
        self.set_command("SAP", &[&"ARP", &value])
            .await
            .map_err(|e| self.antenna_error(e))
    }

    /// Number of outputs used to switch an external antenna multiplexer.
    pub async fn set_antenna_outputs(&self, pins: u8) -> Result<()> {
        self.set_command("SAP", &[&"PIN", &pins])
            .await
            .map_err(|e| self.antenna_error(e))
    }

    /// Multiplex `count` antennas, waiting `switch_delay` ms on each. Readers
    /// without configurable delay ignore it.
    pub async fn set_antenna_multiplex_with_delay(&self, count: u8, switch_delay: u32) -> Result<()> {
        let delay = self.multiplex_delay.then_some(switch_delay);
        self.set_command("SAP", &[&"AUT", &count, &delay]).await?;
        self.session().update_config(|c| {
            c.antenna_count = count;
            c.antenna_mode = AntennaMode::Multiplex;
        });
        Ok(())
    }

    async fn ensure_mode(&self, mode: AntennaMode) -> Result<()> {
        let (current, antenna, count) = self
            .session()
            .with_config(|c| (c.antenna_mode, c.antenna, c.antenna_count));
        if current == mode {
            return Ok(());
        }
        match mode {
            AntennaMode::Single => self.set_antenna(antenna).await,
            AntennaMode::Multiplex => self.set_antenna_multiplex(count).await,
        }
    }

    // -----------------------------------------------------------------------
    // Inventory
    // -----------------------------------------------------------------------

    /// Options used by all following inventories.
    pub fn set_inventory_options(&self, options: InventoryOptions) {
        self.dialect().set_inventory_options(options);
    }

    pub fn inventory_options(&self) -> InventoryOptions {
        self.dialect().inventory_options()
    }

    async fn inventory_round(&self) -> Result<Vec<Tag>> {
        let [ssl, ont, afi] = self.inventory_options().params();
        self.dialect()
            .inventory_command(self.session(), "INV", &[&ssl, &ont, &afi])
            .await
    }

    async fn start_continuous(&self) -> Result<()> {
        let [ssl, ont, afi] = self.inventory_options().params();
        self.dialect()
            .send_command(self.session(), "CNR INV", &[&ssl, &ont, &afi])
            .await?;
        self.dialect().set_continuous(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tag requests
    // -----------------------------------------------------------------------

    /// Called with the data of every successful tag request.
    pub fn set_cb_request(&self, callback: Option<RequestCallback>) -> Option<RequestCallback> {
        self.dialect().set_request_callback(callback)
    }

    /// Send an ISO 15693 request, addressed to `tag_id` or to the single
    /// transponder in the field.
    async fn send_request(
        &self,
        command: &str,
        tag_command: &str,
        data: Option<&str>,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        let sub_carrier = match self.dialect().sub_carrier() {
            SubCarrier::Single => '2',
            SubCarrier::Double => '3',
        };
        let data = data.unwrap_or_default();
        let frame = match tag_id {
            Some(tid) => {
                let flags = if option_flag { '6' } else { '2' };
                format!("{flags}{sub_carrier}{tag_command}{tid}{data}")
            }
            None => {
                let flags = if option_flag { '4' } else { '0' };
                format!("{flags}{sub_carrier}{tag_command}{data}")
            }
        };
        let response = self
            .dialect()
            .request_command(self.session(), command, &[&frame, &"CRC"])
            .await?;
        if let Some(error) = &response.error {
            debug!(instance = %self.instance(), command, error = %error, "tag request failed");
        }
        Ok(response)
    }

    /// Read one block of the transponder memory.
    pub async fn read_tag_data(
        &self,
        block: u8,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        let block = Hex2(block).to_string();
        self.send_request("REQ", iso15693::READ_SINGLE_BLOCK, Some(&block), tag_id, option_flag)
            .await
    }

    /// Read the system information; decode it with
    /// [`TagResponse::information`].
    pub async fn read_tag_information(
        &self,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        self.send_request("REQ", iso15693::GET_SYSTEM_INFORMATION, None, tag_id, option_flag)
            .await
    }

    pub async fn write_tag_data(
        &self,
        block: u8,
        data: &str,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        let data = format!("{}{data}", Hex2(block));
        self.send_request("WRQ", iso15693::WRITE_SINGLE_BLOCK, Some(&data), tag_id, option_flag)
            .await
    }

    pub async fn write_tag_afi(
        &self,
        afi: u8,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        let afi = Hex2(afi).to_string();
        self.send_request("WRQ", iso15693::WRITE_AFI, Some(&afi), tag_id, option_flag)
            .await
    }

    /// Lock the AFI of the transponder for good.
    pub async fn lock_tag_afi(&self, tag_id: Option<&str>, option_flag: bool) -> Result<TagResponse> {
        self.send_request("WRQ", iso15693::LOCK_AFI, None, tag_id, option_flag)
            .await
    }

    pub async fn write_tag_dsfid(
        &self,
        dsfid: u8,
        tag_id: Option<&str>,
        option_flag: bool,
    ) -> Result<TagResponse> {
        let dsfid = Hex2(dsfid).to_string();
        self.send_request("WRQ", iso15693::WRITE_DSFID, Some(&dsfid), tag_id, option_flag)
            .await
    }

    /// Lock the DSFID of the transponder for good.
    pub async fn lock_tag_dsfid(&self, tag_id: Option<&str>, option_flag: bool) -> Result<TagResponse> {
        self.send_request("WRQ", iso15693::LOCK_DSFID, None, tag_id, option_flag)
            .await
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Reset the reader and connect again.
    pub async fn reset(&self) -> Result<()> {
        self.set_command("RST", &[]).await?;
        tokio::time::sleep(RESET_DELAY).await;
        self.engine.drop_connection().await;
        self.engine
            .connect(self.engine.engine_config().connect_timeout)
            .await
    }
}

#[async_trait]
impl Reader for HfReader {
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
        let reply = self.get_command(command, &[]).await?;
        Ok(reply.split(PART_SEPARATOR).map(str::to_string).collect())
    }

    async fn get_inventory(&self) -> Result<Vec<Tag>> {
        self.ensure_mode(AntennaMode::Single).await?;
        let tags = self.inventory_round().await?;
        self.session().fire_inventory(tags.clone(), false);
        Ok(tags)
    }

    async fn start_inventory(&self) -> Result<()> {
        self.ensure_mode(AntennaMode::Single).await?;
        self.start_continuous().await
    }

    async fn stop_inventory(&self) -> Result<()> {
        self.dialect().stop_inventory(self.session()).await
    }

    /// One inventory per multiplexed antenna. Antenna faults are not
    /// reported by these readers, so `ignore_errors` has no effect.
    async fn get_inventory_multi(&self, _ignore_errors: bool) -> Result<Vec<Tag>> {
        self.ensure_mode(AntennaMode::Multiplex).await?;
        let rounds = self.session().with_config(|c| c.antenna_count).max(1);
        let mut tags = Vec::new();
        for _ in 0..rounds {
            tags.extend(self.inventory_round().await?);
        }
        self.session().fire_inventory(tags.clone(), false);
        Ok(tags)
    }

    async fn start_inventory_multi(&self, _ignore_errors: bool) -> Result<()> {
        self.ensure_mode(AntennaMode::Multiplex).await?;
        self.start_continuous().await
    }

    async fn stop_inventory_multi(&self) -> Result<()> {
        self.stop_inventory().await
    }

    async fn set_antenna(&self, antenna: u8) -> Result<()> {
        self.set_command("SAP", &[&"MAN", &antenna])
            .await
            .map_err(|e| self.antenna_error(e))?;
        self.session().update_config(|c| {
            c.antenna = antenna;
            c.antenna_mode = AntennaMode::Single;
        });
        Ok(())
    }

    async fn get_antenna(&self) -> Result<u8> {
        Ok(self.session().with_config(|c| c.antenna))
    }

    async fn set_antenna_multiplex(&self, count: u8) -> Result<()> {
        self.set_antenna_multiplex_with_delay(count, 0).await
    }

    async fn get_antenna_multiplex(&self) -> Result<u8> {
        Ok(self.session().with_config(|c| c.antenna_count))
    }

    async fn get_inputs(&self) -> Result<BTreeMap<u8, bool>> {
        let mut inputs = BTreeMap::new();
        for pin in INPUT_PINS {
            inputs.insert(pin, self.get_input(pin).await?);
        }
        Ok(inputs)
    }

    async fn get_input(&self, pin: u8) -> Result<bool> {
        let reply = self.get_command("RIP", &[&pin]).await?;
        if reply.contains("HI") {
            return Ok(true);
        }
        if reply.contains("LOW") {
            return Ok(false);
        }
        Err(Error::Reader(format!("get input error - {reply}")))
    }

    async fn set_output(&self, pin: u8, high: bool) -> Result<()> {
        let level = if high { "HI" } else { "LOW" };
        self.set_command("WOP", &[&pin, &level]).await
    }

    async fn set_outputs(&self, levels: &[Option<bool>]) -> Result<()> {
        for (pin, level) in (0u8..).zip(levels) {
            if let Some(high) = level {
                self.set_output(pin, *high).await?;
            }
        }
        Ok(())
    }

    async fn enable_input_events(&self, enable: bool) -> Result<()> {
        self.engine.enable_input_events(enable).await
    }
}
