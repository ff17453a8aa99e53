//! NFC specific operations of AT readers.
//!
//! Memory access and raw requests address a single transponder: in ISO 14A
//! mode it has to be selected first, ISO 15 transponders answer when they are
//! alone in the field or selected. Transponder failures surface as
//! [`Error::Transponder`].

use chrono::Utc;
use tracing::debug;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::tag::{Tag, TagKind};
use rfidlib_engine::Hex2;

use crate::inventory::NfcMode;
use crate::protocol;
use crate::reader::{AtReader, Nfc};
use crate::settings::NfcInventorySettings;

/// Memory layout of a transponder (`+SCT: 2,64,4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySector {
    /// Adjacent sectors of the same size.
    pub sectors: u16,
    pub number_of_blocks: u16,
    /// Bytes per block.
    pub block_size: u16,
}

impl MemorySector {
    fn parse(payload: &str) -> Option<Self> {
        let mut fields = payload.split(',').map(|f| f.trim().parse::<u16>());
        Some(Self {
            sectors: fields.next()?.ok()?,
            number_of_blocks: fields.next()?.ok()?,
            block_size: fields.next()?.ok()?,
        })
    }
}

/// A transponder found by [`detect_tag_types`](AtReader::detect_tag_types).
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedTag {
    pub tag: Tag,
    /// Type reported by the reader, e.g. `ISO15` or `MIFARE_CLASSIC_1K`.
    pub tag_type: String,
}

/// Sub-carrier mode of the RF interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubCarrier {
    #[default]
    Single,
    Double,
}

fn option_flag(flag: bool) -> u8 {
    u8::from(flag)
}

fn parse_detected(entries: &[String], antenna: u8) -> Vec<DetectedTag> {
    let timestamp = Utc::now();
    entries
        .iter()
        .filter_map(|entry| protocol::payload(entry))
        .filter(|p| !p.starts_with('<'))
        .filter_map(|p| {
            // E002223504422958,ISO15
            let (tid, tag_type) = p.split_once(',')?;
            let kind = if tag_type == "ISO15" {
                TagKind::Iso15
            } else {
                TagKind::Iso14a
            };
            let mut tag = Tag::new(kind, tid, timestamp);
            tag.antenna = Some(antenna);
            Some(DetectedTag {
                tag,
                tag_type: tag_type.to_string(),
            })
        })
        .collect()
}

/// Concatenate the data (and option flag status) of `+READM` entries.
fn join_blocks(entries: &[String]) -> (String, String) {
    let mut data = String::new();
    let mut flags = String::new();
    for payload in entries.iter().filter_map(|e| protocol::payload(e)) {
        let mut split = payload.split(',');
        data.push_str(split.next().unwrap_or_default());
        flags.push_str(split.next().unwrap_or_default());
    }
    (data, flags)
}

impl AtReader<Nfc> {
    // -----------------------------------------------------------------------
    // Mode and RF interface
    // -----------------------------------------------------------------------

    pub async fn set_mode(&self, mode: NfcMode) -> Result<()> {
        self.command("AT+MOD", &[&mode.as_str()]).await?;
        self.dialect().set_nfc_mode(mode);
        Ok(())
    }

    pub async fn get_mode(&self) -> Result<NfcMode> {
        self.dialect().query_nfc_mode(self.session()).await
    }

    pub async fn enable_rf_interface(&self) -> Result<()> {
        self.command("AT+CW", &[&1u8]).await?;
        Ok(())
    }

    pub async fn disable_rf_interface(&self) -> Result<()> {
        self.command("AT+CW", &[&0u8]).await?;
        Ok(())
    }

    /// `modulation_depth` is 10 or 100 (percent).
    pub async fn config_rf_interface(&self, sub_carrier: SubCarrier, modulation_depth: u8) -> Result<()> {
        if modulation_depth != 10 && modulation_depth != 100 {
            return Err(Error::InvalidParameter("Modulation depth must be 100 or 10".into()));
        }
        let carrier = match sub_carrier {
            SubCarrier::Single => "SINGLE",
            SubCarrier::Double => "DOUBLE",
        };
        self.command("AT+CRI", &[&carrier, &modulation_depth]).await?;
        Ok(())
    }

    pub async fn get_inventory_settings(&self) -> Result<NfcInventorySettings> {
        self.dialect().query_nfc_settings(self.session()).await
    }

    pub async fn set_inventory_settings(&self, settings: NfcInventorySettings) -> Result<()> {
        self.dialect()
            .apply_nfc_settings(self.session(), settings)
            .await
    }

    // -----------------------------------------------------------------------
    // Transponder selection
    // -----------------------------------------------------------------------

    /// Find the transponders in the field and report their types.
    pub async fn detect_tag_types(&self) -> Result<Vec<DetectedTag>> {
        let entries = self.command("AT+DTT", &[]).await?;
        Ok(parse_detected(&entries, self.current_antenna()))
    }

    pub async fn select_transponder(&self, tid: &str) -> Result<()> {
        self.command("AT+SEL", &[&tid]).await?;
        self.dialect().set_selected(Some(tid.to_string()));
        Ok(())
    }

    /// TID of the selected transponder.
    pub fn selected_transponder(&self) -> Option<String> {
        self.dialect().selected()
    }

    pub async fn deselect_transponder(&self) -> Result<()> {
        self.command("AT+DEL", &[]).await?;
        self.dialect().set_selected(None);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Memory layout of the transponders in the field. Only some ISO 15693
    /// transponders support this.
    pub async fn get_memory_sectors(&self) -> Result<Vec<MemorySector>> {
        let entries = self.command("AT+SCT?", &[]).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let sector = protocol::payload(entry).and_then(MemorySector::parse);
                if sector.is_none() {
                    debug!(instance = %self.session().instance(), entry = %entry, "error parsing memory sector");
                }
                sector
            })
            .collect())
    }

    /// Write one block. The option flag is only used in ISO 15 mode.
    pub async fn write_data(&self, block: u16, data: &str, option_flag: Option<bool>) -> Result<()> {
        let flag = option_flag.map(self::option_flag);
        self.command("AT+WRT", &[&block, &data, &flag]).await?;
        Ok(())
    }

    /// Read `count` blocks starting at `block` as one hex string.
    pub async fn read_data(&self, block: u16, count: u16) -> Result<String> {
        if count > 1 {
            let entries = self.command("AT+READM", &[&block, &count]).await?;
            return Ok(join_blocks(&entries).0);
        }
        let entries = self.command("AT+READ", &[&block]).await?;
        Ok(protocol::first_payload(&entries, "AT+READ")?.to_string())
    }

    /// Read blocks with the ISO 15693 option flag set. Returns the data and
    /// the block security status bytes.
    pub async fn read_data_with_option_flag(&self, block: u16, count: u16) -> Result<(String, String)> {
        if count > 1 {
            let entries = self.command("AT+READM", &[&block, &count, &1u8]).await?;
            return Ok(join_blocks(&entries));
        }
        let entries = self.command("AT+READ", &[&block, &1u8]).await?;
        let payload = protocol::first_payload(&entries, "AT+READ")?;
        let (data, flags) = payload.split_once(',').unwrap_or((payload, ""));
        Ok((data.to_string(), flags.to_string()))
    }

    // -----------------------------------------------------------------------
    // ISO 15693
    // -----------------------------------------------------------------------

    fn require_iso15(&self) -> Result<()> {
        if self.dialect().nfc_mode() != NfcMode::Iso15 {
            return Err(Error::Unsupported("Only available in ISO15 mode!".into()));
        }
        Ok(())
    }

    /// Send a raw ISO 15693 request with read timing and return the
    /// transponder response.
    pub async fn send_read_request_iso15693(&self, request: &str) -> Result<String> {
        self.require_iso15()?;
        let entries = self.command("AT+RRQ", &[&request]).await?;
        Ok(protocol::first_payload(&entries, "AT+RRQ")?.to_string())
    }

    /// Send a raw ISO 15693 request with write timing.
    pub async fn send_write_request_iso15693(&self, request: &str) -> Result<()> {
        self.require_iso15()?;
        self.command("AT+WRQ", &[&request]).await?;
        Ok(())
    }

    /// Only transponders with this application family identifier answer
    /// inventories. 0 disables the filter.
    pub async fn set_afi(&self, afi: u8) -> Result<()> {
        self.command("AT+AFI", &[&Hex2(afi)]).await?;
        Ok(())
    }

    pub async fn get_afi(&self) -> Result<u8> {
        let entries = self.command("AT+AFI?", &[]).await?;
        let value = protocol::first_payload(&entries, "AT+AFI?")?;
        u8::from_str_radix(value.trim(), 16).map_err(|_| {
            Error::Protocol(format!("Not expected response for command AT+AFI? - {entries:?}"))
        })
    }

    pub async fn write_tag_afi(&self, afi: u8, option_flag: bool) -> Result<()> {
        self.command("AT+WAFI", &[&Hex2(afi), &self::option_flag(option_flag)])
            .await?;
        Ok(())
    }

    /// Lock the AFI of the transponder for good.
    pub async fn lock_tag_afi(&self, option_flag: bool) -> Result<()> {
        self.command("AT+LAFI", &[&self::option_flag(option_flag)])
            .await?;
        Ok(())
    }

    pub async fn write_tag_dsfid(&self, dsfid: u8, option_flag: bool) -> Result<()> {
        self.command("AT+WDSFID", &[&Hex2(dsfid), &self::option_flag(option_flag)])
            .await?;
        Ok(())
    }

    /// Lock the DSFID of the transponder for good.
    pub async fn lock_tag_dsfid(&self, option_flag: bool) -> Result<()> {
        self.command("AT+LDSFID", &[&self::option_flag(option_flag)])
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ISO 14443-A
    // -----------------------------------------------------------------------

    /// Send a raw request to the selected ISO 14A transponder.
    pub async fn send_request_iso14a(&self, request: &str) -> Result<String> {
        let entries = self.command("AT+REQ14", &[&request]).await?;
        Ok(entries
            .first()
            .and_then(|e| protocol::payload(e))
            .unwrap_or_default()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn memory_sector_reply() {
        assert_eq!(
            MemorySector::parse("2,64,4"),
            Some(MemorySector {
                sectors: 2,
                number_of_blocks: 64,
                block_size: 4
            })
        );
        assert_eq!(MemorySector::parse("2,x,4"), None);
    }

    #[test]
    fn detected_types() {
        let entries = lines(&[
            "+DTT: E002223504422958,ISO15",
            "+DTT: 04A2B3C4,MIFARE_CLASSIC_1K",
            "+DTT: <NO TAGS FOUND>",
        ]);
        let detected = parse_detected(&entries, 1);
        assert_eq!(detected.len(), 2);
        assert_eq!(detected[0].tag.kind, TagKind::Iso15);
        assert_eq!(detected[0].tag.tid.as_deref(), Some("E002223504422958"));
        assert_eq!(detected[1].tag.kind, TagKind::Iso14a);
        assert_eq!(detected[1].tag_type, "MIFARE_CLASSIC_1K");
        assert_eq!(detected[1].tag.antenna, Some(1));
    }

    #[test]
    fn multi_block_reads_concatenate() {
        let entries = lines(&["+READM: 00112233,00", "+READM: 44556677,01"]);
        let (data, flags) = join_blocks(&entries);
        assert_eq!(data, "0011223344556677");
        assert_eq!(flags, "0001");
    }
}
