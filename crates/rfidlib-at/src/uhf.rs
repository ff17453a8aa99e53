//! UHF specific operations of AT readers.
//!
//! Tag operations (read, write, lock, kill) run on every transponder in the
//! field that matches the optional EPC mask. Per-tag outcomes are attached to
//! the returned tags; only a failure of the command as a whole is an error.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::InventoryCallback;
use rfidlib_core::tag::Tag;
use rfidlib_engine::CommandParam;

use crate::inventory::{parse_group, parse_tag_results, settle_group};
use crate::protocol;
use crate::reader::{AtReader, Uhf};
use crate::settings::{LockBank, Mask, MemoryBank, UhfInventorySettings};

/// Q value configuration of the anti-collision algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QValue {
    pub start: u8,
    pub min: u8,
    pub max: u8,
}

impl QValue {
    /// Expected number of tags in the field.
    pub fn tag_size(&self) -> u32 {
        1 << self.start
    }

    pub fn min_tags(&self) -> u32 {
        1 << self.min
    }

    pub fn max_tags(&self) -> u32 {
        1 << self.max
    }

    fn parse(payload: &str) -> Option<Self> {
        let mut fields = payload.split(',').map(|f| f.trim().parse::<u8>());
        Some(Self {
            start: fields.next()?.ok()?,
            min: fields.next()?.ok()?,
            max: fields.next()?.ok()?,
        })
    }
}

/// Smallest q with `2^q >= count`.
fn q_for(count: u32) -> u8 {
    let mut q = 0u8;
    while q < 31 && count > (1u32 << q) {
        q += 1;
    }
    q
}

/// Both or neither bound must be given.
fn bounds<T>(min: Option<T>, max: Option<T>, message: &str) -> Result<Option<(T, T)>> {
    match (min, max) {
        (Some(min), Some(max)) => Ok(Some((min, max))),
        (None, None) => Ok(None),
        _ => Err(Error::InvalidParameter(message.to_string())),
    }
}

fn mismatch(command: &str, entries: &[String]) -> Error {
    Error::Protocol(format!("Not expected response for command {command} - {entries:?}"))
}

/// Protocol control word length bits for an EPC of `hex_len` characters.
fn pc_length_bits(hex_len: usize) -> Result<u16> {
    if hex_len % 4 != 0 {
        return Err(Error::InvalidParameter(
            "The new epc length must be a multiple of 4".into(),
        ));
    }
    let words = u16::try_from(hex_len / 4)
        .ok()
        .filter(|w| *w <= 31)
        .ok_or_else(|| Error::InvalidParameter("The new epc is too long".into()))?;
    Ok(words << 11)
}

impl AtReader<Uhf> {
    // -----------------------------------------------------------------------
    // Radio
    // -----------------------------------------------------------------------

    /// Set the regulatory region, e.g. `ETSI` or `FCC`.
    pub async fn set_region(&self, region: &str) -> Result<()> {
        self.command("AT+REG", &[&region]).await?;
        Ok(())
    }

    pub async fn get_region(&self) -> Result<String> {
        let entries = self.command("AT+REG?", &[]).await?;
        Ok(protocol::first_payload(&entries, "AT+REG?")?.trim().to_string())
    }

    /// Set the output power in dBm.
    pub async fn set_power(&self, power: i32) -> Result<()> {
        self.command("AT+PWR", &[&power]).await?;
        Ok(())
    }

    pub async fn get_power(&self) -> Result<i32> {
        let entries = self.command("AT+PWR?", &[]).await?;
        protocol::first_number(&entries, "AT+PWR?")
    }

    // -----------------------------------------------------------------------
    // Anti-collision
    // -----------------------------------------------------------------------

    /// Configure the expected number of transponders in the field. The
    /// bounds must be given together.
    pub async fn set_tag_size(
        &self,
        tag_size: u32,
        min_tags: Option<u32>,
        max_tags: Option<u32>,
    ) -> Result<()> {
        let range = bounds(
            min_tags,
            max_tags,
            "min_tags and max_tags must be set, or none of the these",
        )?;
        let q_min = range.map(|(min, _)| q_for(min));
        let q_max = range.map(|(_, max)| q_for(max));
        self.command("AT+Q", &[&q_for(tag_size), &q_min, &q_max])
            .await?;
        Ok(())
    }

    pub async fn get_tag_size(&self) -> Result<u32> {
        Ok(self.get_q_value().await?.tag_size())
    }

    /// Set the Q value directly. The bounds must be given together.
    pub async fn set_q_value(&self, start: u8, min: Option<u8>, max: Option<u8>) -> Result<()> {
        let range = bounds(min, max, "q_min and q_max must be set, or none of the these")?;
        let min = range.map(|(min, _)| min);
        let max = range.map(|(_, max)| max);
        self.command("AT+Q", &[&start, &min, &max]).await?;
        Ok(())
    }

    pub async fn get_q_value(&self) -> Result<QValue> {
        let entries = self.command("AT+Q?", &[]).await?;
        protocol::first_payload(&entries, "AT+Q?")
            .ok()
            .and_then(QValue::parse)
            .ok_or_else(|| mismatch("AT+Q?", &entries))
    }

    // -----------------------------------------------------------------------
    // Mask
    // -----------------------------------------------------------------------

    /// Only transponders matching `mask` take part in inventories and tag
    /// operations. A bit length of 0 compares the complete mask.
    pub async fn set_mask(&self, mask: &Mask) -> Result<()> {
        if mask.bit_length > 0 {
            self.command(
                "AT+BMSK",
                &[&mask.memory, &mask.start, &mask.mask, &mask.bit_length],
            )
            .await?;
        } else {
            self.command("AT+MSK", &[&mask.memory, &mask.start, &mask.mask])
                .await?;
        }
        Ok(())
    }

    /// The active mask, `None` when disabled.
    pub async fn get_mask(&self) -> Result<Option<Mask>> {
        let entries = self.command("AT+BMSK?", &[]).await?;
        protocol::first_payload(&entries, "AT+BMSK?")
            .ok()
            .and_then(Mask::parse)
            .ok_or_else(|| mismatch("AT+BMSK?", &entries))
    }

    pub async fn reset_mask(&self) -> Result<()> {
        self.command("AT+MSK", &[&"OFF"]).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inventory settings
    // -----------------------------------------------------------------------

    pub async fn get_inventory_settings(&self) -> Result<UhfInventorySettings> {
        self.dialect().query_uhf_settings(self.session()).await
    }

    /// Apply inventory settings. Optional fields are sent up to the first
    /// absent one.
    pub async fn set_inventory_settings(&self, settings: UhfInventorySettings) -> Result<()> {
        self.dialect()
            .apply_uhf_settings(self.session(), settings)
            .await
    }

    /// The settings read during configuration or applied last.
    pub fn inventory_settings(&self) -> Option<UhfInventorySettings> {
        self.dialect().uhf_settings()
    }

    // -----------------------------------------------------------------------
    // Inventory reports
    // -----------------------------------------------------------------------

    /// Register the callback for inventory reports. Without one, continuous
    /// reports are aggregated for [`fetch_inventory`](rfidlib_core::Reader::fetch_inventory).
    pub fn set_cb_inventory_report(
        &self,
        callback: Option<InventoryCallback>,
    ) -> Option<InventoryCallback> {
        self.session().set_cb_inventory_report(callback)
    }

    pub fn set_fire_empty_reports(&self, enable: bool) {
        self.session().set_fire_empty_reports(enable);
    }

    /// Collect tags for `duration` (the device default when zero) and
    /// report each once, with its occurrence count.
    pub async fn get_inventory_report(
        &self,
        duration: Duration,
        ignore_errors: bool,
    ) -> Result<Vec<Tag>> {
        self.dialect().set_ignore_errors(ignore_errors);
        let millis = (!duration.is_zero()).then(|| duration.as_millis() as u64);
        let timeout = self.session().command_timeout() + duration;
        let entries = self
            .command_with_timeout("AT+INVR", &[&millis], timeout)
            .await?;
        let session = self.session();
        let format = self.dialect().entry_format(session, true);
        let group = parse_group(entries.iter().map(String::as_str), format, Utc::now());
        let fallback = Some(self.current_antenna());
        let tags = settle_group(session, group, fallback, ignore_errors)?;
        session.fire_inventory_report(tags.clone(), false);
        Ok(tags)
    }

    /// Start continuous inventory reports, one every `duration`.
    pub async fn start_inventory_report(&self, duration: Duration, ignore_errors: bool) -> Result<()> {
        self.dialect().set_ignore_errors(ignore_errors);
        let millis = duration.as_millis() as u64;
        let timeout = self.session().command_timeout() + duration;
        self.command_with_timeout("AT+CINVR", &[&millis], timeout)
            .await?;
        Ok(())
    }

    /// Stop continuous inventory reports. Stopping reports that are not
    /// running succeeds.
    pub async fn stop_inventory_report(&self) -> Result<()> {
        self.dialect().stop_inventory_report(self.session()).await
    }

    // -----------------------------------------------------------------------
    // Tag memory
    // -----------------------------------------------------------------------

    /// Read `length` words from `memory` of every transponder in the field.
    pub async fn read_tag_data(
        &self,
        memory: MemoryBank,
        start: u16,
        length: u16,
        epc_mask: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let entries = self
            .command("AT+READ", &[&memory, &start, &length, &epc_mask])
            .await?;
        let timestamp = Utc::now();
        let tags = entries
            .iter()
            .filter_map(|entry| protocol::payload(entry))
            .filter(|p| !p.starts_with('<'))
            .filter_map(|p| {
                // EPC,OK,DATA or EPC,ERROR
                let mut info = p.split(',');
                let mut tag = Tag::uhf(info.next().filter(|e| !e.is_empty())?, timestamp);
                match (info.next(), info.next()) {
                    (Some("OK"), Some(data)) => {
                        if memory == MemoryBank::Tid {
                            tag.tid = Some(data.to_string());
                        }
                        tag.data = Some(data.to_string());
                    }
                    (Some("OK"), None) | (None, _) => {}
                    (Some(status), _) => tag.set_error_message(Some(status.to_string())),
                }
                Some(tag)
            })
            .collect();
        Ok(tags)
    }

    pub async fn read_tag_usr(&self, start: u16, length: u16, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.read_tag_data(MemoryBank::Usr, start, length, epc_mask)
            .await
    }

    pub async fn read_tag_tid(&self, start: u16, length: u16, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.read_tag_data(MemoryBank::Tid, start, length, epc_mask)
            .await
    }

    /// Write hex `data` to `memory` of every transponder in the field.
    pub async fn write_tag_data(
        &self,
        memory: MemoryBank,
        start: u16,
        data: &str,
        epc_mask: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let entries = self
            .command("AT+WRT", &[&memory, &start, &data, &epc_mask])
            .await?;
        Ok(parse_tag_results(&entries, Utc::now()))
    }

    pub async fn write_tag_usr(&self, start: u16, data: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        if data.is_empty() {
            return Err(Error::InvalidParameter("Data must be set".into()));
        }
        self.write_tag_data(MemoryBank::Usr, start, data, epc_mask)
            .await
    }

    /// Replace the EPC and update the length bits of the protocol control
    /// word. With a `tid` only that transponder is written; the previous mask
    /// is restored afterwards.
    ///
    /// Successfully written tags are returned under their new EPC with the
    /// old one in `previous_id`.
    pub async fn write_tag_epc(&self, tid: Option<&str>, new_epc: &str, start: u16) -> Result<Vec<Tag>> {
        let length_bits = pc_length_bits(new_epc.len())?;
        let saved_mask = match tid {
            Some(tid) => {
                let saved = self.get_mask().await?;
                self.set_mask(&Mask::new(MemoryBank::Tid, tid)).await?;
                Some(saved)
            }
            None => None,
        };

        let result = self.write_epc_and_length(new_epc, start, length_bits).await;

        if let Some(saved) = saved_mask {
            let restored = match saved {
                Some(mask) => self.set_mask(&mask).await,
                None => self.reset_mask().await,
            };
            if let Err(e) = restored {
                debug!(instance = %self.session().instance(), error = %e, "mask not restored");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    async fn write_epc_and_length(&self, new_epc: &str, start: u16, length_bits: u16) -> Result<Vec<Tag>> {
        let pc_tags = self.read_tag_data(MemoryBank::Pc, 0, 2, None).await?;
        let mut pc_word: Option<u16> = None;
        for tag in pc_tags.iter().filter(|t| !t.has_error()) {
            let Some(word) = tag
                .data
                .as_deref()
                .and_then(|d| u16::from_str_radix(d.get(..4).unwrap_or(d), 16).ok())
            else {
                continue;
            };
            let flags = word & 0x07FF;
            match pc_word {
                None => pc_word = Some(flags),
                Some(existing) if existing != flags => {
                    return Err(Error::Reader(
                        "Different tags are in the field, which would result in data loss \
                         when writing. Please edit individually."
                            .into(),
                    ));
                }
                Some(_) => {}
            }
        }
        let Some(pc_word) = pc_word else {
            return Ok(Vec::new());
        };

        // The field stays active between both writes, so both replies carry
        // the old EPC and can be matched.
        let mut order: Vec<String> = Vec::new();
        let mut tags: HashMap<String, Tag> = HashMap::new();
        for tag in self
            .write_tag_data(MemoryBank::Epc, start, new_epc, None)
            .await?
        {
            let key = tag.id().to_string();
            order.push(key.clone());
            let tag = if tag.has_error() { tag } else { tag.rename(new_epc) };
            tags.insert(key, tag);
        }

        let length_word = format!("{:04X}", pc_word | length_bits);
        for pc_tag in self
            .write_tag_data(MemoryBank::Pc, 0, &length_word, None)
            .await?
        {
            match tags.get_mut(pc_tag.id()) {
                Some(epc_tag) if pc_tag.has_error() => {
                    let message = match epc_tag.error_message() {
                        None => "epc written, epc length not updated!".to_string(),
                        Some(err) => format!("epc not written - {err}"),
                    };
                    epc_tag.set_error_message(Some(message));
                }
                Some(_) => {}
                None if !pc_tag.has_error() => {
                    let mut tag = pc_tag;
                    tag.set_error_message(Some("epc not written, but epc length updated!".into()));
                    order.push(tag.id().to_string());
                    tags.insert(tag.id().to_string(), tag);
                }
                None => {}
            }
        }
        Ok(order.into_iter().filter_map(|k| tags.remove(&k)).collect())
    }

    // -----------------------------------------------------------------------
    // Access control
    // -----------------------------------------------------------------------

    /// Permanently disable every transponder in the field.
    pub async fn kill_tag(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.tag_command("AT+KILL", &[&password, &epc_mask]).await
    }

    pub async fn lock_tag(&self, bank: LockBank, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.tag_command("AT+LCK", &[&bank, &password, &epc_mask])
            .await
    }

    pub async fn lock_user_memory(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.lock_tag(LockBank::Usr, password, epc_mask).await
    }

    pub async fn lock_epc_memory(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.lock_tag(LockBank::Epc, password, epc_mask).await
    }

    pub async fn unlock_tag(&self, bank: LockBank, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.tag_command("AT+ULCK", &[&bank, &password, &epc_mask])
            .await
    }

    pub async fn unlock_user_memory(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.unlock_tag(LockBank::Usr, password, epc_mask).await
    }

    pub async fn unlock_epc_memory(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.unlock_tag(LockBank::Epc, password, epc_mask).await
    }

    /// Lock a memory bank for good. This cannot be undone.
    pub async fn lock_tag_permanent(
        &self,
        bank: LockBank,
        password: &str,
        epc_mask: Option<&str>,
    ) -> Result<Vec<Tag>> {
        self.tag_command("AT+PLCK", &[&bank, &password, &epc_mask])
            .await
    }

    pub async fn lock_user_memory_permanent(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.lock_tag_permanent(LockBank::Usr, password, epc_mask)
            .await
    }

    pub async fn lock_epc_memory_permanent(&self, password: &str, epc_mask: Option<&str>) -> Result<Vec<Tag>> {
        self.lock_tag_permanent(LockBank::Epc, password, epc_mask)
            .await
    }

    pub async fn set_lock_password(
        &self,
        password: &str,
        new_password: &str,
        epc_mask: Option<&str>,
    ) -> Result<Vec<Tag>> {
        self.tag_command("AT+PWD", &[&"LCK", &password, &new_password, &epc_mask])
            .await
    }

    pub async fn set_kill_password(
        &self,
        password: &str,
        new_password: &str,
        epc_mask: Option<&str>,
    ) -> Result<Vec<Tag>> {
        self.tag_command("AT+PWD", &[&"KILL", &password, &new_password, &epc_mask])
            .await
    }

    async fn tag_command(&self, name: &str, params: &[&dyn CommandParam]) -> Result<Vec<Tag>> {
        let entries = self.command(name, params).await?;
        Ok(parse_tag_results(&entries, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q_rounds_up_to_power_of_two() {
        assert_eq!(q_for(0), 0);
        assert_eq!(q_for(1), 0);
        assert_eq!(q_for(2), 1);
        assert_eq!(q_for(5), 3);
        assert_eq!(q_for(16), 4);
        assert_eq!(q_for(17), 5);
    }

    #[test]
    fn q_reply() {
        let q = QValue::parse("4,2,15").unwrap();
        assert_eq!(q, QValue { start: 4, min: 2, max: 15 });
        assert_eq!(q.tag_size(), 16);
        assert_eq!(q.min_tags(), 4);
        assert!(QValue::parse("4,2").is_none());
    }

    #[test]
    fn bounds_come_in_pairs() {
        assert_eq!(bounds::<u8>(None, None, "x").unwrap(), None);
        assert_eq!(bounds(Some(1), Some(2), "x").unwrap(), Some((1, 2)));
        let err = bounds(Some(1), None, "q_min and q_max must be set, or none of the these").unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(m) if m.starts_with("q_min")));
    }

    #[test]
    fn pc_length_word() {
        // 96 bit EPC: 6 words.
        assert_eq!(pc_length_bits(24).unwrap(), 0x3000);
        // 112 bit EPC: 7 words.
        assert_eq!(pc_length_bits(28).unwrap(), 0x3800);
        assert!(pc_length_bits(26).is_err());
    }
}
