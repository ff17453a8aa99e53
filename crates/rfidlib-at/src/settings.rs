//! Inventory settings and memory addressing of AT readers.

use std::fmt;

use rfidlib_core::config::InventoryFields;
use rfidlib_engine::CommandParam;

/// UHF inventory response settings (`AT+INVS`).
///
/// The optional fields are only reported by newer firmware. When writing,
/// fields are sent up to the first absent one, so the reply of
/// `get_inventory_settings` is the natural starting point for a change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UhfInventorySettings {
    pub only_new_tag: bool,
    pub with_rssi: bool,
    pub with_tid: bool,
    /// Start without putting all tags into session state A first.
    pub fast_start: Option<bool>,
    pub phase: Option<bool>,
    /// `ALL`, `SL` or `NSL`.
    pub select: Option<String>,
    /// `A` or `B`.
    pub target: Option<String>,
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

impl UhfInventorySettings {
    /// Parse the payload of `+INVS: 0,1,0[,fast_start,phase,select,target]`.
    pub fn parse(payload: &str) -> Option<Self> {
        let data: Vec<&str> = payload.trim().split(',').collect();
        if data.len() < 3 {
            return None;
        }
        Some(Self {
            only_new_tag: data[0] == "1",
            with_rssi: data[1] == "1",
            with_tid: data[2] == "1",
            fast_start: data.get(3).map(|v| *v == "1"),
            phase: data.get(4).map(|v| *v == "1"),
            select: data.get(5).map(|v| v.to_string()),
            target: data.get(6).map(|v| v.to_string()),
        })
    }

    /// The optional inventory fields these settings produce.
    pub fn fields(&self) -> InventoryFields {
        InventoryFields {
            tid: self.with_tid,
            rssi: self.with_rssi,
            phase: self.phase.unwrap_or(false),
            tag_details: false,
        }
    }

    pub(crate) fn params(&self) -> Vec<String> {
        let mut params = vec![
            flag(self.only_new_tag),
            flag(self.with_rssi),
            flag(self.with_tid),
        ];
        let optional = [
            self.fast_start.map(flag),
            self.phase.map(flag),
            self.select.clone(),
            self.target.clone(),
        ];
        params.extend(optional.into_iter().map_while(|p| p));
        params
    }

    /// Drop the settings the device does not know about, as reported by
    /// a previous `+INVS` reply.
    pub(crate) fn effective(mut self) -> Self {
        if self.fast_start.is_none() {
            self.phase = None;
        }
        if self.phase.is_none() {
            self.select = None;
        }
        if self.select.is_none() {
            self.target = None;
        }
        self
    }
}

/// NFC inventory response settings (`AT+INVS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NfcInventorySettings {
    /// Add tag type and type specific details to each entry.
    pub tag_details: bool,
    /// Send a stay quiet to every tag after it was found.
    pub only_new_tags: bool,
    /// ISO15 only: run inventories without anti-collision loop.
    pub single_slot: bool,
}

impl Default for NfcInventorySettings {
    fn default() -> Self {
        Self {
            tag_details: true,
            only_new_tags: false,
            single_slot: false,
        }
    }
}

impl NfcInventorySettings {
    /// Parse the payload of `+INVS: 1,0,0`.
    pub fn parse(payload: &str) -> Option<Self> {
        let data: Vec<&str> = payload.trim().split(',').collect();
        if data.len() < 3 {
            return None;
        }
        Some(Self {
            tag_details: data[0] == "1",
            only_new_tags: data[1] == "1",
            single_slot: data[2] == "1",
        })
    }

    pub(crate) fn params(&self) -> [String; 3] {
        [
            flag(self.tag_details),
            flag(self.only_new_tags),
            flag(self.single_slot),
        ]
    }
}

/// UHF tag memory banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBank {
    /// Protocol control word.
    Pc,
    Epc,
    Tid,
    Usr,
}

impl MemoryBank {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryBank::Pc => "PC",
            MemoryBank::Epc => "EPC",
            MemoryBank::Tid => "TID",
            MemoryBank::Usr => "USR",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "PC" => Some(MemoryBank::Pc),
            "EPC" => Some(MemoryBank::Epc),
            "TID" => Some(MemoryBank::Tid),
            "USR" => Some(MemoryBank::Usr),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CommandParam for MemoryBank {
    fn to_param(&self) -> Option<String> {
        Some(self.as_str().to_string())
    }
}

/// Lockable areas of a UHF tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBank {
    /// The kill password.
    Kill,
    /// The access password.
    Lck,
    Epc,
    Tid,
    Usr,
}

impl CommandParam for LockBank {
    fn to_param(&self) -> Option<String> {
        Some(
            match self {
                LockBank::Kill => "KILL",
                LockBank::Lck => "LCK",
                LockBank::Epc => "EPC",
                LockBank::Tid => "TID",
                LockBank::Usr => "USR",
            }
            .to_string(),
        )
    }
}

/// A UHF tag filter (`AT+MSK` / `AT+BMSK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    pub memory: MemoryBank,
    /// Start address in the memory bank.
    pub start: u16,
    /// Hexadecimal mask.
    pub mask: String,
    /// Number of mask bits to compare; 0 compares the complete mask.
    pub bit_length: u16,
}

impl Mask {
    pub fn new(memory: MemoryBank, mask: impl Into<String>) -> Self {
        Self {
            memory,
            start: 0,
            mask: mask.into(),
            bit_length: 0,
        }
    }

    /// Parse the payload of `+BMSK: EPC,0,0000,16`; `OFF` is no mask.
    pub fn parse(payload: &str) -> Option<Option<Self>> {
        let data: Vec<&str> = payload.trim().split(',').collect();
        if data.first() == Some(&"OFF") {
            return Some(None);
        }
        if data.len() < 4 {
            return None;
        }
        Some(Some(Self {
            memory: MemoryBank::parse(data[0])?,
            start: data[1].trim().parse().ok()?,
            mask: data[2].to_string(),
            bit_length: data[3].trim().parse().ok()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidlib_engine::render_params;

    #[test]
    fn uhf_settings_basic() {
        let s = UhfInventorySettings::parse("0,1,0").unwrap();
        assert!(!s.only_new_tag);
        assert!(s.with_rssi);
        assert!(!s.with_tid);
        assert_eq!(s.fast_start, None);
        assert_eq!(s.params(), vec!["0", "1", "0"]);
        let fields = s.fields();
        assert!(fields.rssi && !fields.tid && !fields.phase);
    }

    #[test]
    fn uhf_settings_extended() {
        let s = UhfInventorySettings::parse("1,1,1,0,1,ALL,A").unwrap();
        assert_eq!(s.fast_start, Some(false));
        assert_eq!(s.phase, Some(true));
        assert_eq!(s.select.as_deref(), Some("ALL"));
        assert_eq!(s.target.as_deref(), Some("A"));
        assert!(s.fields().phase);
        assert_eq!(s.params(), vec!["1", "1", "1", "0", "1", "ALL", "A"]);
    }

    #[test]
    fn uhf_settings_stop_at_first_gap() {
        let s = UhfInventorySettings {
            with_rssi: true,
            phase: Some(true),
            ..Default::default()
        };
        assert_eq!(s.params(), vec!["0", "1", "0"]);
        assert_eq!(s.effective().phase, None);
    }

    #[test]
    fn short_settings_rejected() {
        assert_eq!(UhfInventorySettings::parse("0,1"), None);
        assert_eq!(NfcInventorySettings::parse(""), None);
    }

    #[test]
    fn nfc_settings() {
        let s = NfcInventorySettings::parse("0,1,0").unwrap();
        assert!(!s.tag_details);
        assert!(s.only_new_tags);
        assert_eq!(s.params(), ["0", "1", "0"]);
    }

    #[test]
    fn mask_parse() {
        assert_eq!(Mask::parse("OFF"), Some(None));
        let mask = Mask::parse("TID,0,E200,16").unwrap().unwrap();
        assert_eq!(mask.memory, MemoryBank::Tid);
        assert_eq!(mask.mask, "E200");
        assert_eq!(mask.bit_length, 16);
        assert_eq!(Mask::parse("EPC,0"), None);
    }

    #[test]
    fn banks_render_as_tokens() {
        assert_eq!(render_params(&[&MemoryBank::Usr, &LockBank::Kill]), vec!["USR", "KILL"]);
    }
}
