//! Reader configuration snapshot and device identity checks.
//!
//! The [`ReaderConfig`] is populated while a reader is being configured and
//! consulted by the inventory parsers to know which fields a line carries.
//! It belongs to exactly one reader instance.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// A firmware or hardware version, reported by devices as four digits
/// (`"0218"` is version 2.18).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parse the four-digit device notation.
    pub fn parse(digits: &str) -> Option<Self> {
        let digits = digits.trim();
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let major = digits[..2].parse().ok()?;
        let minor = digits[2..].parse().ok()?;
        Some(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// What the device reported about itself during configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderIdentity {
    pub hardware_name: String,
    pub hardware_version: Option<Version>,
    pub firmware_name: String,
    pub firmware_version: Option<Version>,
    pub serial_number: Option<String>,
}

/// The device signature a reader model expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedReader {
    pub hardware_name: &'static str,
    pub firmware_name: &'static str,
    pub min_firmware: Version,
}

impl ExpectedReader {
    /// Check a reported identity.
    ///
    /// Names match case-insensitively as substrings of the reported names.
    /// A missing firmware version is not treated as too old.
    pub fn validate(&self, identity: &ReaderIdentity) -> Result<()> {
        let contains = |found: &str, expected: &str| {
            found.to_lowercase().contains(&expected.to_lowercase())
        };
        if !contains(&identity.hardware_name, self.hardware_name) {
            return Err(Error::Configuration(format!(
                "Wrong reader type! {} expected, {} found",
                self.hardware_name, identity.hardware_name
            )));
        }
        if !contains(&identity.firmware_name, self.firmware_name) {
            return Err(Error::Configuration(format!(
                "Wrong reader firmware! {} expected, {} found",
                self.firmware_name, identity.firmware_name
            )));
        }
        if let Some(found) = identity.firmware_version {
            if found < self.min_firmware {
                return Err(Error::Configuration(format!(
                    "Reader firmware too low, please update! Minimum {} expected, {} found",
                    self.min_firmware, found
                )));
            }
        }
        Ok(())
    }
}

/// Single antenna or multiplexed antenna operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntennaMode {
    #[default]
    Single,
    Multiplex,
}

/// Optional fields present in inventory lines, derived from the reader's
/// inventory settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryFields {
    pub tid: bool,
    pub rssi: bool,
    pub phase: bool,
    /// NFC readers: tag type and type specific details.
    pub tag_details: bool,
}

/// Mutable per-reader configuration record.
#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    pub identity: ReaderIdentity,
    pub antenna_mode: AntennaMode,
    /// Currently selected antenna (single mode).
    pub antenna: u8,
    /// Number of multiplexed antennas.
    pub antenna_count: u8,
    /// Heartbeat interval in seconds; 0 disables liveness checking.
    pub heartbeat: u32,
    pub inventory: InventoryFields,
    /// Antenna faults seen during inventories, keyed by `"Antenna N"` or
    /// `"message"` when the fault could not be attributed.
    pub errors: BTreeMap<String, String>,
}

impl ReaderConfig {
    /// Key under which an antenna fault is recorded.
    pub fn error_key(antenna: Option<u8>) -> String {
        match antenna {
            Some(n) => format!("Antenna {n}"),
            None => "message".to_string(),
        }
    }

    pub fn record_error(&mut self, antenna: Option<u8>, message: impl Into<String>) {
        self.errors.insert(Self::error_key(antenna), message.into());
    }

    /// Forget the fault of an antenna that completed a round without error.
    /// Returns true if an entry was removed.
    pub fn clear_error(&mut self, antenna: Option<u8>) -> bool {
        self.errors.remove(&Self::error_key(antenna)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> ExpectedReader {
        ExpectedReader {
            hardware_name: "QUASAR_MX",
            firmware_name: "QUASAR_MX",
            min_firmware: Version::new(2, 18),
        }
    }

    fn identity(hw: &str, fw: &str, version: &str) -> ReaderIdentity {
        ReaderIdentity {
            hardware_name: hw.into(),
            hardware_version: Version::parse("0200"),
            firmware_name: fw.into(),
            firmware_version: Version::parse(version),
            serial_number: None,
        }
    }

    #[test]
    fn version_parse_and_order() {
        let v = Version::parse("0218").unwrap();
        assert_eq!(v, Version::new(2, 18));
        assert_eq!(v.to_string(), "2.18");
        assert!(Version::parse("0202").unwrap() < v);
        assert!(Version::parse("0300").unwrap() > v);
        assert_eq!(Version::parse("2.18"), None);
        assert_eq!(Version::parse("02"), None);
    }

    #[test]
    fn identity_accepted() {
        assert!(expected().validate(&identity("QUASAR_MX", "QUASAR_MX", "0218")).is_ok());
        assert!(expected().validate(&identity("quasar_mx_v2", "Quasar_MX", "0301")).is_ok());
    }

    #[test]
    fn wrong_hardware_rejected() {
        let err = expected()
            .validate(&identity("DESKID_ISO", "QUASAR_MX", "0218"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: Wrong reader type! QUASAR_MX expected, DESKID_ISO found"
        );
    }

    #[test]
    fn wrong_firmware_rejected() {
        let err = expected()
            .validate(&identity("QUASAR_MX", "PULSAR", "0218"))
            .unwrap_err();
        assert!(err.to_string().contains("Wrong reader firmware!"));
    }

    #[test]
    fn old_firmware_rejected() {
        let err = expected()
            .validate(&identity("QUASAR_MX", "QUASAR_MX", "0217"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("Minimum 2.18 expected, 2.17 found"));
    }

    #[test]
    fn antenna_error_bookkeeping() {
        let mut config = ReaderConfig::default();
        config.record_error(Some(2), "Antenna Error");
        config.record_error(None, "Antenna Error");
        assert_eq!(config.errors.get("Antenna 2").map(String::as_str), Some("Antenna Error"));
        assert!(config.errors.contains_key("message"));
        assert!(config.clear_error(Some(2)));
        assert!(!config.clear_error(Some(2)));
        assert_eq!(config.errors.len(), 1);
    }
}
