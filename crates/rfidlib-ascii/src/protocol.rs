//! Legacy ASCII command codec and line parsers.
//!
//! Commands are three-letter names followed by space separated parameters,
//! terminated with `\r`:
//!
//! ```text
//! SAP MAN 2<CR>
//! ```
//!
//! While the reader is being configured lines are framed on `\r`. Once
//! end-of-frame mode is enabled (`EOF`) the reader closes every frame with
//! `\n`, so one framed line can carry several `\r` separated parts:
//!
//! ```text
//! E0040150954F02B1<CR>E200600311753E33<CR>ARP 12<CR>IVF 02<CR><LF>
//! TDT<CR>0011112222B7DD<CR>COK<CR>NCL<CR><LF>
//! ```
//!
//! Heartbeats (`HBT`), inventory groups (`IVF`), tag request results
//! (`TDT`, `TND`, `TNR`), registers-not-written (`RNW`) and soft reset
//! (`SRT`) notifications arrive without being asked for; [`classify`]
//! separates them from command replies.

use chrono::{DateTime, Utc};

use rfidlib_core::config::{ReaderIdentity, Version};
use rfidlib_core::error::{Error, Result};
use rfidlib_core::tag::Tag;
use rfidlib_engine::{CommandParam, render_params};

/// Command terminator.
pub const TERMINATOR: char = '\r';

/// Separator of the parts of one end-of-frame line.
pub const PART_SEPARATOR: char = '\r';

/// Build the wire text of a command, without terminator. Absent
/// parameters are left out.
///
/// ```
/// use rfidlib_ascii::protocol::prepare_command;
///
/// let afi: Option<&str> = None;
/// assert_eq!(prepare_command("INV", &[&"SSL", &afi]), "INV SSL");
/// assert_eq!(prepare_command("SAP", &[&"AUT", &4u8, &0u32]), "SAP AUT 4 0");
/// assert_eq!(prepare_command("BRK", &[]), "BRK");
/// ```
pub fn prepare_command(command: &str, params: &[&dyn CommandParam]) -> String {
    let params = render_params(params);
    if params.is_empty() {
        return command.to_string();
    }
    format!("{command} {}", params.join(" "))
}

/// Did a set command succeed? The reader answers `OK!`.
pub fn is_ok(reply: &str) -> bool {
    reply.contains("OK")
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// What a received line is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    Empty,
    Heartbeat,
    /// Result of a `REQ` / `WRQ` tag request.
    Request(&'a str),
    /// An inventory group ending with `IVF nn`.
    Inventory(&'a str),
    /// `RNW`: the RF interface registers were not written, the interface
    /// is off.
    RegistersNotWritten,
    /// `SRT`: the reader reset itself.
    SoftReset,
    Reply(&'a str),
}

/// Classify one received line, trailing `\r` already removed.
///
/// ```
/// use rfidlib_ascii::protocol::{classify, Line};
///
/// assert_eq!(classify("HBT"), Line::Heartbeat);
/// assert_eq!(classify("IVF 00"), Line::Inventory("IVF 00"));
/// assert_eq!(classify("OK!"), Line::Reply("OK!"));
/// ```
pub fn classify(line: &str) -> Line<'_> {
    if line.is_empty() {
        return Line::Empty;
    }
    if line.starts_with("HBT") {
        return Line::Heartbeat;
    }
    if line.starts_with("TD") || line.starts_with("TN") {
        return Line::Request(line);
    }
    if line.starts_with("IV") {
        return Line::Inventory(line);
    }
    if line.starts_with("RNW") {
        return Line::RegistersNotWritten;
    }
    if line.starts_with("SRT") {
        return Line::SoftReset;
    }
    if line.contains(PART_SEPARATOR) && last_part(line).starts_with("IVF") {
        return Line::Inventory(line);
    }
    Line::Reply(line)
}

fn last_part(line: &str) -> &str {
    line.rsplit(PART_SEPARATOR).next().unwrap_or(line)
}

/// Lines worth queuing while the reader is being configured. Heartbeats of
/// a reader that kept running are dropped.
pub fn is_config_reply(line: &str) -> bool {
    !line.is_empty() && !line.starts_with("HBT")
}

// ---------------------------------------------------------------------------
// Inventory groups
// ---------------------------------------------------------------------------

/// Parse an inventory group: TIDs, optional `ARP nn` antenna reports that
/// apply to the TIDs before them, and the closing `IVF nn`.
///
/// ```
/// use chrono::Utc;
/// use rfidlib_ascii::protocol::parse_inventory;
///
/// let tags = parse_inventory("E0040150954F02B1\rE200600311753E33\rARP 12\rIVF 02", Utc::now());
/// assert_eq!(tags.len(), 2);
/// assert_eq!(tags[1].antenna, Some(12));
/// ```
pub fn parse_inventory(group: &str, timestamp: DateTime<Utc>) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for part in group.split(PART_SEPARATOR) {
        if part.is_empty() || part.starts_with("IVF") {
            continue;
        }
        if let Some(antenna) = part.strip_prefix("ARP") {
            if let Ok(antenna) = antenna.trim().parse::<u8>() {
                for tag in &mut tags {
                    tag.antenna = Some(antenna);
                }
            }
            continue;
        }
        tags.push(Tag::hf(part, timestamp));
    }
    tags
}

// ---------------------------------------------------------------------------
// Tag requests
// ---------------------------------------------------------------------------

/// Outcome of a `REQ` / `WRQ` tag request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagResponse {
    /// Response data of the transponder without flags and CRC. Empty for
    /// writes and on error.
    pub data: String,
    /// `TNR` (no tag), `CDT` (collision), `TEC xx` (transponder error
    /// code) and the like.
    pub error: Option<String>,
    /// Antenna that answered, when the antenna report is on.
    pub antenna: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl TagResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Decode the data of a `Get System Information` request.
    pub fn information(&self) -> Option<TagInformation> {
        TagInformation::parse(&self.data)
    }
}

/// Parse the result group of a tag request.
///
/// ```
/// use chrono::Utc;
/// use rfidlib_ascii::protocol::parse_request;
///
/// let response = parse_request("TDT\r0011112222B7DD\rCOK\rNCL", Utc::now());
/// assert_eq!(response.data, "11112222");
/// assert!(response.is_ok());
///
/// let response = parse_request("TNR", Utc::now());
/// assert_eq!(response.error.as_deref(), Some("TNR"));
/// ```
pub fn parse_request(group: &str, timestamp: DateTime<Utc>) -> TagResponse {
    let mut parts: Vec<&str> = group.split(PART_SEPARATOR).collect();
    let mut antenna = None;
    if let Some(report) = parts.last().and_then(|p| p.strip_prefix("ARP")) {
        antenna = report.trim().parse().ok();
        parts.pop();
    }

    let last = parts.last().copied().unwrap_or_default();
    let error = if last == "NCL" {
        match (parts.get(1), parts.get(2)) {
            (Some(frame), Some(&"COK")) => {
                if frame.starts_with("00") && frame.len() >= 6 {
                    let data = frame[2..frame.len() - 4].to_string();
                    return TagResponse {
                        data,
                        error: None,
                        antenna,
                        timestamp,
                    };
                }
                Some(format!("TEC {}", frame.get(2..4).unwrap_or_default()))
            }
            (_, Some(status)) => Some(status.to_string()),
            _ => Some(group.to_string()),
        }
    } else {
        // TNR (no tag), CDT (collision), RDL (read data too long)
        Some(last.to_string())
    };
    TagResponse {
        data: String::new(),
        error,
        antenna,
        timestamp,
    }
}

/// System information of an ISO 15693 transponder (`Get System Information`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagInformation {
    pub dsfid: Option<u8>,
    pub afi: Option<u8>,
    pub number_of_blocks: Option<u16>,
    /// Bytes per block.
    pub block_size: Option<u8>,
    pub ic_reference: Option<u8>,
}

impl TagInformation {
    /// Decode the response data: info flags, UID, then the fields the
    /// flags announce, in order.
    pub fn parse(data: &str) -> Option<Self> {
        let byte = |at: usize| {
            data.get(at..at + 2)
                .and_then(|b| u8::from_str_radix(b, 16).ok())
        };
        let flags = byte(0)?;
        let mut info = TagInformation::default();
        // info flags and the 8 byte UID
        let mut at = 18;
        if flags & 0x01 != 0 {
            info.dsfid = byte(at);
            at += 2;
        }
        if flags & 0x02 != 0 {
            info.afi = byte(at);
            at += 2;
        }
        if flags & 0x04 != 0 {
            info.number_of_blocks = byte(at).map(|n| u16::from(n) + 1);
            info.block_size = byte(at + 2).map(|n| (n & 0x3F) + 1);
            at += 4;
        }
        if flags & 0x08 != 0 {
            info.ic_reference = byte(at);
        }
        Some(info)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Split `NAME      VVVV` into name and version.
fn split_versioned(reply: &str, digits: usize) -> Option<(&str, &str)> {
    let reply = reply.trim_end();
    let at = reply.len().checked_sub(digits)?;
    let (name, version) = (reply.get(..at)?, reply.get(at..)?);
    Some((name.trim(), version))
}

/// Identity from the `HWR` and `RFW` replies (`DESKID_ISO      0200`).
pub fn parse_hwr_rfw(hwr: &str, rfw: &str) -> Result<ReaderIdentity> {
    let bad = |command: &str, reply: &str| {
        Error::Protocol(format!("Not expected response for command {command} - {reply}"))
    };
    let (hardware, hardware_version) = split_versioned(hwr, 4).ok_or_else(|| bad("HWR", hwr))?;
    let (firmware, firmware_version) = split_versioned(rfw, 4).ok_or_else(|| bad("RFW", rfw))?;
    Ok(ReaderIdentity {
        hardware_name: hardware.to_string(),
        hardware_version: Version::parse(hardware_version),
        firmware_name: firmware.to_string(),
        firmware_version: Version::parse(firmware_version),
        serial_number: None,
    })
}

/// Identity from the `REV` reply of older readers
/// (`DESKID_ISO     01000218`: hardware revision, then firmware revision).
pub fn parse_rev(rev: &str) -> Result<ReaderIdentity> {
    let (name, versions) = split_versioned(rev, 8)
        .ok_or_else(|| Error::Protocol(format!("Not expected response for command REV - {rev}")))?;
    Ok(ReaderIdentity {
        hardware_name: name.to_string(),
        hardware_version: versions.get(..4).and_then(Version::parse),
        firmware_name: name.to_string(),
        firmware_version: versions.get(4..).and_then(Version::parse),
        serial_number: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // =======================================================================
    // Commands
    // =======================================================================

    #[test]
    fn command_rendering() {
        let none: Option<&str> = None;
        assert_eq!(prepare_command("CNR INV", &[&none, &"ONT"]), "CNR INV ONT");
        assert_eq!(prepare_command("SRI", &[&"SS", &100u8]), "SRI SS 100");
        assert_eq!(prepare_command("HBT", &[&0u32]), "HBT 0");
    }

    // =======================================================================
    // Classification
    // =======================================================================

    #[test]
    fn event_lines() {
        assert_eq!(classify(""), Line::Empty);
        assert_eq!(classify("HBT"), Line::Heartbeat);
        assert_eq!(classify("TNR"), Line::Request("TNR"));
        assert_eq!(
            classify("TDT\r0011112222B7DD\rCOK\rNCL"),
            Line::Request("TDT\r0011112222B7DD\rCOK\rNCL")
        );
        assert_eq!(classify("RNW"), Line::RegistersNotWritten);
        assert_eq!(classify("SRT"), Line::SoftReset);
    }

    #[test]
    fn inventory_group_starting_with_tid() {
        let group = "E0040150954F02B1\rIVF 01";
        assert_eq!(classify(group), Line::Inventory(group));
    }

    #[test]
    fn replies() {
        assert_eq!(classify("BRA"), Line::Reply("BRA"));
        assert_eq!(classify("QUASAR_MX       0218"), Line::Reply("QUASAR_MX       0218"));
        assert_eq!(classify("HI"), Line::Reply("HI"));
    }

    #[test]
    fn config_phase_drops_heartbeats() {
        assert!(!is_config_reply("HBT"));
        assert!(!is_config_reply(""));
        assert!(is_config_reply("CCE"));
    }

    // =======================================================================
    // Inventory and requests
    // =======================================================================

    #[test]
    fn empty_inventory() {
        assert!(parse_inventory("IVF 00", Utc::now()).is_empty());
    }

    #[test]
    fn inventory_without_antenna_report() {
        let tags = parse_inventory("E0040150954F02B1\rIVF 01", Utc::now());
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id(), "E0040150954F02B1");
        assert_eq!(tags[0].tid.as_deref(), Some("E0040150954F02B1"));
        assert_eq!(tags[0].antenna, None);
    }

    #[test]
    fn antenna_reports_apply_to_preceding_tags() {
        let tags = parse_inventory("AAAA\rARP 01\rBBBB\rARP 02\rIVF 02", Utc::now());
        assert_eq!(tags[0].antenna, Some(2));
        assert_eq!(tags[1].antenna, Some(2));
    }

    #[test]
    fn request_transponder_error_code() {
        let response = parse_request("TDT\r010F1234\rCOK\rNCL", Utc::now());
        assert_eq!(response.error.as_deref(), Some("TEC 0F"));
        assert!(response.data.is_empty());
    }

    #[test]
    fn request_crc_failure() {
        let response = parse_request("TDT\r0011112222B7DD\rCER\rNCL", Utc::now());
        assert_eq!(response.error.as_deref(), Some("CER"));
    }

    #[test]
    fn request_with_antenna_report() {
        let response = parse_request("TDT\r0011112222B7DD\rCOK\rNCL\rARP 2", Utc::now());
        assert_eq!(response.data, "11112222");
        assert_eq!(response.antenna, Some(2));

        let response = parse_request("CDT\rARP 1", Utc::now());
        assert_eq!(response.error.as_deref(), Some("CDT"));
    }

    #[test]
    fn system_information() {
        // flags 0F, UID, DSFID 00, AFI 07, 28 blocks of 4 bytes, IC 01
        let info = TagInformation::parse("0FE0040150954F02B100071B0301").unwrap();
        assert_eq!(info.dsfid, Some(0));
        assert_eq!(info.afi, Some(7));
        assert_eq!(info.number_of_blocks, Some(28));
        assert_eq!(info.block_size, Some(4));
        assert_eq!(info.ic_reference, Some(1));

        let info = TagInformation::parse("00E0040150954F02B1").unwrap();
        assert_eq!(info, TagInformation::default());
        assert_eq!(TagInformation::parse(""), None);
    }

    // =======================================================================
    // Identity
    // =======================================================================

    #[test]
    fn identity_from_hwr_and_rfw() {
        let identity = parse_hwr_rfw("QUASAR_MX       0200", "QUASAR_MX       0218").unwrap();
        assert_eq!(identity.hardware_name, "QUASAR_MX");
        assert_eq!(identity.hardware_version, Some(Version::new(2, 0)));
        assert_eq!(identity.firmware_version, Some(Version::new(2, 18)));
    }

    #[test]
    fn identity_from_rev() {
        let identity = parse_rev("DESKID_ISO     01000218").unwrap();
        assert_eq!(identity.hardware_name, "DESKID_ISO");
        assert_eq!(identity.firmware_name, "DESKID_ISO");
        assert_eq!(identity.hardware_version, Some(Version::new(1, 0)));
        assert_eq!(identity.firmware_version, Some(Version::new(2, 18)));
        assert!(parse_rev("REV").is_err());
    }
}
