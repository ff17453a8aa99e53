//! Transponder observations.
//!
//! A [`Tag`] is created by an inventory parser for every entry it finds.
//! Its identifier never changes after construction; everything else may be
//! updated by the parser that produced it and by the aggregation step that
//! merges repeated sightings during a continuous scan.

use chrono::{DateTime, Utc};

/// The air interface a tag was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// EPC Gen2 UHF transponder, identified by its EPC.
    Uhf,
    /// HF transponder of unspecified type, identified by its TID.
    Hf,
    /// ISO 15693 (vicinity) transponder.
    Iso15,
    /// ISO 14443-A (proximity) transponder.
    Iso14a,
}

impl TagKind {
    /// Parse the tag type token reported by NFC readers (`ISO15`, `ISO14A`).
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "ISO15" => TagKind::Iso15,
            "ISO14A" => TagKind::Iso14a,
            _ => TagKind::Hf,
        }
    }
}

/// One transponder observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    id: String,
    pub kind: TagKind,
    /// TID, when the inventory includes it. For HF tags this equals the id.
    pub tid: Option<String>,
    /// Capture time of this observation.
    pub timestamp: DateTime<Utc>,
    /// Set by aggregation.
    pub first_seen: Option<DateTime<Utc>>,
    /// Set by aggregation.
    pub last_seen: Option<DateTime<Utc>>,
    /// Antenna (or multiplexer port) the tag was seen on.
    pub antenna: Option<u8>,
    /// Memory contents returned by a read command.
    pub data: Option<String>,
    /// Occurrences merged into this observation.
    pub seen_count: u32,
    pub rssi: Option<i32>,
    /// Phase pair reported by UHF readers with phase output enabled.
    pub phase: Option<(i32, i32)>,
    /// The EPC before a successful EPC rewrite.
    pub previous_id: Option<String>,
    /// ISO 15693 data storage format identifier.
    pub dsfid: Option<String>,
    /// ISO 14443-A select acknowledge.
    pub sak: Option<String>,
    /// ISO 14443-A answer to request.
    pub atqa: Option<String>,
    error_message: Option<String>,
}

impl Tag {
    /// A new observation with a seen count of one.
    pub fn new(kind: TagKind, id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let id = id.into();
        let tid = match kind {
            TagKind::Uhf => None,
            _ => Some(id.clone()),
        };
        Self {
            id,
            kind,
            tid,
            timestamp,
            first_seen: None,
            last_seen: None,
            antenna: None,
            data: None,
            seen_count: 1,
            rssi: None,
            phase: None,
            previous_id: None,
            dsfid: None,
            sak: None,
            atqa: None,
            error_message: None,
        }
    }

    /// A UHF tag identified by its EPC.
    pub fn uhf(epc: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(TagKind::Uhf, epc, timestamp)
    }

    /// An HF tag identified by its TID.
    pub fn hf(tid: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(TagKind::Hf, tid, timestamp)
    }

    /// The identifier: EPC for UHF tags, TID for HF tags.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the EPC after a successful rewrite, keeping the old one.
    pub fn rename(&self, new_epc: impl Into<String>) -> Self {
        let mut renamed = self.clone();
        renamed.previous_id = Some(std::mem::replace(&mut renamed.id, new_epc.into()));
        renamed
    }

    pub fn has_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Set or clear the error message. An empty message clears the error.
    pub fn set_error_message(&mut self, message: Option<String>) {
        self.error_message = message.filter(|m| !m.is_empty());
    }
}

// ---------------------------------------------------------------------------
// ISO 15693 system information
// ---------------------------------------------------------------------------

/// Parsed ISO 15693 "get system information" response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub dsfid: Option<u8>,
    pub afi: Option<u8>,
    pub block_count: Option<u16>,
    pub block_size: Option<u8>,
    /// IC reference.
    pub icr: Option<u8>,
}

impl SystemInfo {
    /// Parse the hex payload (response flag byte already stripped): an info
    /// flag byte, the 8-byte UID, then only the optional fields the flag announces.
    pub fn parse(data: &str) -> Option<Self> {
        let byte = |from: usize| -> Option<u8> {
            data.get(from..from + 2)
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        };
        let flags = byte(0)?;
        let mut info = SystemInfo::default();
        let mut pos = 18;
        if flags & 0x01 != 0 {
            info.dsfid = byte(pos);
            pos += 2;
        }
        if flags & 0x02 != 0 {
            info.afi = byte(pos);
            pos += 2;
        }
        if flags & 0x04 != 0 {
            info.block_count = byte(pos).map(|n| u16::from(n) + 1);
            info.block_size = byte(pos + 2).map(|n| (n & 0x3F) + 1);
            pos += 4;
        }
        if flags & 0x08 != 0 {
            info.icr = byte(pos);
        }
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uhf_tag_defaults() {
        let now = Utc::now();
        let tag = Tag::uhf("ABCD1234", now);
        assert_eq!(tag.id(), "ABCD1234");
        assert_eq!(tag.kind, TagKind::Uhf);
        assert_eq!(tag.tid, None);
        assert_eq!(tag.seen_count, 1);
        assert_eq!(tag.timestamp, now);
        assert!(!tag.has_error());
    }

    #[test]
    fn hf_tag_id_is_tid() {
        let tag = Tag::hf("E0040150954F02B1", Utc::now());
        assert_eq!(tag.tid.as_deref(), Some("E0040150954F02B1"));
    }

    #[test]
    fn error_message_sets_flag() {
        let mut tag = Tag::uhf("A", Utc::now());
        tag.set_error_message(Some("ACCESS ERROR".into()));
        assert!(tag.has_error());
        assert_eq!(tag.error_message(), Some("ACCESS ERROR"));
        tag.set_error_message(Some(String::new()));
        assert!(!tag.has_error());
    }

    #[test]
    fn rename_keeps_previous_epc() {
        let tag = Tag::uhf("OLD0", Utc::now());
        let renamed = tag.clone().rename("NEW0");
        assert_eq!(renamed.id(), "NEW0");
        assert_eq!(renamed.previous_id.as_deref(), Some("OLD0"));
        assert_eq!(tag.id(), "OLD0");
    }

    #[test]
    fn tag_kind_tokens() {
        assert_eq!(TagKind::from_token("ISO15"), TagKind::Iso15);
        assert_eq!(TagKind::from_token("iso14a"), TagKind::Iso14a);
        assert_eq!(TagKind::from_token("other"), TagKind::Hf);
    }

    #[test]
    fn system_info_all_fields() {
        // flags, uid, dsfid, afi, block count - 1, block size - 1, icr
        let info = SystemInfo::parse("0FE0040150954F02B101021B0305").unwrap();
        assert_eq!(info.dsfid, Some(0x01));
        assert_eq!(info.afi, Some(0x02));
        assert_eq!(info.block_count, Some(0x1C));
        assert_eq!(info.block_size, Some(4));
        assert_eq!(info.icr, Some(0x05));
    }

    #[test]
    fn system_info_flags_respected() {
        let info = SystemInfo::parse("02E0040150954F02B107").unwrap();
        assert_eq!(info.dsfid, None);
        assert_eq!(info.afi, Some(0x07));
        assert_eq!(info.block_count, None);
        assert!(SystemInfo::parse("").is_none());
    }
}
