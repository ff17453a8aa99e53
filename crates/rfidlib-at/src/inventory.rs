//! Inventory and tag response parsing.
//!
//! An inventory group is a list of `+PREFIX: payload` entries. A payload is
//! either a tag (comma separated fields whose layout depends on the
//! inventory settings) or a control marker in angle brackets:
//!
//! ```text
//! +CINV: 3034257BF468D480000003EC,E200600311753E33,-55   tag, TID, RSSI
//! +CINV: <NO TAGS FOUND>                                 nothing seen
//! +CINV: <ROUND FINISHED, ANT=2>                         end of one antenna round
//! +CINV: <Antenna Error>                                 antenna fault
//! ```

use chrono::{DateTime, Utc};
use tracing::debug;

use rfidlib_core::config::InventoryFields;
use rfidlib_core::error::{Error, Result};
use rfidlib_core::tag::{Tag, TagKind};
use rfidlib_engine::Session;

use crate::protocol::payload;

/// Operation mode of an NFC reader, which decides the tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NfcMode {
    #[default]
    Auto,
    Iso15,
    Iso14a,
}

impl NfcMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NfcMode::Auto => "AUTO",
            NfcMode::Iso15 => "ISO15",
            NfcMode::Iso14a => "ISO14A",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "AUTO" => Some(NfcMode::Auto),
            "ISO15" => Some(NfcMode::Iso15),
            "ISO14A" => Some(NfcMode::Iso14a),
            _ => None,
        }
    }
}

/// Field layout of the tag entries of one inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    /// EPC, then TID / RSSI / phase as configured; reports end with the
    /// occurrence count.
    Uhf { fields: InventoryFields, report: bool },
    /// TID, then tag details when enabled.
    Nfc { mode: NfcMode, details: bool },
}

/// One parsed inventory group.
#[derive(Debug, Default)]
pub struct InventoryGroup {
    pub tags: Vec<Tag>,
    /// Antenna named by a `<ROUND FINISHED, ANT=n>` marker.
    pub antenna: Option<u8>,
    /// The last fault marker of the group.
    pub error: Option<String>,
}

enum Marker<'a> {
    NoTags,
    RoundFinished(Option<u8>),
    Fault(&'a str),
}

fn marker(payload: &str) -> Option<Marker<'_>> {
    let inner = payload.strip_prefix('<')?;
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    Some(match inner.chars().next() {
        Some('N') => Marker::NoTags,
        Some('R') => Marker::RoundFinished(
            inner
                .split_once("ANT=")
                .and_then(|(_, n)| n.trim().parse().ok()),
        ),
        _ => Marker::Fault(inner),
    })
}

/// Parse one inventory group. A round-finished marker naming an antenna
/// stamps the tags read since the previous marker.
pub fn parse_group<'a>(
    entries: impl IntoIterator<Item = &'a str>,
    format: EntryFormat,
    timestamp: DateTime<Utc>,
) -> InventoryGroup {
    let mut group = InventoryGroup::default();
    let mut round_start = 0;
    for entry in entries {
        let Some(payload) = payload(entry) else {
            continue;
        };
        match marker(payload) {
            Some(Marker::NoTags) => {}
            Some(Marker::RoundFinished(antenna)) => {
                if antenna.is_some() {
                    for tag in &mut group.tags[round_start..] {
                        tag.antenna = antenna;
                    }
                    group.antenna = antenna;
                }
                round_start = group.tags.len();
            }
            Some(Marker::Fault(message)) => group.error = Some(message.to_string()),
            None => match parse_tag(payload, format, timestamp) {
                Some(tag) => group.tags.push(tag),
                None => debug!(entry, "error parsing inventory transponder"),
            },
        }
    }
    group
}

fn parse_tag(payload: &str, format: EntryFormat, timestamp: DateTime<Utc>) -> Option<Tag> {
    let mut info: Vec<&str> = payload.split(',').collect();
    if info[0].is_empty() {
        return None;
    }
    match format {
        EntryFormat::Uhf { fields, report } => {
            let mut tag = Tag::uhf(info[0], timestamp);
            if fields.tid {
                tag.tid = Some(info.get(1)?.to_string());
            }
            if fields.rssi {
                let index = if fields.tid { 2 } else { 1 };
                tag.rssi = Some(info.get(index)?.trim().parse().ok()?);
            }
            if report {
                tag.seen_count = info.last()?.trim().parse().ok()?;
            }
            if fields.phase && info.len() >= 2 {
                let n = info.len();
                tag.phase = info[n - 2]
                    .trim()
                    .parse()
                    .ok()
                    .zip(info[n - 1].trim().parse().ok());
            }
            Some(tag)
        }
        EntryFormat::Nfc { mode, details } => {
            let kind = match mode {
                NfcMode::Auto if details => {
                    if info.len() < 2 {
                        return None;
                    }
                    TagKind::from_token(info.remove(1))
                }
                NfcMode::Auto => TagKind::Hf,
                NfcMode::Iso15 => TagKind::Iso15,
                NfcMode::Iso14a => TagKind::Iso14a,
            };
            let mut tag = Tag::new(kind, info[0], timestamp);
            if details {
                match kind {
                    TagKind::Iso15 => tag.dsfid = Some(info.get(1)?.to_string()),
                    TagKind::Iso14a => {
                        tag.sak = Some(info.get(1)?.to_string());
                        tag.atqa = Some(info.get(2)?.to_string());
                    }
                    _ => {}
                }
            }
            Some(tag)
        }
    }
}

/// Split a multi-antenna reply into antenna rounds. Each round ends with
/// its round-finished marker.
pub fn split_rounds<S: AsRef<str>>(entries: &[S]) -> Vec<&[S]> {
    let mut rounds = Vec::new();
    let mut start = 0;
    for (index, entry) in entries.iter().enumerate() {
        if payload(entry.as_ref()).is_some_and(|p| p.starts_with("<R")) {
            rounds.push(&entries[start..=index]);
            start = index + 1;
        }
    }
    if start < entries.len() {
        rounds.push(&entries[start..]);
    }
    rounds
}

/// Parse a multi-antenna reply round by round, so every fault stays with
/// the antenna of its own round.
pub fn parse_rounds<S: AsRef<str>>(
    entries: &[S],
    format: EntryFormat,
    timestamp: DateTime<Utc>,
) -> Vec<InventoryGroup> {
    split_rounds(entries)
        .into_iter()
        .map(|round| parse_group(round.iter().map(S::as_ref), format, timestamp))
        .collect()
}

/// Apply the antenna fault policy to a parsed group.
///
/// A fault is recorded in the configuration error map under the group's
/// antenna (or `fallback_antenna` when no marker named one). Without
/// `ignore_errors` it then fails the group. A clean group clears the
/// antenna's earlier fault.
pub fn settle_group(
    session: &Session,
    group: InventoryGroup,
    fallback_antenna: Option<u8>,
    ignore_errors: bool,
) -> Result<Vec<Tag>> {
    let antenna = group.antenna.or(fallback_antenna);
    let Some(message) = group.error else {
        session.clear_antenna_error(antenna);
        return Ok(group.tags);
    };
    session.record_antenna_error(antenna, &message);
    if ignore_errors {
        debug!(instance = %session.instance(), ?antenna, message, "antenna error ignored");
        return Ok(group.tags);
    }
    Err(match antenna {
        Some(antenna) => Error::Antenna { antenna, message },
        None => Error::Reader(message),
    })
}

/// Parse per-tag results of a tag operation (`+KILL: EPC,ACCESS ERROR`).
/// Every tag whose status is not `OK` carries the status as its error.
pub fn parse_tag_results(entries: &[String], timestamp: DateTime<Utc>) -> Vec<Tag> {
    entries
        .iter()
        .filter_map(|entry| payload(entry))
        .filter(|p| !p.starts_with('<'))
        .filter_map(|p| {
            let mut info = p.split(',');
            let epc = info.next().filter(|e| !e.is_empty())?;
            let mut tag = Tag::uhf(epc, timestamp);
            match info.next() {
                Some("OK") => {}
                Some(status) => tag.set_error_message(Some(status.to_string())),
                None => tag.set_error_message(Some("no transponder response".into())),
            }
            Some(tag)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rfidlib_core::ReaderConfig;

    fn uhf(tid: bool, rssi: bool) -> EntryFormat {
        EntryFormat::Uhf {
            fields: InventoryFields {
                tid,
                rssi,
                ..Default::default()
            },
            report: false,
        }
    }

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    fn session() -> Session {
        let session = Session::new("test", ReaderConfig::default(), Duration::from_secs(1), 8);
        session.set_status(rfidlib_core::Status::Running);
        session
    }

    #[test]
    fn tag_with_tid_and_rssi() {
        let group = parse_group(
            ["+CINV: ABCD1234,AA11BB22CC33DD44,-55"],
            uhf(true, true),
            Utc::now(),
        );
        assert_eq!(group.tags.len(), 1);
        let tag = &group.tags[0];
        assert_eq!(tag.id(), "ABCD1234");
        assert_eq!(tag.tid.as_deref(), Some("AA11BB22CC33DD44"));
        assert_eq!(tag.rssi, Some(-55));
        assert_eq!(tag.seen_count, 1);
        assert!(group.error.is_none());
    }

    #[test]
    fn tags_keep_input_order() {
        let group = parse_group(
            ["+INV: 0001", "+INV: 0002", "+INV: 0003", "+INV: 0004"],
            uhf(false, false),
            Utc::now(),
        );
        let ids: Vec<&str> = group.tags.iter().map(Tag::id).collect();
        assert_eq!(ids, vec!["0001", "0002", "0003", "0004"]);
    }

    #[test]
    fn round_finished_stamps_antenna() {
        let group = parse_group(
            ["+CINV: 0001,-60", "+CINV: 0002,-61", "+CINV: <ROUND FINISHED, ANT=3>"],
            uhf(false, true),
            Utc::now(),
        );
        assert_eq!(group.antenna, Some(3));
        assert!(group.tags.iter().all(|t| t.antenna == Some(3)));
    }

    #[test]
    fn each_round_stamps_its_own_tags() {
        let group = parse_group(
            [
                "+CMINV: 0001",
                "+CMINV: <ROUND FINISHED, ANT=1>",
                "+CMINV: 0002",
                "+CMINV: <ROUND FINISHED, ANT=2>",
            ],
            uhf(false, false),
            Utc::now(),
        );
        let stamped: Vec<_> = group.tags.iter().map(|t| (t.id(), t.antenna)).collect();
        assert_eq!(stamped, vec![("0001", Some(1)), ("0002", Some(2))]);
    }

    #[test]
    fn no_tags_marker_is_not_an_error() {
        let group = parse_group(["+INV: <NO TAGS FOUND>"], uhf(false, false), Utc::now());
        assert!(group.tags.is_empty());
        assert!(group.error.is_none());
    }

    #[test]
    fn report_count_and_phase() {
        let format = EntryFormat::Uhf {
            fields: InventoryFields {
                rssi: true,
                phase: true,
                ..Default::default()
            },
            report: true,
        };
        let group = parse_group(["+INVR: 0001,-58,12,7"], format, Utc::now());
        let tag = &group.tags[0];
        assert_eq!(tag.rssi, Some(-58));
        assert_eq!(tag.seen_count, 7);
        assert_eq!(tag.phase, Some((12, 7)));
    }

    #[test]
    fn short_entries_are_skipped() {
        let group = parse_group(["+INV: 0001", "+INV: 0002,-40"], uhf(false, true), Utc::now());
        assert_eq!(group.tags.len(), 1);
        assert_eq!(group.tags[0].id(), "0002");
    }

    #[test]
    fn nfc_auto_mode_reads_tag_type() {
        let format = EntryFormat::Nfc {
            mode: NfcMode::Auto,
            details: true,
        };
        let group = parse_group(
            ["+CINV: E002223504422958,ISO15,00", "+CINV: 04A1B2C3,ISO14A,08,0004"],
            format,
            Utc::now(),
        );
        assert_eq!(group.tags[0].kind, TagKind::Iso15);
        assert_eq!(group.tags[0].dsfid.as_deref(), Some("00"));
        assert_eq!(group.tags[1].kind, TagKind::Iso14a);
        assert_eq!(group.tags[1].sak.as_deref(), Some("08"));
        assert_eq!(group.tags[1].atqa.as_deref(), Some("0004"));
    }

    #[test]
    fn nfc_without_details_uses_mode() {
        let format = EntryFormat::Nfc {
            mode: NfcMode::Iso15,
            details: false,
        };
        let group = parse_group(["+INV: E002223504422958"], format, Utc::now());
        assert_eq!(group.tags[0].kind, TagKind::Iso15);
        assert_eq!(group.tags[0].tid.as_deref(), Some("E002223504422958"));
    }

    #[test]
    fn rounds_split_at_markers() {
        let entries = lines(&[
            "+MINV: <Antenna Error>",
            "+MINV: <ROUND FINISHED, ANT=1>",
            "+MINV: 3034257BF468D480000003EB",
            "+MINV: <ROUND FINISHED, ANT=2>",
            "+MINV: <NO TAGS FOUND>",
        ]);
        let rounds = split_rounds(&entries);
        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[0].len(), 2);
        assert_eq!(rounds[1].len(), 2);
        assert_eq!(rounds[2].len(), 1);
    }

    #[test]
    fn fault_stays_with_its_round() {
        let session = session();
        let entries = [
            "+CMINV: 0001",
            "+CMINV: <Antenna Error>",
            "+CMINV: <ROUND FINISHED, ANT=1>",
            "+CMINV: 0002",
            "+CMINV: <ROUND FINISHED, ANT=2>",
        ];
        let groups = parse_rounds(&entries, uhf(false, false), Utc::now());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].antenna, Some(1));
        assert_eq!(groups[0].error.as_deref(), Some("Antenna Error"));
        assert_eq!(groups[1].antenna, Some(2));
        assert!(groups[1].error.is_none());

        let mut tags = Vec::new();
        for group in groups {
            tags.extend(settle_group(&session, group, None, true).unwrap());
        }
        let stamped: Vec<_> = tags.iter().map(|t| (t.id(), t.antenna)).collect();
        assert_eq!(stamped, vec![("0001", Some(1)), ("0002", Some(2))]);
        let errors = session.config().errors;
        assert!(errors.contains_key("Antenna 1"));
        assert!(!errors.contains_key("Antenna 2"));
    }

    #[test]
    fn antenna_error_fails_without_ignore() {
        let session = session();
        let group = parse_group(["+CINV: <Antenna Error>"], uhf(false, false), Utc::now());
        let err = settle_group(&session, group, Some(1), false).unwrap_err();
        assert!(matches!(err, Error::Antenna { antenna: 1, .. }));
        assert_eq!(err.to_string(), "Antenna Error - Antenna 1");
        assert_eq!(
            session.config().errors.get("Antenna 1").map(String::as_str),
            Some("Antenna Error")
        );
    }

    #[test]
    fn antenna_error_is_recorded_with_ignore() {
        let session = session();
        let group = parse_group(["+CINV: <Antenna Error>"], uhf(false, false), Utc::now());
        let tags = settle_group(&session, group, Some(2), true).unwrap();
        assert!(tags.is_empty());
        assert!(session.config().errors.contains_key("Antenna 2"));
    }

    #[test]
    fn clean_round_clears_antenna_error() {
        let session = session();
        session.record_antenna_error(Some(2), "Antenna Error");
        let group = parse_group(
            ["+CMINV: 0001", "+CMINV: <ROUND FINISHED, ANT=2>"],
            uhf(false, false),
            Utc::now(),
        );
        let tags = settle_group(&session, group, None, false).unwrap();
        assert_eq!(tags.len(), 1);
        assert!(session.config().errors.is_empty());
    }

    #[test]
    fn unattributed_fault_is_reader_error() {
        let session = session();
        let group = parse_group(["+CMINV: <Operation Error (6AC0B)>"], uhf(false, false), Utc::now());
        let err = settle_group(&session, group, None, false).unwrap_err();
        assert!(matches!(err, Error::Reader(ref m) if m == "Operation Error (6AC0B)"));
        assert!(session.config().errors.contains_key("message"));
    }

    #[test]
    fn tag_results_attach_errors() {
        let entries = lines(&[
            "+KILL: ABCD0001,OK",
            "+KILL: ABCD0002,ACCESS ERROR",
            "+KILL: <NO TAGS FOUND>",
        ]);
        let tags = parse_tag_results(&entries, Utc::now());
        assert_eq!(tags.len(), 2);
        assert!(!tags[0].has_error());
        assert_eq!(tags[1].error_message(), Some("ACCESS ERROR"));
    }
}
