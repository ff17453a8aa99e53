//! AT-style command codec and reply state machine.
//!
//! Commands are `AT+NAME` or `AT+NAME=p1,p2,...`, terminated with `\r`.
//! Replies are `\n` framed lines; one line may carry several `\r`
//! separated entries. A reply ends with a bare `OK` or `ERROR` line:
//!
//! ```text
//! AT+INV<CR><LF>                         echo (when enabled with ATE1)
//! +INV: 3034257BF468D480000003EB<CR>     data entries
//! +INV: <ROUND FINISHED, ANT=1><CR><LF>
//! OK<CR><LF>                             terminator
//! ```
//!
//! On `ERROR` the device usually explains itself in angle brackets in the
//! preceding line (`+BINV: <is not running>`).
//!
//! Lines starting with `+C`, `+HBT` and `+IEV` are events the reader pushes
//! on its own; [`classify`] separates them from reply lines.

use rfidlib_core::config::ReaderIdentity;
use rfidlib_core::error::{Error, Result};
use rfidlib_core::Version;
use rfidlib_engine::{CommandParam, render_params};

/// Command terminator.
pub const TERMINATOR: char = '\r';

/// Input line separator.
pub const SEPARATOR: u8 = b'\n';

/// Build the wire text of a command, without terminator. Absent
/// parameters are left out; without parameters no `=` is added.
///
/// ```
/// use rfidlib_at::protocol::prepare_command;
///
/// let mask: Option<&str> = None;
/// assert_eq!(prepare_command("AT+READ", &[&"TID", &0u8, &4u8, &mask]), "AT+READ=TID,0,4");
/// assert_eq!(prepare_command("AT+INV", &[]), "AT+INV");
/// ```
pub fn prepare_command(command: &str, params: &[&dyn CommandParam]) -> String {
    if params.is_empty() {
        return command.to_string();
    }
    format!("{command}={}", render_params(params).join(","))
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// Continuous inventory event flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuousKind {
    /// `+CINV`: current antenna.
    Single,
    /// `+CMINV`: all multiplexed antennas.
    Multi,
    /// `+CINVR`: windowed report with per-tag occurrence counts.
    Report,
}

/// What a received line is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// Nothing to do.
    Empty,
    Heartbeat,
    /// A continuous inventory group; the text still holds every entry.
    Inventory(ContinuousKind, &'a str),
    InputChanged { pin: u8, high: bool },
    /// Anything else belongs to the command waiting for a reply.
    Reply(&'a str),
}

/// Classify a line with its trailing `\r` already removed.
pub fn classify(line: &str) -> Line<'_> {
    if line.is_empty() {
        return Line::Empty;
    }
    if line.starts_with("+C") {
        let kind = if line.starts_with("+CM") {
            ContinuousKind::Multi
        } else if line.starts_with("+CINVR") {
            ContinuousKind::Report
        } else {
            ContinuousKind::Single
        };
        return Line::Inventory(kind, line);
    }
    if line.len() == 4 && line.starts_with("+H") {
        return Line::Heartbeat;
    }
    if let Some(rest) = line.strip_prefix("+IE") {
        // +IEV: 1,HIGH
        let parsed = rest
            .split_once(':')
            .and_then(|(_, value)| value.trim().split_once(','))
            .and_then(|(pin, level)| Some((pin.trim().parse().ok()?, level.contains("HIGH"))));
        return match parsed {
            Some((pin, high)) => Line::InputChanged { pin, high },
            None => Line::Reply(line),
        };
    }
    Line::Reply(line)
}

/// Whether a line may reach the reply queue while the reader is still
/// being configured. Events left over from an earlier session are dropped.
pub fn is_config_reply(line: &str) -> bool {
    !matches!(
        classify(line),
        Line::Empty | Line::Heartbeat | Line::Inventory(..)
    )
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// The payload of a `+NAME: payload` entry.
pub fn payload(entry: &str) -> Option<&str> {
    let body = entry.strip_prefix('+')?;
    let split = body.find([':', '='])?;
    Some(body[split + 1..].trim_start())
}

/// The message inside the last `<...>` of `text`.
pub fn bracketed_error(text: &str) -> Option<&str> {
    let start = text.rfind('<')?;
    let end = text.rfind('>')?;
    (end > start).then(|| &text[start + 1..end])
}

// ---------------------------------------------------------------------------
// Reply state machine
// ---------------------------------------------------------------------------

/// Maps a device error message to an error.
pub type ErrorMapper = fn(&str) -> Error;

/// Collects the lines of one command reply.
#[derive(Debug)]
pub struct ReplyCollector {
    wire: String,
    name: String,
    echo_pending: bool,
    received_any: bool,
    entries: Vec<String>,
    map_error: ErrorMapper,
}

impl ReplyCollector {
    /// `wire` is the command as sent (without terminator), `name` the bare
    /// command name. With `echo` the first line must repeat the command.
    pub fn new(wire: &str, name: &str, echo: bool, map_error: ErrorMapper) -> Self {
        Self {
            wire: wire.to_string(),
            name: name.to_string(),
            echo_pending: echo,
            received_any: false,
            entries: Vec::new(),
            map_error,
        }
    }

    /// Feed one reply line. Returns the data entries once the reply is
    /// complete.
    pub fn feed(&mut self, line: &str) -> Result<Option<Vec<String>>> {
        self.received_any = true;
        if self.echo_pending {
            self.echo_pending = false;
            if !line.contains(&self.wire) {
                return Err(Error::Protocol(format!(
                    "Not expected response for {} - {line}",
                    self.wire
                )));
            }
            return Ok(None);
        }
        match line {
            "OK" => Ok(Some(std::mem::take(&mut self.entries))),
            "ERROR" => {
                let text = self.entries.join("\r");
                Err(match bracketed_error(&text) {
                    Some(message) => (self.map_error)(message),
                    None => Error::Reader(format!("{} ERROR", self.name)),
                })
            }
            _ => {
                self.entries
                    .extend(line.split(TERMINATOR).filter(|e| !e.is_empty()).map(str::to_string));
                Ok(None)
            }
        }
    }

    /// The error for a reply that did not complete in time. `silence` is
    /// used when not a single line came back.
    pub fn timed_out(self, silence: Error) -> Error {
        if !self.received_any {
            return silence;
        }
        if self.entries.is_empty() {
            return Error::Protocol(format!("no reader response for command {}", self.wire));
        }
        Error::Protocol(format!(
            "wrong response for command {} - {}",
            self.wire,
            self.entries.join(" ")
        ))
    }
}

// ---------------------------------------------------------------------------
// Common replies
// ---------------------------------------------------------------------------

/// Parse the `ATI` reply:
///
/// ```text
/// +SW: PULSAR_LR 0104
/// +HW: PULSAR_LR 0100
/// +SERIAL: 2020090817420000
/// ```
pub fn parse_identity(entries: &[String]) -> Result<ReaderIdentity> {
    let wrong = || Error::Configuration(format!("Wrong reader - Not expected info response - {entries:?}"));
    let fields = |index: usize| -> Option<Vec<&str>> {
        let words: Vec<&str> = entries.get(index)?.split(' ').collect();
        (words.len() >= 2).then_some(words)
    };
    let firmware = fields(0).ok_or_else(wrong)?;
    let hardware = fields(1).ok_or_else(wrong)?;
    let serial = fields(2).ok_or_else(wrong)?;
    Ok(ReaderIdentity {
        firmware_name: firmware[1].to_string(),
        firmware_version: firmware.last().and_then(|v| Version::parse(v)),
        hardware_name: hardware[1].to_string(),
        hardware_version: hardware.last().and_then(|v| Version::parse(v)),
        serial_number: Some(serial[1].to_string()),
    })
}

/// Parse `+IN: 1,LOW` style pin lines into `(pin, high)` pairs.
pub fn parse_pins(entries: &[String]) -> Vec<(u8, bool)> {
    entries
        .iter()
        .filter_map(|entry| {
            let (pin, level) = payload(entry)?.split_once(',')?;
            Some((pin.trim().parse().ok()?, level.contains("HIGH")))
        })
        .collect()
}

/// The first entry's payload, or a protocol error naming the command.
pub fn first_payload<'a>(entries: &'a [String], command: &str) -> Result<&'a str> {
    entries
        .first()
        .and_then(|e| payload(e))
        .ok_or_else(|| Error::Protocol(format!("Not expected response for command {command} - {entries:?}")))
}

/// The first entry's payload as a number.
pub fn first_number<T: std::str::FromStr>(entries: &[String], command: &str) -> Result<T> {
    first_payload(entries, command)?
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("Not expected response for command {command} - {entries:?}")))
}
