//! Error types for rfidlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Errors fall into two families:
//!
//! - **Reader errors**: the link is gone, the device did not answer, the
//!   reply was malformed, the device identity did not match, or the reader
//!   reported a failure that is not about a particular transponder. These
//!   usually need a reconnect or a configuration change.
//! - **Transponder errors**: the reader worked, but the tag in the field
//!   answered with an error (see [`TransponderError`]). These are per-tag and
//!   a retry on that tag may succeed.

use std::fmt;

/// The error type for all rfidlib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, TCP socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// No connection to the reader has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the reader was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The reader is connected and configured but did not answer in time.
    #[error("reader not responding")]
    NotResponding,

    /// Timed out waiting for a reply or a state change.
    #[error("timeout waiting for response")]
    Timeout,

    /// The reader answered with something that does not fit the command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The configuration handshake failed (wrong device, firmware too old).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The reader reported a failure that is not tied to a transponder.
    #[error("{0}")]
    Reader(String),

    /// An antenna reported a failure during an inventory.
    #[error("{message} - Antenna {antenna}")]
    Antenna {
        /// Antenna (or multiplexer port) number, 1-based.
        antenna: u8,
        /// The device message, without brackets.
        message: String,
    },

    /// A transponder in the field answered with an error.
    #[error(transparent)]
    Transponder(#[from] TransponderError),

    /// The requested operation is not supported by this reader or firmware.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An invalid parameter was passed to a reader command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify a device error message.
    ///
    /// The message is looked up in the transponder table first; anything
    /// not found there is a generic [`Error::Reader`].
    pub fn from_device_message(message: &str) -> Self {
        match TransponderError::from_message(message) {
            Some(err) => Error::Transponder(err),
            None => Error::Reader(message.to_string()),
        }
    }

    /// Whether this error was reported by a transponder rather than the reader.
    pub fn is_transponder_error(&self) -> bool {
        matches!(self, Error::Transponder(_))
    }

    /// Whether this error means the link to the reader is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NotConnected
                | Error::ConnectionLost
                | Error::NotResponding
                | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Transponder error table
// ---------------------------------------------------------------------------

/// Errors reported by a transponder and relayed by the reader.
///
/// The [`Display`](fmt::Display) output is exactly the text the reader
/// firmware uses, so a round trip through [`TransponderError::from_message`]
/// is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransponderError {
    NotSelected,
    WrongTagType,
    UnexpectedResponse,
    BlockOutOfRange,
    NotAuthenticated,
    AccessProhibited,
    WrongBlockSize,
    TagTimeout,
    Collision,
    Overflow,
    Parity,
    Framing,
    ProtocolViolation,
    AuthenticationFailure,
    Length,
    ReceivedNak,
    NtagInvalidArgument,
    NtagParityCrc,
    NtagAuthLimit,
    NtagEepromFailure,
    /// Mifare NAK code. The firmware never reports code 2.
    MifareNak(u8),
    Iso15CustomCommand,
    Iso15CommandNotSupported,
    Iso15CommandNotRecognized,
    Iso15OptionNotSupported,
    Iso15NoInformation,
    Iso15BlockNotAvailable,
    Iso15BlockLocked,
    Iso15ContentChangeFailure,
    Iso15BlockProgrammingFailure,
    Iso15BlockProtected,
    Iso15Cryptographic,
}

const FIXED_MESSAGES: &[(TransponderError, &str)] = &[
    (TransponderError::NotSelected, "No Tag selected"),
    (TransponderError::WrongTagType, "Wrong Tag type"),
    (TransponderError::UnexpectedResponse, "Unexpected Tag response"),
    (TransponderError::BlockOutOfRange, "Block out of range"),
    (TransponderError::NotAuthenticated, "Not authenticated"),
    (TransponderError::AccessProhibited, "Access prohibited"),
    (TransponderError::WrongBlockSize, "Wrong block size"),
    (TransponderError::TagTimeout, "Tag timeout"),
    (TransponderError::Collision, "Collision error"),
    (TransponderError::Overflow, "Overflow"),
    (TransponderError::Parity, "Parity error"),
    (TransponderError::Framing, "Framing error"),
    (TransponderError::ProtocolViolation, "Protocol violation"),
    (TransponderError::AuthenticationFailure, "Authentication failure"),
    (TransponderError::Length, "Length error"),
    (TransponderError::ReceivedNak, "Received NAK"),
    (TransponderError::NtagInvalidArgument, "NTAG invalid argument"),
    (TransponderError::NtagParityCrc, "NTAG parity/crc error"),
    (TransponderError::NtagAuthLimit, "NTAG auth limit reached"),
    (TransponderError::NtagEepromFailure, "NTAG EEPROM failure (maybe locked?)"),
    (TransponderError::Iso15CustomCommand, "ISO15 custom command error"),
    (TransponderError::Iso15CommandNotSupported, "ISO15 command not supported"),
    (TransponderError::Iso15CommandNotRecognized, "ISO15 command not recognized"),
    (TransponderError::Iso15OptionNotSupported, "ISO15 option not supported"),
    (TransponderError::Iso15NoInformation, "ISO15 no information"),
    (TransponderError::Iso15BlockNotAvailable, "ISO15 block not available"),
    (TransponderError::Iso15BlockLocked, "ISO15 block locked"),
    (TransponderError::Iso15ContentChangeFailure, "ISO15 content change failure"),
    (TransponderError::Iso15BlockProgrammingFailure, "ISO15 block programming failure"),
    (TransponderError::Iso15BlockProtected, "ISO15 block protected"),
    (TransponderError::Iso15Cryptographic, "ISO15 cryptographic error"),
];

impl TransponderError {
    /// Look up a device message in the transponder table.
    ///
    /// Returns `None` for anything that is not a transponder error.
    pub fn from_message(message: &str) -> Option<Self> {
        let message = message.trim();
        if let Some(code) = message.strip_prefix("Mifare NAK ") {
            return match code.parse::<u8>() {
                Ok(n) if n <= 9 && n != 2 => Some(TransponderError::MifareNak(n)),
                _ => None,
            };
        }
        FIXED_MESSAGES
            .iter()
            .find(|(_, text)| *text == message)
            .map(|(err, _)| *err)
    }
}

impl fmt::Display for TransponderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let TransponderError::MifareNak(n) = self {
            return write!(f, "Mifare NAK {n}");
        }
        let text = FIXED_MESSAGES
            .iter()
            .find(|(err, _)| err == self)
            .map(|(_, text)| *text)
            .unwrap_or("Transponder error");
        f.write_str(text)
    }
}

impl std::error::Error for TransponderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_not_responding() {
        assert_eq!(Error::NotResponding.to_string(), "reader not responding");
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_reader_is_device_text() {
        let e = Error::Reader("Wrong reader type! QUASAR_MX expected, DESKID_ISO found".into());
        assert_eq!(
            e.to_string(),
            "Wrong reader type! QUASAR_MX expected, DESKID_ISO found"
        );
    }

    #[test]
    fn error_display_antenna_names_antenna() {
        let e = Error::Antenna {
            antenna: 3,
            message: "Antenna Error".into(),
        };
        assert_eq!(e.to_string(), "Antenna Error - Antenna 3");
    }

    #[test]
    fn device_message_transponder_lookup() {
        let e = Error::from_device_message("No Tag selected");
        assert!(e.is_transponder_error());
        assert_eq!(e.to_string(), "No Tag selected");

        let e = Error::from_device_message("ISO15 block locked");
        assert!(matches!(
            e,
            Error::Transponder(TransponderError::Iso15BlockLocked)
        ));
    }

    #[test]
    fn device_message_falls_back_to_reader_error() {
        let e = Error::from_device_message("Invalid parameter");
        assert!(!e.is_transponder_error());
        assert!(matches!(e, Error::Reader(ref m) if m == "Invalid parameter"));
    }

    #[test]
    fn mifare_nak_codes() {
        assert_eq!(
            TransponderError::from_message("Mifare NAK 0"),
            Some(TransponderError::MifareNak(0))
        );
        assert_eq!(
            TransponderError::from_message("Mifare NAK 9"),
            Some(TransponderError::MifareNak(9))
        );
        assert_eq!(TransponderError::from_message("Mifare NAK 2"), None);
        assert_eq!(TransponderError::from_message("Mifare NAK 10"), None);
        assert_eq!(TransponderError::MifareNak(7).to_string(), "Mifare NAK 7");
    }

    #[test]
    fn table_display_matches_lookup() {
        for (err, text) in FIXED_MESSAGES {
            assert_eq!(err.to_string(), *text);
            assert_eq!(TransponderError::from_message(text), Some(*err));
        }
    }

    #[test]
    fn connection_errors_classified() {
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::NotResponding.is_connection_error());
        assert!(!Error::Timeout.is_connection_error());
        assert!(!Error::Reader("x".into()).is_connection_error());
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn result_alias_works() {
        let ok: Result<u32> = Ok(42);
        assert!(matches!(ok, Ok(42)));
        let err: Result<u32> = Err(Error::Timeout);
        assert!(err.is_err());
    }
}
