//! Legacy ASCII reader model definitions.
//!
//! Models are defined as factory functions (e.g. [`quasar_mx()`]) returning
//! a fully populated [`AsciiModel`]:
//!
//! | Model      | Connection         | Min firmware | Heartbeat |
//! |------------|--------------------|--------------|-----------|
//! | QuasarMX   | TCP or USB serial  | 2.18         | 10 s      |
//! | DeskID ISO | USB serial         | 2.18         | off       |
//! | QuasarLR   | TCP or USB serial  | 2.20         | 10 s      |

use rfidlib_core::config::{ExpectedReader, Version};
use rfidlib_transport::{DEFAULT_BAUD_RATE, DEFAULT_PORT};

/// Static model definition of a legacy ASCII HF reader.
#[derive(Debug, Clone)]
pub struct AsciiModel {
    pub name: &'static str,
    pub expected: ExpectedReader,
    /// Heartbeat interval in seconds; 0 disables liveness checking.
    pub default_heartbeat: u32,
    pub default_baud_rate: u32,
    pub default_tcp_port: u16,
    /// `SAP AUT` accepts an antenna switch delay.
    pub multiplex_delay: bool,
}

/// QuasarMX: ISO 15693 mid range reader with antenna multiplexer support.
pub fn quasar_mx() -> AsciiModel {
    AsciiModel {
        name: "QuasarMX",
        expected: ExpectedReader {
            hardware_name: "QUASAR_MX",
            firmware_name: "QUASAR_MX",
            min_firmware: Version::new(2, 18),
        },
        default_heartbeat: 10,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
        multiplex_delay: true,
    }
}

/// DeskID ISO: desktop ISO 15693 reader on USB.
pub fn deskid_iso() -> AsciiModel {
    AsciiModel {
        name: "DeskID ISO",
        expected: ExpectedReader {
            hardware_name: "DESKID_ISO",
            firmware_name: "DESKID_ISO",
            min_firmware: Version::new(2, 18),
        },
        default_heartbeat: 0,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
        multiplex_delay: true,
    }
}

/// QuasarLR: ISO 15693 long range reader.
pub fn quasar_lr() -> AsciiModel {
    AsciiModel {
        name: "QuasarLR",
        expected: ExpectedReader {
            hardware_name: "QuasarLR",
            firmware_name: "QuasarLR",
            min_firmware: Version::new(2, 20),
        },
        default_heartbeat: 10,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
        multiplex_delay: false,
    }
}

/// All legacy ASCII models, for lookup by name.
pub fn all_models() -> Vec<AsciiModel> {
    vec![quasar_mx(), deskid_iso(), quasar_lr()]
}
