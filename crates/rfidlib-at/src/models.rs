//! AT reader model definitions.
//!
//! Each supported reader is described by an [`AtModel`] that captures the
//! identity it must report, its default connection parameters and the
//! heartbeat interval used for liveness checking.
//!
//! | Model         | Family | Connection       | Heartbeat |
//! |---------------|--------|------------------|-----------|
//! | PULSAR LR     | UHF    | TCP, port 10001  | 10 s      |
//! | DeskID UHF v2 | UHF    | USB serial       | off       |
//! | DeskID NFC    | NFC    | USB serial       | off       |

use rfidlib_core::config::{ExpectedReader, Version};
use rfidlib_transport::{DEFAULT_BAUD_RATE, DEFAULT_PORT};

use crate::dialect::Family;

/// Static model definition of an AT reader.
#[derive(Debug, Clone)]
pub struct AtModel {
    /// Human-readable model name.
    pub name: &'static str,
    pub family: Family,
    /// Identity the reader must report during configuration.
    pub expected: ExpectedReader,
    /// Heartbeat interval in seconds; 0 disables liveness checking.
    pub default_heartbeat: u32,
    pub default_baud_rate: u32,
    pub default_tcp_port: u16,
}

/// PULSAR LR: long range UHF reader with up to four antenna ports (16
/// with multiplexer), usually connected over Ethernet.
pub fn pulsar_lr() -> AtModel {
    AtModel {
        name: "PULSAR LR",
        family: Family::Uhf,
        expected: ExpectedReader {
            hardware_name: "PULSAR_LR",
            firmware_name: "PULSAR_LR",
            min_firmware: Version::new(1, 0),
        },
        default_heartbeat: 10,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
    }
}

/// DeskID UHF v2: desktop UHF reader with a single internal antenna.
pub fn deskid_uhf_v2() -> AtModel {
    AtModel {
        name: "DeskID UHF v2",
        family: Family::Uhf,
        expected: ExpectedReader {
            hardware_name: "DESKID_UHF_V2",
            firmware_name: "DESKID_UHF_V2",
            min_firmware: Version::new(1, 0),
        },
        default_heartbeat: 0,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
    }
}

/// DeskID NFC: desktop reader for ISO 15693 and ISO 14443-A transponders.
pub fn deskid_nfc() -> AtModel {
    AtModel {
        name: "DeskID NFC",
        family: Family::Nfc,
        expected: ExpectedReader {
            hardware_name: "DeskID_NFC",
            firmware_name: "DeskID_NFC",
            min_firmware: Version::new(1, 0),
        },
        default_heartbeat: 0,
        default_baud_rate: DEFAULT_BAUD_RATE,
        default_tcp_port: DEFAULT_PORT,
    }
}

/// All AT models, for lookup by name.
pub fn all_models() -> Vec<AtModel> {
    vec![pulsar_lr(), deskid_uhf_v2(), deskid_nfc()]
}
