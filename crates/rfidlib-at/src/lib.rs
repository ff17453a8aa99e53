//! AT protocol backend for rfidlib.
//!
//! This crate implements the AT-style command protocol spoken by current
//! metraTec UHF and NFC readers (`AT+INV`, `+INV: ...`, `OK`). It provides:
//!
//! - **Protocol codec** ([`protocol`]) -- command rendering, line
//!   classification into replies and events, and the reply state machine.
//! - **Inventory parsing** ([`inventory`]) -- tag entries, round markers and
//!   antenna faults of inventory groups.
//! - **Settings** ([`settings`]) -- inventory settings, memory banks and masks.
//! - **Dialect** ([`dialect`]) -- the engine [`Dialect`](rfidlib_engine::Dialect)
//!   with handshake, identity check and continuous inventory events.
//! - **Readers** ([`reader`], [`uhf`], [`nfc`]) -- [`UhfReader`] and
//!   [`NfcReader`], implementing [`Reader`](rfidlib_core::Reader) plus the
//!   family specific operations.
//! - **Models and builder** ([`models`], [`builder`]) -- supported devices and
//!   the fluent [`AtReaderBuilder`].
//!
//! # Example
//!
//! ```
//! use rfidlib_at::protocol::{classify, prepare_command, Line};
//!
//! let cmd = prepare_command("AT+PWR", &[&17u8]);
//! assert_eq!(cmd, "AT+PWR=17");
//!
//! assert_eq!(classify("+HBT"), Line::Heartbeat);
//! assert_eq!(classify("+PWR: 17"), Line::Reply("+PWR: 17"));
//! ```

pub mod builder;
pub mod dialect;
pub mod inventory;
pub mod models;
pub mod nfc;
pub mod protocol;
pub mod reader;
pub mod settings;
pub mod uhf;

// Re-export the primary types for ergonomic `use rfidlib_at::*`.
pub use builder::AtReaderBuilder;
pub use dialect::{AtDialect, Family};
pub use inventory::NfcMode;
pub use models::AtModel;
pub use nfc::{DetectedTag, MemorySector, SubCarrier};
pub use reader::{AtReader, Nfc, NfcReader, ReaderFamily, Uhf, UhfReader};
pub use settings::{LockBank, Mask, MemoryBank, NfcInventorySettings, UhfInventorySettings};
pub use uhf::QValue;
