//! Legacy ASCII protocol backend for rfidlib.
//!
//! This crate implements the line-oriented command protocol of the first
//! generation metraTec HF readers (`INV`, `IVF 02`, `OK!`). It provides:
//!
//! - **Protocol codec** ([`protocol`]) -- command rendering, line
//!   classification, and the inventory, tag request and identity parsers.
//! - **Dialect** ([`dialect`]) -- the engine [`Dialect`](rfidlib_engine::Dialect)
//!   with the break/wake handshake, the end-of-frame switch and the
//!   demultiplexer for inventory and tag request groups.
//! - **Reader** ([`reader`]) -- [`HfReader`], implementing
//!   [`Reader`](rfidlib_core::Reader) plus RF interface, antenna and ISO 15693
//!   tag request operations.
//! - **Models and builder** ([`models`], [`builder`]) -- supported devices and
//!   the fluent [`AsciiReaderBuilder`].
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use rfidlib_ascii::protocol::{classify, parse_inventory, prepare_command, Line};
//!
//! assert_eq!(prepare_command("SAP", &[&"MAN", &2u8]), "SAP MAN 2");
//!
//! let group = "E0040150954F02B1\rARP 01\rIVF 01";
//! assert_eq!(classify(group), Line::Inventory(group));
//! assert_eq!(parse_inventory(group, Utc::now())[0].antenna, Some(1));
//! ```

pub mod builder;
pub mod dialect;
pub mod models;
pub mod protocol;
pub mod reader;

pub use builder::AsciiReaderBuilder;
pub use dialect::{AsciiDialect, InventoryOptions, RequestCallback, SubCarrier};
pub use models::AsciiModel;
pub use protocol::{TagInformation, TagResponse};
pub use reader::{HfMode, HfReader};
