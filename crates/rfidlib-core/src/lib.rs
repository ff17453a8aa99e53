//! rfidlib-core: Core traits, types, and error definitions for rfidlib.
//!
//! This crate defines the dialect-agnostic pieces shared by every reader
//! backend. Applications can depend on these types without pulling in a
//! specific protocol implementation.
//!
//! # Key types
//!
//! - [`Tag`] -- one transponder observation
//! - [`Status`] / [`StatusRecord`] -- reader connection state
//! - [`Reader`] -- the unified reader interface
//! - [`InventoryStore`] -- deduplicating accumulator for continuous scans
//! - [`ReaderConfig`] -- per-reader configuration snapshot
//! - [`Transport`] / [`Connector`] -- byte-level communication channel
//! - [`ReaderEvent`] -- asynchronous notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod config;
pub mod error;
pub mod events;
pub mod inventory;
pub mod reader;
pub mod status;
pub mod tag;
pub mod transport;

pub use config::{
    AntennaMode, ExpectedReader, InventoryFields, ReaderConfig, ReaderIdentity, Version,
};
pub use error::{Error, Result, TransponderError};
pub use events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
pub use inventory::InventoryStore;
pub use reader::Reader;
pub use status::{Status, StatusCell, StatusRecord};
pub use tag::{SystemInfo, Tag, TagKind};
pub use transport::{Connector, Transport};
