//! # rfidlib -- Async communication engine for RFID readers
//!
//! `rfidlib` is an asynchronous Rust library for talking to metraTec RFID
//! readers over serial ports and TCP. It keeps the connection alive,
//! reconnects after failures, and turns the readers' line protocols into
//! typed calls and tag events.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rfidlib::Reader;
//! use rfidlib::at::{AtReaderBuilder, models::pulsar_lr};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = AtReaderBuilder::new(pulsar_lr())
//!         .tcp("192.168.2.203", 10001)
//!         .build_uhf()?;
//!     reader.connect(Duration::from_secs(5)).await?;
//!
//!     for tag in reader.get_inventory().await? {
//!         println!("{} on antenna {:?}", tag.id(), tag.antenna);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                | Purpose                                             |
//! |----------------------|-----------------------------------------------------|
//! | `rfidlib-core`       | [`Reader`] trait, tags, status, config, errors      |
//! | `rfidlib-transport`  | Serial and TCP connectors                           |
//! | `rfidlib-engine`     | Connection lifecycle, IO task, command exchange     |
//! | `rfidlib-at`         | AT dialect (UHF and NFC readers)                    |
//! | `rfidlib-ascii`      | Legacy ASCII dialect (HF readers)                   |
//! | **`rfidlib`**        | This facade crate -- re-exports everything          |
//!
//! ## Feature Flags
//!
//! | Feature | Enables                        | Default |
//! |---------|--------------------------------|---------|
//! | `at`    | [`at`] module (AT dialect)     | yes     |
//! | `ascii` | [`ascii`] module (ASCII dialect) | yes   |
//!
//! ## Events
//!
//! Every reader publishes [`ReaderEvent`]s on a broadcast channel in
//! addition to the registered callbacks:
//!
//! ```no_run
//! use rfidlib::{Reader, ReaderEvent};
//! # async fn example(reader: &dyn Reader) {
//! let mut events = reader.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ReaderEvent::StatusChanged(record) => println!("{}", record.status.message()),
//!         ReaderEvent::Inventory(tags) => println!("{} tags", tags.len()),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```

pub use rfidlib_core::*;
pub use rfidlib_engine::EngineConfig;
pub use rfidlib_transport::{SerialConnector, TcpConnector};

/// AT protocol backend.
///
/// Provides [`UhfReader`](at::UhfReader), [`NfcReader`](at::NfcReader) and
/// [`AtReaderBuilder`](at::AtReaderBuilder) for the current generation of
/// UHF and NFC readers.
#[cfg(feature = "at")]
pub mod at {
    pub use rfidlib_at::*;
}

/// Legacy ASCII protocol backend.
///
/// Provides [`HfReader`](ascii::HfReader) and
/// [`AsciiReaderBuilder`](ascii::AsciiReaderBuilder) for the first
/// generation ISO 15693 readers.
#[cfg(feature = "ascii")]
pub mod ascii {
    pub use rfidlib_ascii::*;
}

/// Which wire dialect a reader model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectKind {
    At,
    Ascii,
}

/// A supported reader model, for model pickers and command line lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderDefinition {
    pub name: &'static str,
    pub dialect: DialectKind,
    /// Hardware name the reader reports during configuration.
    pub hardware_name: &'static str,
    pub default_heartbeat: u32,
    pub default_tcp_port: u16,
}

/// Returns a flat list of all supported reader models across the enabled
/// dialect backends.
///
/// # Example
///
/// ```
/// for reader in rfidlib::supported_readers() {
///     println!("{} ({:?})", reader.name, reader.dialect);
/// }
/// ```
pub fn supported_readers() -> Vec<ReaderDefinition> {
    let mut readers = Vec::new();

    #[cfg(feature = "at")]
    {
        readers.extend(at::models::all_models().iter().map(|m| ReaderDefinition {
            name: m.name,
            dialect: DialectKind::At,
            hardware_name: m.expected.hardware_name,
            default_heartbeat: m.default_heartbeat,
            default_tcp_port: m.default_tcp_port,
        }));
    }

    #[cfg(feature = "ascii")]
    {
        readers.extend(ascii::models::all_models().iter().map(|m| ReaderDefinition {
            name: m.name,
            dialect: DialectKind::Ascii,
            hardware_name: m.expected.hardware_name,
            default_heartbeat: m.default_heartbeat,
            default_tcp_port: m.default_tcp_port,
        }));
    }

    readers
}

#[cfg(all(test, feature = "at", feature = "ascii"))]
mod tests {
    use super::*;

    #[test]
    fn lists_both_dialects() {
        let readers = supported_readers();
        assert!(readers.iter().any(|r| r.dialect == DialectKind::At));
        assert!(readers.iter().any(|r| r.dialect == DialectKind::Ascii));
        assert!(readers.iter().any(|r| r.name == "QuasarMX"));
    }

    #[test]
    fn model_names_are_unique() {
        let readers = supported_readers();
        let mut names: Vec<_> = readers.iter().map(|r| r.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), readers.len());
    }
}
