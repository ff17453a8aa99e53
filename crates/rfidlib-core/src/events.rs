//! Asynchronous reader event types.
//!
//! Events are published by every reader through a [`tokio::sync::broadcast`]
//! channel in addition to the registered callbacks. Delivery is best-effort:
//! slow subscribers may miss events while a busy continuous inventory runs.

use std::sync::Arc;

use crate::status::StatusRecord;
use crate::tag::Tag;

/// Called with the new status record on every status change.
pub type StatusCallback = Arc<dyn Fn(&StatusRecord) + Send + Sync>;

/// Called with each delivered inventory (or inventory report) batch.
pub type InventoryCallback = Arc<dyn Fn(&[Tag]) + Send + Sync>;

/// Called with the pin number and new level of a changed input.
pub type InputCallback = Arc<dyn Fn(u8, bool) + Send + Sync>;

/// An event emitted by a reader.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// The reader status changed.
    StatusChanged(StatusRecord),

    /// An inventory batch was delivered.
    Inventory(Vec<Tag>),

    /// A UHF inventory report (tags with occurrence counts) was delivered.
    InventoryReport(Vec<Tag>),

    /// An input pin changed level.
    InputChanged {
        /// Input pin number.
        pin: u8,
        /// `true` for high level.
        high: bool,
    },

    /// Transponder data returned by an asynchronous tag request.
    RequestData(String),
}
