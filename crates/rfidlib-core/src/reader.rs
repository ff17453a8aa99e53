//! The `Reader` trait -- unified interface for all reader backends.
//!
//! Applications and trigger sequencers program against `dyn Reader` without
//! needing to know which wire dialect the device speaks. Each dialect crate
//! (rfidlib-at, rfidlib-ascii) provides concrete types implementing this
//! trait; dialect and device specific operations (region, mask, memory
//! access, AFI...) live as inherent methods on those types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::ReaderIdentity;
use crate::error::{Error, Result};
use crate::events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
use crate::status::StatusRecord;
use crate::tag::Tag;

/// Unified asynchronous interface for an RFID reader.
///
/// Methods that talk to the device are `async`; methods that return
/// cached state (status, identity) are synchronous.
///
/// # Consuming inventories
///
/// Continuous inventory results reach the application in one of two
/// mutually exclusive ways: through the callback registered with
/// [`set_cb_inventory()`](Reader::set_cb_inventory), or, when no callback is
/// registered, aggregated per tag and drained with
/// [`fetch_inventory()`](Reader::fetch_inventory). Every batch is also
/// broadcast on the [`subscribe()`](Reader::subscribe) channel.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Name of this reader instance, carried into status records and logs.
    fn instance(&self) -> &str;

    /// Open the connection and wait until the reader is configured and
    /// running. On an open connection the reader is configured again.
    async fn connect(&self, timeout: Duration) -> Result<()>;

    /// Stop continuous operations and close the connection.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_running(&self) -> bool;

    /// The current status record.
    fn status(&self) -> StatusRecord;

    /// Subscribe to reader events.
    ///
    /// The channel is bounded; a consumer that falls behind loses the
    /// oldest events (lagged).
    fn subscribe(&self) -> broadcast::Receiver<ReaderEvent>;

    /// Register the status callback, returning the previous one.
    fn set_cb_status(&self, callback: Option<StatusCallback>) -> Option<StatusCallback>;

    /// Register the inventory callback, returning the previous one.
    fn set_cb_inventory(&self, callback: Option<InventoryCallback>) -> Option<InventoryCallback>;

    /// Register the input change callback, returning the previous one.
    ///
    /// On readers with input events the events are switched on while a
    /// callback is registered.
    fn set_cb_input_changed(&self, callback: Option<InputCallback>) -> Option<InputCallback>;

    /// Also deliver empty inventory batches to the inventory callback.
    fn set_fire_empty_inventories(&self, enable: bool);

    /// Drain the aggregated continuous-scan results.
    ///
    /// With `wait_for_tags` the call suspends until at least one tag has
    /// been seen.
    async fn fetch_inventory(&self, wait_for_tags: bool) -> Vec<Tag>;

    /// Program the device heartbeat interval in seconds (0 disables the
    /// heartbeat and the liveness check).
    async fn set_heartbeat(&self, seconds: u32) -> Result<()>;

    /// Identity captured during configuration.
    fn reader_info(&self) -> ReaderIdentity;

    /// Send a raw command and return the reply lines.
    async fn send_custom_command(&self, command: &str) -> Result<Vec<String>>;

    /// Run one inventory on the current antenna.
    ///
    /// The tags are delivered to the inventory callback but never
    /// aggregated.
    async fn get_inventory(&self) -> Result<Vec<Tag>>;

    /// Start pushing inventories continuously.
    async fn start_inventory(&self) -> Result<()>;

    /// Stop the continuous inventory. Stopping an inventory that is not
    /// running succeeds.
    async fn stop_inventory(&self) -> Result<()>;

    /// Run one inventory over all multiplexed antennas.
    ///
    /// With `ignore_errors` an antenna fault is recorded in the
    /// configuration error map instead of failing the call.
    async fn get_inventory_multi(&self, _ignore_errors: bool) -> Result<Vec<Tag>> {
        Err(Error::Unsupported("multi antenna inventory not supported".into()))
    }

    /// Start a continuous inventory over all multiplexed antennas.
    async fn start_inventory_multi(&self, _ignore_errors: bool) -> Result<()> {
        Err(Error::Unsupported("multi antenna inventory not supported".into()))
    }

    async fn stop_inventory_multi(&self) -> Result<()> {
        Err(Error::Unsupported("multi antenna inventory not supported".into()))
    }

    /// Select the active antenna (1-based).
    async fn set_antenna(&self, _antenna: u8) -> Result<()> {
        Err(Error::Unsupported("antenna selection not supported".into()))
    }

    async fn get_antenna(&self) -> Result<u8> {
        Err(Error::Unsupported("antenna selection not supported".into()))
    }

    /// Use the first `count` antennas in turn.
    async fn set_antenna_multiplex(&self, _count: u8) -> Result<()> {
        Err(Error::Unsupported("antenna multiplex not supported".into()))
    }

    async fn get_antenna_multiplex(&self) -> Result<u8> {
        Err(Error::Unsupported("antenna multiplex not supported".into()))
    }

    /// Levels of all input pins, keyed by pin number.
    async fn get_inputs(&self) -> Result<BTreeMap<u8, bool>> {
        Err(Error::Unsupported("inputs not supported".into()))
    }

    /// Level of one input pin.
    async fn get_input(&self, _pin: u8) -> Result<bool> {
        Err(Error::Unsupported("inputs not supported".into()))
    }

    /// Levels of all output pins, keyed by pin number.
    async fn get_outputs(&self) -> Result<BTreeMap<u8, bool>> {
        Err(Error::Unsupported("outputs not supported".into()))
    }

    async fn get_output(&self, _pin: u8) -> Result<bool> {
        Err(Error::Unsupported("outputs not supported".into()))
    }

    async fn set_output(&self, _pin: u8, _high: bool) -> Result<()> {
        Err(Error::Unsupported("outputs not supported".into()))
    }

    /// Set several outputs at once. Index 0 is pin 1; `None` leaves the
    /// pin unchanged.
    async fn set_outputs(&self, _levels: &[Option<bool>]) -> Result<()> {
        Err(Error::Unsupported("outputs not supported".into()))
    }

    /// Switch input change events on or off.
    async fn enable_input_events(&self, _enable: bool) -> Result<()> {
        Err(Error::Unsupported("input events not available".into()))
    }
}
