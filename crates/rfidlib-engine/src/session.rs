//! Per-reader shared state.
//!
//! A [`Session`] is shared between the IO task (through the dialect's line
//! router), the background configuration and liveness tasks, and the
//! reader's public methods. It holds the status, the reply queue guarded by
//! the command lock, the registered callbacks, the event channel, the
//! inventory aggregation store and the configuration snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
use rfidlib_core::inventory::InventoryStore;
use rfidlib_core::status::{Status, StatusCell, StatusRecord};
use rfidlib_core::tag::Tag;
use rfidlib_core::ReaderConfig;

use crate::io::IoHandle;

#[derive(Default)]
struct Callbacks {
    status: Option<StatusCallback>,
    inventory: Option<InventoryCallback>,
    report: Option<InventoryCallback>,
    input: Option<InputCallback>,
}

/// State shared by everything that works on one reader connection.
pub struct Session {
    instance: String,
    status: StatusCell,
    io: Mutex<Option<IoHandle>>,
    replies_tx: mpsc::UnboundedSender<String>,
    /// The command lock. Holding it grants exclusive use of the reply queue.
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    callbacks: Mutex<Callbacks>,
    events: broadcast::Sender<ReaderEvent>,
    inventory: InventoryStore,
    config: Mutex<ReaderConfig>,
    fire_empty_inventories: AtomicBool,
    fire_empty_reports: AtomicBool,
    /// Lines go to the steady-state demultiplexer instead of the
    /// configuration sink.
    steady: AtomicBool,
    /// Cancels the configuration and liveness tasks of the current
    /// connection.
    tasks: Mutex<CancellationToken>,
    command_timeout: Duration,
}

impl Session {
    pub fn new(
        instance: impl Into<String>,
        config: ReaderConfig,
        command_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let instance = instance.into();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            status: StatusCell::new(instance.clone()),
            instance,
            io: Mutex::new(None),
            replies_tx,
            replies: tokio::sync::Mutex::new(replies_rx),
            callbacks: Mutex::new(Callbacks::default()),
            events,
            inventory: InventoryStore::new(),
            config: Mutex::new(config),
            fire_empty_inventories: AtomicBool::new(false),
            fire_empty_reports: AtomicBool::new(false),
            steady: AtomicBool::new(false),
            tasks: Mutex::new(CancellationToken::new()),
            command_timeout,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Default per-command reply timeout.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn status_record(&self) -> StatusRecord {
        self.status.record()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusRecord> {
        self.status.subscribe()
    }

    /// Update the status. Subscribers and the status callback only hear
    /// about actual changes.
    pub fn set_status(&self, status: Status) {
        let Some(record) = self.status.set(status) else {
            return;
        };
        debug!(instance = %self.instance, status = %record.status, "status changed");
        let callback = self.callbacks.lock().status.clone();
        if let Some(callback) = callback {
            callback(&record);
        }
        let _ = self.events.send(ReaderEvent::StatusChanged(record));
    }

    /// Set an error status unless the reader is already in error.
    pub fn fail(&self, reason: &str) {
        if !self.status().is_error() {
            self.set_status(Status::Error(reason.to_string()));
        }
    }

    /// Degrade to a warning after an inventory fault. An antenna error
    /// already shown is not replaced by the next one.
    pub fn warn_inventory(&self, message: &str) {
        if let Status::Warning(current) = self.status() {
            if current.to_lowercase().contains("antenna error") {
                return;
            }
        }
        tracing::warn!(instance = %self.instance, message, "inventory warning");
        self.set_status(Status::Warning(message.to_string()));
    }

    /// Record an antenna fault in the configuration error map.
    pub fn record_antenna_error(&self, antenna: Option<u8>, message: &str) {
        self.config.lock().record_error(antenna, message);
    }

    /// Forget the fault of an antenna that completed a round cleanly. Once
    /// no faults remain a warning returns to running.
    pub fn clear_antenna_error(&self, antenna: Option<u8>) {
        let all_clear = {
            let mut config = self.config.lock();
            config.clear_error(antenna) && config.errors.is_empty()
        };
        if all_clear && matches!(self.status(), Status::Warning(_)) {
            self.set_status(Status::Running);
        }
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    pub fn attach_io(&self, io: IoHandle) {
        if let Some(old) = self.io.lock().replace(io) {
            old.cancel();
        }
    }

    pub fn detach_io(&self) -> Option<IoHandle> {
        self.io.lock().take()
    }

    /// Whether a transport is open and its IO task is alive.
    pub fn is_connected(&self) -> bool {
        self.io.lock().as_ref().is_some_and(IoHandle::is_alive)
    }

    /// Time of the last byte received on the current connection.
    pub fn last_activity(&self) -> Option<Instant> {
        self.io.lock().as_ref().map(IoHandle::last_activity)
    }

    /// Write raw text to the reader.
    pub async fn write(&self, text: &str) -> Result<()> {
        let writer = self
            .io
            .lock()
            .as_ref()
            .map(IoHandle::writer)
            .ok_or(Error::NotConnected)?;
        debug!(instance = %self.instance, data = ?text, "send");
        writer.write(text.as_bytes().to_vec()).await
    }

    /// Switch the input line separator of the current connection.
    pub async fn set_separator(&self, separator: u8) -> Result<()> {
        let writer = self
            .io
            .lock()
            .as_ref()
            .map(IoHandle::writer)
            .ok_or(Error::NotConnected)?;
        writer.set_separator(separator).await
    }

    /// Called by the IO task when the link went down under us.
    pub fn connection_lost(&self, reason: &str) {
        self.detach_io();
        self.stop_tasks();
        self.set_steady(false);
        self.fail(reason);
    }

    pub fn is_steady(&self) -> bool {
        self.steady.load(Ordering::Acquire)
    }

    pub fn set_steady(&self, steady: bool) {
        self.steady.store(steady, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Cancel the running background tasks and return a fresh token for the
    /// next set.
    pub fn restart_tasks(&self) -> CancellationToken {
        let mut tasks = self.tasks.lock();
        tasks.cancel();
        *tasks = CancellationToken::new();
        tasks.clone()
    }

    pub fn stop_tasks(&self) {
        self.tasks.lock().cancel();
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    /// Queue a line for the command currently waiting on a reply.
    pub fn push_reply(&self, line: impl Into<String>) {
        let _ = self.replies_tx.send(line.into());
    }

    /// Acquire the command lock. Anything still queued from earlier
    /// exchanges is discarded first.
    pub async fn exchange(&self) -> Exchange<'_> {
        let replies = self.replies.lock().await;
        let mut exchange = Exchange {
            session: self,
            replies,
        };
        exchange.discard_stale();
        exchange
    }

    /// Acquire the command lock keeping queued lines, to collect the tail
    /// of a reply an earlier exchange gave up on.
    pub async fn resume(&self) -> Exchange<'_> {
        Exchange {
            session: self,
            replies: self.replies.lock().await,
        }
    }

    /// The error for a reply that never came.
    pub fn silence_error(&self) -> Error {
        match self.status() {
            Status::Running | Status::Warning(_) | Status::Busy(_) => Error::NotResponding,
            Status::Initialized | Status::Error(_) => Error::NotConnected,
        }
    }

    // -----------------------------------------------------------------------
    // Callbacks and events
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events.subscribe()
    }

    pub fn set_cb_status(&self, callback: Option<StatusCallback>) -> Option<StatusCallback> {
        std::mem::replace(&mut self.callbacks.lock().status, callback)
    }

    pub fn set_cb_inventory(
        &self,
        callback: Option<InventoryCallback>,
    ) -> Option<InventoryCallback> {
        std::mem::replace(&mut self.callbacks.lock().inventory, callback)
    }

    pub fn set_cb_inventory_report(
        &self,
        callback: Option<InventoryCallback>,
    ) -> Option<InventoryCallback> {
        std::mem::replace(&mut self.callbacks.lock().report, callback)
    }

    pub fn set_cb_input_changed(&self, callback: Option<InputCallback>) -> Option<InputCallback> {
        std::mem::replace(&mut self.callbacks.lock().input, callback)
    }

    pub fn has_input_callback(&self) -> bool {
        self.callbacks.lock().input.is_some()
    }

    pub fn set_fire_empty_inventories(&self, enable: bool) {
        self.fire_empty_inventories.store(enable, Ordering::Relaxed);
    }

    pub fn set_fire_empty_reports(&self, enable: bool) {
        self.fire_empty_reports.store(enable, Ordering::Relaxed);
    }

    /// Deliver an inventory batch.
    ///
    /// With an inventory callback registered the batch goes to the callback
    /// (empty batches only when enabled). Without one, batches from a
    /// continuous scan are merged into the aggregation store for
    /// [`fetch_inventory`](Self::fetch_inventory).
    pub fn fire_inventory(&self, batch: Vec<Tag>, continuous: bool) {
        let callback = self.callbacks.lock().inventory.clone();
        let fire_empty = self.fire_empty_inventories.load(Ordering::Relaxed);
        self.deliver(batch, continuous, callback, fire_empty, ReaderEvent::Inventory);
    }

    /// Deliver an inventory report batch; same policy as
    /// [`fire_inventory`](Self::fire_inventory) with the report callback.
    pub fn fire_inventory_report(&self, batch: Vec<Tag>, continuous: bool) {
        let callback = self.callbacks.lock().report.clone();
        let fire_empty = self.fire_empty_reports.load(Ordering::Relaxed);
        self.deliver(
            batch,
            continuous,
            callback,
            fire_empty,
            ReaderEvent::InventoryReport,
        );
    }

    fn deliver(
        &self,
        batch: Vec<Tag>,
        continuous: bool,
        callback: Option<InventoryCallback>,
        fire_empty: bool,
        event: fn(Vec<Tag>) -> ReaderEvent,
    ) {
        if batch.is_empty() && !fire_empty {
            return;
        }
        let _ = self.events.send(event(batch.clone()));
        match callback {
            Some(callback) => callback(&batch),
            None if continuous => self.inventory.merge(batch),
            None => {}
        }
    }

    pub fn fire_input_changed(&self, pin: u8, high: bool) {
        debug!(instance = %self.instance, pin, high, "input changed");
        let callback = self.callbacks.lock().input.clone();
        if let Some(callback) = callback {
            callback(pin, high);
        }
        let _ = self.events.send(ReaderEvent::InputChanged { pin, high });
    }

    pub fn fire_request_data(&self, data: &str) {
        let _ = self.events.send(ReaderEvent::RequestData(data.to_string()));
    }

    // -----------------------------------------------------------------------
    // Aggregation and configuration
    // -----------------------------------------------------------------------

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    /// Drain the aggregated continuous-scan results, optionally waiting
    /// until there is at least one tag.
    pub async fn fetch_inventory(&self, wait_for_tags: bool) -> Vec<Tag> {
        self.inventory.fetch(wait_for_tags).await
    }

    /// A copy of the configuration snapshot.
    pub fn config(&self) -> ReaderConfig {
        self.config.lock().clone()
    }

    /// Read one value of the configuration snapshot.
    pub fn with_config<R>(&self, f: impl FnOnce(&ReaderConfig) -> R) -> R {
        f(&self.config.lock())
    }

    pub fn update_config(&self, f: impl FnOnce(&mut ReaderConfig)) {
        f(&mut self.config.lock());
    }
}

/// Exclusive use of the reply queue for one command exchange.
///
/// Dropping the exchange releases the command lock, on every exit path.
pub struct Exchange<'a> {
    session: &'a Session,
    replies: tokio::sync::MutexGuard<'a, mpsc::UnboundedReceiver<String>>,
}

impl Exchange<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Drop queued lines that no command asked for.
    pub fn discard_stale(&mut self) {
        while let Ok(line) = self.replies.try_recv() {
            info!(
                instance = %self.session.instance,
                line = ?line,
                "unexpected reader response in buffer"
            );
        }
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        self.session.write(text).await
    }

    /// The next reply line, or `None` when nothing arrived in time.
    pub async fn next_line(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.replies.recv())
            .await
            .ok()
            .flatten()
    }

    /// The next reply line; silence becomes "not responding" or "not
    /// connected" depending on the reader status.
    pub async fn recv(&mut self, timeout: Duration) -> Result<String> {
        match self.next_line(timeout).await {
            Some(line) => Ok(line),
            None => Err(self.session.silence_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(
            "test",
            ReaderConfig::default(),
            Duration::from_millis(200),
            16,
        )
    }

    fn tag(id: &str) -> Tag {
        Tag::uhf(id, chrono::Utc::now())
    }

    // =======================================================================
    // Status
    // =======================================================================

    #[test]
    fn status_callback_fires_on_change_only() {
        let session = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_cb_status(Some(Arc::new(move |r: &StatusRecord| {
            sink.lock().push(r.status.clone())
        })));

        session.set_status(Status::Busy("configuring".into()));
        session.set_status(Status::Busy("configuring".into()));
        session.set_status(Status::Running);
        session.set_status(Status::Running);

        assert_eq!(
            *seen.lock(),
            vec![Status::Busy("configuring".into()), Status::Running]
        );
    }

    #[test]
    fn fail_keeps_first_error() {
        let session = session();
        session.fail("connection lost");
        session.fail("disconnected");
        assert_eq!(session.status(), Status::Error("connection lost".into()));
    }

    #[test]
    fn antenna_warning_is_not_overwritten() {
        let session = session();
        session.set_status(Status::Running);
        session.warn_inventory("Antenna Error - Antenna 2");
        session.warn_inventory("Operation Error (6AC0B)");
        assert_eq!(
            session.status(),
            Status::Warning("Antenna Error - Antenna 2".into())
        );
    }

    #[test]
    fn cleared_antenna_errors_restore_running() {
        let session = session();
        session.set_status(Status::Running);
        session.record_antenna_error(Some(1), "Antenna Error");
        session.record_antenna_error(Some(3), "Antenna Error");
        session.warn_inventory("Antenna Error - Antenna 1");

        session.clear_antenna_error(Some(1));
        assert!(matches!(session.status(), Status::Warning(_)));
        session.clear_antenna_error(Some(3));
        assert_eq!(session.status(), Status::Running);
        assert!(session.config().errors.is_empty());
    }

    #[test]
    fn silence_error_depends_on_status() {
        let session = session();
        assert!(matches!(session.silence_error(), Error::NotConnected));
        session.set_status(Status::Running);
        assert!(matches!(session.silence_error(), Error::NotResponding));
        session.set_status(Status::Error("connection lost".into()));
        assert!(matches!(session.silence_error(), Error::NotConnected));
    }

    // =======================================================================
    // Replies
    // =======================================================================

    #[tokio::test]
    async fn exchange_discards_stale_replies() {
        let session = session();
        session.push_reply("OK");
        let mut exchange = session.exchange().await;
        session.push_reply("+ANT: 1");
        assert_eq!(exchange.recv(Duration::from_millis(10)).await.unwrap(), "+ANT: 1");
        assert!(exchange.next_line(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn resume_keeps_queued_replies() {
        let session = session();
        session.push_reply("OK");
        let mut exchange = session.resume().await;
        assert_eq!(exchange.recv(Duration::from_millis(10)).await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn exchange_timeout_maps_to_status() {
        let session = session();
        session.set_status(Status::Running);
        let mut exchange = session.exchange().await;
        let err = exchange.recv(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::NotResponding));
    }

    #[tokio::test]
    async fn write_without_connection_fails() {
        let session = session();
        assert!(matches!(session.write("ATI\r").await, Err(Error::NotConnected)));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn command_lock_serializes_exchanges() {
        let session = Arc::new(session());
        let first = session.exchange().await;

        let other = Arc::clone(&session);
        let waiter = tokio::spawn(async move {
            let _second = other.exchange().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    // =======================================================================
    // Inventory delivery
    // =======================================================================

    #[tokio::test]
    async fn continuous_batches_aggregate_without_callback() {
        let session = session();
        session.fire_inventory(vec![tag("A"), tag("B")], true);
        session.fire_inventory(vec![tag("A")], true);

        let tags = session.fetch_inventory(false).await;
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].seen_count, 2);
        assert!(session.fetch_inventory(false).await.is_empty());
    }

    #[tokio::test]
    async fn single_inventories_are_not_aggregated() {
        let session = session();
        session.fire_inventory(vec![tag("A")], false);
        assert!(session.fetch_inventory(false).await.is_empty());
    }

    #[test]
    fn callback_bypasses_aggregation() {
        let session = session();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        session.set_cb_inventory(Some(Arc::new(move |tags: &[Tag]| {
            *sink.lock() += tags.len()
        })));

        session.fire_inventory(vec![tag("A"), tag("B")], true);
        assert_eq!(*count.lock(), 2);
        assert!(session.inventory().is_empty());
    }

    #[test]
    fn empty_batches_fire_only_when_enabled() {
        let session = session();
        let calls = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&calls);
        session.set_cb_inventory(Some(Arc::new(move |_: &[Tag]| *sink.lock() += 1)));

        session.fire_inventory(Vec::new(), true);
        assert_eq!(*calls.lock(), 0);

        session.set_fire_empty_inventories(true);
        session.fire_inventory(Vec::new(), true);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn report_callback_is_separate() {
        let session = session();
        let reports = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&reports);
        session.set_cb_inventory_report(Some(Arc::new(move |_: &[Tag]| *sink.lock() += 1)));

        session.fire_inventory(vec![tag("A")], true);
        session.fire_inventory_report(vec![tag("B")], true);
        assert_eq!(*reports.lock(), 1);
        assert_eq!(session.inventory().len(), 1);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let session = session();
        let mut rx = session.subscribe();
        session.fire_input_changed(2, true);
        match rx.recv().await.unwrap() {
            ReaderEvent::InputChanged { pin, high } => {
                assert_eq!(pin, 2);
                assert!(high);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
