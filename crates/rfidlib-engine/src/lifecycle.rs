//! Connection lifecycle: connect, configure, run, detect failure, reconnect.
//!
//! [`Engine`] owns the connector, the shared [`Session`] and the dialect. A
//! connect opens the transport, spawns the IO task and starts a
//! configuration task; the caller waits on the status watch until the
//! reader runs, fails or the timeout passes. A failed configuration is
//! retried after a delay until the reader is disconnected. Once running, a
//! liveness task compares the time of the last received byte against the
//! heartbeat interval and makes one reconnect attempt when the reader has
//! gone quiet.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::{InputCallback, InventoryCallback, ReaderEvent, StatusCallback};
use rfidlib_core::status::{Status, StatusRecord};
use rfidlib_core::tag::Tag;
use rfidlib_core::transport::Connector;
use rfidlib_core::ReaderConfig;

use crate::dialect::Dialect;
use crate::io::{self, LineSink};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing of the connection lifecycle.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default reply timeout for one command.
    pub command_timeout: Duration,
    /// Timeout of the reconnect made by the liveness check.
    pub connect_timeout: Duration,
    /// Delay before a failed configuration is retried.
    pub retry_delay: Duration,
    /// How often the liveness check runs.
    pub liveness_period: Duration,
    /// The reader counts as lost after `liveness_factor * heartbeat`
    /// seconds without a received byte.
    pub liveness_factor: f64,
    /// Capacity of the reader event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            liveness_period: Duration::from_secs(5),
            liveness_factor: 2.5,
            event_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A reader connection driven by one dialect.
pub struct Engine<D: Dialect> {
    inner: Arc<Inner<D>>,
}

struct Inner<D: Dialect> {
    session: Arc<Session>,
    dialect: Arc<D>,
    connector: Box<dyn Connector>,
    config: EngineConfig,
}

/// Routes lines from the IO task to the dialect, switching from the
/// configuration sink to the demultiplexer once the reader runs.
struct LineRouter<D: Dialect> {
    session: Arc<Session>,
    dialect: Arc<D>,
}

impl<D: Dialect> LineSink for LineRouter<D> {
    fn on_line(&self, line: &str, timestamp: DateTime<Utc>) {
        if self.session.is_steady() {
            self.dialect.route_line(&self.session, line, timestamp);
        } else {
            self.dialect.route_config_line(&self.session, line);
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!(instance = %self.session.instance(), reason, "connection lost");
        self.session.connection_lost(reason);
    }
}

impl<D: Dialect> Engine<D> {
    pub fn new(
        instance: impl Into<String>,
        dialect: D,
        connector: Box<dyn Connector>,
        reader_config: ReaderConfig,
        config: EngineConfig,
    ) -> Self {
        let session = Session::new(
            instance,
            reader_config,
            config.command_timeout,
            config.event_capacity,
        );
        Self {
            inner: Arc::new(Inner {
                session: Arc::new(session),
                dialect: Arc::new(dialect),
                connector,
                config,
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn dialect(&self) -> &D {
        &self.inner.dialect
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Connection description, e.g. `tcp://192.168.2.239:10001`.
    pub fn endpoint(&self) -> String {
        self.inner.connector.describe()
    }

    /// Connect and wait until the reader is configured and running.
    ///
    /// If the transport is already open the reader is configured again.
    /// Fails with the status message when configuration fails (a retry is
    /// still scheduled in the background) and with [`Error::Timeout`] when
    /// the reader is not running within `timeout`; in that case the
    /// transport is closed.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.inner.connect(timeout).await
    }

    /// Stop continuous operations, cancel the background tasks and close
    /// the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.session.is_connected() {
            if let Err(e) = inner.dialect.stop_activity(&inner.session).await {
                debug!(instance = %inner.session.instance(), error = %e, "stop before disconnect failed");
            }
        }
        inner.close_transport().await;
        inner.session.inventory().clear();
        inner.session.fail("disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.inner.session.status().is_running()
    }

    pub fn status(&self) -> StatusRecord {
        self.inner.session.status_record()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ReaderEvent> {
        self.inner.session.subscribe()
    }

    pub fn set_cb_status(&self, callback: Option<StatusCallback>) -> Option<StatusCallback> {
        self.inner.session.set_cb_status(callback)
    }

    pub fn set_cb_inventory(
        &self,
        callback: Option<InventoryCallback>,
    ) -> Option<InventoryCallback> {
        self.inner.session.set_cb_inventory(callback)
    }

    /// Register the input change callback. On a running reader input
    /// events are switched on or off in the background to match.
    pub fn set_cb_input_changed(&self, callback: Option<InputCallback>) -> Option<InputCallback> {
        let enable = callback.is_some();
        let old = self.inner.session.set_cb_input_changed(callback);
        if self.is_running() {
            let session = Arc::clone(&self.inner.session);
            let dialect = Arc::clone(&self.inner.dialect);
            tokio::spawn(async move {
                if let Err(e) = dialect.enable_input_events(&session, enable).await {
                    warn!(instance = %session.instance(), error = %e, "error enabling input events");
                }
            });
        }
        old
    }

    pub fn set_fire_empty_inventories(&self, enable: bool) {
        self.inner.session.set_fire_empty_inventories(enable);
    }

    pub async fn fetch_inventory(&self, wait_for_tags: bool) -> Vec<Tag> {
        self.inner.session.fetch_inventory(wait_for_tags).await
    }

    /// Program the device heartbeat and re-arm the liveness timeout.
    pub async fn set_heartbeat(&self, seconds: u32) -> Result<()> {
        self.inner
            .dialect
            .set_heartbeat(&self.inner.session, seconds)
            .await?;
        self.inner.session.update_config(|c| c.heartbeat = seconds);
        Ok(())
    }

    /// Enable or disable input change events on the device.
    pub async fn enable_input_events(&self, enable: bool) -> Result<()> {
        self.inner
            .dialect
            .enable_input_events(&self.inner.session, enable)
            .await
    }

    /// Close the transport without stopping anything on the device, as
    /// after a reset command.
    pub async fn drop_connection(&self) {
        self.inner.close_transport().await;
    }
}

impl<D: Dialect> Drop for Inner<D> {
    fn drop(&mut self) {
        self.session.stop_tasks();
        if let Some(io) = self.session.detach_io() {
            io.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle internals
// ---------------------------------------------------------------------------

impl<D: Dialect> Inner<D> {
    async fn connect(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let mut status_rx = self.session.subscribe_status();
        if self.session.is_connected() {
            self.start_configuration();
        } else {
            self.open().await?;
        }

        let wait = async {
            loop {
                {
                    let record = status_rx.borrow_and_update();
                    if record.status.is_running() {
                        return Ok(());
                    }
                    if record.status.code() < 0 {
                        return Err(Error::Configuration(record.status.message().to_string()));
                    }
                }
                if status_rx.changed().await.is_err() {
                    return Err(Error::NotConnected);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(instance = %self.session.instance(), "connection timeout");
                self.close_transport().await;
                self.session.fail("connection timeout");
                Err(Error::Timeout)
            }
        }
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let transport = match self.connector.open().await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    instance = %self.session.instance(),
                    endpoint = %self.connector.describe(),
                    error = %e,
                    "failed to open connection"
                );
                self.session.set_status(Status::Error(e.to_string()));
                return Err(e);
            }
        };
        info!(
            instance = %self.session.instance(),
            endpoint = %self.connector.describe(),
            "connection established"
        );

        let router = LineRouter {
            session: Arc::clone(&self.session),
            dialect: Arc::clone(&self.dialect),
        };
        let io = io::spawn_io_task(transport, self.dialect.initial_separator(), Arc::new(router));
        self.session.attach_io(io);
        self.start_configuration();
        Ok(())
    }

    fn start_configuration(self: &Arc<Self>) {
        let cancel = self.session.restart_tasks();
        self.session.set_steady(false);
        self.session.set_status(Status::Busy("configuring".into()));
        tokio::spawn(run_configuration(Arc::downgrade(self), cancel));
    }

    /// One configuration attempt.
    async fn configure_once(&self) -> Result<()> {
        let session = &*self.session;
        self.dialect.configure(session).await?;

        let heartbeat = session.with_config(|c| c.heartbeat);
        match self.dialect.set_heartbeat(session, heartbeat).await {
            Ok(()) => {}
            Err(e) if e.is_connection_error() || matches!(e, Error::Timeout) => return Err(e),
            Err(e) => {
                debug!(
                    instance = %session.instance(),
                    error = %e,
                    "no heartbeat available, connection check disabled"
                );
                session.update_config(|c| c.heartbeat = 0);
            }
        }

        match self
            .dialect
            .enable_input_events(session, session.has_input_callback())
            .await
        {
            Ok(()) | Err(Error::Unsupported(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancel the background tasks and close the transport.
    async fn close_transport(&self) {
        self.session.stop_tasks();
        self.session.set_steady(false);
        if let Some(io) = self.session.detach_io() {
            match io.shutdown().await {
                Ok(mut transport) => {
                    if let Err(e) = transport.close().await {
                        debug!(instance = %self.session.instance(), error = %e, "close failed");
                    }
                }
                Err(e) => {
                    debug!(instance = %self.session.instance(), error = %e, "IO task already gone");
                }
            }
        }
    }
}

/// Configure the reader, retrying after a delay until it succeeds or the
/// task is cancelled.
async fn run_configuration<D: Dialect>(engine: Weak<Inner<D>>, cancel: CancellationToken) {
    loop {
        let Some(inner) = engine.upgrade() else {
            return;
        };

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = inner.configure_once() => result,
        };

        match attempt {
            Ok(()) => {
                inner.session.set_steady(true);
                inner.session.set_status(Status::Running);
                tokio::spawn(run_liveness(Arc::downgrade(&inner), cancel.clone()));
                return;
            }
            Err(e) => {
                let message = e.to_string();
                warn!(instance = %inner.session.instance(), error = %message, "configuration failed");
                inner.session.set_status(Status::Error(message));
            }
        }

        let delay = inner.config.retry_delay;
        drop(inner);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Watch the time since the last received byte. On silence longer than
/// `liveness_factor * heartbeat`, mark the reader lost, close the transport
/// and make one reconnect attempt.
async fn run_liveness<D: Dialect>(engine: Weak<Inner<D>>, cancel: CancellationToken) {
    let period = match engine.upgrade() {
        Some(inner) => inner.config.liveness_period,
        None => return,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }

        let Some(inner) = engine.upgrade() else {
            return;
        };
        let session = &inner.session;
        if !session.status().is_operational() {
            return;
        }
        let heartbeat = session.with_config(|c| c.heartbeat);
        if heartbeat == 0 {
            debug!(instance = %session.instance(), "heartbeat disabled, liveness check stopped");
            return;
        }
        let Some(last) = session.last_activity() else {
            return;
        };
        let limit = Duration::from_secs_f64(inner.config.liveness_factor * f64::from(heartbeat));
        if last.elapsed() <= limit {
            continue;
        }

        warn!(
            instance = %session.instance(),
            silent_ms = last.elapsed().as_millis() as u64,
            "no data from reader, connection lost"
        );
        session.set_status(Status::Error("connection lost".into()));
        inner.close_transport().await;
        if let Err(e) = inner.connect(inner.config.connect_timeout).await {
            debug!(instance = %session.instance(), error = %e, "reconnect failed");
        }
        return;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
