//! IO task types and implementation for line-oriented readers.
//!
//! One tokio task owns the transport exclusively for the lifetime of a
//! connection. It writes outgoing commands, splits incoming bytes into lines
//! and hands every line to a [`LineSink`] together with its arrival time.
//! Correlating replies with commands is not done here: the sink decides
//! whether a line is a reply fragment or an asynchronous event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::transport::Transport;

use crate::framing::LineFramer;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A request sent to the IO task.
pub enum Request {
    /// Write raw bytes to the transport.
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Switch the line separator for all following input.
    SetSeparator { separator: u8 },
    /// Graceful shutdown; returns the transport so the caller can close it.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Receiver of de-framed input lines.
///
/// Called from inside the IO task, so implementations must not block.
pub trait LineSink: Send + Sync + 'static {
    /// A complete line arrived. The separator is already removed.
    fn on_line(&self, line: &str, timestamp: DateTime<Utc>);

    /// The transport failed or the peer closed the connection. The IO task
    /// has stopped and closed the transport when this is called.
    fn on_connection_lost(&self, reason: &str);
}

/// Handle to a running IO task.
pub struct IoHandle {
    tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
    task: JoinHandle<()>,
}

impl IoHandle {
    /// Write bytes and wait until the transport accepted them.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        send_write(&self.tx, bytes).await
    }

    /// A sender usable without holding on to the handle.
    pub fn writer(&self) -> IoWriter {
        IoWriter {
            tx: self.tx.clone(),
        }
    }

    /// Time of the most recently received byte (or of the task start).
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// `false` once the IO task has exited.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the IO task without waiting for it; the task closes the
    /// transport itself.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Shutdown { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

/// Cloneable write side of an [`IoHandle`].
#[derive(Clone)]
pub struct IoWriter {
    tx: mpsc::Sender<Request>,
}

impl IoWriter {
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        send_write(&self.tx, bytes).await
    }

    /// Switch the line separator. Takes effect for bytes processed after
    /// every previously queued write.
    pub async fn set_separator(&self, separator: u8) -> Result<()> {
        self.tx
            .send(Request::SetSeparator { separator })
            .await
            .map_err(|_| Error::NotConnected)
    }
}

async fn send_write(tx: &mpsc::Sender<Request>, bytes: Vec<u8>) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Request::Write {
        bytes,
        reply: reply_tx,
    })
    .await
    .map_err(|_| Error::NotConnected)?;
    reply_rx.await.map_err(|_| Error::NotConnected)?
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task on an open transport.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    separator: u8,
    sink: Arc<dyn LineSink>,
) -> IoHandle {
    let (tx, rx) = mpsc::channel::<Request>(32);
    let cancel = CancellationToken::new();
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let task = tokio::spawn(io_loop(
        transport,
        LineFramer::new(separator),
        sink,
        rx,
        cancel.clone(),
        Arc::clone(&last_activity),
    ));

    IoHandle {
        tx,
        cancel,
        last_activity,
        task,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Size of one idle read.
const READ_CHUNK: usize = 256;

/// How long one idle read waits before the loop checks for requests again.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Result of one idle read.
enum Incoming {
    Lines(Vec<String>),
    Quiet,
    Lost(String),
}

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Requests (writes, separator switch, shutdown)
/// 3. Idle reads of incoming lines
async fn io_loop(
    mut transport: Box<dyn Transport>,
    mut framer: LineFramer,
    sink: Arc<dyn LineSink>,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                break;
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Write { bytes, reply }) => {
                        let result = transport.send(&bytes).await;
                        let lost = match &result {
                            Err(e) if e.is_connection_error() => Some(e.to_string()),
                            _ => None,
                        };
                        let _ = reply.send(result);
                        if let Some(reason) = lost {
                            let _ = transport.close().await;
                            sink.on_connection_lost(&reason);
                            return;
                        }
                    }
                    Some(Request::SetSeparator { separator }) => {
                        debug!(separator = ?char::from(separator), "line separator changed");
                        framer.set_separator(separator);
                    }
                    Some(Request::Shutdown { reply }) => {
                        debug!("IO task shutdown requested");
                        let _ = reply.send(transport);
                        return;
                    }
                    None => {
                        debug!("request channel closed, exiting IO task");
                        break;
                    }
                }
            }

            incoming = async {
                let mut buf = [0u8; READ_CHUNK];
                match transport.receive(&mut buf, IDLE_POLL).await {
                    Ok(n) if n > 0 => {
                        *last_activity.lock() = Instant::now();
                        Incoming::Lines(framer.push(&buf[..n]))
                    }
                    Ok(_) | Err(Error::Timeout) => Incoming::Quiet,
                    Err(e) => Incoming::Lost(e.to_string()),
                }
            } => {
                match incoming {
                    Incoming::Lines(lines) => {
                        for line in lines {
                            tracing::trace!(line = ?line, "rx line");
                            sink.on_line(&line, Utc::now());
                        }
                    }
                    Incoming::Quiet => {}
                    Incoming::Lost(reason) => {
                        tracing::warn!(reason = %reason, "reader connection lost");
                        let _ = transport.close().await;
                        sink.on_connection_lost(&reason);
                        return;
                    }
                }
            }
        }
    }

    let _ = transport.close().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rfidlib_test_harness::MockTransport;

    /// Records everything the IO task delivers.
    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
        lost: Mutex<Vec<String>>,
    }

    impl LineSink for RecordingSink {
        fn on_line(&self, line: &str, _timestamp: DateTime<Utc>) {
            self.lines.lock().push(line.to_string());
        }

        fn on_connection_lost(&self, reason: &str) {
            self.lost.lock().push(reason.to_string());
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // =======================================================================
    // Writes and line delivery
    // =======================================================================

    #[tokio::test]
    async fn write_reaches_transport_and_reply_lines_reach_sink() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATI\r", b"ATI\r\n+SW: PULSAR_LR 0102\r\nOK\r\n");
        let link = mock.link();

        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink.clone());

        io.write(b"ATI\r".to_vec()).await.unwrap();
        settle().await;

        assert_eq!(link.sent_text(), vec!["ATI\r"]);
        assert_eq!(
            *sink.lines.lock(),
            vec!["ATI\r", "+SW: PULSAR_LR 0102\r", "OK\r"]
        );
        io.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unsolicited_lines_are_delivered() {
        let mock = MockTransport::new();
        let link = mock.link();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink.clone());

        link.inject(b"+HBT\r\n+CINV: 3034257BF7194E4000001A85\r\n");
        settle().await;

        assert_eq!(sink.lines.lock().len(), 2);
        assert!(sink.lost.lock().is_empty());
        io.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn received_bytes_refresh_activity() {
        let mock = MockTransport::new();
        let link = mock.link();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink);

        let started = io.last_activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.inject(b"+HBT\r\n");
        settle().await;
        assert!(io.last_activity() > started);
        io.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn separator_switch_changes_framing() {
        let mut mock = MockTransport::new();
        mock.expect(b"EOF\r", b"OK!\r");
        let link = mock.link();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\r', sink.clone());

        io.writer().set_separator(b'\n').await.unwrap();
        io.write(b"EOF\r".to_vec()).await.unwrap();
        settle().await;
        // The reply is still incomplete under the new separator.
        assert!(sink.lines.lock().is_empty());

        link.inject(b"\n");
        settle().await;
        assert_eq!(*sink.lines.lock(), vec!["OK!\r"]);
        io.shutdown().await.unwrap();
    }

    // =======================================================================
    // Failure and shutdown
    // =======================================================================

    #[tokio::test]
    async fn hang_up_reports_connection_lost() {
        let mock = MockTransport::new();
        let link = mock.link();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink.clone());

        link.hang_up();
        settle().await;

        assert_eq!(sink.lost.lock().len(), 1);
        assert!(!io.is_alive());
        assert!(!link.is_connected());
        assert!(matches!(
            io.write(b"ATI\r".to_vec()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn shutdown_recovers_transport() {
        let mock = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink.clone());

        let transport = io.shutdown().await.unwrap();
        assert!(transport.is_connected());
        assert!(sink.lost.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_closes_transport() {
        let mock = MockTransport::new();
        let link = mock.link();
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink.clone());

        io.cancel();
        settle().await;
        assert!(!link.is_connected());
        assert!(sink.lost.lock().is_empty());
    }

    #[tokio::test]
    async fn write_error_is_returned_to_caller() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATI\r", b"");
        let sink = Arc::new(RecordingSink::default());
        let io = spawn_io_task(Box::new(mock), b'\n', sink);

        // The mock rejects anything it was not told to expect.
        let result = io.write(b"AT+INV\r".to_vec()).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        io.shutdown().await.unwrap();
    }
}
