//! Serial link driver: wires the ingress and egress engines, the
//! collector, and the stream writer into a running link over a pair of
//! asynchronous byte-stream halves.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► collector ring ──► collector task ──► batch handoff ─┐
//!                                                                   ▼
//!                        outbox ring ◄── egress engine (ARQ window) ┘
//!                            │
//!                            ▼
//!                       writer task ──► serial stream ──► ingress engine
//!                                                             │     │
//!                                  inbox ring ◄───────────────┘     │
//!                                      │            feedback atomics┘
//!                                      ▼
//!                                node dispatch
//! ```
//!
//! All three rings are bounded at 256 frames; their occupancy is tracked
//! with atomic counters exposed as backlog diagnostics. Submission is the
//! only caller-visible operation that can block, bounded by the configured
//! submit timeout.

pub(crate) mod batch;
pub(crate) mod egress;
pub(crate) mod ingress;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{ModlinkError, Result};
use crate::link::{DecodedFrame, EncodedFrame, PartialFrame};
use batch::{handoff_pair, Batch, CollectorHandoff};
use egress::{EgressEngine, Feedback};
use ingress::IngressEngine;

/// Capacity of the inbox, outbox and collector rings, in frames.
pub(crate) const RING_SIZE: usize = 256;

/// Ring occupancy counters backing the backlog diagnostics.
pub(crate) struct Backlogs {
    pub(crate) inbox: AtomicUsize,
    pub(crate) outbox: AtomicUsize,
    pub(crate) collector: AtomicUsize,
}

impl Backlogs {
    pub(crate) fn new() -> Self {
        Self {
            inbox: AtomicUsize::new(0),
            outbox: AtomicUsize::new(0),
            collector: AtomicUsize::new(0),
        }
    }
}

/// Park briefly after an unexpected fault so a persistent error condition
/// cannot thrash its processing context.
pub(crate) async fn pause_on_error() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Receiving side of the inbox ring, handed to the dispatch layer.
pub struct InboxReceiver {
    rx: mpsc::Receiver<DecodedFrame>,
    backlogs: Arc<Backlogs>,
}

impl InboxReceiver {
    /// Receive the next validated data frame, or `None` once the link has
    /// shut down.
    pub async fn recv(&mut self) -> Option<DecodedFrame> {
        let frame = self.rx.recv().await?;
        self.backlogs.inbox.fetch_sub(1, Ordering::Relaxed);
        Some(frame)
    }
}

/// Handle to a running serial link.
///
/// Cheap to share behind the node layer; submission methods are safe to
/// call from any task. Dropping the driver aborts every link task.
pub struct SerialDriver {
    collector_tx: mpsc::Sender<PartialFrame>,
    backlogs: Arc<Backlogs>,
    submit_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialDriver {
    /// Spawn the link tasks over the given stream halves.
    ///
    /// Must be called within a tokio runtime. Returns the driver handle
    /// and the inbox receiver carrying validated incoming data frames.
    pub fn spawn<R, W>(reader: R, writer: W, config: LinkConfig) -> Result<(Self, InboxReceiver)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let backlogs = Arc::new(Backlogs::new());
        let feedback = Arc::new(Feedback::new());
        let (inbox_tx, inbox_rx) = mpsc::channel(RING_SIZE);
        let (outbox_tx, outbox_rx) = mpsc::channel(RING_SIZE);
        let (collector_tx, collector_rx) = mpsc::channel(RING_SIZE);
        let (collector_handoff, egress_handoff, initial_batch) = handoff_pair();

        let egress = EgressEngine::new(
            config.clone(),
            feedback.clone(),
            egress_handoff,
            outbox_tx.clone(),
            backlogs.clone(),
        )?;
        let ingress = IngressEngine::new(
            reader,
            config.clone(),
            feedback,
            inbox_tx,
            outbox_tx,
            backlogs.clone(),
        );

        let tasks = vec![
            tokio::spawn(writer_loop(outbox_rx, writer, backlogs.clone())),
            tokio::spawn(collector_loop(
                collector_rx,
                collector_handoff,
                initial_batch,
                backlogs.clone(),
            )),
            tokio::spawn(egress.run()),
            tokio::spawn(ingress.run()),
        ];

        let driver = Self {
            collector_tx,
            backlogs: backlogs.clone(),
            submit_timeout: config.submit_timeout,
            tasks,
        };
        let inbox = InboxReceiver {
            rx: inbox_rx,
            backlogs,
        };
        Ok((driver, inbox))
    }

    /// Submit a frame for reliable transmission.
    ///
    /// The frame must already carry its command byte and payload; the
    /// link appends sequence, checksum and framing. Blocks while the
    /// collector ring is full, up to the configured submit timeout.
    pub async fn submit(&self, frame: PartialFrame) -> Result<()> {
        if frame.is_empty() {
            return Err(ModlinkError::Protocol("empty frame".to_string()));
        }
        self.backlogs.collector.fetch_add(1, Ordering::Relaxed);
        match self
            .collector_tx
            .send_timeout(frame, self.submit_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.backlogs.collector.fetch_sub(1, Ordering::Relaxed);
                Err(ModlinkError::SubmitTimeout)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.backlogs.collector.fetch_sub(1, Ordering::Relaxed);
                Err(ModlinkError::LinkClosed)
            }
        }
    }

    /// Submit several frames for reliable transmission, preserving order.
    pub async fn submit_all(&self, frames: Vec<PartialFrame>) -> Result<()> {
        for frame in frames {
            self.submit(frame).await?;
        }
        Ok(())
    }

    /// Frames accepted by the ingress engine but not yet dispatched.
    pub fn inbox_backlog(&self) -> usize {
        self.backlogs.inbox.load(Ordering::Relaxed)
    }

    /// Frames queued for the stream writer.
    pub fn outbox_backlog(&self) -> usize {
        self.backlogs.outbox.load(Ordering::Relaxed)
    }

    /// Frames submitted but not yet accepted into the egress window.
    pub fn collector_backlog(&self) -> usize {
        self.backlogs.collector.load(Ordering::Relaxed)
    }
}

impl Drop for SerialDriver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Drain the outbox ring onto the stream, batching ready frames into one
/// flush.
async fn writer_loop<W>(
    mut outbox_rx: mpsc::Receiver<EncodedFrame>,
    mut writer: W,
    backlogs: Arc<Backlogs>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match outbox_rx.recv().await {
            Some(frame) => frame,
            None => return, // Channel closed, clean shutdown.
        };
        let mut written = 0usize;
        let mut error = None;
        let mut frame = Some(first);
        while let Some(current) = frame.take() {
            if let Err(io_error) = writer.write_all(current.as_slice()).await {
                error = Some(io_error);
                written += 1;
                break;
            }
            written += 1;
            frame = outbox_rx.try_recv().ok();
        }
        backlogs.outbox.fetch_sub(written, Ordering::Relaxed);
        match error {
            None => {
                if let Err(io_error) = writer.flush().await {
                    tracing::warn!(error = %io_error, "I/O error whilst flushing stream");
                    pause_on_error().await;
                }
            }
            Some(io_error) => {
                tracing::warn!(error = %io_error, "I/O error whilst transmitting frame");
                pause_on_error().await;
            }
        }
    }
}

/// Drain the collector ring into batches and hand them to the egress
/// engine through the rendezvous.
async fn collector_loop(
    mut collector_rx: mpsc::Receiver<PartialFrame>,
    mut handoff: CollectorHandoff,
    initial: Batch,
    backlogs: Arc<Backlogs>,
) {
    let mut batch = initial;
    loop {
        let first = match collector_rx.recv().await {
            Some(frame) => frame,
            None => return, // Channel closed, clean shutdown.
        };
        if let Err(error) = insert(&mut batch, first, &backlogs) {
            tracing::error!(%error, "dropping collected frame");
        }
        loop {
            if batch.is_full() {
                batch = match handoff.exchange(batch).await {
                    Some(fresh) => fresh,
                    None => return,
                };
            }
            match collector_rx.try_recv() {
                Ok(frame) => {
                    if let Err(error) = insert(&mut batch, frame, &backlogs) {
                        tracing::error!(%error, "dropping collected frame");
                    }
                }
                Err(_) => break,
            }
        }
        if batch.count() > 0 {
            batch = match handoff.exchange(batch).await {
                Some(fresh) => fresh,
                None => return,
            };
        }
    }
}

fn insert(batch: &mut Batch, frame: PartialFrame, backlogs: &Backlogs) -> Result<()> {
    let result = batch.insert(frame.as_slice());
    backlogs.collector.fetch_sub(1, Ordering::Relaxed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::command;

    fn test_config() -> LinkConfig {
        LinkConfig {
            pong_quota: 2,
            active_period: Duration::from_millis(1),
            idle_period: Duration::from_millis(20),
            cursor_reset_delay: Duration::from_millis(5),
            accumulation_period: Duration::from_millis(1),
            submit_timeout: Duration::from_secs(1),
            ..LinkConfig::default()
        }
    }

    fn message_frame(payload: &[u8]) -> PartialFrame {
        let mut frame = PartialFrame::new();
        frame.write(command::MESSAGE).unwrap();
        frame.write_slice(payload).unwrap();
        frame
    }

    #[tokio::test]
    async fn test_two_drivers_converse() {
        let (side_a, side_b) = tokio::io::duplex(65536);
        let (read_a, write_a) = tokio::io::split(side_a);
        let (read_b, write_b) = tokio::io::split(side_b);
        let (driver_a, _inbox_a) = SerialDriver::spawn(read_a, write_a, test_config()).unwrap();
        let (_driver_b, mut inbox_b) = SerialDriver::spawn(read_b, write_b, test_config()).unwrap();

        driver_a
            .submit(message_frame(&[1, 2, 3, 4, 5, 6]))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), inbox_b.recv())
            .await
            .expect("handshake or delivery timed out")
            .expect("inbox closed");
        assert_eq!(frame.as_slice()[1], command::MESSAGE);
        assert_eq!(&frame.as_slice()[2..8], &[1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_burst_larger_than_window_is_delivered_exactly_once() {
        let (side_a, side_b) = tokio::io::duplex(65536);
        let (read_a, write_a) = tokio::io::split(side_a);
        let (read_b, write_b) = tokio::io::split(side_b);
        let (driver_a, _inbox_a) = SerialDriver::spawn(read_a, write_a, test_config()).unwrap();
        let (_driver_b, mut inbox_b) = SerialDriver::spawn(read_b, write_b, test_config()).unwrap();

        // Submit twice the window size in one burst.
        for index in 0..32u8 {
            driver_a
                .submit(message_frame(&[index, 0, 0, 0, 0, 0]))
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 32 {
            let frame = tokio::time::timeout(Duration::from_secs(10), inbox_b.recv())
                .await
                .expect("delivery timed out")
                .expect("inbox closed");
            received.push(frame.as_slice()[2]);
        }
        // In order, no duplicates.
        assert_eq!(received, (0..32u8).collect::<Vec<_>>());
        // Nothing further arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inbox_b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_frame() {
        let (side_a, _side_b) = tokio::io::duplex(65536);
        let (read_a, write_a) = tokio::io::split(side_a);
        let (driver, _inbox) = SerialDriver::spawn(read_a, write_a, test_config()).unwrap();
        assert!(driver.submit(PartialFrame::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_backlogs_start_empty() {
        let (side_a, _side_b) = tokio::io::duplex(65536);
        let (read_a, write_a) = tokio::io::split(side_a);
        let (driver, _inbox) = SerialDriver::spawn(read_a, write_a, test_config()).unwrap();
        assert_eq!(driver.inbox_backlog(), 0);
        assert_eq!(driver.outbox_backlog(), 0);
        assert_eq!(driver.collector_backlog(), 0);
    }
}
