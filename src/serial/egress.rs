//! Egress engine: owns the retransmission window, drives the handshake
//! and keepalive state machine, and serializes application frames plus
//! control traffic into the outgoing byte stream under a bandwidth
//! budget.
//!
//! The window is a circular run of up to `window_size` unacknowledged
//! frames over 256 sequence-indexed slots. `head` points at the oldest
//! unacknowledged frame, `tail` at the next free sequence, and a `cursor`
//! walks the window each transmit cycle re-sending frames until the
//! per-cycle byte budget is spent. When the cursor reaches the tail it
//! holds off a few cycles before wrapping back to the head, so a slow
//! acknowledger does not trigger a busy-loop resend storm.
//!
//! Feedback from the ingress engine (acknowledgements, pongs,
//! initialisation state changes) arrives through plain atomics read once
//! per cycle; staleness of one cycle is acceptable and keeps the two
//! engines' latencies decoupled.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::error::{ModlinkError, Result};
use crate::link::{self, command, EncodedFrame, PROTOCOL_VERSION};
use crate::serial::batch::{Accepted, EgressHandoff, BATCH_CAPACITY};
use crate::serial::{pause_on_error, Backlogs};

/// Cross-engine feedback, written by the ingress engine and drained by
/// the egress engine once per cycle.
pub(crate) struct Feedback {
    /// Last acknowledged sequence number, -1 when none is pending.
    pub(crate) acknowledge: AtomicI32,
    pub(crate) initialisations: AtomicU32,
    pub(crate) uninitialisations: AtomicU32,
    pub(crate) pongs: AtomicU32,
}

impl Feedback {
    pub(crate) fn new() -> Self {
        Self {
            acknowledge: AtomicI32::new(-1),
            initialisations: AtomicU32::new(0),
            uninitialisations: AtomicU32::new(0),
            pongs: AtomicU32::new(0),
        }
    }

    /// Apply a decoded reply frame.
    pub(crate) fn apply(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < 2 {
            return Err(ModlinkError::Protocol("truncated feedback".to_string()));
        }
        let code = frame[1];
        match code {
            command::ACKNOWLEDGE => {
                if frame.len() < 3 {
                    Err(ModlinkError::Protocol(
                        "acknowledgement returned without a sequence number".to_string(),
                    ))
                } else {
                    self.acknowledge.store(frame[2] as i32, Ordering::Release);
                    Ok(())
                }
            }
            command::INITIALISED => {
                self.initialisations.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            command::UNINITIALISED => {
                self.uninitialisations.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            command::PONG => {
                if frame.len() < 3 || frame[2] < PROTOCOL_VERSION {
                    Err(ModlinkError::Protocol(
                        "counterparty does not support minimal protocol version (>= 1)"
                            .to_string(),
                    ))
                } else {
                    self.pongs.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
            }
            _ => Err(ModlinkError::Protocol(format!(
                "unsupported feedback code {code}"
            ))),
        }
    }
}

struct WindowSlot {
    bytes: [u8; 256],
    length: usize,
    attempts: u32,
}

pub(crate) struct EgressEngine {
    config: LinkConfig,
    feedback: Arc<Feedback>,
    handoff: EgressHandoff,
    outbox_tx: mpsc::Sender<EncodedFrame>,
    backlogs: Arc<Backlogs>,
    slots: Vec<WindowSlot>,
    scratchpad: [u8; 256],
    initialised: bool,
    head: u8,
    tail: u8,
    cursor: u8,
    holdoff: u32,
    countdown: i64,
    budget: usize,
    holdoff_limit: u32,
}

fn mod_distance(a: u8, b: u8) -> u8 {
    a.wrapping_sub(b)
}

impl EgressEngine {
    pub(crate) fn new(
        config: LinkConfig,
        feedback: Arc<Feedback>,
        handoff: EgressHandoff,
        outbox_tx: mpsc::Sender<EncodedFrame>,
        backlogs: Arc<Backlogs>,
    ) -> Result<Self> {
        if BATCH_CAPACITY > config.window_size / 2 {
            return Err(ModlinkError::Protocol(
                "batch capacity over half the window size".to_string(),
            ));
        }
        let budget = config.cycle_byte_budget();
        let holdoff_limit = config.cursor_reset_holdoff();
        let countdown = config.pong_quota as i64;
        Ok(Self {
            config,
            feedback,
            handoff,
            outbox_tx,
            backlogs,
            slots: (0..256)
                .map(|_| WindowSlot {
                    bytes: [0u8; 256],
                    length: 0,
                    attempts: 0,
                })
                .collect(),
            scratchpad: [0u8; 256],
            initialised: false,
            head: 0,
            tail: 0,
            cursor: 0,
            holdoff: 0,
            countdown,
            budget,
            holdoff_limit,
        })
    }

    pub(crate) async fn run(mut self) {
        if self.budget < 256 {
            tracing::warn!(
                budget = self.budget,
                "bandwidth restrictions limit maximum frame size"
            );
        }
        loop {
            let timestamp = Instant::now();
            if !self.accept_until_next_transmission(timestamp).await {
                tracing::debug!("collector closed, egress terminating");
                return;
            }
            self.handle_feedback();
            match self.publish_batch().await {
                Ok(()) => {}
                Err(ModlinkError::LinkClosed) => {
                    tracing::debug!("outbox closed, egress terminating");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "egress error");
                    pause_on_error().await;
                }
            }
        }
    }

    /// Accept application frames into the window until the next transmit
    /// instant. Returns false once the collector side has shut down.
    async fn accept_until_next_transmission(&mut self, timestamp: Instant) -> bool {
        loop {
            let duration = self.until_next_transmission(timestamp);
            if duration.is_zero() {
                return true;
            }
            let space = self.config.window_size - mod_distance(self.tail, self.head) as usize;
            // Do not bother entering the exchange unless we are near the
            // start of the cycle with room for a whole batch.
            if space >= BATCH_CAPACITY && duration > self.config.active_period.mul_f64(0.95) {
                match self.handoff.accept(duration).await {
                    Accepted::Batch(batch) => {
                        for index in 0..batch.count() {
                            if let Err(error) = self.accept_frame(batch.slot(index)) {
                                tracing::error!(%error, "dropping unacceptable frame");
                            }
                        }
                        self.handoff.recycle(batch);
                    }
                    Accepted::TimedOut => return true,
                    Accepted::Closed => return false,
                }
            } else {
                tokio::time::sleep(duration).await;
            }
        }
    }

    fn until_next_transmission(&self, timestamp: Instant) -> Duration {
        let period = if self.tail != self.head || !self.initialised {
            self.config.active_period
        } else {
            self.config.idle_period
        };
        (timestamp + period).saturating_duration_since(Instant::now())
    }

    /// Frame an accepted payload into the slot at `tail`: COBS overhead
    /// placeholder, payload, sequence byte, CRC16, delimiter.
    fn accept_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(ModlinkError::Protocol("buffer is empty".to_string()));
        }
        let sequence = self.tail;
        let slot = &mut self.slots[sequence as usize];
        slot.length = 0;
        slot.attempts = 0;
        slot.bytes[0] = 0x00; // Placeholder for the COBS overhead byte.
        let prefix = 1 + data.len();
        if prefix > 252 {
            return Err(ModlinkError::Protocol("buffer is too full".to_string()));
        }
        slot.bytes[1..prefix].copy_from_slice(data);
        slot.length = link::seal_message(&mut slot.bytes, prefix, sequence)?;
        self.tail = self.tail.wrapping_add(1);
        Ok(())
    }

    /// Drain the feedback atomics once per cycle.
    fn handle_feedback(&mut self) {
        let pongs = self.feedback.pongs.swap(0, Ordering::AcqRel);
        if self.countdown > 0 && pongs > 0 {
            self.countdown -= pongs as i64;
        }
        let acknowledged = self.feedback.acknowledge.swap(-1, Ordering::AcqRel);
        if acknowledged >= 0 {
            let acknowledged = acknowledged as u8;
            // Advance only for sequences inside the outstanding window,
            // guarding against stale or duplicate acknowledgements.
            if mod_distance(acknowledged, self.head) < mod_distance(self.tail, self.head) {
                self.head = acknowledged.wrapping_add(1);
            }
        }
        let initialisations = self.feedback.initialisations.swap(0, Ordering::AcqRel);
        if !self.initialised && initialisations > 0 {
            tracing::info!("serial egress channel initialised");
            self.initialised = true;
        }
        let uninitialisations = self.feedback.uninitialisations.swap(0, Ordering::AcqRel);
        if self.initialised && uninitialisations > 0 {
            tracing::info!("serial egress channel uninitialised");
            self.countdown = self.config.pong_quota as i64;
            self.initialised = false;
        }
    }

    async fn publish_batch(&mut self) -> Result<()> {
        let limit = self.budget;
        let mut accumulator = 0usize;
        if self.initialised {
            if self.head != self.tail {
                loop {
                    if self.cursor == self.tail {
                        // The cursor hit the end of the window; wait some
                        // cycles before wrapping, new data might be queued
                        // in the meantime.
                        let previous = self.holdoff;
                        self.holdoff += 1;
                        if previous < self.holdoff_limit {
                            break;
                        }
                    }
                    if mod_distance(self.cursor, self.head) >= mod_distance(self.tail, self.head)
                    {
                        // Cursor lies outside the window (e.g. its slot
                        // was just acknowledged); reset it to the head.
                        self.cursor = self.head;
                    }
                    self.holdoff = 0;
                    let length = self.slots[self.cursor as usize].length;
                    if length > limit {
                        // The budget can never admit this frame.
                        return Err(ModlinkError::Protocol(
                            "bandwidth restrictions prevent egress from making progress"
                                .to_string(),
                        ));
                    }
                    accumulator += length;
                    if accumulator > limit {
                        break; // Publication would breach the budget.
                    }
                    let mut frame = EncodedFrame::new();
                    frame.write_slice(&self.slots[self.cursor as usize].bytes[..length])?;
                    self.send(frame).await?;
                    let slot = &mut self.slots[self.cursor as usize];
                    slot.attempts += 1;
                    if slot.attempts > 2 {
                        tracing::warn!(
                            attempts = slot.attempts,
                            slot = self.cursor,
                            "excessive serial retransmission"
                        );
                    }
                    self.cursor = self.cursor.wrapping_add(1);
                }
            }
        } else if self.countdown > 0 {
            let length = link::write_ping(&mut self.scratchpad)?;
            if length <= limit {
                let mut frame = EncodedFrame::new();
                frame.write_slice(&self.scratchpad[..length])?;
                self.send(frame).await?;
            }
        } else {
            let length =
                link::write_initialise(&mut self.scratchpad, PROTOCOL_VERSION, self.head)?;
            if length <= limit {
                let mut frame = EncodedFrame::new();
                frame.write_slice(&self.scratchpad[..length])?;
                self.send(frame).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, frame: EncodedFrame) -> Result<()> {
        self.backlogs.outbox.fetch_add(1, Ordering::Relaxed);
        if self.outbox_tx.send(frame).await.is_err() {
            self.backlogs.outbox.fetch_sub(1, Ordering::Relaxed);
            return Err(ModlinkError::LinkClosed);
        }
        Ok(())
    }
}
