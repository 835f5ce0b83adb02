//! Ingress engine: consumes the raw byte stream, reconstructs frames via
//! COBS and CRC16, demultiplexes control frames from data frames, and
//! drives the receive side of the acknowledge/retransmit protocol.
//!
//! The engine owns its half of the link state machine: it tracks whether
//! the peer has initialised the channel towards us and which sequence
//! number it will accept next. Reply frames (PONG, INITIALISED,
//! UNINITIALISED, ACKNOWLEDGE) are coalesced and flushed once per
//! processing cycle rather than per frame.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::error::{ModlinkError, Result};
use crate::link::{self, cobs, command, crc16, DecodedFrame, EncodedFrame, PROTOCOL_VERSION};
use crate::serial::egress::Feedback;
use crate::serial::{pause_on_error, Backlogs};

pub(crate) struct IngressEngine<R> {
    reader: R,
    config: LinkConfig,
    feedback: Arc<Feedback>,
    inbox_tx: mpsc::Sender<DecodedFrame>,
    outbox_tx: mpsc::Sender<EncodedFrame>,
    backlogs: Arc<Backlogs>,
    backlog: Box<[u8]>,
    buffer: [u8; 256],
    scratchpad: [u8; 256],
    pointer: usize,
    initialised: bool,
    accept: u8,
    respond_pong: bool,
    respond_initialised: bool,
    respond_uninitialised: bool,
    respond_acknowledge: Option<u8>,
}

impl<R> IngressEngine<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub(crate) fn new(
        reader: R,
        config: LinkConfig,
        feedback: Arc<Feedback>,
        inbox_tx: mpsc::Sender<DecodedFrame>,
        outbox_tx: mpsc::Sender<EncodedFrame>,
        backlogs: Arc<Backlogs>,
    ) -> Self {
        let backlog = vec![0u8; config.max_ingress_backlog].into_boxed_slice();
        Self {
            reader,
            config,
            feedback,
            inbox_tx,
            outbox_tx,
            backlogs,
            backlog,
            buffer: [0u8; 256],
            scratchpad: [0u8; 256],
            pointer: 0,
            initialised: false,
            accept: 0,
            respond_pong: false,
            respond_initialised: false,
            respond_uninitialised: false,
            respond_acknowledge: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.cycle().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("serial stream closed, ingress terminating");
                    return;
                }
                Err(ModlinkError::LinkClosed) => {
                    tracing::debug!("link channels closed, ingress terminating");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "ingress error");
                    pause_on_error().await;
                }
            }
        }
    }

    /// One processing cycle: wait for bytes, let a burst accumulate,
    /// consume everything buffered, then flush the coalesced replies.
    async fn cycle(&mut self) -> Result<bool> {
        let mut filled = self.reader.read(&mut self.backlog).await?;
        if filled == 0 {
            return Ok(false);
        }
        // Let the kernel accumulate a burst instead of waking per frame.
        tokio::time::sleep(self.config.accumulation_period).await;
        loop {
            if filled == self.backlog.len() {
                // More may be pending than we are willing to buffer; drop
                // the backlog to bound ingress latency, the protocol
                // retransmits whatever mattered.
                match self.probe().await? {
                    Some(read) => {
                        tracing::warn!(
                            skipped = self.backlog.len(),
                            "skipped bytes to reduce ingress latency"
                        );
                        let length = read.min(self.backlog.len());
                        self.backlog[..length].copy_from_slice(&self.scratchpad[..length]);
                        filled = length;
                        continue;
                    }
                    None => break,
                }
            }
            match tokio::time::timeout(
                Duration::ZERO,
                self.reader.read(&mut self.backlog[filled..]),
            )
            .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(read)) => filled += read,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => break,
            }
        }
        for offset in 0..filled {
            let value = self.backlog[offset];
            self.consume(value).await?;
        }
        self.respond().await?;
        Ok(true)
    }

    /// Zero-wait read into the scratchpad, used to decide whether the
    /// stream holds more than the backlog bound.
    async fn probe(&mut self) -> Result<Option<usize>> {
        match tokio::time::timeout(Duration::ZERO, self.reader.read(&mut self.scratchpad)).await {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(read)) => Ok(Some(read)),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Ok(None),
        }
    }

    async fn consume(&mut self, value: u8) -> Result<()> {
        if value != 0x00 {
            if self.pointer >= 255 {
                tracing::warn!("oversize frame or corrupted delimiter");
                self.pointer = 0;
            }
            self.buffer[self.pointer] = value;
            self.pointer += 1;
            Ok(())
        } else {
            self.process().await
        }
    }

    async fn process(&mut self) -> Result<()> {
        let length = self.pointer;
        self.pointer = 0;
        if length == 0 {
            return Ok(()); // Empty frame.
        } else if length < link::MIN_DECODED_LENGTH {
            tracing::warn!(length, "truncated frame");
            return Ok(());
        }
        let counter = match cobs::decode(&mut self.buffer, 0, 0, length) {
            Ok(counter) => counter,
            Err(error) => {
                tracing::warn!(%error, length, "COBS error");
                return Ok(());
            }
        };
        if counter != 0 {
            tracing::warn!(length, counter, "COBS error");
            return Ok(());
        }
        let checksum = crc16::calculate(&self.buffer, 1, length - 1);
        if checksum != 0 {
            tracing::warn!(length, checksum, "CRC error");
            return Ok(());
        }
        let code = self.buffer[1];
        if code >= command::RESPONSE_FLOOR {
            self.feedback.apply(&self.buffer[..length])?;
        } else if code == command::PING {
            self.respond_pong = true;
        } else if code == command::INITIALISE {
            self.handle_initialise(length)?;
        } else if !self.initialised {
            // No other command may be handled until we are initialised.
            self.respond_uninitialised = true;
        } else if code == command::MESSAGE {
            self.handle_message(length).await?;
        } else {
            tracing::error!(code, "unsupported command code");
        }
        Ok(())
    }

    fn handle_initialise(&mut self, length: usize) -> Result<()> {
        if length == 6 && self.buffer[2] == PROTOCOL_VERSION {
            // Always update the next accepted sequence number, whether we
            // are already initialised or not.
            self.accept = self.buffer[3];
            self.respond_initialised = true;
            if !self.initialised {
                self.initialised = true;
                tracing::info!("serial ingress channel initialised");
            }
            Ok(())
        } else {
            if !self.initialised {
                self.respond_uninitialised = true;
            }
            Err(ModlinkError::Protocol(
                "counterparty attempted to initialise channel with an unsupported format or version"
                    .to_string(),
            ))
        }
    }

    async fn handle_message(&mut self, length: usize) -> Result<()> {
        // The sequence number is always the last byte before the CRC.
        let sequence = self.buffer[length - 3];
        if sequence == self.accept {
            self.accept = self.accept.wrapping_add(1);
            let mut frame = DecodedFrame::new();
            frame.write_slice(&self.buffer[..length])?;
            self.backlogs.inbox.fetch_add(1, Ordering::Relaxed);
            if self.inbox_tx.send(frame).await.is_err() {
                self.backlogs.inbox.fetch_sub(1, Ordering::Relaxed);
                return Err(ModlinkError::LinkClosed);
            }
            self.respond_acknowledge = Some(sequence);
        } else {
            self.respond_acknowledge = Some(self.accept.wrapping_sub(1));
            tracing::debug!(sequence, accept = self.accept, "ignoring incoming frame");
        }
        Ok(())
    }

    async fn respond(&mut self) -> Result<()> {
        if self.respond_pong {
            self.respond_pong = false;
            let length = link::write_pong(&mut self.scratchpad, PROTOCOL_VERSION)?;
            self.send_reply(length).await?;
        }
        if self.respond_uninitialised {
            self.respond_uninitialised = false;
            let length = link::write_uninitialised(&mut self.scratchpad)?;
            self.send_reply(length).await?;
        }
        if self.respond_initialised {
            self.respond_initialised = false;
            let length = link::write_initialised(&mut self.scratchpad)?;
            self.send_reply(length).await?;
        }
        if let Some(sequence) = self.respond_acknowledge.take() {
            let length = link::write_acknowledge(&mut self.scratchpad, sequence)?;
            self.send_reply(length).await?;
        }
        Ok(())
    }

    async fn send_reply(&mut self, length: usize) -> Result<()> {
        let mut frame = EncodedFrame::new();
        frame.write_slice(&self.scratchpad[..length])?;
        self.backlogs.outbox.fetch_add(1, Ordering::Relaxed);
        if self.outbox_tx.send(frame).await.is_err() {
            self.backlogs.outbox.fetch_sub(1, Ordering::Relaxed);
            return Err(ModlinkError::LinkClosed);
        }
        Ok(())
    }
}
