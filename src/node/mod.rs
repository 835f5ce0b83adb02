//! Node multiplexing layer: the addressable entity on the bus.
//!
//! A [`Node`] offers broadcast, request/response and response-send
//! primitives over a running serial link, owns the per-type and
//! per-(peer, type) transfer-ID tables, dispatches incoming traffic to
//! registered handlers or pending continuations, and runs the allocator
//! for anonymous peers.
//!
//! Incoming frames are processed on a dedicated dispatch task; internal
//! state transitions driven off received messages are therefore
//! single-threaded, while the submission methods are safe to call from
//! any task. Continuation delivery is always deferred to the worker pool
//! so application callbacks can never stall frame ingestion.
//!
//! # Example
//!
//! ```ignore
//! use modlink::node::Node;
//!
//! let node = Node::builder()
//!     .on_broadcast(|source, type_id, _transfer, _priority, payload: &[u8]| {
//!         println!("broadcast {type_id} from {source}: {payload:?}");
//!     })
//!     .spawn(reader, writer)?;
//! node.broadcast(20000, 16, &[1, 2, 3]).await?;
//! ```

mod allocator;
mod broadcast_table;
pub mod continuation;
pub mod header;
mod service_table;

pub use allocator::UniqueId;
pub use continuation::{
    CallbackContinuation, Continuation, ContinuationPool, CountdownContinuation,
    NullContinuation, Response, Task,
};
pub use header::{type_id, BusMessage, MessageKind, MAX_PAYLOAD_LENGTH};

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::config::{LinkConfig, NodeConfig};
use crate::error::{ModlinkError, Result};
use crate::link::{DecodedFrame, PartialFrame};
use crate::serial::{InboxReceiver, SerialDriver};
use allocator::{Allocator, ALLOCATION_PRIORITY};
use broadcast_table::BroadcastTable;
use service_table::ServiceTable;

/// Handler for incoming broadcasts.
pub trait BroadcastHandler: Send + Sync + 'static {
    fn handle(&self, source: u8, type_id: u16, transfer_id: u8, priority: u8, payload: &[u8]);
}

impl<F> BroadcastHandler for F
where
    F: Fn(u8, u16, u8, u8, &[u8]) + Send + Sync + 'static,
{
    fn handle(&self, source: u8, type_id: u16, transfer_id: u8, priority: u8, payload: &[u8]) {
        self(source, type_id, transfer_id, priority, payload)
    }
}

/// Handler for incoming service requests addressed to this node.
pub trait ServiceHandler: Send + Sync + 'static {
    fn handle(&self, source: u8, type_id: u8, transfer_id: u8, priority: u8, payload: &[u8]);
}

impl<F> ServiceHandler for F
where
    F: Fn(u8, u8, u8, u8, &[u8]) + Send + Sync + 'static,
{
    fn handle(&self, source: u8, type_id: u8, transfer_id: u8, priority: u8, payload: &[u8]) {
        self(source, type_id, transfer_id, priority, payload)
    }
}

/// Builder for configuring and spawning a [`Node`].
pub struct NodeBuilder {
    link_config: LinkConfig,
    node_config: NodeConfig,
    broadcast_handler: Option<Arc<dyn BroadcastHandler>>,
    request_handler: Option<Arc<dyn ServiceHandler>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            link_config: LinkConfig::default(),
            node_config: NodeConfig::default(),
            broadcast_handler: None,
            request_handler: None,
        }
    }

    /// Override the link configuration.
    pub fn link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    /// Override the node configuration.
    pub fn node_config(mut self, config: NodeConfig) -> Self {
        self.node_config = config;
        self
    }

    /// Register the broadcast handler.
    pub fn on_broadcast(mut self, handler: impl BroadcastHandler) -> Self {
        self.broadcast_handler = Some(Arc::new(handler));
        self
    }

    /// Register the incoming-request handler. Without one, incoming
    /// requests are logged as unsupported and dropped.
    pub fn on_request(mut self, handler: impl ServiceHandler) -> Self {
        self.request_handler = Some(Arc::new(handler));
        self
    }

    /// Spawn the link and dispatch tasks over the given stream halves.
    /// Must be called within a tokio runtime.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> Result<Node>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Node::spawn(
            reader,
            writer,
            self.link_config,
            self.node_config,
            self.broadcast_handler,
            self.request_handler,
        )
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct NodeInner {
    config: NodeConfig,
    driver: SerialDriver,
    // One slot for each 16-bit broadcast type, holding the next transfer ID.
    broadcast_table: BroadcastTable,
    // One entry for each (7-bit peer, 8-bit type) pair, 32 slots each.
    service_table: ServiceTable,
    allocator: Allocator,
    broadcast_handler: Option<Arc<dyn BroadcastHandler>>,
    request_handler: Option<Arc<dyn ServiceHandler>>,
}

/// A running bus node.
///
/// Dropping the node shuts down its link and dispatch tasks.
pub struct Node {
    inner: Arc<NodeInner>,
    tasks: Vec<JoinHandle<()>>,
}

fn service_key(counterparty_id: u8, type_id: u8) -> Result<u16> {
    if !(1..=127).contains(&counterparty_id) {
        return Err(ModlinkError::Protocol(format!(
            "invalid counterparty ID {counterparty_id}"
        )));
    }
    Ok(type_id as u16 | (counterparty_id as u16) << 8)
}

impl Node {
    /// Create a node builder.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    fn spawn<R, W>(
        reader: R,
        writer: W,
        link_config: LinkConfig,
        node_config: NodeConfig,
        broadcast_handler: Option<Arc<dyn BroadcastHandler>>,
        request_handler: Option<Arc<dyn ServiceHandler>>,
    ) -> Result<Node>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !(1..=127).contains(&node_config.self_id) {
            // The node must not be anonymous, since it is the allocator.
            return Err(ModlinkError::Protocol(format!(
                "invalid node ID {}",
                node_config.self_id
            )));
        }
        let (driver, inbox) = SerialDriver::spawn(reader, writer, link_config)?;
        let inner = Arc::new(NodeInner {
            driver,
            broadcast_table: BroadcastTable::new(65536),
            service_table: ServiceTable::new(32768, node_config.request_expiry),
            allocator: Allocator::new(node_config.allocation_timeout),
            broadcast_handler,
            request_handler,
            config: node_config,
        });
        let sweep_period = inner.config.sweep_period;
        let tasks = vec![
            tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbox)),
            tokio::spawn(sweep_loop(Arc::downgrade(&inner), sweep_period)),
        ];
        Ok(Node { inner, tasks })
    }

    /// Send a fire-and-forget broadcast of `type_id`.
    pub async fn broadcast(&self, type_id: u16, priority: u8, payload: &[u8]) -> Result<()> {
        self.inner.broadcast(type_id, priority, payload).await
    }

    /// Send a request and register `continuation` for its response.
    ///
    /// Fails with [`ModlinkError::Backoff`] when all 32 transfer IDs for
    /// this (destination, type) pair are outstanding; the caller retries
    /// later.
    pub async fn request(
        &self,
        destination_id: u8,
        type_id: u8,
        priority: u8,
        payload: &[u8],
        continuation: Arc<dyn Continuation>,
    ) -> Result<()> {
        let key = service_key(destination_id, type_id)?;
        let transfer_id = self
            .inner
            .service_table
            .claim(key, Instant::now(), continuation)?;
        let result = self
            .inner
            .send_service(
                header::pack_request(self.inner.config.self_id, destination_id, type_id, priority),
                transfer_id,
                payload,
            )
            .await;
        if result.is_err() {
            // The request never reached the link; give the slot back
            // rather than waiting for the sweep.
            let _ = self.inner.service_table.release(key, transfer_id);
        }
        result
    }

    /// Send a request, delivering the outcome to `callback` on the worker
    /// pool.
    pub async fn request_callback<F>(
        &self,
        destination_id: u8,
        type_id: u8,
        priority: u8,
        payload: &[u8],
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        self.request(
            destination_id,
            type_id,
            priority,
            payload,
            Arc::new(CallbackContinuation::new(callback)),
        )
        .await
    }

    /// Send several requests under one continuation.
    ///
    /// All transfer IDs are claimed with one shared timestamp so they
    /// expire together. If the table exhausts mid-batch, the already
    /// claimed IDs are released before the backoff signal is returned, so
    /// partially-failed batches never leak slots.
    pub async fn request_many(
        &self,
        destination_id: u8,
        type_id: u8,
        priority: u8,
        payloads: &[&[u8]],
        continuation: Arc<dyn Continuation>,
    ) -> Result<()> {
        let key = service_key(destination_id, type_id)?;
        let timestamp = Instant::now();
        let mut transfer_ids = Vec::with_capacity(payloads.len());
        for _ in payloads {
            match self
                .inner
                .service_table
                .claim(key, timestamp, continuation.clone())
            {
                Ok(transfer_id) => transfer_ids.push(transfer_id),
                Err(error) => {
                    for &claimed in &transfer_ids {
                        if self.inner.service_table.release(key, claimed).is_err() {
                            tracing::error!(
                                transfer_id = claimed,
                                "failed to release transfer ID whilst unwinding request"
                            );
                        }
                    }
                    return Err(error);
                }
            }
        }
        let header =
            header::pack_request(self.inner.config.self_id, destination_id, type_id, priority);
        let mut frames = Vec::with_capacity(payloads.len());
        for (payload, &transfer_id) in payloads.iter().zip(&transfer_ids) {
            let mut frame = PartialFrame::new();
            header::write_message(&mut frame, header, transfer_id, payload)?;
            frames.push(frame);
        }
        self.inner.driver.submit_all(frames).await
    }

    /// Send a response to a previously received request.
    pub async fn respond(
        &self,
        destination_id: u8,
        type_id: u8,
        transfer_id: u8,
        priority: u8,
        payload: &[u8],
    ) -> Result<()> {
        self.inner
            .send_service(
                header::pack_response(self.inner.config.self_id, destination_id, type_id, priority),
                transfer_id,
                payload,
            )
            .await
    }

    /// Number of outstanding requests across all peers and types.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.service_table.occupancy_count()
    }

    /// Reclaim expired request slots, firing their timeout paths on the
    /// worker pool. Returns the number of reclaimed slots. Also run
    /// periodically by the background sweep.
    pub fn abort_expired_requests(&self) -> usize {
        self.inner.abort_expired()
    }

    /// Frames accepted by the link but not yet dispatched.
    pub fn inbox_backlog(&self) -> usize {
        self.inner.driver.inbox_backlog()
    }

    /// Frames queued for the stream writer.
    pub fn outbox_backlog(&self) -> usize {
        self.inner.driver.outbox_backlog()
    }

    /// Frames submitted but not yet accepted into the egress window.
    pub fn collector_backlog(&self) -> usize {
        self.inner.driver.collector_backlog()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl NodeInner {
    async fn broadcast(&self, type_id: u16, priority: u8, payload: &[u8]) -> Result<()> {
        let transfer_id = self.broadcast_table.next(type_id);
        let header = header::pack_broadcast(self.config.self_id, type_id, priority);
        let mut frame = PartialFrame::new();
        header::write_message(&mut frame, header, transfer_id, payload)?;
        self.driver.submit(frame).await
    }

    async fn send_service(&self, header: u32, transfer_id: u8, payload: &[u8]) -> Result<()> {
        let mut frame = PartialFrame::new();
        header::write_message(&mut frame, header, transfer_id, payload)?;
        self.driver.submit(frame).await
    }

    fn abort_expired(&self) -> usize {
        self.service_table.abort_expired(|task| {
            tokio::spawn(async move { task() });
        })
    }

    async fn process_frame(&self, frame: &DecodedFrame) {
        let Some(message) = header::parse(frame) else {
            return;
        };
        match message.kind {
            MessageKind::Broadcast => self.handle_broadcast(&message).await,
            MessageKind::Request => self.handle_request(&message),
            MessageKind::Response => self.handle_response(&message),
        }
    }

    async fn handle_broadcast(&self, message: &BusMessage<'_>) {
        if message.type_id == type_id::ALLOCATION {
            let reply = self
                .allocator
                .handle_message(message.source, message.payload);
            if let Some(reply) = reply {
                if let Err(error) = self
                    .broadcast(type_id::ALLOCATION, ALLOCATION_PRIORITY, reply.as_slice())
                    .await
                {
                    tracing::warn!(%error, "failed to send allocation reply");
                }
            }
        } else if let Some(handler) = &self.broadcast_handler {
            handler.handle(
                message.source,
                message.type_id,
                message.transfer_id,
                message.priority,
                message.payload,
            );
        }
    }

    fn handle_request(&self, message: &BusMessage<'_>) {
        if message.destination != self.config.self_id {
            return;
        }
        match &self.request_handler {
            Some(handler) => handler.handle(
                message.source,
                message.type_id as u8,
                message.transfer_id,
                message.priority,
                message.payload,
            ),
            None => {
                tracing::error!(
                    source = message.source,
                    type_id = message.type_id,
                    "unsupported operation: incoming service request"
                );
            }
        }
    }

    fn handle_response(&self, message: &BusMessage<'_>) {
        if message.destination != self.config.self_id {
            return;
        }
        let Ok(key) = service_key(message.source, message.type_id as u8) else {
            tracing::warn!(source = message.source, "response from invalid source");
            return;
        };
        match self.service_table.release(key, message.transfer_id) {
            Ok(continuation) => {
                if let Some(task) = continuation.next(message.payload) {
                    // Issue to the worker pool rather than blocking the
                    // dispatch task.
                    tokio::spawn(async move { task() });
                }
            }
            Err(_) => {
                // Could be a late response for an already-expired or
                // already-satisfied exchange; not fatal.
                tracing::warn!(source = message.source, "unexpected response");
            }
        }
    }
}

async fn dispatch_loop(inner: std::sync::Weak<NodeInner>, mut inbox: InboxReceiver) {
    while let Some(frame) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.process_frame(&frame).await;
    }
    tracing::debug!("inbox closed, dispatch terminating");
}

/// Periodically reclaim expired requests and report link health.
async fn sweep_loop(inner: std::sync::Weak<NodeInner>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let inbox_backlog = inner.driver.inbox_backlog();
        let outbox_backlog = inner.driver.outbox_backlog();
        let collector_backlog = inner.driver.collector_backlog();
        let in_flight = inner.service_table.occupancy_count();
        let timed_out = inner.abort_expired();
        if timed_out > 0 {
            tracing::warn!(
                inbox_backlog,
                outbox_backlog,
                collector_backlog,
                in_flight,
                timed_out,
                "expired outstanding requests"
            );
        } else {
            tracing::debug!(
                inbox_backlog,
                outbox_backlog,
                collector_backlog,
                in_flight,
                "link health"
            );
        }
    }
}
