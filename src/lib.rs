//! # modlink
//!
//! Transport and multiplexing core of a daemon that controls a network of
//! hardware modules (sensors, actuators, displays) over a single
//! asynchronous serial link, using a lightweight publish/subscribe plus
//! request/response protocol.
//!
//! The crate makes an unreliable, bandwidth-constrained byte stream
//! behave like a reliable, multiplexed request/response and broadcast bus
//! with bounded memory and bounded latency.
//!
//! ## Architecture
//!
//! ```text
//! application ──► Node ──► SerialDriver ──► collector ─► egress (ARQ) ─┐
//!      ▲           │                                                   ▼
//!      │           │ transfer tables, continuations              writer task
//!      │           ▼                                                   │
//!      └── dispatch ◄── inbox ◄── ingress (COBS + CRC16) ◄── serial stream
//! ```
//!
//! - [`link`] — byte-stream delimiting (COBS), corruption detection
//!   (CRC16), fixed-capacity frame buffers and the control-frame
//!   vocabulary.
//! - [`serial`] — the ingress/egress engines implementing the windowed
//!   acknowledge/retransmit protocol with its handshake and keepalive,
//!   plus the collector and stream-writer tasks.
//! - [`node`] — broadcast fan-out, request/response correlation with
//!   bounded concurrency and timeout reclamation, and dynamic address
//!   allocation for anonymous peers.
//! - [`dictionary`] — the schema-driven sparse binary codec carried as
//!   the payload format of almost all bus traffic.
//!
//! ## Example
//!
//! ```ignore
//! use modlink::{Node, Response};
//!
//! let node = Node::builder()
//!     .on_broadcast(|source, type_id, _t, _p, payload: &[u8]| {
//!         println!("broadcast {type_id} from node {source}: {payload:?}");
//!     })
//!     .spawn(serial_reader, serial_writer)?;
//!
//! node.request_callback(5, 204, 20, &query, |response: Response| {
//!     // Runs on the worker pool once the peer answers or the request
//!     // expires.
//! })
//! .await?;
//! ```

pub mod config;
pub mod dictionary;
pub mod error;
pub mod link;
pub mod node;
pub mod pool;
pub mod serial;

pub use config::{LinkConfig, NodeConfig};
pub use error::{ModlinkError, Result};
pub use node::{
    CallbackContinuation, Continuation, Node, NodeBuilder, NullContinuation, Response,
};
pub use serial::SerialDriver;
