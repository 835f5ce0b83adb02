//! Self-describing dictionary codec.
//!
//! Almost all bus traffic carries sparse key→value records compressed
//! against externally-supplied per-field metadata:
//!
//! - [`flat`] — scalar-only records over caller-provided key/value arrays,
//!   the allocation-free path used for field reads and writes.
//! - [`recursive`] — records whose values may be nested dictionaries,
//!   used for structured queries such as the paginated metadata exchange.
//! - [`metadata`] — the schema interface both codecs decode against, plus
//!   the hardcoded bootstrap schema and the queried-metadata adapter.

pub mod flat;
pub mod metadata;
pub mod recursive;

pub use metadata::{BootstrapMetadata, FieldType, Metadata, QueriedMetadata};
pub use recursive::{RecursiveDictionary, Value};
