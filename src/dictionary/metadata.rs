//! Field metadata: the externally-supplied schema the dictionary codec
//! decodes against.
//!
//! Metadata is immutable once constructed and only ever queried. Each key
//! exposes a display name, a primitive type tag, a fixed byte size (0 for
//! variable-length), a span (the number of contiguous keys governed by one
//! entry), visibility flags, an owning module name, and, for
//! dictionary-typed keys, the submetadata describing the nested record.

use std::sync::Arc;

use crate::dictionary::recursive::{RecursiveDictionary, Value};

/// Primitive type tag of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// Placeholder for absent data.
    Null = 0,
    /// Unsigned raw bytes.
    Raw = 1,
    /// Signed enumeration.
    Enum = 2,
    /// Boolean, encoded as a signed integer.
    Boolean = 3,
    /// Unsigned integer.
    Uint = 4,
    /// Signed integer.
    Int = 5,
    /// Single-precision floating point.
    Float = 6,
    /// Signed timestamp.
    Time = 7,
    /// Single UTF-8 code unit.
    Utf8Char = 8,
    /// Variable-length UTF-8 string.
    Utf8String = 9,
    /// Nested dictionary.
    Dictionary = 10,
}

impl FieldType {
    /// Map a wire code to a type tag.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Null,
            1 => Self::Raw,
            2 => Self::Enum,
            3 => Self::Boolean,
            4 => Self::Uint,
            5 => Self::Int,
            6 => Self::Float,
            7 => Self::Time,
            8 => Self::Utf8Char,
            9 => Self::Utf8String,
            10 => Self::Dictionary,
            _ => return None,
        })
    }

    /// Wire code of this type tag.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether integral values of this type sign-extend.
    pub fn is_signed(self) -> bool {
        matches!(self, Self::Enum | Self::Boolean | Self::Int | Self::Time)
    }

    /// Whether this is a fixed-width integral type the flat codec copies
    /// byte for byte.
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Raw | Self::Enum | Self::Boolean | Self::Uint | Self::Int
        )
    }
}

/// Per-key schema queried by the dictionary codec. Immutable.
pub trait Metadata: Send + Sync {
    /// Display name of the field.
    fn name(&self, key: u16) -> Option<String>;
    /// Primitive type tag.
    fn field_type(&self, key: u16) -> FieldType;
    /// Fixed byte size, 0 meaning variable-length.
    fn size(&self, key: u16) -> usize;
    /// Number of contiguous keys governed by this entry, at least 1.
    fn span(&self, key: u16) -> u32;
    /// Whether the field is debug-only.
    fn debug(&self, _key: u16) -> bool {
        false
    }
    /// Whether the field belongs to the system layer.
    fn system(&self, _key: u16) -> bool {
        false
    }
    /// Owning module name, if any.
    fn module(&self, _key: u16) -> Option<String> {
        None
    }
    /// Start of the span containing `key`.
    fn floor(&self, key: u16) -> u16;
    /// Submetadata for dictionary-typed keys.
    fn submetadata(&self, key: u16) -> Option<Arc<dyn Metadata>>;
    /// Every described key. Empty for non-enumerable schemas.
    fn keys(&self) -> Vec<u16>;
}

/// Well-known sub-keys of the field-metadata bootstrap schema.
pub mod bootstrap_key {
    pub const NAME: u16 = 0;
    pub const TYPE: u16 = 1;
    pub const SIZE: u16 = 2;
    pub const SPAN: u16 = 3;
    pub const GETTABLE: u16 = 4;
    pub const SETTABLE: u16 = 5;
    pub const IDEMPOTENT: u16 = 6;
    pub const MIN_VALUE: u16 = 7;
    pub const MAX_VALUE: u16 = 8;
    pub const UNITS: u16 = 9;
    pub const DEBUG: u16 = 10;
    pub const SYSTEM: u16 = 11;
    pub const MODULE: u16 = 12;
}

/// Hardcoded schema used to query a peer's own field metadata.
///
/// Every key is a nested dictionary following the closed 13-key field
/// schema. The schema describes itself by construction rather than by
/// metadata, breaking the self-description recursion.
pub struct BootstrapMetadata {
    fields: Arc<BootstrapFieldMetadata>,
}

impl BootstrapMetadata {
    pub fn new() -> Self {
        Self {
            fields: Arc::new(BootstrapFieldMetadata),
        }
    }
}

impl Default for BootstrapMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata for BootstrapMetadata {
    fn name(&self, key: u16) -> Option<String> {
        Some(format!("metadata_{key}"))
    }

    fn field_type(&self, _key: u16) -> FieldType {
        FieldType::Dictionary
    }

    fn size(&self, _key: u16) -> usize {
        0
    }

    fn span(&self, _key: u16) -> u32 {
        1
    }

    fn floor(&self, key: u16) -> u16 {
        key
    }

    fn submetadata(&self, _key: u16) -> Option<Arc<dyn Metadata>> {
        Some(self.fields.clone())
    }

    fn keys(&self) -> Vec<u16> {
        Vec::new() // Not enumerable.
    }
}

/// The closed 13-key schema of a single field's metadata record.
struct BootstrapFieldMetadata;

impl Metadata for BootstrapFieldMetadata {
    fn name(&self, key: u16) -> Option<String> {
        use bootstrap_key::*;
        let name = match key {
            NAME => "name",
            TYPE => "type",
            SIZE => "size",
            SPAN => "span",
            GETTABLE => "gettable",
            SETTABLE => "settable",
            IDEMPOTENT => "idempotent",
            MIN_VALUE => "min_value",
            MAX_VALUE => "max_value",
            UNITS => "units",
            DEBUG => "debug",
            SYSTEM => "system",
            MODULE => "module",
            _ => return None,
        };
        Some(name.to_string())
    }

    fn field_type(&self, key: u16) -> FieldType {
        use bootstrap_key::*;
        match key {
            NAME | UNITS | MODULE => FieldType::Utf8String,
            TYPE | SIZE | SPAN | MIN_VALUE | MAX_VALUE => FieldType::Uint,
            GETTABLE | SETTABLE | IDEMPOTENT | DEBUG | SYSTEM => FieldType::Boolean,
            _ => FieldType::Null,
        }
    }

    fn size(&self, key: u16) -> usize {
        use bootstrap_key::*;
        match key {
            TYPE | SIZE | GETTABLE | SETTABLE | IDEMPOTENT | DEBUG | SYSTEM => 1,
            SPAN => 4,
            // NAME, MIN_VALUE, MAX_VALUE, UNITS, MODULE are variable.
            _ => 0,
        }
    }

    fn span(&self, _key: u16) -> u32 {
        1
    }

    fn floor(&self, key: u16) -> u16 {
        key
    }

    fn submetadata(&self, _key: u16) -> Option<Arc<dyn Metadata>> {
        None
    }

    fn keys(&self) -> Vec<u16> {
        Vec::new() // Not enumerable.
    }
}

/// Metadata backed by a peer's accumulated field-metadata query results.
///
/// The dictionary maps each field key to a sub-dictionary following the
/// bootstrap schema. Non-mandatory flags default to false when absent.
pub struct QueriedMetadata {
    dictionary: RecursiveDictionary,
}

impl QueriedMetadata {
    pub fn new(dictionary: RecursiveDictionary) -> Self {
        Self { dictionary }
    }

    fn field(&self, key: u16, subkey: u16) -> Option<&Value> {
        match self.dictionary.get(key) {
            Some(Value::Dict(sub)) => sub.get(subkey),
            _ => None,
        }
    }

    fn integer(&self, key: u16, subkey: u16) -> Option<i64> {
        match self.field(key, subkey) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

impl Metadata for QueriedMetadata {
    fn name(&self, key: u16) -> Option<String> {
        match self.field(key, bootstrap_key::NAME) {
            Some(Value::Str(name)) => Some(name.clone()),
            _ => None,
        }
    }

    fn field_type(&self, key: u16) -> FieldType {
        self.integer(key, bootstrap_key::TYPE)
            .and_then(|code| FieldType::from_code(code as u8))
            .unwrap_or(FieldType::Null)
    }

    fn size(&self, key: u16) -> usize {
        self.integer(key, bootstrap_key::SIZE).unwrap_or(0) as usize
    }

    fn span(&self, key: u16) -> u32 {
        self.integer(key, bootstrap_key::SPAN).unwrap_or(1) as u32
    }

    fn debug(&self, key: u16) -> bool {
        matches!(self.field(key, bootstrap_key::DEBUG), Some(Value::Bool(true)))
    }

    fn system(&self, key: u16) -> bool {
        matches!(
            self.field(key, bootstrap_key::SYSTEM),
            Some(Value::Bool(true))
        )
    }

    fn module(&self, key: u16) -> Option<String> {
        match self.field(key, bootstrap_key::MODULE) {
            Some(Value::Str(module)) => Some(module.clone()),
            _ => None,
        }
    }

    fn floor(&self, key: u16) -> u16 {
        self.dictionary.floor(key).unwrap_or(key)
    }

    fn submetadata(&self, _key: u16) -> Option<Arc<dyn Metadata>> {
        None // The bootstrap schema has no metadata-of-metadata key.
    }

    fn keys(&self) -> Vec<u16> {
        self.dictionary.keys()
    }
}
