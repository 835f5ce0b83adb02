//! Recursive dictionary: an ordered sparse key→value record decoded
//! against metadata, where values may themselves be dictionaries.
//!
//! Used to interpret structured query results, most prominently the
//! paginated field-metadata query whose pages are accumulated with
//! [`RecursiveDictionary::merge`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dictionary::metadata::{FieldType, Metadata};
use crate::error::{ModlinkError, Result};

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
    Dict(RecursiveDictionary),
}

/// Immutable ordered mapping from key to [`Value`], tied to the metadata
/// it was decoded against.
#[derive(Clone)]
pub struct RecursiveDictionary {
    metadata: Arc<dyn Metadata>,
    fields: BTreeMap<u16, Value>,
}

impl RecursiveDictionary {
    /// Look up a value.
    pub fn get(&self, key: u16) -> Option<&Value> {
        self.fields.get(&key)
    }

    /// All populated keys in ascending order.
    pub fn keys(&self) -> Vec<u16> {
        self.fields.keys().copied().collect()
    }

    /// The highest populated key.
    pub fn last_key(&self) -> Option<u16> {
        self.fields.keys().next_back().copied()
    }

    /// The highest populated key at or below `key`.
    pub fn floor(&self, key: u16) -> Option<u16> {
        self.fields.range(..=key).next_back().map(|(&k, _)| k)
    }

    /// Number of populated keys.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the dictionary holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decode a dictionary from `buffer` against `metadata`.
    pub fn deserialise(buffer: &[u8], metadata: Arc<dyn Metadata>) -> Result<Self> {
        let mut position = 0;
        let dictionary = deserialise_at(buffer, &mut position, buffer.len(), metadata)?;
        if position != buffer.len() {
            return Err(ModlinkError::Codec("buffer overflow".to_string()));
        }
        Ok(dictionary)
    }

    /// Recursively merge `other` into this dictionary, with `other` taking
    /// precedence: sub-dictionaries found at the same key in both are
    /// merged, any other value collision is resolved by replacement.
    pub fn merge(&self, other: &RecursiveDictionary) -> Result<Self> {
        if !Arc::ptr_eq(&self.metadata, &other.metadata) {
            return Err(ModlinkError::Codec("incompatible metadata".to_string()));
        }
        let mut fields = self.fields.clone();
        for (&key, value) in &other.fields {
            let merged = match (fields.get(&key), value) {
                (Some(Value::Dict(existing)), Value::Dict(incoming)) => {
                    Value::Dict(existing.merge(incoming)?)
                }
                _ => value.clone(),
            };
            fields.insert(key, merged);
        }
        Ok(Self {
            metadata: self.metadata.clone(),
            fields,
        })
    }
}

impl fmt::Debug for RecursiveDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

impl PartialEq for RecursiveDictionary {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

fn read_byte(buffer: &[u8], position: &mut usize, limit: usize) -> Result<u8> {
    if *position >= limit {
        return Err(ModlinkError::Codec("truncated dictionary".to_string()));
    }
    let value = buffer[*position];
    *position += 1;
    Ok(value)
}

/// Parse a self-delimiting base-128 size prefix (7 bits per byte,
/// little-endian, continuation in the high bit).
fn parse_size(buffer: &[u8], position: &mut usize, limit: usize) -> Result<usize> {
    let mut size = 0usize;
    for counter in 0.. {
        let value = read_byte(buffer, position, limit)?;
        size |= ((value & 0x7F) as usize) << (counter * 7);
        if value < 128 {
            break;
        }
    }
    Ok(size)
}

fn read_integer(
    buffer: &[u8],
    position: &mut usize,
    limit: usize,
    size: usize,
    signed: bool,
) -> Result<i64> {
    if size > 8 {
        return Err(ModlinkError::Codec("unsupported integer size".to_string()));
    }
    let mut value = 0i64;
    for shift in 0..size {
        value |= (read_byte(buffer, position, limit)? as i64) << (8 * shift);
    }
    if signed && size > 0 && size < 8 {
        let bound = 1i64 << (8 * size - 1);
        if value >= bound {
            value -= 2 * bound;
        }
    }
    Ok(value)
}

fn deserialise_at(
    buffer: &[u8],
    position: &mut usize,
    limit: usize,
    metadata: Arc<dyn Metadata>,
) -> Result<RecursiveDictionary> {
    let mut fields = BTreeMap::new();
    let mut key_accumulator = 0u32;
    while *position < limit {
        let command = read_byte(buffer, position, limit)?;
        let width = (command & 0x0F) as usize;
        if width > 4 {
            return Err(ModlinkError::Codec("unsupported width".to_string()));
        }
        let discriminator = (command >> 4) & 0x0F;
        let mut parameter = 0u32;
        for index in 0..width {
            parameter |= (read_byte(buffer, position, limit)? as u32) << (8 * index);
        }
        match discriminator {
            0 => {
                // A run of `parameter` contiguous keys follows; it may
                // silently span several differently-typed metadata blocks.
                let mut countdown = parameter;
                while countdown > 0 {
                    let key = u16::try_from(key_accumulator)
                        .map_err(|_| ModlinkError::Codec("key out of range".to_string()))?;
                    let floor = metadata.floor(key) as u32;
                    let span = metadata.span(floor as u16);
                    let field_type = metadata.field_type(floor as u16);
                    let size = metadata.size(floor as u16);
                    if floor + span <= key_accumulator {
                        return Err(ModlinkError::Codec(
                            "metadata span does not cover key".to_string(),
                        ));
                    }
                    let block_length = countdown.min(floor + span - key_accumulator);
                    match field_type {
                        FieldType::Null if size > 0 => {
                            for index in 0..block_length {
                                fields.insert((key_accumulator + index) as u16, Value::Null);
                                *position += size; // Skip over NULL data.
                            }
                            if *position > limit {
                                return Err(ModlinkError::Codec(
                                    "truncated dictionary".to_string(),
                                ));
                            }
                        }
                        _ if field_type.code() < 6 => {
                            // Fixed- or variable-size integral types.
                            let signed = field_type.is_signed();
                            for index in 0..block_length {
                                let this_size = if size == 0 {
                                    parse_size(buffer, position, limit)?
                                } else {
                                    size
                                };
                                let value =
                                    read_integer(buffer, position, limit, this_size, signed)?;
                                fields.insert(
                                    (key_accumulator + index) as u16,
                                    if field_type == FieldType::Boolean {
                                        Value::Bool(value != 0)
                                    } else {
                                        Value::Int(value)
                                    },
                                );
                            }
                        }
                        FieldType::Float if size == 4 => {
                            for index in 0..block_length {
                                let raw = read_integer(buffer, position, limit, 4, false)?;
                                fields.insert(
                                    (key_accumulator + index) as u16,
                                    Value::Float(f32::from_bits(raw as u32)),
                                );
                            }
                        }
                        FieldType::Utf8String if size == 0 => {
                            for index in 0..block_length {
                                let string_size = parse_size(buffer, position, limit)?;
                                if *position + string_size > limit {
                                    return Err(ModlinkError::Codec(
                                        "truncated dictionary".to_string(),
                                    ));
                                }
                                let string = String::from_utf8_lossy(
                                    &buffer[*position..*position + string_size],
                                )
                                .into_owned();
                                *position += string_size;
                                fields
                                    .insert((key_accumulator + index) as u16, Value::Str(string));
                            }
                        }
                        FieldType::Dictionary if size == 0 => {
                            let submetadata =
                                metadata.submetadata(floor as u16).ok_or_else(|| {
                                    ModlinkError::Codec("missing submetadata".to_string())
                                })?;
                            for index in 0..block_length {
                                let sub_size = parse_size(buffer, position, limit)?;
                                let sub_limit = *position + sub_size;
                                if sub_limit > limit {
                                    return Err(ModlinkError::Codec(
                                        "truncated dictionary".to_string(),
                                    ));
                                }
                                let subdictionary = deserialise_at(
                                    buffer,
                                    position,
                                    sub_limit,
                                    submetadata.clone(),
                                )?;
                                if *position != sub_limit {
                                    return Err(ModlinkError::Codec(
                                        "sub-dictionary overflow".to_string(),
                                    ));
                                }
                                fields.insert(
                                    (key_accumulator + index) as u16,
                                    Value::Dict(subdictionary),
                                );
                            }
                        }
                        _ => {
                            return Err(ModlinkError::Codec("unsupported type".to_string()));
                        }
                    }
                    countdown -= block_length;
                    key_accumulator += block_length;
                }
            }
            1 => {
                key_accumulator += parameter;
            }
            _ => {
                return Err(ModlinkError::Codec(
                    "invalid dictionary command".to_string(),
                ));
            }
        }
    }
    Ok(RecursiveDictionary { metadata, fields })
}
