//! Flat dictionary codec: sparse key→value records with scalar values
//! only, encoded as alternating skip and run commands.
//!
//! Each command is one byte whose low nibble is the byte width (0-4) of a
//! little-endian parameter that follows, and whose next nibble
//! discriminates skip (advance the key cursor) from run (the next
//! `parameter` keys carry contiguous values). Value encoding within a run
//! is resolved per key from metadata at the key's span floor; a run
//! silently segments at span boundaries.
//!
//! The encoder requires its key array to be sorted ascending; violations
//! are caller-contract errors, not recoverable conditions.

use crate::dictionary::metadata::{FieldType, Metadata};
use crate::error::{ModlinkError, Result};

fn push(buffer: &mut [u8], cursor: &mut usize, value: u8) -> Result<()> {
    if *cursor >= buffer.len() {
        return Err(ModlinkError::Codec("output buffer overflow".to_string()));
    }
    buffer[*cursor] = value;
    *cursor += 1;
    Ok(())
}

fn parameter_width(value: u32) -> usize {
    4 - value.leading_zeros() as usize / 8
}

fn write_command(
    buffer: &mut [u8],
    cursor: &mut usize,
    discriminator: u8,
    parameter: u32,
) -> Result<()> {
    let width = parameter_width(parameter);
    push(buffer, cursor, (discriminator << 4) | width as u8)?;
    for index in 0..width {
        push(buffer, cursor, (parameter >> (8 * index)) as u8)?;
    }
    Ok(())
}

/// Serialise sorted `keys` and their `values` into `buffer` starting at
/// `cursor`, returning the cursor past the encoded record.
pub fn serialise(
    buffer: &mut [u8],
    cursor: usize,
    keys: &[u16],
    values: &[i32],
    metadata: &dyn Metadata,
) -> Result<usize> {
    if keys.len() != values.len() {
        return Err(ModlinkError::Codec("mismatched arrays".to_string()));
    }
    let mut cursor = cursor;
    let length = keys.len();
    let mut key_accumulator = 0u32;
    let mut fields_remaining = length;
    while fields_remaining > 0 {
        // (1) Delimit the run of contiguous keys.
        let run_start = length - fields_remaining;
        let mut scan_pointer = run_start;
        loop {
            scan_pointer += 1;
            if scan_pointer >= length || keys[scan_pointer] != keys[scan_pointer - 1] + 1 {
                break;
            }
        }
        let run_end = scan_pointer;
        // (2) Insert the skip command (the only legitimate zero skip is at
        // the start of the dictionary).
        let skip_value = keys[run_start] as i64 - key_accumulator as i64;
        if skip_value < 0 {
            return Err(ModlinkError::Codec("unordered fields".to_string()));
        } else if skip_value == 0 && fields_remaining != length {
            return Err(ModlinkError::Codec("delimitation error".to_string()));
        } else if skip_value > 0 {
            write_command(buffer, &mut cursor, 0x1, skip_value as u32)?;
        }
        key_accumulator += skip_value as u32;
        // (3) Insert the run length.
        let run_length = run_end - run_start;
        if run_length == 0 {
            return Err(ModlinkError::Codec("delimitation error".to_string()));
        }
        write_command(buffer, &mut cursor, 0x0, run_length as u32)?;
        // (4) Serialise the run, block by homogeneously-typed block.
        let mut run_countdown = run_length;
        while run_countdown > 0 {
            let block_start = run_end - run_countdown;
            let first_key = keys[block_start];
            let floor = metadata.floor(first_key);
            let span = metadata.span(floor);
            let field_type = metadata.field_type(floor);
            let size = metadata.size(floor);
            if floor as u32 + span <= first_key as u32 {
                return Err(ModlinkError::Codec(
                    "metadata span does not cover key".to_string(),
                ));
            }
            let block_length =
                run_countdown.min((floor as u32 + span - first_key as u32) as usize);
            if field_type.is_integral() && size > 0 {
                for &value in &values[block_start..block_start + block_length] {
                    for shift in 0..size {
                        push(buffer, &mut cursor, (value >> (8 * shift)) as u8)?;
                    }
                }
            } else if field_type == FieldType::Utf8Char && size == 1 {
                for &value in &values[block_start..block_start + block_length] {
                    push(buffer, &mut cursor, value as u8)?;
                }
            } else {
                return Err(ModlinkError::Codec("unsupported type".to_string()));
            }
            run_countdown -= block_length;
            key_accumulator += block_length as u32;
            fields_remaining -= block_length;
        }
    }
    Ok(cursor)
}

/// Deserialise a record from `buffer` into the caller-provided `keys` and
/// `values` arrays starting at `cursor`, returning the cursor past the
/// decoded fields.
///
/// Floating-point fields are rounded to the nearest integer to fit the
/// `i32` value lane; callers needing fractional precision use the
/// recursive codec instead. Character runs are skipped.
pub fn deserialise(
    buffer: &[u8],
    keys: &mut [u16],
    values: &mut [i32],
    cursor: usize,
    metadata: &dyn Metadata,
) -> Result<usize> {
    if keys.len() != values.len() {
        return Err(ModlinkError::Codec("mismatched arrays".to_string()));
    }
    let mut cursor = cursor;
    let mut offset = 0usize;
    let limit = buffer.len();
    let mut key_accumulator = 0u32;
    let read = |offset: &mut usize| -> Result<u8> {
        if *offset >= limit {
            return Err(ModlinkError::Codec("truncated dictionary".to_string()));
        }
        let value = buffer[*offset];
        *offset += 1;
        Ok(value)
    };
    while offset < limit {
        let command = read(&mut offset)?;
        let width = (command & 0x0F) as usize;
        if width > 4 {
            return Err(ModlinkError::Codec("unsupported width".to_string()));
        }
        let discriminator = (command >> 4) & 0x0F;
        let mut parameter = 0u32;
        for index in 0..width {
            parameter |= (read(&mut offset)? as u32) << (8 * index);
        }
        match discriminator {
            0 => {
                let mut run_countdown = parameter;
                while run_countdown > 0 {
                    let key = u16::try_from(key_accumulator)
                        .map_err(|_| ModlinkError::Codec("key out of range".to_string()))?;
                    let floor = metadata.floor(key);
                    let span = metadata.span(floor);
                    let field_type = metadata.field_type(floor);
                    let size = metadata.size(floor);
                    if floor as u32 + span <= key_accumulator {
                        return Err(ModlinkError::Codec(
                            "metadata span does not cover key".to_string(),
                        ));
                    }
                    let block_length =
                        run_countdown.min(floor as u32 + span - key_accumulator);
                    if field_type.is_integral() && size > 0 {
                        let sign_extension_bound = 1i64 << (8 * size - 1);
                        for index in 0..block_length {
                            let mut value = 0i64;
                            for shift in 0..size {
                                value |= (read(&mut offset)? as i64) << (8 * shift);
                            }
                            if field_type.is_signed() && value >= sign_extension_bound {
                                value -= 2 * sign_extension_bound;
                            }
                            if cursor >= keys.len() {
                                return Err(ModlinkError::Codec(
                                    "result arrays too small".to_string(),
                                ));
                            }
                            keys[cursor] = (key_accumulator + index) as u16;
                            values[cursor] = value as i32;
                            cursor += 1;
                        }
                    } else if field_type == FieldType::Float && size == 4 {
                        for index in 0..block_length {
                            let mut raw = 0u32;
                            for shift in 0..size {
                                raw |= (read(&mut offset)? as u32) << (8 * shift);
                            }
                            // Lossy by contract: the flat value lane is
                            // integral, fractional readings round here.
                            let value = f32::from_bits(raw);
                            if cursor >= keys.len() {
                                return Err(ModlinkError::Codec(
                                    "result arrays too small".to_string(),
                                ));
                            }
                            keys[cursor] = (key_accumulator + index) as u16;
                            values[cursor] = value.round() as i32;
                            cursor += 1;
                        }
                    } else if field_type == FieldType::Utf8Char && size == 1 {
                        // Character runs carry no scalar values.
                        offset += block_length as usize;
                        if offset > limit {
                            return Err(ModlinkError::Codec(
                                "truncated dictionary".to_string(),
                            ));
                        }
                    } else {
                        return Err(ModlinkError::Codec("unsupported type".to_string()));
                    }
                    run_countdown -= block_length;
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
    Ok(cursor)
}
