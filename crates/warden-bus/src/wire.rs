//! Typed wire values.
//!
//! Bus messages carry tagged unions. Rather than letting raw tag/variant
//! pairs leak through the codebase, every reply is decoded into [`WireValue`]
//! at the transport seam and from there into the typed data model by the
//! proxy — tags are checked once, in one place, and a mismatch anywhere in a
//! nested structure fails the whole decode.

use crate::error::BusError;

/// One value in a bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    /// Unsigned byte ("y").
    Byte(u8),
    /// Unsigned 16-bit integer ("q").
    U16(u16),
    /// Unsigned 32-bit integer ("u").
    U32(u32),
    /// Boolean ("b").
    Bool(bool),
    /// UTF-8 string ("s").
    Str(String),
    /// Byte array ("ay").
    Bytes(Vec<u8>),
    /// Homogeneous array ("a...").
    Array(Vec<WireValue>),
    /// Struct ("(...)").
    Struct(Vec<WireValue>),
    /// Variant ("v") — a value whose type is carried alongside it.
    Variant(Box<WireValue>),
}

impl WireValue {
    /// Wraps a value in a variant.
    pub fn variant(value: WireValue) -> Self {
        WireValue::Variant(Box::new(value))
    }

    /// Expects a byte; anything else is a decode error.
    pub fn expect_byte(&self) -> Result<u8, BusError> {
        match self {
            WireValue::Byte(b) => Ok(*b),
            other => Err(decode_error("byte", other)),
        }
    }

    /// Expects a u16.
    pub fn expect_u16(&self) -> Result<u16, BusError> {
        match self {
            WireValue::U16(v) => Ok(*v),
            other => Err(decode_error("u16", other)),
        }
    }

    /// Expects a u32.
    pub fn expect_u32(&self) -> Result<u32, BusError> {
        match self {
            WireValue::U32(v) => Ok(*v),
            other => Err(decode_error("u32", other)),
        }
    }

    /// Expects a string.
    pub fn expect_str(&self) -> Result<&str, BusError> {
        match self {
            WireValue::Str(s) => Ok(s),
            other => Err(decode_error("string", other)),
        }
    }

    /// Expects a byte array.
    pub fn expect_bytes(&self) -> Result<&[u8], BusError> {
        match self {
            WireValue::Bytes(b) => Ok(b),
            other => Err(decode_error("byte array", other)),
        }
    }

    /// Expects an array.
    pub fn expect_array(&self) -> Result<&[WireValue], BusError> {
        match self {
            WireValue::Array(items) => Ok(items),
            other => Err(decode_error("array", other)),
        }
    }

    /// Expects a struct with exactly `len` fields.
    pub fn expect_struct(&self, len: usize) -> Result<&[WireValue], BusError> {
        match self {
            WireValue::Struct(fields) if fields.len() == len => Ok(fields),
            WireValue::Struct(fields) => Err(BusError::Decode(format!(
                "expected struct of {len} fields, got {}",
                fields.len()
            ))),
            other => Err(decode_error("struct", other)),
        }
    }

    /// Expects a variant and unwraps it.
    pub fn expect_variant(&self) -> Result<&WireValue, BusError> {
        match self {
            WireValue::Variant(inner) => Ok(inner),
            other => Err(decode_error("variant", other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            WireValue::Byte(_) => "byte",
            WireValue::U16(_) => "u16",
            WireValue::U32(_) => "u32",
            WireValue::Bool(_) => "bool",
            WireValue::Str(_) => "string",
            WireValue::Bytes(_) => "byte array",
            WireValue::Array(_) => "array",
            WireValue::Struct(_) => "struct",
            WireValue::Variant(_) => "variant",
        }
    }
}

fn decode_error(expected: &str, got: &WireValue) -> BusError {
    BusError::Decode(format!("expected {expected}, got {}", got.kind()))
}
