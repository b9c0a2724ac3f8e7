//! The closed scalar value type and timestamp/value pairs.
//!
//! Per the design note on dynamic dispatch (§9), the set of scalar types is
//! closed: callers match once per chunk to pick a decode/encode path, never
//! once per point.

use super::timestamp::Timestamp;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Data type tag stored in chunk metadata, one byte on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Int32 = 0,
    Int64 = 1,
    Float32 = 2,
    Float64 = 3,
    Bool = 4,
    Text = 5,
}

impl DataType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => DataType::Int32,
            1 => DataType::Int64,
            2 => DataType::Float32,
            3 => DataType::Float64,
            4 => DataType::Bool,
            5 => DataType::Text,
            other => return Err(Error::CorruptInput(format!("unknown data type tag {other}"))),
        })
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

/// One scalar value of a fixed, closed set of wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Text(String),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float32(_) => DataType::Float32,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Text(_) => DataType::Text,
        }
    }

    /// Encode into `buf` using the type dispatched once by the caller
    /// (typically once per chunk via `DataType`), not once per value.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            ScalarValue::Int32(v) => buf.put_i32(*v),
            ScalarValue::Int64(v) => buf.put_i64(*v),
            ScalarValue::Float32(v) => buf.put_f32(*v),
            ScalarValue::Float64(v) => buf.put_f64(*v),
            ScalarValue::Bool(v) => buf.put_u8(if *v { 1 } else { 0 }),
            ScalarValue::Text(v) => {
                buf.put_u32(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
        }
    }

    pub fn decode(data_type: DataType, buf: &mut impl Buf) -> Result<Self> {
        Ok(match data_type {
            DataType::Int32 => ScalarValue::Int32(buf.get_i32()),
            DataType::Int64 => ScalarValue::Int64(buf.get_i64()),
            DataType::Float32 => ScalarValue::Float32(buf.get_f32()),
            DataType::Float64 => ScalarValue::Float64(buf.get_f64()),
            DataType::Bool => ScalarValue::Bool(buf.get_u8() != 0),
            DataType::Text => {
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::CorruptInput("truncated text value".to_string()));
                }
                let mut bytes = vec![0u8; len];
                buf.copy_to_slice(&mut bytes);
                ScalarValue::Text(String::from_utf8(bytes).map_err(|e| {
                    Error::CorruptInput(format!("invalid utf8 in text value: {e}"))
                })?)
            }
        })
    }
}

/// A single `(timestamp, value)` sample. `value == None` represents a point
/// that has been elided by a tombstone; it is never written back out, but
/// is a useful intermediate state while merging.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: Option<ScalarValue>,
}

impl TimeValuePair {
    pub fn new(timestamp: Timestamp, value: ScalarValue) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    pub fn deleted(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }
}
