//! Tagged binary value codec.
//!
//! Cached JSON responses and the persisted settings file store values in
//! this form: a one-byte type tag followed by a little-endian payload.
//! Float64 payloads are padded to an 8-byte boundary measured from the
//! start of the encoded buffer, so existing files decode bit-exactly.

use crate::codec::buffer::{BufferReader, BufferWriter};
use crate::error::{Error, Result};

/// Marker prefix of a data file that holds a binary-encoded JSON value
/// (`"json"` in little-endian byte order).
pub const JSON_MAGIC: u32 = 0x6E6F_736A;

const TAG_NULL: u8 = 0x00;
const TAG_TRUE: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_INT32: u8 = 0x03;
const TAG_INT64: u8 = 0x04;
const TAG_FLOAT64: u8 = 0x06;
const TAG_STRING: u8 = 0x07;
const TAG_BYTES: u8 = 0x08;
const TAG_ARRAY: u8 = 0x0C;
const TAG_MAP: u8 = 0x0D;

/// A dynamically typed value, covering everything JSON can express plus
/// raw byte buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Key order is preserved; keys may be arbitrary values.
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn encode_to(&self, writer: &mut BufferWriter) {
        match self {
            Value::Null => writer.put_u8(TAG_NULL),
            Value::Bool(true) => writer.put_u8(TAG_TRUE),
            Value::Bool(false) => writer.put_u8(TAG_FALSE),
            Value::Int32(v) => {
                writer.put_u8(TAG_INT32);
                writer.put_i32(*v);
            }
            Value::Int64(v) => {
                writer.put_u8(TAG_INT64);
                writer.put_i64(*v);
            }
            Value::Float64(v) => {
                writer.put_u8(TAG_FLOAT64);
                writer.align(8);
                writer.put_f64(*v);
            }
            Value::String(v) => {
                writer.put_u8(TAG_STRING);
                writer.put_str(v);
            }
            Value::Bytes(v) => {
                writer.put_u8(TAG_BYTES);
                writer.put_size(v.len() as u32);
                writer.put_bytes(v);
            }
            Value::Array(items) => {
                writer.put_u8(TAG_ARRAY);
                writer.put_size(items.len() as u32);
                for item in items {
                    item.encode_to(writer);
                }
            }
            Value::Map(entries) => {
                writer.put_u8(TAG_MAP);
                writer.put_size(entries.len() as u32);
                for (key, value) in entries {
                    key.encode_to(writer);
                    value.encode_to(writer);
                }
            }
        }
    }

    pub fn decode_from(reader: &mut BufferReader) -> Result<Value> {
        match reader.get_u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_INT32 => Ok(Value::Int32(reader.get_i32()?)),
            TAG_INT64 => Ok(Value::Int64(reader.get_i64()?)),
            TAG_FLOAT64 => {
                reader.align(8)?;
                Ok(Value::Float64(reader.get_f64()?))
            }
            TAG_STRING => Ok(Value::String(reader.get_str()?.to_string())),
            TAG_BYTES => {
                let len = reader.get_size()? as usize;
                Ok(Value::Bytes(reader.get_bytes(len)?.to_vec()))
            }
            TAG_ARRAY => {
                let len = reader.get_size()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Value::decode_from(reader)?);
                }
                Ok(Value::Array(items))
            }
            TAG_MAP => {
                let len = reader.get_size()? as usize;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = Value::decode_from(reader)?;
                    let value = Value::decode_from(reader)?;
                    entries.push((key, value));
                }
                Ok(Value::Map(entries))
            }
            _ => Err(Error::MalformedSidecar("unknown value tag")),
        }
    }

    /// Converts a parsed textual JSON value. Integral numbers become
    /// `Int32` when they fit, `Int64` otherwise; all other numbers become
    /// `Float64`.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(*v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    if let Ok(v) = i32::try_from(v) {
                        Value::Int32(v)
                    } else {
                        Value::Int64(v)
                    }
                } else {
                    Value::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(v) => Value::String(v.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to a textual JSON value. Byte buffers become arrays
    /// of numbers and non-string map keys are rendered through their JSON
    /// form, mirroring how the widget layer consumed these values.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int32(v) => serde_json::Value::from(*v),
            Value::Int64(v) => serde_json::Value::from(*v),
            Value::Float64(v) => {
                serde_json::Number::from_f64(*v).map_or(serde_json::Value::Null, Into::into)
            }
            Value::String(v) => serde_json::Value::String(v.clone()),
            Value::Bytes(v) => serde_json::Value::Array(
                v.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::String(s) => s.clone(),
                            other => other.to_json().to_string(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
        }
    }
}
