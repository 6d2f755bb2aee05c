// src/core/commands/transform.rs

//! Reply transforms: the per-command conversion from a raw `RespFrame` into the
//! `RespValue` handed to the caller.

use crate::core::errors::ClientError;
use crate::core::protocol::{RespFrame, RespValue};
use bytes::Bytes;
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyTransform {
    /// Frames map one-to-one onto values.
    #[default]
    Identity,
    /// A flat `[field, value, ...]` array becomes an ordered map.
    Map,
    /// A bulk string is parsed as a float; null stays nil.
    Double,
    /// `0`/`1` integers become booleans.
    Boolean,
    /// Simple or bulk strings are returned as status text.
    Status,
}

impl ReplyTransform {
    /// Applies the transform. A top-level error frame always becomes `Err`.
    pub fn apply(self, frame: RespFrame) -> Result<RespValue, ClientError> {
        let frame = frame.into_result()?;
        match self {
            ReplyTransform::Identity => Ok(frame.into()),
            ReplyTransform::Map => to_map(frame),
            ReplyTransform::Double => to_double(frame),
            ReplyTransform::Boolean => to_boolean(frame),
            ReplyTransform::Status => match frame {
                RespFrame::SimpleString(s) => Ok(RespValue::Status(s)),
                RespFrame::BulkString(b) => Ok(RespValue::Status(
                    String::from_utf8_lossy(&b).into_owned(),
                )),
                other => Ok(other.into()),
            },
        }
    }
}

fn to_map(frame: RespFrame) -> Result<RespValue, ClientError> {
    match frame {
        RespFrame::Array(items) => {
            if items.len() % 2 != 0 {
                return Err(ClientError::UnexpectedReply(format!(
                    "odd number of elements ({}) in map reply",
                    items.len()
                )));
            }
            let mut map = IndexMap::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                let key = match k {
                    RespFrame::BulkString(b) => b,
                    RespFrame::SimpleString(s) => Bytes::from(s),
                    RespFrame::Integer(i) => Bytes::from(i.to_string()),
                    other => {
                        return Err(ClientError::UnexpectedReply(format!(
                            "map key must be a string, got {other:?}"
                        )));
                    }
                };
                map.insert(key, v.into());
            }
            Ok(RespValue::Map(map))
        }
        RespFrame::Null | RespFrame::NullArray => Ok(RespValue::Map(IndexMap::new())),
        other => Err(ClientError::UnexpectedReply(format!(
            "expected array for map reply, got {other:?}"
        ))),
    }
}

fn to_double(frame: RespFrame) -> Result<RespValue, ClientError> {
    match frame {
        RespFrame::Null | RespFrame::NullArray => Ok(RespValue::Nil),
        RespFrame::Integer(i) => Ok(RespValue::Double(i as f64)),
        other => match other.as_bytes() {
            Some(raw) => Ok(RespValue::Double(std::str::from_utf8(raw)?.parse()?)),
            None => Err(ClientError::UnexpectedReply(format!(
                "expected float reply, got {other:?}"
            ))),
        },
    }
}

fn to_boolean(frame: RespFrame) -> Result<RespValue, ClientError> {
    match frame {
        RespFrame::Integer(i) => Ok(RespValue::Boolean(i != 0)),
        RespFrame::SimpleString(s) => Ok(RespValue::Boolean(s == "OK")),
        RespFrame::Null | RespFrame::NullArray => Ok(RespValue::Boolean(false)),
        other => Ok(other.into()),
    }
}
