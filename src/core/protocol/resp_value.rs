// src/core/protocol/resp_value.rs

//! Defines the application-facing value type produced by reply transforms.

use super::RespFrame;
use crate::core::errors::{ClientError, ServerError};
use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::hash::Hash;

/// `RespValue` is what a resolved command hands back to the caller.
///
/// It is derived from a `RespFrame` by the command's reply transform: plain
/// frames map one-to-one, while transforms can produce richer shapes such as
/// ordered maps (`HGETALL`), doubles (`ZSCORE`) or booleans (`SISMEMBER`).
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Status(String),
    Bulk(Bytes),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Array(Vec<RespValue>),
    Map(IndexMap<Bytes, RespValue>),
    Nil,
    /// An error nested inside an aggregate reply. Top-level errors are never values.
    Error(ServerError),
}

impl From<RespFrame> for RespValue {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::SimpleString(s) => RespValue::Status(s),
            RespFrame::Error(e) => RespValue::Error(e),
            RespFrame::Integer(i) => RespValue::Integer(i),
            RespFrame::BulkString(b) => RespValue::Bulk(b),
            RespFrame::Null | RespFrame::NullArray => RespValue::Nil,
            RespFrame::Array(arr) | RespFrame::Push(arr) => {
                RespValue::Array(arr.into_iter().map(Into::into).collect())
            }
        }
    }
}

impl RespValue {
    /// Returns the value as UTF-8 text if it is a status or bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Status(s) => Some(s),
            RespValue::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Nil)
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        RespValue::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        RespValue::Integer(i)
    }
}

/// Conversion from a reply value into a concrete Rust type.
pub trait FromRespValue: Sized {
    fn from_resp(value: RespValue) -> Result<Self, ClientError>;
}

fn unexpected<T>(expected: &str, value: &RespValue) -> Result<T, ClientError> {
    Err(ClientError::UnexpectedReply(format!(
        "expected {expected}, got {value:?}"
    )))
}

impl FromRespValue for RespValue {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        Ok(value)
    }
}

impl FromRespValue for () {
    fn from_resp(_: RespValue) -> Result<Self, ClientError> {
        Ok(())
    }
}

impl FromRespValue for Bytes {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Bulk(b) => Ok(b),
            RespValue::Status(s) => Ok(Bytes::from(s)),
            RespValue::Integer(i) => Ok(Bytes::from(i.to_string())),
            other => unexpected("bytes", &other),
        }
    }
}

impl FromRespValue for String {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Status(s) => Ok(s),
            RespValue::Bulk(b) => Ok(String::from_utf8(b.to_vec())
                .map_err(|e| ClientError::UnexpectedReply(format!("invalid UTF-8: {e}")))?),
            RespValue::Integer(i) => Ok(i.to_string()),
            RespValue::Double(d) => Ok(d.to_string()),
            other => unexpected("string", &other),
        }
    }
}

impl FromRespValue for i64 {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Integer(i) => Ok(i),
            RespValue::Boolean(b) => Ok(i64::from(b)),
            ref v @ (RespValue::Bulk(_) | RespValue::Status(_)) => match v.as_str() {
                Some(s) => Ok(s.parse()?),
                None => unexpected("integer", v),
            },
            other => unexpected("integer", &other),
        }
    }
}

impl FromRespValue for u64 {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        let i = i64::from_resp(value)?;
        u64::try_from(i).map_err(|_| ClientError::UnexpectedReply(format!("negative value {i}")))
    }
}

impl FromRespValue for usize {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        let i = i64::from_resp(value)?;
        usize::try_from(i)
            .map_err(|_| ClientError::UnexpectedReply(format!("negative value {i}")))
    }
}

impl FromRespValue for f64 {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Double(d) => Ok(d),
            RespValue::Integer(i) => Ok(i as f64),
            ref v @ (RespValue::Bulk(_) | RespValue::Status(_)) => match v.as_str() {
                Some(s) => Ok(s.parse()?),
                None => unexpected("float", v),
            },
            other => unexpected("float", &other),
        }
    }
}

impl FromRespValue for bool {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Boolean(b) => Ok(b),
            RespValue::Integer(i) => Ok(i != 0),
            RespValue::Status(s) => Ok(s == "OK"),
            RespValue::Nil => Ok(false),
            other => unexpected("boolean", &other),
        }
    }
}

impl<T: FromRespValue> FromRespValue for Option<T> {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Nil => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

impl<T: FromRespValue> FromRespValue for Vec<T> {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
            RespValue::Nil => Ok(Vec::new()),
            other => unexpected("array", &other),
        }
    }
}

/// Pairs of a map or a flat `[k1, v1, k2, v2, ...]` array.
fn into_pairs(value: RespValue) -> Result<Vec<(RespValue, RespValue)>, ClientError> {
    match value {
        RespValue::Map(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (RespValue::Bulk(k), v))
            .collect()),
        RespValue::Array(items) if items.len() % 2 == 0 => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok(pairs)
        }
        RespValue::Nil => Ok(Vec::new()),
        other => unexpected("map", &other),
    }
}

impl<K, V> FromRespValue for HashMap<K, V>
where
    K: FromRespValue + Eq + Hash,
    V: FromRespValue,
{
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        into_pairs(value)?
            .into_iter()
            .map(|(k, v)| Ok((K::from_resp(k)?, V::from_resp(v)?)))
            .collect()
    }
}

impl<K, V> FromRespValue for IndexMap<K, V>
where
    K: FromRespValue + Eq + Hash,
    V: FromRespValue,
{
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        into_pairs(value)?
            .into_iter()
            .map(|(k, v)| Ok((K::from_resp(k)?, V::from_resp(v)?)))
            .collect()
    }
}

impl<A: FromRespValue, B: FromRespValue> FromRespValue for (A, B) {
    fn from_resp(value: RespValue) -> Result<Self, ClientError> {
        match value {
            RespValue::Array(items) => match <[RespValue; 2]>::try_from(items) {
                Ok([a, b]) => Ok((A::from_resp(a)?, B::from_resp(b)?)),
                Err(items) => unexpected("two-element array", &RespValue::Array(items)),
            },
            other => unexpected("two-element array", &other),
        }
    }
}
