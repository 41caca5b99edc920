//! Column values as they travel between the row store, the caches and
//! entity fields.
//!
//! A row image is a `Vec<SqlValue>` in declaration order; images are
//! JSON-encoded when packed into a cache layer.

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const DATETIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// A single column value.
///
/// Dates and datetimes are carried in their canonical MySQL text form so
/// that row images are byte-stable across the store and both cache layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_u64().map(|v| v != 0)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        Date::parse(self.as_str()?, DATE_FORMAT).ok()
    }

    pub fn as_datetime(&self) -> Option<PrimitiveDateTime> {
        PrimitiveDateTime::parse(self.as_str()?, DATETIME_FORMAT).ok()
    }

    pub fn from_date(date: Date) -> Self {
        match date.format(DATE_FORMAT) {
            Ok(text) => Self::Str(text),
            Err(_) => Self::Null,
        }
    }

    pub fn from_datetime(datetime: PrimitiveDateTime) -> Self {
        match datetime.format(DATETIME_FORMAT) {
            Ok(text) => Self::Str(text),
            Err(_) => Self::Null,
        }
    }

    /// Equality across numeric representations.
    ///
    /// Cache images round-trip through JSON, which erases the distinction
    /// between the signed and unsigned integer variants; diffing a decoded
    /// image against a freshly read row must not report a change for that.
    pub fn eq_loose(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.as_u64(), b.as_u64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.eq_loose(other)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::UInt(u64::from(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for SqlValue {
            fn from(v: $t) -> Self {
                Self::UInt(u64::from(v))
            }
        }
    )*};
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for SqlValue {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        }
    )*};
}

from_unsigned!(u8, u16, u32, u64);
from_signed!(i8, i16, i32, i64);

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

impl From<Date> for SqlValue {
    fn from(v: Date) -> Self {
        Self::from_date(v)
    }
}

impl From<PrimitiveDateTime> for SqlValue {
    fn from(v: PrimitiveDateTime) -> Self {
        Self::from_datetime(v)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;

    #[test]
    fn date_round_trip() {
        let value = SqlValue::from(date!(2026 - 08 - 02));
        assert_eq!(value.as_str(), Some("2026-08-02"));
        assert_eq!(value.as_date(), Some(date!(2026 - 08 - 02)));
    }

    #[test]
    fn datetime_round_trip() {
        let value = SqlValue::from(datetime!(2026-08-02 10:30:00));
        assert_eq!(value.as_str(), Some("2026-08-02 10:30:00"));
        assert_eq!(value.as_datetime(), Some(datetime!(2026-08-02 10:30:00)));
    }

    #[test]
    fn loose_equality_across_json() {
        let original = SqlValue::Int(42);
        let encoded = serde_json::to_string(&original).expect("encode");
        let decoded: SqlValue = serde_json::from_str(&encoded).expect("decode");
        // JSON decoding picks the unsigned variant for non-negative numbers.
        assert_eq!(original, decoded);
    }

    #[test]
    fn null_option() {
        let value = SqlValue::from(None::<u32>);
        assert!(value.is_null());
        assert_eq!(SqlValue::from(Some(7u32)), SqlValue::UInt(7));
    }
}
