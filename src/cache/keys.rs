//! Cache key schemes.
//!
//! These layouts are stable; both cache layers and data shared between
//! processes depend on them:
//!
//! - row image: `<Type>:<id>` → packed field list in declaration order
//! - cached query page: `<Type>:<index>:<argHash>:<page>` → id list
//! - queue payload: `<Type>:<id>` bytes

use crate::entity::SqlValue;

/// Marker stored for a key known to have no backing row.
pub const MISS_MARKER: &str = "nil";

pub fn row_key(entity: &str, id: u64) -> String {
    format!("{entity}:{id}")
}

pub fn query_page_key(entity: &str, index: &str, arg_hash: u64, page: u32) -> String {
    format!("{entity}:{index}:{arg_hash}:{page}")
}

/// Pack a row image for a cache layer: JSON field list in declaration
/// order.
pub fn pack_row(values: &[SqlValue]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a packed row image; `None` for the miss marker or garbage.
pub fn unpack_row(packed: &str) -> Option<Vec<SqlValue>> {
    if packed == MISS_MARKER {
        return None;
    }
    serde_json::from_str(packed).ok()
}

/// Parse a `<Type>:<id>` queue payload.
pub fn parse_row_key(key: &str) -> Option<(&str, u64)> {
    let (entity, id) = key.rsplit_once(':')?;
    let id = id.parse().ok()?;
    Some((entity, id))
}

/// FNV-1a over the canonical form of an argument tuple.
///
/// The hash must come out identical for a tuple supplied by a caller and
/// for the same values read back out of a row, across processes; a keyed
/// hasher would break the shared key space.
pub fn arg_hash(values: &[SqlValue]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
    };
    for value in values {
        let canonical = match value {
            SqlValue::Null => "\u{0}".to_string(),
            SqlValue::UInt(v) => v.to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Str(v) => v.clone(),
            SqlValue::Bytes(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
        };
        feed(canonical.as_bytes());
        feed(&[0x1f]);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_keys() {
        assert_eq!(row_key("User", 1), "User:1");
        assert_eq!(parse_row_key("User:1"), Some(("User", 1)));
        assert_eq!(parse_row_key("User"), None);
        assert_eq!(parse_row_key("User:x"), None);
    }

    #[test]
    fn arg_hash_is_stable_across_numeric_variants() {
        // A caller-supplied unsigned 37 and a signed 37 read from a row
        // must land on the same page keys.
        assert_eq!(
            arg_hash(&[SqlValue::UInt(37)]),
            arg_hash(&[SqlValue::Int(37)])
        );
        assert_ne!(
            arg_hash(&[SqlValue::UInt(37)]),
            arg_hash(&[SqlValue::UInt(38)])
        );
    }

    #[test]
    fn arg_hash_separates_adjacent_values() {
        assert_ne!(
            arg_hash(&[SqlValue::Str("ab".into()), SqlValue::Str("c".into())]),
            arg_hash(&[SqlValue::Str("a".into()), SqlValue::Str("bc".into())])
        );
    }
}
