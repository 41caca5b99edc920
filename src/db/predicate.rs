//! Parameterized predicate builder.
//!
//! Collection-valued parameters are expanded into the query text up front
//! (`IN ?` becomes `IN (?,?,…)`), so downstream clients only ever see
//! scalar placeholders.

use crate::entity::SqlValue;

/// One predicate parameter: a scalar or a collection destined for an
/// `IN ?` placeholder.
#[derive(Debug, Clone)]
pub enum PredicateParam {
    Value(SqlValue),
    List(Vec<SqlValue>),
}

impl<T: Into<SqlValue>> From<T> for PredicateParam {
    fn from(value: T) -> Self {
        Self::Value(value.into())
    }
}

impl PredicateParam {
    /// A collection destined for an `IN ?` placeholder. (A `Vec<u8>`
    /// converts to a scalar blob via `From`; every other collection goes
    /// through here.)
    pub fn list<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SqlValue>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// An immutable query string plus its final scalar parameter list.
#[derive(Debug, Clone)]
pub struct Predicate {
    query: String,
    params: Vec<SqlValue>,
}

impl Predicate {
    pub fn new(template: &str, params: impl IntoIterator<Item = PredicateParam>) -> Self {
        let mut query = template.to_string();
        let mut final_params = Vec::new();
        for param in params {
            match param {
                PredicateParam::Value(value) => final_params.push(value),
                PredicateParam::List(values) => {
                    // Each expansion consumes the leftmost unexpanded
                    // placeholder; expanded ones no longer match.
                    let placeholders = vec!["?"; values.len().max(1)].join(",");
                    query = replace_first(&query, "IN ?", &format!("IN ({placeholders})"));
                    final_params.extend(values);
                }
            }
        }
        Self {
            query,
            params: final_params,
        }
    }

    /// Predicate matching every row.
    pub fn all() -> Self {
        Self::new("1", [])
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

/// Replace the first occurrence of `needle` in `haystack`.
fn replace_first(haystack: &str, needle: &str, replacement: &str) -> String {
    match haystack.find(needle) {
        Some(offset) => {
            let mut out = String::with_capacity(haystack.len() + replacement.len());
            out.push_str(&haystack[..offset]);
            out.push_str(replacement);
            out.push_str(&haystack[offset + needle.len()..]);
            out
        }
        None => haystack.to_string(),
    }
}

/// Offset pagination: 1-based page of a fixed size.
#[derive(Debug, Clone, Copy)]
pub struct Pager {
    pub page: u32,
    pub page_size: u32,
}

impl Pager {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn limit_clause(&self) -> String {
        format!(" LIMIT {},{}", self.offset(), self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_pass_through() {
        let predicate = Predicate::new("`Age` = ? AND `Name` = ?", [37u32.into(), "Ada".into()]);
        assert_eq!(predicate.query(), "`Age` = ? AND `Name` = ?");
        assert_eq!(predicate.params().len(), 2);
    }

    #[test]
    fn collection_expands_in_place() {
        let predicate = Predicate::new(
            "a = ? AND b IN ?",
            [PredicateParam::from(1u32), PredicateParam::list([2u32, 3, 4])],
        );
        assert_eq!(predicate.query(), "a = ? AND b IN (?,?,?)");
        assert_eq!(predicate.params().len(), 4);
        assert_eq!(predicate.params()[0], SqlValue::UInt(1));
        assert_eq!(predicate.params()[3], SqlValue::UInt(4));
    }

    #[test]
    fn multiple_collections_expand_in_order() {
        let predicate = Predicate::new(
            "a IN ? OR b IN ?",
            [
                PredicateParam::list([1u32, 2]),
                PredicateParam::list([3u32]),
            ],
        );
        assert_eq!(predicate.query(), "a IN (?,?) OR b IN (?)");
        assert_eq!(predicate.params().len(), 3);
    }

    #[test]
    fn pager_limits() {
        let pager = Pager::new(3, 20);
        assert_eq!(pager.limit_clause(), " LIMIT 40,20");
        assert_eq!(Pager::new(0, 10).page, 1);
    }
}
