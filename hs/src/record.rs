//! Record trait and query model
//!
//! Any serde type can be stored by implementing [`Record`]: a stable id, a
//! collection name, and the subset of fields worth indexing for queries.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current time in unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value that can be stored in the side index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl IndexValue {
    /// Text form stored in the index table
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::String(s) => s.parse().ok(),
            Self::Boolean(b) => Some(*b as i64),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Comparison operator for filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A single query predicate against an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Shorthand for the common equality case
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Evaluate this filter against a record's indexed fields.
    /// Ordered comparisons are numeric when both sides parse as integers,
    /// lexicographic otherwise.
    pub fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => actual.as_text() == self.value.as_text(),
            FilterOp::Ne => actual.as_text() != self.value.as_text(),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let ord = match (actual.as_integer(), self.value.as_integer()) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    _ => actual.as_text().cmp(&self.value.as_text()),
                };
                match self.op {
                    FilterOp::Gt => ord.is_gt(),
                    FilterOp::Gte => ord.is_ge(),
                    FilterOp::Lt => ord.is_lt(),
                    FilterOp::Lte => ord.is_le(),
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// A storable document
pub trait Record: Serialize + DeserializeOwned {
    /// Stable unique identifier
    fn id(&self) -> &str;

    /// Last-modified timestamp (unix ms)
    fn updated_at(&self) -> i64;

    /// Collection (logical table) this record lives in
    fn collection_name() -> &'static str;

    /// Fields extracted into the side index for querying
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, IndexValue)]) -> HashMap<String, IndexValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_filter_eq() {
        let f = Filter::eq("status", "pending");
        assert!(f.matches(&fields(&[("status", "pending".into())])));
        assert!(!f.matches(&fields(&[("status", "running".into())])));
        assert!(!f.matches(&fields(&[("other", "pending".into())])));
    }

    #[test]
    fn test_filter_numeric_ordering() {
        let f = Filter::new("priority", FilterOp::Gte, 10i64);
        assert!(f.matches(&fields(&[("priority", 10i64.into())])));
        assert!(f.matches(&fields(&[("priority", 99i64.into())])));
        assert!(!f.matches(&fields(&[("priority", 9i64.into())])));
        // Numeric, not lexicographic: 9 < 10 even though "9" > "10"
        let f = Filter::new("priority", FilterOp::Lt, 10i64);
        assert!(f.matches(&fields(&[("priority", 9i64.into())])));
    }

    #[test]
    fn test_filter_boolean() {
        let f = Filter::eq("quick_win", true);
        assert!(f.matches(&fields(&[("quick_win", true.into())])));
        assert!(!f.matches(&fields(&[("quick_win", false.into())])));
    }

    #[test]
    fn test_index_value_text() {
        assert_eq!(IndexValue::String("x".into()).as_text(), "x");
        assert_eq!(IndexValue::Integer(-3).as_text(), "-3");
        assert_eq!(IndexValue::Boolean(true).as_text(), "true");
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Eq and Ne partition the space
            #[test]
            fn eq_and_ne_are_complementary(a in any::<i64>(), b in any::<i64>()) {
                let fields = fields(&[("n", a.into())]);
                let eq = Filter::new("n", FilterOp::Eq, b).matches(&fields);
                let ne = Filter::new("n", FilterOp::Ne, b).matches(&fields);
                prop_assert_ne!(eq, ne);
            }

            // Ordered operators agree with integer ordering
            #[test]
            fn ordered_ops_match_integer_order(a in any::<i64>(), b in any::<i64>()) {
                let fields = fields(&[("n", a.into())]);
                prop_assert_eq!(Filter::new("n", FilterOp::Gt, b).matches(&fields), a > b);
                prop_assert_eq!(Filter::new("n", FilterOp::Gte, b).matches(&fields), a >= b);
                prop_assert_eq!(Filter::new("n", FilterOp::Lt, b).matches(&fields), a < b);
                prop_assert_eq!(Filter::new("n", FilterOp::Lte, b).matches(&fields), a <= b);
            }

            // A filter on a missing field never matches
            #[test]
            fn missing_field_never_matches(value in ".*") {
                let fields = fields(&[("present", "x".into())]);
                prop_assert!(!Filter::eq("absent", value).matches(&fields));
            }
        }
    }
}
