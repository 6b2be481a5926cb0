//! Backend-neutral queries.
//!
//! A [`Query`] is a conjunction of filters plus optional ordering and paging.
//! Field names are resolved per entity kind through
//! [`EntitySchema::resolve`](super::schema::EntitySchema::resolve); the
//! relational backend compiles them to SQL, the JSON backend evaluates them in
//! memory with [`Filter::matches`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Exact equality.
    Eq,
    /// Case-insensitive substring match.
    Like,
}

/// A single field filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field name (record field, column, alias, joined field or payload key).
    pub field: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Value to compare against.
    pub value: Value,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// An index or count query.
///
/// `offset == 0 && limit == 0` means "everything".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filters, all of which must match.
    pub filters: Vec<Filter>,
    /// Optional ordering field and direction; defaults to `id` ascending.
    pub order_by: Option<(String, SortOrder)>,
    /// Number of matching records to skip.
    pub offset: usize,
    /// Maximum number of records to return; `0` means unlimited.
    pub limit: usize,
    /// Skips the count cache when set.
    pub bypass_count_cache: bool,
}

impl Query {
    /// Creates an empty query matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    #[must_use]
    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            operator: Operator::Eq,
            value: value.into(),
        });
        self
    }

    /// Adds a case-insensitive substring filter.
    #[must_use]
    pub fn filter_like(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            operator: Operator::Like,
            value: value.into(),
        });
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    /// Sets offset and limit.
    #[must_use]
    pub const fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Forces a fresh count instead of a cached one.
    #[must_use]
    pub const fn bypass_count_cache(mut self) -> Self {
        self.bypass_count_cache = true;
        self
    }

    /// Returns the same query without paging, for counting.
    #[must_use]
    pub fn unpaged(&self) -> Self {
        Self {
            offset: 0,
            limit: 0,
            ..self.clone()
        }
    }
}

/// Text form of a scalar used for comparisons; `None` for null or absent.
#[must_use]
pub fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl Filter {
    /// Evaluates this filter against a resolved field value.
    #[must_use]
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let (Some(actual), Some(expected)) = (value_text(actual), value_text(Some(&self.value)))
        else {
            return false;
        };
        match self.operator {
            Operator::Eq => actual == expected,
            Operator::Like => actual.to_lowercase().contains(&expected.to_lowercase()),
        }
    }
}

/// Orders two field values: nulls first, numbers numerically, everything else
/// by text.
#[must_use]
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => value_text(a).cmp(&value_text(b)),
    }
}
