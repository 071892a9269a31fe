/// Query surface for collection indexes.
///
/// Searches are expressed as a predicate tree (`Filter`), or as an
/// exact-match map for the common "all fields equal" case, with optional
/// sort specs and a fetch limit.
///
/// # Example
///
/// ```ignore
/// use weft::query::{Filter, SearchOptions, SortBy};
///
/// let options = SearchOptions::new()
///     .query(Filter::eq("category_id", "movies"))
///     .sort(SortBy::ascending("name"))
///     .fetch(10);
/// ```
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A filter condition over stored documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value.
    Eq { field: String, value: JsonValue },
    /// Field not equals value.
    Ne { field: String, value: JsonValue },
    /// Field greater than value.
    Gt { field: String, value: JsonValue },
    /// Field greater than or equal to value.
    Gte { field: String, value: JsonValue },
    /// Field less than value.
    Lt { field: String, value: JsonValue },
    /// Field less than or equal to value.
    Lte { field: String, value: JsonValue },
    /// Field contains substring (for strings) or element (for arrays).
    Contains { field: String, value: JsonValue },
    /// Field exists (is not null/missing).
    Exists { field: String },
    /// Field matches regex pattern (for strings).
    Matches { field: String, pattern: String },
    /// Logical AND of multiple filters.
    And(Vec<Filter>),
    /// Logical OR of multiple filters.
    Or(Vec<Filter>),
    /// Logical NOT of a filter.
    Not(Box<Filter>),
}

impl Filter {
    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a not-equals filter.
    pub fn ne(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than-or-equal filter.
    pub fn gte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than-or-equal filter.
    pub fn lte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create an exists filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    /// Create a regex match filter.
    pub fn matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Combine filters with AND.
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Combine filters with OR.
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Negate a filter.
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Check whether a document matches this filter.
    pub fn matches_value(&self, value: &JsonValue) -> bool {
        match self {
            Filter::Eq { field, value: v } => get_field(value, field) == Some(v),
            Filter::Ne { field, value: v } => get_field(value, field) != Some(v),
            Filter::Gt { field, value: v } => {
                matches!(compare_field(value, field, v), Some(Ordering::Greater))
            }
            Filter::Gte { field, value: v } => matches!(
                compare_field(value, field, v),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            Filter::Lt { field, value: v } => {
                matches!(compare_field(value, field, v), Some(Ordering::Less))
            }
            Filter::Lte { field, value: v } => matches!(
                compare_field(value, field, v),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            Filter::Contains { field, value: v } => match get_field(value, field) {
                Some(JsonValue::String(s)) => v.as_str().map(|n| s.contains(n)).unwrap_or(false),
                Some(JsonValue::Array(items)) => items.contains(v),
                _ => false,
            },
            Filter::Exists { field } => {
                matches!(get_field(value, field), Some(f) if !f.is_null())
            }
            Filter::Matches { field, pattern } => match get_field(value, field) {
                Some(JsonValue::String(s)) => regex::Regex::new(pattern)
                    .map(|re| re.is_match(s))
                    .unwrap_or(false),
                _ => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.matches_value(value)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches_value(value)),
            Filter::Not(filter) => !filter.matches_value(value),
        }
    }
}

/// Look up a field in a document. Dotted paths traverse nested objects.
fn get_field<'a>(value: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in field.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Compare a document field against a query value.
///
/// Numbers compare numerically, strings lexicographically. Mismatched or
/// incomparable types yield `None`.
fn compare_field(value: &JsonValue, field: &str, against: &JsonValue) -> Option<Ordering> {
    let field_value = get_field(value, field)?;
    compare_json(field_value, against)
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A sort specification: field plus direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortBy {
    /// The field to sort on.
    pub field: String,
    /// Ascending when true.
    pub ascending: bool,
}

impl SortBy {
    /// Sort ascending by a field.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    /// Sort descending by a field.
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// A search request body: a predicate tree or an exact-match map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Query {
    /// Arbitrary predicate tree.
    Predicate(Filter),
    /// All listed fields must equal the given values.
    Match(BTreeMap<String, JsonValue>),
}

impl Query {
    /// Check whether a document matches this query.
    pub fn matches_value(&self, value: &JsonValue) -> bool {
        match self {
            Query::Predicate(filter) => filter.matches_value(value),
            Query::Match(fields) => fields
                .iter()
                .all(|(field, expected)| get_field(value, field) == Some(expected)),
        }
    }

    /// Exact-match query on a single field.
    pub fn field_eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), value.into());
        Query::Match(fields)
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Query::Predicate(filter)
    }
}

/// Options for a collection search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Optional query; `None` matches every document.
    pub query: Option<Query>,
    /// Sort specs applied in order.
    pub sort: Vec<SortBy>,
    /// Maximum number of results to return.
    pub fetch: Option<usize>,
}

impl SearchOptions {
    /// Match-everything options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the query.
    pub fn query(mut self, query: impl Into<Query>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a sort spec.
    pub fn sort(mut self, sort: SortBy) -> Self {
        self.sort.push(sort);
        self
    }

    /// Limit the number of results.
    pub fn fetch(mut self, fetch: usize) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Compare two documents per the sort specs.
    pub fn compare_documents(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        for sort in &self.sort {
            let ordering = match (get_field(a, &sort.field), get_field(b, &sort.field)) {
                (Some(x), Some(y)) => compare_json(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = if sort.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
