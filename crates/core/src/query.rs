//! QuerySpec: immutable description of what a paginated view currently wants.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: Direction,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Asc } }
    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: Direction::Desc } }

    /// `field` or `-field`, the ordering parameter most list endpoints accept.
    pub fn ordering_param(&self) -> String {
        match self.direction {
            Direction::Asc => self.field.clone(),
            Direction::Desc => format!("-{}", self.field),
        }
    }
}

/// Scalar filter value. A null filter is represented by the key being absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FilterValue {
    /// Matches against a JSON scalar; numbers and booleans also match their
    /// string rendering, since query strings carry everything as text.
    pub fn matches(&self, v: &serde_json::Value) -> bool {
        match (self, v) {
            (Self::Bool(a), serde_json::Value::Bool(b)) => a == b,
            (Self::Int(a), serde_json::Value::Number(n)) => n.as_i64() == Some(*a),
            (Self::Text(a), serde_json::Value::String(s)) => a == s,
            (Self::Text(a), serde_json::Value::Bool(b)) => a == &b.to_string(),
            (Self::Text(a), serde_json::Value::Number(n)) => a == &n.to_string(),
            _ => false,
        }
    }

    /// Parse a `key=value` right-hand side: `true`/`false`, integers, else text.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => raw.parse::<i64>().map(Self::Int).unwrap_or_else(|_| Self::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => f.write_str(s),
        }
    }
}

pub type Filters = BTreeMap<String, FilterValue>;

/// How a fetched page is combined into the materialized list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// New query: replace the list.
    Reset,
    /// Load more: same query class, next page, deduplicating append.
    Append,
}

/// Immutable query value. Every `with_*` builder returns a fresh spec on page 1;
/// only [`QuerySpec::next_page`] advances the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "QuerySpecRepr")]
pub struct QuerySpec {
    page: u32,
    page_size: u32,
    search: Option<String>,
    sort: Option<SortSpec>,
    filters: Filters,
}

/// Wire form; converted through the same normalization as the builders.
#[derive(Deserialize)]
struct QuerySpecRepr {
    page: u32,
    page_size: u32,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    sort: Option<SortSpec>,
    #[serde(default)]
    filters: Filters,
}

impl From<QuerySpecRepr> for QuerySpec {
    fn from(r: QuerySpecRepr) -> Self {
        let q = QuerySpec::new(r.page_size)
            .with_search(r.search.as_deref())
            .with_sort(r.sort)
            .with_filters(r.filters);
        Self { page: r.page.max(1), ..q }
    }
}

impl QuerySpec {
    pub fn new(page_size: u32) -> Self {
        Self { page: 1, page_size: page_size.max(1), search: None, sort: None, filters: Filters::new() }
    }

    pub fn page(&self) -> u32 { self.page }
    pub fn page_size(&self) -> u32 { self.page_size }
    pub fn search(&self) -> Option<&str> { self.search.as_deref() }
    pub fn sort(&self) -> Option<&SortSpec> { self.sort.as_ref() }
    pub fn filters(&self) -> &Filters { &self.filters }

    /// Offset of the first row of this page.
    pub fn offset(&self) -> u64 { (self.page as u64).saturating_sub(1) * self.page_size as u64 }

    /// Same filters/search/sort/page size; `page` is ignored. Two specs in the
    /// same class differ only by how far the user scrolled.
    pub fn same_class(&self, other: &QuerySpec) -> bool {
        self.page_size == other.page_size
            && self.search == other.search
            && self.sort == other.sort
            && self.filters == other.filters
    }

    /// Whether fetching `next` after `self` is a genuine load-more.
    pub fn is_append_of(&self, next: &QuerySpec) -> bool {
        self.same_class(next) && next.page == self.page + 1
    }

    pub fn next_page(&self) -> Self {
        Self { page: self.page.saturating_add(1), ..self.clone() }
    }

    pub fn first_page(&self) -> Self { Self { page: 1, ..self.clone() } }

    /// Blank or whitespace-only search clears it.
    pub fn with_search(&self, search: Option<&str>) -> Self {
        let search = search.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Self { page: 1, search, ..self.clone() }
    }

    pub fn with_sort(&self, sort: Option<SortSpec>) -> Self { Self { page: 1, sort, ..self.clone() } }

    /// `None` (null) or an empty text value removes the filter.
    pub fn with_filter(&self, key: &str, value: Option<FilterValue>) -> Self {
        let mut filters = self.filters.clone();
        match value {
            Some(FilterValue::Text(s)) if s.is_empty() => { filters.remove(key); }
            Some(v) => { filters.insert(key.to_string(), v); }
            None => { filters.remove(key); }
        }
        Self { page: 1, filters, ..self.clone() }
    }

    pub fn with_filters(&self, filters: Filters) -> Self {
        let mut next = Self { page: 1, filters: Filters::new(), ..self.clone() };
        for (k, v) in filters { next = next.with_filter(&k, Some(v)); }
        next
    }

    pub fn with_page_size(&self, page_size: u32) -> Self {
        Self { page: 1, page_size: page_size.max(1), ..self.clone() }
    }

    /// Drop filters and search, keep sort and page size.
    pub fn cleared(&self) -> Self {
        Self { page: 1, search: None, filters: Filters::new(), ..self.clone() }
    }

    /// Flatten into query-string pairs: `page`, `page_size`, `search`, `ordering`, then filters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("page".to_string(), self.page.to_string()),
            ("page_size".to_string(), self.page_size.to_string()),
        ];
        if let Some(s) = &self.search { out.push(("search".into(), s.clone())); }
        if let Some(s) = &self.sort { out.push(("ordering".into(), s.ordering_param())); }
        for (k, v) in &self.filters { out.push((k.clone(), v.to_string())); }
        out
    }
}

impl Default for QuerySpec {
    fn default() -> Self { Self::new(crate::config::DEFAULT_PAGE_SIZE) }
}
