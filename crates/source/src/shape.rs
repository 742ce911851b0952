//! Explicit validation of raw JSON responses at the fetch boundary.
//!
//! Each endpoint is configured with exactly one [`ResponseShape`]. A body that
//! does not match it is a [`ErrorKind::Shape`]; no alternate layout is tried.

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabula_core::{BulkFailure, BulkReport, ErrorKind, PageResult, QuerySpec, Stats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// `{ "items": [...], "totalCount": n }`
    ItemsTotalCount,
    /// `{ "data": [...], "total_count": n }`
    DataTotalCount,
}

impl ResponseShape {
    fn keys(self) -> (&'static str, &'static str) {
        match self {
            Self::ItemsTotalCount => ("items", "totalCount"),
            Self::DataTotalCount => ("data", "total_count"),
        }
    }
}

/// Validate a page body. `page`/`page_size` echo fields are optional; when the
/// server omits them the requested values are used.
pub fn validate_page<I: DeserializeOwned>(raw: &Value, shape: ResponseShape, query: &QuerySpec) -> Result<PageResult<I>, ErrorKind> {
    let (items_key, total_key) = shape.keys();
    let obj = raw.as_object().ok_or_else(|| ErrorKind::shape(format!("expected object, got {}", kind_of(raw))))?;
    let arr = obj
        .get(items_key)
        .and_then(Value::as_array)
        .ok_or_else(|| ErrorKind::shape(format!("missing array field `{}`", items_key)))?;
    let total_count = obj
        .get(total_key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ErrorKind::shape(format!("missing non-negative integer `{}`", total_key)))?;
    let mut items = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let item = serde_json::from_value::<I>(v.clone())
            .map_err(|e| ErrorKind::shape(format!("{}[{}]: {}", items_key, i, e)))?;
        items.push(item);
    }
    let server_page = echo_u32(obj.get("page"), "page")?.unwrap_or(query.page());
    let server_page_size = echo_u32(obj.get("page_size"), "page_size")?.unwrap_or(query.page_size());
    Ok(PageResult { items, total_count, server_page, server_page_size })
}

/// Stats must be a flat object of non-negative integers.
pub fn validate_stats(raw: &Value) -> Result<Stats, ErrorKind> {
    let obj = raw.as_object().ok_or_else(|| ErrorKind::shape(format!("stats: expected object, got {}", kind_of(raw))))?;
    let mut out = Stats::new();
    for (k, v) in obj {
        let n = v.as_u64().ok_or_else(|| ErrorKind::shape(format!("stats: `{}` is not a count", k)))?;
        out.insert(k.clone(), n);
    }
    Ok(out)
}

#[derive(Deserialize)]
struct BulkEntry {
    id: Value,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// `{ "results": [{ "id": .., "success": bool, "error": str? }] }`
pub fn validate_bulk(raw: &Value) -> Result<BulkReport, ErrorKind> {
    let results = raw
        .get("results")
        .cloned()
        .ok_or_else(|| ErrorKind::shape("bulk: missing `results`"))?;
    let entries: Vec<BulkEntry> = serde_json::from_value(results).map_err(|e| ErrorKind::shape(format!("bulk: {}", e)))?;
    let mut report = BulkReport::default();
    for e in entries {
        if e.success {
            report.success_count += 1;
        } else {
            let id = match e.id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            report.failures.push(BulkFailure { id, error: e.error.unwrap_or_else(|| "unknown error".into()) });
        }
    }
    Ok(report)
}

fn echo_u32(v: Option<&Value>, key: &str) -> Result<Option<u32>, ErrorKind> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ErrorKind::shape(format!("`{}` is not a page number", key))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
