//! In-memory backend with offset pagination, used by the demo CLI and tests.
//!
//! It implements the console's write rules for subscriptions, the pending
//! review queue, legacy imports, users and the knowledge base, and records an
//! audit-log row for every successful write.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabula_core::{
    BulkFailure, BulkReport, ErrorKind, FilterValue, Filters, Identified, MutationKind, MutationRequest, PageResult,
    QuerySpec, ResourceName, Stats, WriteResult,
};
use tracing::{debug, info};

use crate::{DataSource, MutationSink, SourceResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl From<i64> for RecordId {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<i32> for RecordId {
    fn from(v: i32) -> Self { Self::Int(v as i64) }
}

impl From<&str> for RecordId {
    fn from(v: &str) -> Self { Self::Text(v.to_string()) }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Schemaless row: an identity plus arbitrary JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>) -> Self { Self { id: id.into(), fields: Map::new() } }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.fields.get(key) }

    pub fn str_field(&self, key: &str) -> Option<&str> { self.get(key).and_then(Value::as_str) }

    fn matches_filters(&self, filters: &Filters) -> bool {
        filters.iter().all(|(k, v)| match k.as_str() {
            "id" => v.to_string() == self.id.to_string(),
            _ => self.get(k).map_or(false, |x| v.matches(x)),
        })
    }

    fn matches_search(&self, needle: &str) -> bool {
        if self.id.to_string().to_lowercase().contains(needle) { return true; }
        self.fields.values().any(|v| matches!(v, Value::String(s) if s.to_lowercase().contains(needle)))
    }
}

impl Identified for Record {
    type Id = RecordId;
    fn id(&self) -> RecordId { self.id.clone() }
}

/// One named counter: rows matching `field == value`, or all rows when `field` is None.
#[derive(Debug, Clone)]
pub struct StatRule {
    pub key: String,
    pub field: Option<(String, FilterValue)>,
}

impl StatRule {
    pub fn all(key: &str) -> Self { Self { key: key.to_string(), field: None } }
    pub fn when(key: &str, field: &str, value: FilterValue) -> Self {
        Self { key: key.to_string(), field: Some((field.to_string(), value)) }
    }
}

/// Most recent calls kept for assertions; older ones are dropped.
pub const CALL_LOG_CAP: usize = 256;

/// Observed backend call, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Page { resource: ResourceName, query: QuerySpec },
    Stats { resource: ResourceName },
    Mutate { kind: MutationKind },
}

#[derive(Default)]
struct Inner {
    tables: FxHashMap<ResourceName, Vec<Record>>,
    stat_rules: FxHashMap<ResourceName, Vec<StatRule>>,
    failures: FxHashMap<ResourceName, VecDeque<ErrorKind>>,
    mutation_failures: VecDeque<ErrorKind>,
    calls: VecDeque<Call>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let me = Self::default();
        me.lock().next_id = 10_000;
        me
    }

    /// Backend preloaded with the console's stats rules (no rows).
    pub fn console() -> Self {
        let me = Self::new();
        me.set_stats(ResourceName::PENDING, vec![
            StatRule::when("pending", "status", FilterValue::Text("pending".into())),
            StatRule::when("complete", "status", FilterValue::Text("complete".into())),
            StatRule::all("total_all"),
        ]);
        me.set_stats(ResourceName::LEGACY, vec![
            StatRule::when("processed", "processed", FilterValue::Bool(true)),
            StatRule::when("unprocessed", "processed", FilterValue::Bool(false)),
        ]);
        me.set_stats(ResourceName::SUBSCRIPTIONS, vec![
            StatRule::when("active", "status", FilterValue::Text("active".into())),
            StatRule::when("cancelled", "status", FilterValue::Text("cancelled".into())),
            StatRule::all("total"),
        ]);
        me
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, resource: ResourceName, rows: impl IntoIterator<Item = Record>) {
        self.lock().tables.entry(resource).or_default().extend(rows);
    }

    pub fn records(&self, resource: &ResourceName) -> Vec<Record> {
        self.lock().tables.get(resource).cloned().unwrap_or_default()
    }

    pub fn set_stats(&self, resource: ResourceName, rules: Vec<StatRule>) {
        self.lock().stat_rules.insert(resource, rules);
    }

    /// Fail the next page or stats fetch on `resource` with `err`.
    pub fn fail_next(&self, resource: ResourceName, err: ErrorKind) {
        self.lock().failures.entry(resource).or_default().push_back(err);
    }

    pub fn fail_next_mutation(&self, err: ErrorKind) {
        self.lock().mutation_failures.push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.iter().cloned().collect() }

    pub fn take_calls(&self) -> Vec<Call> { self.lock().calls.drain(..).collect() }

    async fn simulate_latency(&self) {
        if let Some(d) = self.latency { tokio::time::sleep(d).await; }
    }
}

#[async_trait::async_trait]
impl DataSource<Record> for MemoryBackend {
    async fn fetch_page(&self, resource: &ResourceName, query: &QuerySpec) -> SourceResult<PageResult<Record>> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.record(Call::Page { resource: resource.clone(), query: query.clone() });
        if let Some(err) = inner.failures.get_mut(resource).and_then(VecDeque::pop_front) {
            counter!("memory_injected_failures_total", 1);
            return Err(err);
        }
        let rows = inner.tables.get(resource).map(Vec::as_slice).unwrap_or(&[]);
        let (items, total_count) = select(rows, query);
        debug!(resource = %resource, page = query.page(), items = items.len(), total = total_count, "memory: page");
        Ok(PageResult { items, total_count, server_page: query.page(), server_page_size: query.page_size() })
    }

    async fn fetch_stats(&self, resource: &ResourceName, filters: Option<&Filters>) -> SourceResult<Stats> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.record(Call::Stats { resource: resource.clone() });
        if let Some(err) = inner.failures.get_mut(resource).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let rows: Vec<&Record> = inner
            .tables
            .get(resource)
            .map(|t| t.iter().filter(|r| filters.map_or(true, |f| r.matches_filters(f))).collect())
            .unwrap_or_default();
        let default_rules = [StatRule::all("total")];
        let rules = inner.stat_rules.get(resource).map(Vec::as_slice).unwrap_or(&default_rules);
        let mut out = Stats::new();
        for rule in rules {
            let n = match &rule.field {
                None => rows.len(),
                Some((field, value)) => rows.iter().filter(|r| r.get(field).map_or(false, |v| value.matches(v))).count(),
            };
            out.insert(rule.key.clone(), n as u64);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl MutationSink for MemoryBackend {
    async fn mutate(&self, request: &MutationRequest) -> SourceResult<WriteResult> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.record(Call::Mutate { kind: request.kind.clone() });
        if let Some(err) = inner.mutation_failures.pop_front() {
            return Err(err);
        }
        let res = inner.apply(request)?;
        let audit_id = inner.next_id();
        let audit = Record::new(audit_id)
            .with("action", request.kind.as_str())
            .with("target", request.target.clone().map(Value::String).unwrap_or(Value::Null))
            .with("summary", res.summary());
        inner.tables.entry(ResourceName::AUDIT_LOG).or_default().push(audit);
        info!(kind = %request.kind, summary = %res.summary(), "memory: mutation applied");
        Ok(res)
    }
}

impl Inner {
    fn record(&mut self, call: Call) {
        if self.calls.len() == CALL_LOG_CAP { self.calls.pop_front(); }
        self.calls.push_back(call);
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn apply(&mut self, req: &MutationRequest) -> SourceResult<WriteResult> {
        let kind = &req.kind;
        if *kind == MutationKind::MARK_PENDING_COMPLETE {
            let id = required_target(req)?;
            self.complete_pending(id)?;
            Ok(WriteResult::Applied)
        } else if *kind == MutationKind::BULK_PROCESS_PENDING {
            Ok(WriteResult::Bulk(self.bulk_process(&req.payload)?))
        } else if *kind == MutationKind::CANCEL_SUBSCRIPTION {
            let id = required_target(req)?;
            let row = self.row_mut(&ResourceName::SUBSCRIPTIONS, id)?;
            if row.str_field("status") == Some("cancelled") {
                return Err(ErrorKind::validation(format!("subscription {} already cancelled", id)));
            }
            row.fields.insert("status".into(), "cancelled".into());
            Ok(WriteResult::Applied)
        } else if *kind == MutationKind::PROCESS_LEGACY {
            let id = required_target(req)?;
            let row = self.row_mut(&ResourceName::LEGACY, id)?;
            if row.get("processed") == Some(&Value::Bool(true)) {
                return Err(ErrorKind::validation(format!("legacy row {} already processed", id)));
            }
            row.fields.insert("processed".into(), true.into());
            let email = row.get("email").cloned().unwrap_or(Value::Null);
            self.activate(email, id);
            Ok(WriteResult::Applied)
        } else if *kind == MutationKind::UPDATE_USER {
            let id = required_target(req)?;
            let patch = req
                .payload
                .as_object()
                .cloned()
                .ok_or_else(|| ErrorKind::validation("update-user: payload must be an object"))?;
            let row = self.row_mut(&ResourceName::USERS, id)?;
            for (k, v) in patch { if k != "id" { row.fields.insert(k, v); } }
            Ok(WriteResult::Applied)
        } else if *kind == MutationKind::DELETE_USER {
            self.remove_row(&ResourceName::USERS, required_target(req)?)?;
            Ok(WriteResult::Applied)
        } else if *kind == MutationKind::DELETE_KB_ENTRY {
            self.remove_row(&ResourceName::KNOWLEDGE_BASE, required_target(req)?)?;
            Ok(WriteResult::Applied)
        } else {
            Err(ErrorKind::validation(format!("unsupported mutation {}", kind)))
        }
    }

    fn row_mut(&mut self, resource: &ResourceName, id: &str) -> SourceResult<&mut Record> {
        self.tables
            .get_mut(resource)
            .and_then(|t| t.iter_mut().find(|r| r.id.to_string() == id))
            .ok_or_else(|| ErrorKind::validation(format!("{} {} not found", resource, id)))
    }

    fn remove_row(&mut self, resource: &ResourceName, id: &str) -> SourceResult<()> {
        let table = self.tables.entry(resource.clone()).or_default();
        let before = table.len();
        table.retain(|r| r.id.to_string() != id);
        if table.len() == before {
            return Err(ErrorKind::validation(format!("{} {} not found", resource, id)));
        }
        Ok(())
    }

    fn activate(&mut self, email: Value, source_id: &str) {
        let id = self.next_id();
        let sub = Record::new(id).with("email", email).with("status", "active").with("source", source_id);
        self.tables.entry(ResourceName::SUBSCRIPTIONS).or_default().push(sub);
    }

    fn complete_pending(&mut self, id: &str) -> SourceResult<()> {
        let row = self.row_mut(&ResourceName::PENDING, id)?;
        if row.str_field("status") != Some("pending") {
            return Err(ErrorKind::validation(format!("pending item {} is not pending", id)));
        }
        let email = match row.get("email") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(ErrorKind::validation("missing email")),
        };
        row.fields.insert("status".into(), "complete".into());
        self.activate(Value::String(email), id);
        Ok(())
    }

    /// Payload is `{ "ids": [...] }` or `{ "all": true }` (every pending row).
    fn bulk_process(&mut self, payload: &Value) -> SourceResult<BulkReport> {
        let ids: Vec<String> = if payload.get("all") == Some(&Value::Bool(true)) {
            self.tables
                .get(&ResourceName::PENDING)
                .map(|t| t.iter().filter(|r| r.str_field("status") == Some("pending")).map(|r| r.id.to_string()).collect())
                .unwrap_or_default()
        } else {
            let arr = payload
                .get("ids")
                .and_then(Value::as_array)
                .ok_or_else(|| ErrorKind::validation("bulk: payload needs `ids` or `all`"))?;
            arr.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        };
        let mut seen = FxHashSet::default();
        let mut report = BulkReport::default();
        for id in ids {
            if !seen.insert(id.clone()) { continue; }
            match self.complete_pending(&id) {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    let error = match e {
                        ErrorKind::Validation(m) | ErrorKind::Shape(m) | ErrorKind::Transport(m) => m,
                    };
                    report.failures.push(BulkFailure { id, error });
                }
            }
        }
        Ok(report)
    }
}

fn required_target(req: &MutationRequest) -> SourceResult<&str> {
    req.target_id().ok_or_else(|| ErrorKind::validation(format!("{}: target id required", req.kind)))
}

/// Filter, search, sort and slice one page. Returns the page and the total
/// for the whole filtered set.
fn select(rows: &[Record], q: &QuerySpec) -> (Vec<Record>, u64) {
    let needle = q.search().map(str::to_lowercase);
    let mut matched: Vec<&Record> = rows
        .iter()
        .filter(|r| r.matches_filters(q.filters()))
        .filter(|r| needle.as_deref().map_or(true, |n| r.matches_search(n)))
        .collect();
    if let Some(sort) = q.sort() {
        matched.sort_by(|a, b| {
            let primary = compare_json(a.get(&sort.field), b.get(&sort.field));
            let primary = match sort.direction {
                tabula_core::Direction::Asc => primary,
                tabula_core::Direction::Desc => primary.reverse(),
            };
            primary.then_with(|| a.id.cmp(&b.id))
        });
    }
    let total = matched.len() as u64;
    let page = matched
        .into_iter()
        .skip(q.offset() as usize)
        .take(q.page_size() as usize)
        .cloned()
        .collect();
    (page, total)
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::SortSpec;

    fn users() -> Vec<Record> {
        vec![
            Record::new(1).with("name", "carol").with("role", "admin").with("age", 40),
            Record::new(2).with("name", "alice").with("role", "staff").with("age", 31),
            Record::new(3).with("name", "bob").with("role", "staff").with("age", 25),
            Record::new(4).with("name", "Alicia").with("role", "staff").with("age", 52),
        ]
    }

    #[test]
    fn select_filters_searches_sorts_and_pages() {
        let rows = users();
        let q = QuerySpec::new(2)
            .with_filter("role", Some(FilterValue::parse("staff")))
            .with_sort(Some(SortSpec::desc("age")));
        let (page, total) = select(&rows, &q);
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![RecordId::Int(4), RecordId::Int(2)]);
        let (page2, _) = select(&rows, &q.next_page());
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].id, RecordId::Int(3));

        let (hits, total) = select(&rows, &QuerySpec::new(10).with_search(Some("ALI")));
        assert_eq!(total, 2);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn record_serializes_flat() {
        let r = Record::new(7).with("email", "a@b.c");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({ "id": 7, "email": "a@b.c" }));
        let back: Record = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }

    #[tokio::test]
    async fn bulk_reports_per_item_failures() {
        let be = MemoryBackend::console();
        be.insert(ResourceName::PENDING, (1..=4).map(|i| {
            let r = Record::new(i).with("status", "pending");
            if i == 2 { r.with("email", Value::Null) } else { r.with("email", format!("u{}@x.io", i)) }
        }));
        let req = MutationRequest::new(MutationKind::BULK_PROCESS_PENDING).with_payload(serde_json::json!({ "all": true }));
        let res = be.mutate(&req).await.unwrap();
        let report = res.bulk().cloned().unwrap();
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failures, vec![BulkFailure { id: "2".into(), error: "missing email".into() }]);
        assert_eq!(be.records(&ResourceName::SUBSCRIPTIONS).len(), 3);
        assert_eq!(be.records(&ResourceName::AUDIT_LOG).len(), 1);
        let stats = be.fetch_stats(&ResourceName::PENDING, None).await.unwrap();
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["complete"], 3);
        assert_eq!(stats["total_all"], 4);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let be = MemoryBackend::new();
        be.insert(ResourceName::USERS, users());
        be.fail_next(ResourceName::USERS, ErrorKind::transport("503"));
        assert!(be.fetch_page(&ResourceName::USERS, &QuerySpec::new(2)).await.is_err());
        let ok = be.fetch_page(&ResourceName::USERS, &QuerySpec::new(2)).await.unwrap();
        assert_eq!(ok.total_count, 4);
        assert_eq!(be.calls().len(), 2);
    }

    #[tokio::test]
    async fn call_log_keeps_only_the_most_recent_calls() {
        let be = MemoryBackend::new();
        be.insert(ResourceName::USERS, users());
        let mut q = QuerySpec::new(1);
        for _ in 0..CALL_LOG_CAP + 10 {
            be.fetch_page(&ResourceName::USERS, &q).await.unwrap();
            q = q.next_page();
        }
        let calls = be.calls();
        assert_eq!(calls.len(), CALL_LOG_CAP);
        match &calls[0] {
            Call::Page { query, .. } => assert_eq!(query.page(), 11),
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(be.take_calls().len(), CALL_LOG_CAP);
        assert!(be.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_requires_existing_active_subscription() {
        let be = MemoryBackend::console();
        be.insert(ResourceName::SUBSCRIPTIONS, vec![Record::new(5).with("status", "active")]);
        let req = MutationRequest::targeting(MutationKind::CANCEL_SUBSCRIPTION, 5);
        assert_eq!(be.mutate(&req).await.unwrap(), WriteResult::Applied);
        assert!(matches!(be.mutate(&req).await, Err(ErrorKind::Validation(_))));
        let missing = MutationRequest::targeting(MutationKind::CANCEL_SUBSCRIPTION, 99);
        assert!(be.mutate(&missing).await.is_err());
    }
}
