#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of write. The cascade table is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationKind(Cow<'static, str>);

impl MutationKind {
    pub const MARK_PENDING_COMPLETE: MutationKind = MutationKind(Cow::Borrowed("mark-pending-complete"));
    pub const BULK_PROCESS_PENDING: MutationKind = MutationKind(Cow::Borrowed("bulk-process-pending"));
    pub const CANCEL_SUBSCRIPTION: MutationKind = MutationKind(Cow::Borrowed("cancel-subscription"));
    pub const PROCESS_LEGACY: MutationKind = MutationKind(Cow::Borrowed("process-legacy"));
    pub const UPDATE_USER: MutationKind = MutationKind(Cow::Borrowed("update-user"));
    pub const DELETE_USER: MutationKind = MutationKind(Cow::Borrowed("delete-user"));
    pub const DELETE_KB_ENTRY: MutationKind = MutationKind(Cow::Borrowed("delete-kb-entry"));

    pub const fn from_static(name: &'static str) -> Self { Self(Cow::Borrowed(name)) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for MutationKind {
    fn from(v: &str) -> Self { Self(Cow::Owned(v.to_string())) }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A single logical write produced by a UI action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub kind: MutationKind,
    /// Identity of the targeted row, rendered as text. Bulk kinds leave it empty.
    pub target: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MutationRequest {
    pub fn new(kind: MutationKind) -> Self {
        Self { kind, target: None, payload: serde_json::Value::Null }
    }

    pub fn targeting(kind: MutationKind, target: impl fmt::Display) -> Self {
        Self { kind, target: Some(target.to_string()), payload: serde_json::Value::Null }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Non-blank target id, if any.
    pub fn target_id(&self) -> Option<&str> {
        self.target.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub id: String,
    pub error: String,
}

/// Per-item result of a bulk write. Partial failure is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkReport {
    pub success_count: usize,
    pub failures: Vec<BulkFailure>,
}

impl BulkReport {
    pub fn is_partial(&self) -> bool { !self.failures.is_empty() }
    pub fn attempted(&self) -> usize { self.success_count + self.failures.len() }
}

/// Successful outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteResult {
    Applied,
    Bulk(BulkReport),
}

impl WriteResult {
    pub fn bulk(&self) -> Option<&BulkReport> {
        match self {
            Self::Bulk(r) => Some(r),
            Self::Applied => None,
        }
    }

    /// One-line summary suitable for a toast.
    pub fn summary(&self) -> String {
        match self {
            Self::Applied => "applied".to_string(),
            Self::Bulk(r) if r.failures.is_empty() => format!("{} processed", r.success_count),
            Self::Bulk(r) => format!("{} processed, {} failed", r.success_count, r.failures.len()),
        }
    }
}
