//! MutationCoordinator: the single path from a UI write to its cascade.
//!
//! The write is awaited; the refreshes it implies are not. Each refresh runs
//! on its own task and reports through its own view's state, so a failed
//! badge fetch never turns a successful write into a failure.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::future::join_all;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tabula_core::{EngineConfig, ErrorKind, MutationKind, MutationRequest, ResourceName, WriteResult};
use tabula_source::MutationSink;
use tabula_store::{FetchStatus, Refreshable};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cascade::{Arity, CascadeGraph, CascadeRule, RefreshScope, RefreshTarget};

/// Secondary, non-blocking message for the UI (toast / log line).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Written { kind: MutationKind, summary: String },
    Rejected { kind: MutationKind, error: ErrorKind },
    RefreshFailed { target: RefreshTarget, error: ErrorKind },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    pub refreshed: Vec<RefreshTarget>,
    /// Not registered, or a list refresh for a view that is not mounted.
    pub skipped: Vec<RefreshTarget>,
    pub failed: Vec<(RefreshTarget, ErrorKind)>,
}

impl CascadeReport {
    pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}

/// Refreshes started by one mutation. Dropping it detaches them.
pub struct CascadeHandle {
    started: Vec<(RefreshTarget, JoinHandle<FetchStatus>)>,
    skipped: Vec<RefreshTarget>,
}

impl CascadeHandle {
    pub fn len(&self) -> usize { self.started.len() }

    pub fn is_empty(&self) -> bool { self.started.is_empty() }

    /// Wait for every refresh (tests, CLI). The UI never needs to.
    pub async fn join(self) -> CascadeReport {
        let (targets, tasks): (Vec<_>, Vec<_>) = self.started.into_iter().unzip();
        let mut report = CascadeReport { skipped: self.skipped, ..Default::default() };
        for (target, res) in targets.into_iter().zip(join_all(tasks).await) {
            match res {
                Ok(FetchStatus::Applied) | Ok(FetchStatus::Superseded) => report.refreshed.push(target),
                Ok(FetchStatus::Skipped) => report.skipped.push(target),
                Ok(FetchStatus::Failed(err)) => report.failed.push((target, err)),
                Err(e) => report.failed.push((target, ErrorKind::transport(format!("refresh task: {}", e)))),
            }
        }
        report
    }
}

/// Primary outcome of a write. Cascade results arrive separately.
pub struct MutationOutcome {
    pub kind: MutationKind,
    pub result: WriteResult,
    pub cascade: CascadeHandle,
}

pub struct MutationCoordinator {
    sink: Arc<dyn MutationSink>,
    graph: CascadeGraph,
    views: RwLock<FxHashMap<ResourceName, Arc<dyn Refreshable>>>,
    notices: broadcast::Sender<Notice>,
}

impl MutationCoordinator {
    pub fn new(sink: Arc<dyn MutationSink>, graph: CascadeGraph, notice_cap: usize) -> Self {
        let (notices, _) = broadcast::channel(notice_cap.max(1));
        Self { sink, graph, views: RwLock::new(FxHashMap::default()), notices }
    }

    pub fn from_config(sink: Arc<dyn MutationSink>, graph: CascadeGraph, cfg: &EngineConfig) -> Self {
        Self::new(sink, graph, cfg.notice_cap)
    }

    pub fn graph(&self) -> &CascadeGraph { &self.graph }

    /// Make a view reachable by cascades. Replaces any earlier view for the same resource.
    pub fn register(&self, view: Arc<dyn Refreshable>) {
        let name = view.resource().clone();
        self.views.write().unwrap_or_else(|e| e.into_inner()).insert(name.clone(), view);
        debug!(resource = %name, "coordinator: view registered");
    }

    pub fn view(&self, resource: &ResourceName) -> Option<Arc<dyn Refreshable>> {
        self.views.read().unwrap_or_else(|e| e.into_inner()).get(resource).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> { self.notices.subscribe() }

    fn notify(&self, notice: Notice) {
        // No receivers is fine: notices are advisory.
        let _ = self.notices.send(notice);
    }

    /// Check a request against its rule without touching the network.
    pub fn validate(&self, request: &MutationRequest) -> Result<&CascadeRule, ErrorKind> {
        let rule = self
            .graph
            .get(&request.kind)
            .ok_or_else(|| ErrorKind::validation(format!("unknown mutation kind {}", request.kind)))?;
        match rule.arity {
            Arity::One if request.target_id().is_none() => {
                Err(ErrorKind::validation(format!("{}: target id required", request.kind)))
            }
            Arity::Many => {
                let all = request.payload.get("all").and_then(|v| v.as_bool()) == Some(true);
                let ids = request.payload.get("ids").and_then(|v| v.as_array()).map_or(false, |a| !a.is_empty());
                if all || ids {
                    Ok(rule)
                } else {
                    Err(ErrorKind::validation(format!("{}: payload needs non-empty `ids` or `all: true`", request.kind)))
                }
            }
            Arity::One => Ok(rule),
        }
    }

    fn reject(&self, kind: &MutationKind, outcome: &'static str, error: ErrorKind) -> ErrorKind {
        counter!("mutation_total", 1, "kind" => kind.to_string(), "outcome" => outcome);
        warn!(kind = %kind, error = %error, "mutation: rejected");
        self.notify(Notice::Rejected { kind: kind.clone(), error: error.clone() });
        error
    }

    /// Perform the write, then start its cascade. The returned error, if any,
    /// is about the write itself; cascade failures only ever become notices.
    pub async fn mutate(&self, request: MutationRequest) -> Result<MutationOutcome, ErrorKind> {
        let rule = match self.validate(&request) {
            Ok(rule) => rule.clone(),
            Err(e) => return Err(self.reject(&request.kind, "invalid", e)),
        };
        let t0 = Instant::now();
        let result = match self.sink.mutate(&request).await {
            Ok(r) => r,
            Err(e) => return Err(self.reject(&request.kind, "failed", e)),
        };
        let outcome = if result.bulk().map_or(false, |b| b.is_partial()) { "partial" } else { "ok" };
        counter!("mutation_total", 1, "kind" => request.kind.to_string(), "outcome" => outcome);
        info!(kind = %request.kind, id = ?request.target_id(), summary = %result.summary(), took_ms = %t0.elapsed().as_millis(), "mutation: write applied");
        if let Some(report) = result.bulk() {
            for f in &report.failures {
                warn!(kind = %request.kind, id = %f.id, error = %f.error, "mutation: bulk item failed");
            }
        }

        if rule.forget_target {
            if let (Some(id), Some(view)) = (request.target_id(), self.view(&rule.owner)) {
                view.forget(id);
            }
        }
        self.notify(Notice::Written { kind: request.kind.clone(), summary: result.summary() });

        let cascade = self.cascade(&request.kind);
        Ok(MutationOutcome { kind: request.kind, result, cascade })
    }

    /// Start every refresh `kind` implies. Lists refresh only when mounted;
    /// stats refresh regardless so navigation badges stay current.
    pub fn cascade(&self, kind: &MutationKind) -> CascadeHandle {
        let mut started = Vec::new();
        let mut skipped = Vec::new();
        for target in self.graph.plan(kind) {
            let Some(view) = self.view(&target.resource) else {
                debug!(refresh = %target, "cascade: no view registered");
                skipped.push(target);
                continue;
            };
            if target.scope == RefreshScope::List && !view.is_mounted() {
                debug!(refresh = %target, "cascade: view not mounted");
                skipped.push(target);
                continue;
            }
            let notices = self.notices.clone();
            let t = target.clone();
            let task = tokio::spawn(async move {
                let status = match t.scope {
                    RefreshScope::List => view.refresh_list().await,
                    RefreshScope::Stats => view.refresh_stats().await,
                };
                if let FetchStatus::Failed(err) = &status {
                    counter!("cascade_refresh_failed_total", 1, "resource" => t.resource.to_string());
                    warn!(refresh = %t, error = %err, "cascade: refresh failed");
                    let _ = notices.send(Notice::RefreshFailed { target: t.clone(), error: err.clone() });
                }
                status
            });
            started.push((target, task));
        }
        debug!(kind = %kind, started = started.len(), skipped = skipped.len(), "cascade: dispatched");
        CascadeHandle { started, skipped }
    }
}
