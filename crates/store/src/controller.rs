//! ViewController: exclusive owner of one resource's view and stats.
//!
//! UI code only reads snapshots ([`ViewController::current`]) and asks for
//! changes through the methods here. Every fetch goes through the resource's
//! [`FetchExecutor`], so the visible state always reflects the most recently
//! issued query once its response arrives, and never regresses to an older one.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use tabula_core::{ErrorKind, FetchMode, Identified, QuerySpec, ResourceName};
use tabula_source::DataSource;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::{Acceptance, FetchExecutor};
use crate::merge::merge;
use crate::stats::StatsState;
use crate::view::ViewState;

/// What happened to one fetch, from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStatus {
    Applied,
    /// A newer request was issued before this one answered; nothing changed.
    Superseded,
    /// Nothing to do (not mounted, no more rows, already loading).
    Skipped,
    Failed(ErrorKind),
}

impl FetchStatus {
    pub fn is_applied(&self) -> bool { matches!(self, Self::Applied) }

    pub fn error(&self) -> Option<&ErrorKind> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Type-erased refresh surface, used by the mutation coordinator to reach
/// dependent resources without knowing their item types.
#[async_trait::async_trait]
pub trait Refreshable: Send + Sync {
    fn resource(&self) -> &ResourceName;
    fn is_mounted(&self) -> bool;
    /// Re-issue a reset for the current query (page 1).
    async fn refresh_list(&self) -> FetchStatus;
    async fn refresh_stats(&self) -> FetchStatus;
    /// Drop a row by its rendered identity. Returns whether a row was removed.
    fn forget(&self, id: &str) -> bool;
}

struct Inner {
    executor: FetchExecutor,
    stats_executor: FetchExecutor,
    mounted: bool,
    /// Page-1 form of the newest query class requested.
    desired: Option<QuerySpec>,
}

pub struct ViewController<I> {
    resource: ResourceName,
    source: Arc<dyn DataSource<I>>,
    view: ArcSwap<ViewState<I>>,
    stats: ArcSwap<StatsState>,
    inner: Mutex<Inner>,
    filtered_stats: bool,
    version: watch::Sender<u64>,
}

impl<I> ViewController<I>
where
    I: Identified + Clone + Send + Sync + 'static,
{
    pub fn new(resource: ResourceName, source: Arc<dyn DataSource<I>>) -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            resource,
            source,
            view: ArcSwap::from_pointee(ViewState::empty()),
            stats: ArcSwap::from_pointee(StatsState::default()),
            inner: Mutex::new(Inner {
                executor: FetchExecutor::new(),
                stats_executor: FetchExecutor::new(),
                mounted: false,
                desired: None,
            }),
            filtered_stats: false,
            version,
        }
    }

    /// Pass the view's current filters to stats fetches (default: unfiltered badges).
    pub fn with_filtered_stats(mut self) -> Self {
        self.filtered_stats = true;
        self
    }

    pub fn resource(&self) -> &ResourceName { &self.resource }

    pub fn current(&self) -> Arc<ViewState<I>> { self.view.load_full() }

    pub fn stats(&self) -> Arc<StatsState> { self.stats.load_full() }

    /// Ticks whenever the view or stats snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.version.subscribe() }

    /// Query the next reset would use, if any.
    pub fn query(&self) -> Option<QuerySpec> { self.lock().desired.clone() }

    pub fn is_mounted(&self) -> bool { self.lock().mounted }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, next: ViewState<I>) {
        self.view.store(Arc::new(next));
        self.version.send_modify(|v| *v += 1);
    }

    fn publish_stats(&self, next: StatsState) {
        self.stats.store(Arc::new(next));
        self.version.send_modify(|v| *v += 1);
    }

    /// View became visible: start from `query` on page 1.
    pub async fn mount(&self, query: QuerySpec) -> FetchStatus {
        self.lock().mounted = true;
        info!(resource = %self.resource, "view: mounted");
        self.issue(query.first_page(), FetchMode::Reset).await
    }

    /// View went away: tear the state down and ignore anything still in flight.
    pub fn unmount(&self) {
        let mut inner = self.lock();
        inner.mounted = false;
        inner.desired = None;
        inner.executor.invalidate();
        self.publish(ViewState::empty());
        info!(resource = %self.resource, "view: unmounted");
    }

    /// New filters/search/sort/page size: always a reset on page 1.
    pub async fn apply_query(&self, query: QuerySpec) -> FetchStatus {
        self.issue(query.first_page(), FetchMode::Reset).await
    }

    /// User-triggered retry, and the cascade entry point.
    pub async fn refresh(&self) -> FetchStatus {
        let Some(q) = self.query() else { return FetchStatus::Skipped; };
        self.issue(q, FetchMode::Reset).await
    }

    /// Fetch the next page of the applied query. No-op while anything is in
    /// flight or when every row is already loaded.
    pub async fn load_more(&self) -> FetchStatus {
        let next = {
            let inner = self.lock();
            if inner.executor.in_flight().is_some() { return FetchStatus::Skipped; }
            let cur = self.view.load();
            if !cur.has_more() { return FetchStatus::Skipped; }
            match &cur.last_applied_query {
                Some(q) => q.next_page(),
                None => return FetchStatus::Skipped,
            }
        };
        self.issue(next, FetchMode::Append).await
    }

    /// Issue one fetch and apply its response if it is still the newest.
    pub async fn issue(&self, query: QuerySpec, mode: FetchMode) -> FetchStatus {
        let handle = {
            let mut inner = self.lock();
            let handle = inner.executor.issue(query, mode);
            let mut next = (*self.view.load_full()).clone();
            match mode {
                FetchMode::Reset => {
                    inner.desired = Some(handle.query.first_page());
                    let class_changed = next
                        .last_applied_query
                        .as_ref()
                        .map_or(false, |q| !q.same_class(&handle.query));
                    if class_changed {
                        next.items.clear();
                        next.total_count = 0;
                        next.last_applied_query = None;
                    }
                    next.loading = true;
                    next.loading_more = false;
                }
                FetchMode::Append => next.loading_more = true,
            }
            next.error = None;
            self.publish(next);
            handle
        };
        counter!("fetch_issued_total", 1, "resource" => self.resource.to_string());
        debug!(resource = %self.resource, seq = handle.seq, mode = ?handle.mode, page = handle.query.page(), "view: fetch issued");

        let t0 = Instant::now();
        let res = self.source.fetch_page(&self.resource, &handle.query).await;
        histogram!("fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);

        let mut inner = self.lock();
        if let Acceptance::Superseded { newest } = inner.executor.complete(handle.seq) {
            counter!("fetch_superseded_total", 1, "resource" => self.resource.to_string());
            debug!(resource = %self.resource, seq = handle.seq, newest, "view: response superseded");
            return FetchStatus::Superseded;
        }
        let cur = self.view.load_full();
        match res {
            Ok(page) => {
                if handle.mode == FetchMode::Append
                    && !cur.last_applied_query.as_ref().map_or(false, |q| q.is_append_of(&handle.query))
                {
                    debug!(resource = %self.resource, seq = handle.seq, page = handle.query.page(), "view: append not following the applied page dropped");
                    let mut next = (*cur).clone();
                    next.loading_more = false;
                    self.publish(next);
                    return FetchStatus::Superseded;
                }
                let out = merge(&cur.items, page, handle.mode);
                if out.duplicates_dropped > 0 {
                    counter!("merge_duplicates_dropped_total", out.duplicates_dropped as u64);
                }
                let len = out.items.len() as u64;
                let mut total_count = out.total_count;
                if len > total_count {
                    warn!(resource = %self.resource, items = len, total = total_count, "view: server total below loaded rows; clamping");
                    total_count = len;
                }
                info!(resource = %self.resource, seq = handle.seq, mode = ?handle.mode, items = len, total = total_count, took_ms = %t0.elapsed().as_millis(), "view: page applied");
                self.publish(ViewState {
                    items: out.items,
                    total_count,
                    loading: false,
                    loading_more: false,
                    error: None,
                    last_applied_query: Some(handle.query),
                    last_sequence_served: handle.seq,
                });
                FetchStatus::Applied
            }
            Err(err) => {
                counter!("fetch_failed_total", 1, "kind" => err.label());
                warn!(resource = %self.resource, seq = handle.seq, error = %err, "view: fetch failed");
                let mut next = (*cur).clone();
                next.loading = false;
                next.loading_more = false;
                next.last_sequence_served = handle.seq;
                if matches!(err, ErrorKind::Shape(_)) {
                    next.items.clear();
                    next.total_count = 0;
                    next.last_applied_query = None;
                }
                next.error = Some(err.clone());
                self.publish(next);
                FetchStatus::Failed(err)
            }
        }
    }

    /// Optimistically drop a row after a successful write; the following
    /// refresh remains authoritative.
    pub fn remove_local(&self, id: &I::Id) -> bool {
        let _inner = self.lock();
        let cur = self.view.load_full();
        if !cur.items.iter().any(|it| &it.id() == id) { return false; }
        let mut next = (*cur).clone();
        next.items.retain(|it| &it.id() != id);
        next.total_count = next.total_count.saturating_sub(1);
        self.publish(next);
        true
    }

    /// Refresh the derived counters. Stats have their own sequence stream so a
    /// slow stats call never blocks or clobbers the list.
    pub async fn refresh_stats(&self) -> FetchStatus {
        let (seq, filters) = {
            let mut inner = self.lock();
            let q = inner.desired.clone().unwrap_or_default();
            let filters = if self.filtered_stats { Some(q.filters().clone()) } else { None };
            let h = inner.stats_executor.issue(q, FetchMode::Reset);
            let mut next = (*self.stats.load_full()).clone();
            next.loading = true;
            self.publish_stats(next);
            (h.seq, filters)
        };
        let res = self.source.fetch_stats(&self.resource, filters.as_ref()).await;
        let mut inner = self.lock();
        if let Acceptance::Superseded { .. } = inner.stats_executor.complete(seq) {
            debug!(resource = %self.resource, seq, "stats: response superseded");
            return FetchStatus::Superseded;
        }
        let mut next = (*self.stats.load_full()).clone();
        next.loading = false;
        match res {
            Ok(counters) => {
                debug!(resource = %self.resource, counters = ?counters, "stats: refreshed");
                next.counters = counters;
                next.error = None;
                next.generation += 1;
                self.publish_stats(next);
                FetchStatus::Applied
            }
            Err(err) => {
                warn!(resource = %self.resource, error = %err, "stats: fetch failed");
                next.error = Some(err.clone());
                self.publish_stats(next);
                FetchStatus::Failed(err)
            }
        }
    }

    /// Apply every QuerySpec arriving on `rx` as a reset. Each one is issued on
    /// its own task so a slow response never delays a newer query.
    pub fn follow(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<QuerySpec>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(q) = rx.recv().await {
                let view = Arc::clone(&me);
                tokio::spawn(async move { view.apply_query(q).await; });
            }
            debug!(resource = %me.resource, "view: query input closed");
        })
    }
}

#[async_trait::async_trait]
impl<I> Refreshable for ViewController<I>
where
    I: Identified + Clone + Send + Sync + 'static,
{
    fn resource(&self) -> &ResourceName { &self.resource }

    fn is_mounted(&self) -> bool { ViewController::is_mounted(self) }

    async fn refresh_list(&self) -> FetchStatus { self.refresh().await }

    async fn refresh_stats(&self) -> FetchStatus { ViewController::refresh_stats(self).await }

    fn forget(&self, id: &str) -> bool {
        let found = self.current().items.iter().map(|it| it.id()).find(|k| k.to_string() == id);
        match found {
            Some(k) => self.remove_local(&k),
            None => false,
        }
    }
}
