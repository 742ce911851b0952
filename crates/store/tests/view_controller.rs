#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use tabula_core::{ErrorKind, FetchMode, FilterValue, Filters, PageResult, QuerySpec, ResourceName, Stats};
use tabula_source::{DataSource, MemoryBackend, Record, RecordId, SourceResult};
use tabula_store::{FetchStatus, Refreshable, ViewController};
use tokio::sync::{mpsc, oneshot};

type Reply = oneshot::Sender<SourceResult<PageResult<Record>>>;

/// Source whose page responses are released by the test, in any order.
struct Scripted {
    requests: mpsc::UnboundedSender<(QuerySpec, Reply)>,
    stats: Mutex<Stats>,
}

impl Scripted {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(QuerySpec, Reply)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { requests: tx, stats: Mutex::new(Stats::new()) }), rx)
    }
}

#[async_trait::async_trait]
impl DataSource<Record> for Scripted {
    async fn fetch_page(&self, _resource: &ResourceName, query: &QuerySpec) -> SourceResult<PageResult<Record>> {
        let (tx, rx) = oneshot::channel();
        self.requests.send((query.clone(), tx)).map_err(|_| ErrorKind::transport("script closed"))?;
        rx.await.map_err(|_| ErrorKind::transport("reply dropped"))?
    }

    async fn fetch_stats(&self, _resource: &ResourceName, _filters: Option<&Filters>) -> SourceResult<Stats> {
        Ok(self.stats.lock().unwrap().clone())
    }
}

fn page(ids: &[i64], total: u64, q: &QuerySpec) -> PageResult<Record> {
    PageResult {
        items: ids.iter().map(|i| Record::new(*i).with("email", format!("u{}@x.io", i))).collect(),
        total_count: total,
        server_page: q.page(),
        server_page_size: q.page_size(),
    }
}

fn ids(view: &ViewController<Record>) -> Vec<RecordId> {
    view.current().items.iter().map(|r| r.id.clone()).collect()
}

fn int_ids(v: &[i64]) -> Vec<RecordId> { v.iter().map(|i| RecordId::Int(*i)).collect() }

fn spawn_apply(view: &Arc<ViewController<Record>>, q: QuerySpec) -> tokio::task::JoinHandle<FetchStatus> {
    let v = Arc::clone(view);
    tokio::spawn(async move { v.apply_query(q).await })
}

#[tokio::test]
async fn late_response_for_older_query_is_ignored() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::USERS, src));
    let q1 = QuerySpec::new(10).with_search(Some("a"));
    let q2 = QuerySpec::new(10).with_search(Some("ab"));

    let t1 = spawn_apply(&view, q1.clone());
    let (_, reply1) = reqs.recv().await.unwrap();
    let t2 = spawn_apply(&view, q2.clone());
    let (_, reply2) = reqs.recv().await.unwrap();

    let _ = reply2.send(Ok(page(&[1, 2], 2, &q2)));
    assert_eq!(t2.await.unwrap(), FetchStatus::Applied);
    let _ = reply1.send(Ok(page(&[7, 8, 9], 3, &q1)));
    assert_eq!(t1.await.unwrap(), FetchStatus::Superseded);

    let cur = view.current();
    assert_eq!(cur.last_applied_query.as_ref(), Some(&q2));
    assert_eq!(cur.last_sequence_served, 2);
    assert_eq!(ids(&view), int_ids(&[1, 2]));
    assert!(!cur.loading);
}

#[tokio::test]
async fn new_query_class_clears_rows_while_loading() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::PENDING, src));
    let qa = QuerySpec::new(2);
    let t = spawn_apply(&view, qa.clone());
    let (_, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[1, 2], 4, &qa)));
    t.await.unwrap();
    assert_eq!(view.current().len(), 2);

    let qb = qa.with_filter("status", Some(FilterValue::parse("pending")));
    let t = spawn_apply(&view, qb.clone());
    let (sent, r) = reqs.recv().await.unwrap();
    assert_eq!(sent.page(), 1);
    let cur = view.current();
    assert!(cur.loading);
    assert!(cur.items.is_empty());
    assert_eq!(cur.total_count, 0);

    let _ = r.send(Ok(page(&[3], 1, &qb)));
    assert!(t.await.unwrap().is_applied());
    assert_eq!(ids(&view), int_ids(&[3]));
    assert!(!view.current().has_more());
}

#[tokio::test]
async fn load_more_dedups_server_overlap() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::SUBSCRIPTIONS, src));
    let q = QuerySpec::new(2);
    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.mount(QuerySpec::new(2)).await });
    let (_, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[1, 2], 5, &q)));
    t.await.unwrap();

    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.load_more().await });
    let (sent, r) = reqs.recv().await.unwrap();
    assert_eq!(sent.page(), 2);
    assert!(view.current().loading_more);
    assert_eq!(view.load_more().await, FetchStatus::Skipped);
    let _ = r.send(Ok(page(&[2, 3], 5, &sent)));
    assert_eq!(t.await.unwrap(), FetchStatus::Applied);

    let cur = view.current();
    assert_eq!(ids(&view), int_ids(&[1, 2, 3]));
    assert_eq!(cur.total_count, 5);
    assert!(cur.has_more());
    assert!(!cur.loading_more);
}

#[tokio::test]
async fn append_for_a_different_class_is_dropped() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::USERS, src));
    let q = QuerySpec::new(2);
    let t = spawn_apply(&view, q.clone());
    let (_, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[1, 2], 6, &q)));
    t.await.unwrap();

    let other = q.with_search(Some("zz")).next_page();
    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.issue(other, FetchMode::Append).await });
    let (sent, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[40, 41], 9, &sent)));
    assert_eq!(t.await.unwrap(), FetchStatus::Superseded);
    assert_eq!(ids(&view), int_ids(&[1, 2]));
    assert_eq!(view.current().total_count, 6);
    assert!(!view.current().loading_more);
}

#[tokio::test]
async fn total_below_loaded_rows_is_clamped() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::USERS, src));
    let q = QuerySpec::new(3);
    let t = spawn_apply(&view, q.clone());
    let (_, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[1, 2, 3], 1, &q)));
    t.await.unwrap();
    assert_eq!(view.current().total_count, 3);
    assert!(!view.current().has_more());
}

#[tokio::test]
async fn unmount_discards_in_flight_response() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::LEGACY, src));
    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.mount(QuerySpec::new(5)).await });
    let (q, r) = reqs.recv().await.unwrap();
    view.unmount();
    let _ = r.send(Ok(page(&[1], 1, &q)));
    assert_eq!(t.await.unwrap(), FetchStatus::Superseded);
    assert!(view.current().is_empty());
    assert!(!view.is_mounted());
    assert_eq!(view.refresh().await, FetchStatus::Skipped);
}

fn seeded() -> Arc<MemoryBackend> {
    let be = MemoryBackend::console();
    be.insert(
        ResourceName::PENDING,
        (1..=4).map(|i| Record::new(i).with("status", "pending").with("email", format!("p{}@x.io", i))),
    );
    Arc::new(be)
}

#[tokio::test]
async fn shape_error_on_reset_empties_the_view() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    assert!(view.mount(QuerySpec::new(10)).await.is_applied());
    assert_eq!(view.current().len(), 4);

    be.fail_next(ResourceName::PENDING, ErrorKind::shape("missing total_count"));
    let st = view.refresh().await;
    assert!(matches!(st.error(), Some(ErrorKind::Shape(_))));
    let cur = view.current();
    assert!(cur.items.is_empty());
    assert_eq!(cur.total_count, 0);
    assert!(cur.error.is_some());
    assert!(!cur.loading);
}

#[tokio::test]
async fn transport_error_keeps_rows_and_retry_recovers() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    view.mount(QuerySpec::new(10)).await;

    be.fail_next(ResourceName::PENDING, ErrorKind::transport("connection reset"));
    let st = view.refresh().await;
    assert!(st.error().map_or(false, ErrorKind::is_retryable));
    assert_eq!(view.current().len(), 4);
    assert!(view.current().error.is_some());

    assert!(view.refresh().await.is_applied());
    assert!(view.current().error.is_none());
}

#[tokio::test]
async fn load_more_is_a_noop_once_everything_is_loaded() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    view.mount(QuerySpec::new(3)).await;
    assert!(view.current().has_more());
    assert!(view.load_more().await.is_applied());
    assert_eq!(view.current().len(), 4);
    be.take_calls();
    assert_eq!(view.load_more().await, FetchStatus::Skipped);
    assert!(be.calls().is_empty());
}

#[tokio::test]
async fn forget_removes_row_optimistically() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    view.mount(QuerySpec::new(10)).await;
    assert!(view.forget("2"));
    assert!(!view.forget("2"));
    assert_eq!(ids(&view), int_ids(&[1, 3, 4]));
    assert_eq!(view.current().total_count, 3);
}

#[tokio::test]
async fn stats_are_fetched_separately_from_the_list() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    assert!(!view.stats().is_loaded());
    assert!(view.refresh_stats().await.is_applied());
    let stats = view.stats();
    assert_eq!(stats.get("pending"), Some(4));
    assert_eq!(stats.get("total_all"), Some(4));
    assert!(view.current().is_empty());

    be.fail_next(ResourceName::PENDING, ErrorKind::transport("timeout"));
    assert!(view.refresh_stats().await.error().is_some());
    assert_eq!(view.stats().get("pending"), Some(4));
    assert_eq!(view.stats().generation, 1);
}

#[tokio::test]
async fn followed_query_stream_settles_on_newest() {
    let be = seeded();
    let view = Arc::new(ViewController::new(ResourceName::PENDING, be.clone()));
    view.mount(QuerySpec::new(10)).await;
    let mut version = view.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();
    let follower = view.follow(rx);
    tx.send(QuerySpec::new(10).with_search(Some("p3"))).unwrap();
    drop(tx);
    follower.await.unwrap();
    while view.current().is_busy() || view.current().last_applied_query.as_ref().and_then(|q| q.search()) != Some("p3") {
        version.changed().await.unwrap();
    }
    assert_eq!(ids(&view), int_ids(&[3]));
}

#[tokio::test]
async fn append_that_skips_a_page_is_dropped() {
    let (src, mut reqs) = Scripted::new();
    let view = Arc::new(ViewController::new(ResourceName::USERS, src));
    let q = QuerySpec::new(2);
    let t = spawn_apply(&view, q.clone());
    let (_, r) = reqs.recv().await.unwrap();
    let _ = r.send(Ok(page(&[1, 2], 6, &q)));
    t.await.unwrap();

    let third = q.next_page().next_page();
    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.issue(third, FetchMode::Append).await });
    let (sent, r) = reqs.recv().await.unwrap();
    assert_eq!(sent.page(), 3);
    let _ = r.send(Ok(page(&[5, 6], 6, &sent)));
    assert_eq!(t.await.unwrap(), FetchStatus::Superseded);
    assert_eq!(ids(&view), int_ids(&[1, 2]));
    assert!(!view.current().loading_more);

    let v = Arc::clone(&view);
    let t = tokio::spawn(async move { v.load_more().await });
    let (sent, r) = reqs.recv().await.unwrap();
    assert_eq!(sent.page(), 2);
    let _ = r.send(Ok(page(&[3, 4], 6, &sent)));
    assert!(t.await.unwrap().is_applied());
    assert_eq!(ids(&view), int_ids(&[1, 2, 3, 4]));
    assert_eq!(view.current().last_applied_query.as_ref().map(QuerySpec::page), Some(2));
}

#[tokio::test]
async fn shape_error_on_load_more_empties_the_view() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    assert!(view.mount(QuerySpec::new(2)).await.is_applied());
    assert_eq!(view.current().len(), 2);

    be.fail_next(ResourceName::PENDING, ErrorKind::shape("bad body"));
    let st = view.load_more().await;
    assert!(matches!(st.error(), Some(ErrorKind::Shape(_))));
    let cur = view.current();
    assert!(cur.items.is_empty());
    assert_eq!(cur.total_count, 0);
    assert!(cur.last_applied_query.is_none());
    assert!(matches!(cur.error, Some(ErrorKind::Shape(_))));
    assert!(!cur.loading_more);
    assert_eq!(view.load_more().await, FetchStatus::Skipped);

    assert!(view.refresh().await.is_applied());
    assert_eq!(ids(&view), int_ids(&[1, 2]));
    assert!(view.current().error.is_none());
}

#[tokio::test]
async fn filtered_stats_count_only_matching_rows() {
    let be = MemoryBackend::console();
    be.insert(
        ResourceName::PENDING,
        (1..=5).map(|i| Record::new(i).with("status", if i <= 3 { "pending" } else { "complete" })),
    );
    let be = Arc::new(be);
    let only_pending = QuerySpec::new(10).with_filter("status", Some(FilterValue::parse("pending")));

    let filtered = ViewController::new(ResourceName::PENDING, be.clone()).with_filtered_stats();
    assert!(filtered.mount(only_pending.clone()).await.is_applied());
    assert!(filtered.refresh_stats().await.is_applied());
    let stats = filtered.stats();
    assert_eq!(stats.get("pending"), Some(3));
    assert_eq!(stats.get("complete"), Some(0));
    assert_eq!(stats.get("total_all"), Some(3));

    let badges = ViewController::new(ResourceName::PENDING, be.clone());
    assert!(badges.mount(only_pending).await.is_applied());
    assert!(badges.refresh_stats().await.is_applied());
    assert_eq!(badges.stats().get("complete"), Some(2));
    assert_eq!(badges.stats().get("total_all"), Some(5));
}

#[tokio::test]
async fn identical_refresh_leaves_the_view_unchanged() {
    let be = seeded();
    let view = ViewController::new(ResourceName::PENDING, be.clone());
    assert!(view.mount(QuerySpec::new(10)).await.is_applied());
    let before = view.current();

    assert!(view.refresh().await.is_applied());
    let after = view.current();
    assert_eq!(after.items, before.items);
    assert_eq!(after.total_count, before.total_count);
    assert_eq!(after.last_applied_query, before.last_applied_query);
    assert!(after.error.is_none());
    assert_eq!(after.last_sequence_served, before.last_sequence_served + 1);
}
