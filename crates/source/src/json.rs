//! JSON adapter: turns a raw request/response transport into a typed
//! [`DataSource`] + [`MutationSink`], validating every body on the way in.

#![forbid(unsafe_code)]

use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tabula_core::{ErrorKind, Filters, MutationKind, MutationRequest, PageResult, QuerySpec, ResourceName, Stats, WriteResult};
use tracing::{debug, info};

use crate::shape::{validate_bulk, validate_page, validate_stats, ResponseShape};
use crate::{DataSource, MutationSink, SourceResult};

/// Raw transport, e.g. an authenticated HTTP client. Timeouts and auth are its business.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, params: &[(String, String)]) -> SourceResult<Value>;
    async fn post(&self, path: &str, body: &Value) -> SourceResult<Value>;
}

/// Where a resource's list and stats live.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub list_path: String,
    /// Without a stats path, stats are derived from a `page_size=1` list query
    /// and reported as `{ "total": n }`.
    pub stats_path: Option<String>,
    pub shape: ResponseShape,
}

#[derive(Debug, Clone)]
pub struct MutationRoute {
    pub path: String,
    pub bulk: bool,
}

pub struct JsonSource<T> {
    transport: T,
    endpoints: FxHashMap<ResourceName, Endpoint>,
    routes: FxHashMap<MutationKind, MutationRoute>,
}

impl<T: Transport> JsonSource<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, endpoints: FxHashMap::default(), routes: FxHashMap::default() }
    }

    pub fn endpoint(mut self, resource: ResourceName, endpoint: Endpoint) -> Self {
        self.endpoints.insert(resource, endpoint);
        self
    }

    pub fn route(mut self, kind: MutationKind, route: MutationRoute) -> Self {
        self.routes.insert(kind, route);
        self
    }

    fn endpoint_for(&self, resource: &ResourceName) -> SourceResult<&Endpoint> {
        self.endpoints
            .get(resource)
            .ok_or_else(|| ErrorKind::validation(format!("no endpoint configured for {}", resource)))
    }
}

#[async_trait::async_trait]
impl<T, I> DataSource<I> for JsonSource<T>
where
    T: Transport,
    I: DeserializeOwned + Send + 'static,
{
    async fn fetch_page(&self, resource: &ResourceName, query: &QuerySpec) -> SourceResult<PageResult<I>> {
        let ep = self.endpoint_for(resource)?;
        let t0 = Instant::now();
        let raw = self.transport.get(&ep.list_path, &query.to_params()).await?;
        let page = validate_page(&raw, ep.shape, query)?;
        debug!(resource = %resource, page = query.page(), items = page.items.len(), total = page.total_count, took_ms = %t0.elapsed().as_millis(), "source: page ok");
        Ok(page)
    }

    async fn fetch_stats(&self, resource: &ResourceName, filters: Option<&Filters>) -> SourceResult<Stats> {
        let ep = self.endpoint_for(resource)?;
        let params: Vec<(String, String)> = filters
            .map(|f| f.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
            .unwrap_or_default();
        match &ep.stats_path {
            Some(path) => validate_stats(&self.transport.get(path, &params).await?),
            None => {
                let mut q = QuerySpec::new(1);
                if let Some(f) = filters { q = q.with_filters(f.clone()); }
                let raw = self.transport.get(&ep.list_path, &q.to_params()).await?;
                let page: PageResult<Value> = validate_page(&raw, ep.shape, &q)?;
                Ok(Stats::from([("total".to_string(), page.total_count)]))
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> MutationSink for JsonSource<T> {
    async fn mutate(&self, request: &MutationRequest) -> SourceResult<WriteResult> {
        let route = self
            .routes
            .get(&request.kind)
            .ok_or_else(|| ErrorKind::validation(format!("no route for mutation {}", request.kind)))?;
        let body = serde_json::json!({ "target": request.target, "payload": request.payload });
        let t0 = Instant::now();
        let raw = self.transport.post(&route.path, &body).await?;
        let res = if route.bulk { WriteResult::Bulk(validate_bulk(&raw)?) } else { WriteResult::Applied };
        info!(kind = %request.kind, took_ms = %t0.elapsed().as_millis(), summary = %res.summary(), "source: mutation ok");
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Row { id: u32 }

    #[derive(Default)]
    struct FakeTransport {
        gets: Mutex<Vec<(String, Vec<(String, String)>)>>,
        reply: Value,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, path: &str, params: &[(String, String)]) -> SourceResult<Value> {
            self.gets.lock().unwrap().push((path.to_string(), params.to_vec()));
            Ok(self.reply.clone())
        }
        async fn post(&self, _path: &str, _body: &Value) -> SourceResult<Value> { Ok(self.reply.clone()) }
    }

    fn source(reply: Value) -> JsonSource<FakeTransport> {
        JsonSource::new(FakeTransport { reply, ..Default::default() })
            .endpoint(ResourceName::USERS, Endpoint { list_path: "/users".into(), stats_path: None, shape: ResponseShape::DataTotalCount })
            .route(MutationKind::BULK_PROCESS_PENDING, MutationRoute { path: "/pending/bulk".into(), bulk: true })
    }

    #[tokio::test]
    async fn page_passes_query_params() {
        let src = source(json!({ "data": [{ "id": 9 }], "total_count": 1 }));
        let q = QuerySpec::new(10).with_search(Some("ann"));
        let page = DataSource::<Row>::fetch_page(&src, &ResourceName::USERS, &q).await.unwrap();
        assert_eq!(page.items[0].id, 9);
        let gets = src.transport.gets.lock().unwrap();
        assert_eq!(gets[0].0, "/users");
        assert!(gets[0].1.contains(&("search".to_string(), "ann".to_string())));
    }

    #[tokio::test]
    async fn stats_fall_back_to_single_row_query() {
        let src = source(json!({ "data": [{ "id": 1 }], "total_count": 42 }));
        let stats = DataSource::<Row>::fetch_stats(&src, &ResourceName::USERS, None).await.unwrap();
        assert_eq!(stats["total"], 42);
        let gets = src.transport.gets.lock().unwrap();
        assert!(gets[0].1.contains(&("page_size".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn unknown_resource_and_route_are_validation_errors() {
        let src = source(json!({}));
        let err = DataSource::<Row>::fetch_page(&src, &ResourceName::LEGACY, &QuerySpec::new(1)).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Validation(_)));
        let err = src.mutate(&MutationRequest::new(MutationKind::DELETE_USER)).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Validation(_)));
    }

    #[tokio::test]
    async fn bulk_route_parses_results() {
        let src = source(json!({ "results": [{ "id": 1, "success": true }, { "id": 2, "success": false, "error": "nope" }] }));
        let res = src.mutate(&MutationRequest::new(MutationKind::BULK_PROCESS_PENDING)).await.unwrap();
        assert_eq!(res.bulk().map(|b| b.failures.len()), Some(1));
    }
}
