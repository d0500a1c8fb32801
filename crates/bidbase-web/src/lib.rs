//! Axum JSON API over the tender store: list, detail, filter stats, cron trigger and upstream proxy.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bidbase_core::ocds::Release;
use bidbase_core::{FilterStats, Tender, TenderDocument, TenderSearchParams};
use bidbase_ocds::OcdsClient;
use bidbase_storage::TenderStore;
use bidbase_sync::{SyncPipeline, CRON_PAGE_SIZE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

mod error;
pub mod params;

pub use error::ApiError;
pub use params::{parse_search_query, to_query_string, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

pub const DEFAULT_WEB_PORT: u16 = 3000;

const NOTHING_TO_SYNC: &str = "No new tenders to sync.";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenderStore>,
    pub ocds: OcdsClient,
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub cron_secret: Option<String>,
    pub cron_page_size: u32,
}

impl AppState {
    pub fn new(store: Arc<dyn TenderStore>, ocds: OcdsClient) -> Self {
        Self {
            store,
            ocds,
            pipeline: None,
            cron_secret: None,
            cron_page_size: CRON_PAGE_SIZE,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>, page_size: u32) -> Self {
        self.pipeline = Some(pipeline);
        self.cron_page_size = page_size;
        self
    }

    pub fn with_cron_secret(mut self, secret: Option<String>) -> Self {
        self.cron_secret = secret.filter(|s| !s.is_empty());
        self
    }
}

/// A stored tender in the upstream release shape, plus the status the UI should show.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseView {
    #[serde(flatten)]
    pub release: Release,
    pub derived_status: String,
}

impl ReleaseView {
    pub fn new(tender: &Tender, documents: &[TenderDocument], now: DateTime<Utc>) -> Self {
        Self {
            release: tender.to_release(documents),
            derived_status: tender.derived_status(now).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageLinks {
    pub next: Option<String>,
    pub prev: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderListResponse {
    pub releases: Vec<ReleaseView>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub links: PageLinks,
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/tenders", get(list_tenders_handler))
        .route("/tenders/filter-stats", get(filter_stats_handler))
        .route("/tenders/{ocid}", get(tender_detail_handler))
        .route("/cron/sync-tenders", get(cron_sync_handler))
        .route("/ocds/releases", get(proxy_releases_handler))
        .route("/ocds/releases/{ocid}", get(proxy_release_detail_handler))
        .layer(cors);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api", api)
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, store = state.store.backend(), "serving tender api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn page_link(params: &TenderSearchParams, page: u32) -> String {
    let mut target = params.clone();
    target.page = page;
    format!("/api/tenders?{}", to_query_string(&target))
}

async fn list_tenders_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<TenderListResponse>, ApiError> {
    let params = parse_search_query(query.as_deref())?;
    let now = Utc::now();
    let page = state.store.search_tenders(&params, now).await?;

    let shown = params.offset() + page.tenders.len() as u64;
    let links = PageLinks {
        next: (shown < page.total_count).then(|| page_link(&params, params.page + 1)),
        prev: (params.page > 1).then(|| page_link(&params, params.page - 1)),
    };

    Ok(Json(TenderListResponse {
        releases: page
            .tenders
            .iter()
            .map(|t| ReleaseView::new(t, &[], now))
            .collect(),
        total_count: page.total_count,
        page: page.current_page,
        page_size: params.limit,
        links,
    }))
}

async fn filter_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FilterStats>, ApiError> {
    Ok(Json(state.store.filter_stats(Utc::now()).await?))
}

async fn tender_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(ocid): AxumPath<String>,
) -> Result<Json<ReleaseView>, ApiError> {
    let tender = state
        .store
        .get_tender(&ocid)
        .await?
        .ok_or(ApiError::NotFound("Tender not found"))?;
    let documents = state.store.tender_documents(&ocid).await?;
    Ok(Json(ReleaseView::new(&tender, &documents, Utc::now())))
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret)
}

async fn cron_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.cron_secret.as_deref()) {
        return ApiError::Unauthorized.into_response();
    }
    let Some(pipeline) = state.pipeline.as_ref() else {
        return cron_failure("sync pipeline is not configured".to_string());
    };

    match pipeline
        .run_cron(Utc::now().date_naive(), state.cron_page_size)
        .await
    {
        Ok(summary) if summary.fetched_releases == 0 => Json(serde_json::json!({
            "success": true,
            "message": NOTHING_TO_SYNC,
            "synced": 0,
            "runId": summary.run_id,
        }))
        .into_response(),
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "synced": summary.processed_releases,
            "runId": summary.run_id,
            "skipped": summary.skipped_releases,
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "cron sync failed");
            cron_failure(err.to_string())
        }
    }
}

fn cron_failure(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

async fn proxy_releases_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.ocds.proxy_releases_json(query.as_deref()).await {
        Ok(body) => Ok(Json(body)),
        Err(err) => {
            error!(error = %err, "proxying release list failed");
            Err(ApiError::Upstream("Failed to fetch tenders"))
        }
    }
}

async fn proxy_release_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(ocid): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.ocds.fetch_release_json(&ocid).await {
        Ok(body) => Ok(Json(body)),
        Err(err) => {
            error!(error = %err, ocid, "proxying release detail failed");
            Err(ApiError::Upstream("Failed to fetch tender detail"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bidbase_core::ocds::{OcdsDocument, OcdsTender};
    use bidbase_core::{NewTender, NewTenderDocument, ProcuringEntity, TenderValue};
    use bidbase_ocds::{OcdsClientConfig, StaticReleaseSource};
    use bidbase_storage::MemoryTenderStore;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use std::time::Duration as StdDuration;
    use tower::ServiceExt;

    fn tender(ocid: &str, title: &str, entity: &str, closes_in_days: i64) -> NewTender {
        NewTender {
            ocid: ocid.into(),
            id: None,
            title: title.into(),
            description: None,
            procurement_method: Some("open".into()),
            procurement_method_details: Some("Request for Bid".into()),
            main_procurement_category: Some("works".into()),
            published_date: Some(Utc::now() - Duration::days(2)),
            start_date: None,
            end_date: Some(Utc::now() + Duration::days(closes_in_days)),
            procuring_entity: Some(ProcuringEntity {
                id: None,
                name: Some(entity.into()),
            }),
            value: Some(TenderValue {
                amount: Some(1000.0),
                currency: Some("ZAR".into()),
            }),
        }
    }

    // Port 9 (discard) is closed on test hosts, so proxy calls fail fast.
    fn offline_client() -> OcdsClient {
        OcdsClient::new(OcdsClientConfig {
            base_url: "http://127.0.0.1:9/api/OCDSReleases".into(),
            timeout: StdDuration::from_secs(2),
            user_agent: None,
        })
        .unwrap()
    }

    async fn seeded_store() -> Arc<MemoryTenderStore> {
        let store = Arc::new(MemoryTenderStore::new());
        store
            .upsert_tenders(&[
                tender("ocds-a", "Road resurfacing", "City of X", 10),
                tender("ocds-b", "IT support", "City of X", 5),
                tender("ocds-c", "Water pipes", "City of Y", -5),
            ])
            .await
            .unwrap();
        store
            .upsert_documents(&[NewTenderDocument {
                tender_ocid: "ocds-a".into(),
                document_id: "doc-1".into(),
                title: Some("Specification".into()),
                description: None,
                url: Some("https://example.test/spec.pdf".into()),
                format: Some("application/pdf".into()),
                date_published: None,
                date_modified: None,
            }])
            .await
            .unwrap();
        store
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_is_plain_ok() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn list_defaults_to_active_tenders() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let (status, json) = get(app, "/api/tenders?pageSize=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["totalCount"], 2);
        assert_eq!(json["page"], 1);
        assert_eq!(json["pageSize"], 1);
        assert_eq!(json["releases"].as_array().unwrap().len(), 1);
        assert_eq!(json["releases"][0]["derivedStatus"], "active");
        assert!(json["links"]["next"].as_str().unwrap().contains("page=2"));
        assert!(json["links"]["prev"].is_null());
    }

    #[tokio::test]
    async fn list_applies_repeated_filters() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let (status, json) = get(
            app,
            "/api/tenders?status=all&procuringEntity=city%20of%20y&procuringEntity=nowhere",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["totalCount"], 1);
        assert_eq!(json["releases"][0]["ocid"], "ocds-c");
        assert_eq!(json["releases"][0]["derivedStatus"], "closed");
        assert_eq!(
            json["releases"][0]["tender"]["procuringEntity"]["name"],
            "City of Y"
        );
    }

    #[tokio::test]
    async fn list_rejects_malformed_numbers() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let (status, json) = get(app, "/api/tenders?valueMin=cheap").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("valueMin"));
    }

    #[tokio::test]
    async fn filter_stats_cover_the_whole_table() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let (status, json) = get(app, "/api/tenders/filter-stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["totalCount"], 3);
        assert_eq!(json["activeCount"], 2);
        assert_eq!(json["closedCount"], 1);
        assert_eq!(json["procuringEntities"][0]["value"], "City of X");
        assert_eq!(json["procuringEntities"][0]["count"], 2);
        assert_eq!(json["procurementMethods"][0]["label"], "Request for Bid");
    }

    #[tokio::test]
    async fn detail_includes_documents_or_404s() {
        let state = AppState::new(seeded_store().await, offline_client());
        let (status, json) = get(app(state.clone()), "/api/tenders/ocds-a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tender"]["title"], "Road resurfacing");
        assert_eq!(json["tender"]["documents"][0]["id"], "doc-1");

        let (status, json) = get(app(state), "/api/tenders/ocds-missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, serde_json::json!({ "error": "Tender not found" }));
    }

    #[tokio::test]
    async fn cron_route_requires_secret_and_runs_sync() {
        let store = Arc::new(MemoryTenderStore::new());
        let release = Release {
            ocid: Some("ocds-cron".into()),
            tender: Some(OcdsTender {
                title: Some("Cron tender".into()),
                documents: vec![OcdsDocument {
                    id: Some("d".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let pipeline = Arc::new(SyncPipeline::new(
            store.clone(),
            Arc::new(StaticReleaseSource::new("cron-test", vec![release])),
        ));
        let state = AppState::new(store.clone(), offline_client())
            .with_pipeline(pipeline, 50)
            .with_cron_secret(Some("s3cret".into()));

        let (status, _) = get(app(state.clone()), "/api/cron/sync-tenders").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let resp = app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/cron/sync-tenders")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["synced"], 1);
        assert!(json.get("message").is_none());
        assert!(store.get_tender("ocds-cron").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cron_route_reports_empty_window() {
        let store = Arc::new(MemoryTenderStore::new());
        let pipeline = Arc::new(SyncPipeline::new(
            store.clone(),
            Arc::new(StaticReleaseSource::new("empty", Vec::new())),
        ));
        let state = AppState::new(store, offline_client()).with_pipeline(pipeline, 50);

        let (status, json) = get(app(state), "/api/cron/sync-tenders").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "No new tenders to sync.");
        assert_eq!(json["synced"], 0);
    }

    #[tokio::test]
    async fn cron_without_pipeline_reports_failure() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let (status, json) = get(app, "/api/cron/sync-tenders").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn proxy_failures_use_fixed_messages() {
        let state = AppState::new(seeded_store().await, offline_client());
        let (status, json) = get(app(state.clone()), "/api/ocds/releases?PageSize=5").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Failed to fetch tenders");

        let (status, json) = get(app(state), "/api/ocds/releases/ocds-a").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Failed to fetch tender detail");
    }

    #[tokio::test]
    async fn api_routes_answer_cors_preflight() {
        let app = app(AppState::new(seeded_store().await, offline_client()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/tenders")
                    .header(header::ORIGIN, "https://ui.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
