//! JSON admin API over the lead sync pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use leadsync_core::{lead_fields, FieldMapping, Form, FormRouting, LeadField, NewPage, Page, RecordId};
use leadsync_storage::StoreError;
use leadsync_sync::{SyncConfig, SyncError, SyncPipeline, SyncRunSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    Internal(anyhow::Error),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Sync(SyncError::Store(err))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Sync(SyncError::Store(StoreError::NotFound { .. })) => StatusCode::NOT_FOUND,
            ApiError::Sync(SyncError::Store(
                StoreError::DuplicateLead(_) | StoreError::DuplicateMapping { .. },
            )) => StatusCode::CONFLICT,
            ApiError::Sync(SyncError::Store(StoreError::UnknownLeadField(_))) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Sync(SyncError::Graph(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Sync(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Sync(err) => err.to_string(),
            ApiError::Internal(err) => format!("{err:#}"),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct AssignMapping {
    lead_field: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pages", get(list_pages_handler).post(create_page_handler))
        .route("/pages/{id}", delete(delete_page_handler))
        .route("/pages/{id}/discover-forms", post(discover_forms_handler))
        .route("/forms", get(list_forms_handler))
        .route("/forms/{id}", patch(form_routing_handler))
        .route("/forms/{id}/discover-fields", post(discover_fields_handler))
        .route("/forms/{id}/mappings", get(form_mappings_handler))
        .route("/mappings/{id}", put(assign_mapping_handler))
        .route("/lead-fields", get(lead_fields_handler))
        .route("/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin api listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

/// Serves the admin API on `LEADSYNC_WEB_PORT`, running the sync scheduler alongside
/// when it is enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let pipeline = Arc::new(SyncPipeline::connect(config).await?);
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started alongside admin api");
    }
    serve(pipeline, port).await
}

async fn health_handler() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn list_pages_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Page>> {
    Ok(Json(state.pipeline.store().list_pages().await?))
}

async fn create_page_handler(
    State(state): State<Arc<AppState>>,
    Json(page): Json<NewPage>,
) -> Result<(StatusCode, Json<Page>), ApiError> {
    let page = state.pipeline.store().create_page(page).await?;
    Ok((StatusCode::CREATED, Json(page)))
}

async fn delete_page_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> Result<StatusCode, ApiError> {
    state.pipeline.store().delete_page(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn discover_forms_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> ApiResult<Vec<Form>> {
    Ok(Json(state.pipeline.discover_forms(id).await?))
}

async fn list_forms_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Form>> {
    Ok(Json(state.pipeline.store().list_forms().await?))
}

async fn form_routing_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
    Json(routing): Json<FormRouting>,
) -> ApiResult<Form> {
    Ok(Json(
        state.pipeline.store().assign_form_routing(id, routing).await?,
    ))
}

async fn discover_fields_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> ApiResult<Vec<FieldMapping>> {
    Ok(Json(state.pipeline.discover_fields(id).await?))
}

async fn form_mappings_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> ApiResult<Vec<FieldMapping>> {
    let store = state.pipeline.store();
    store.get_form(id).await?;
    Ok(Json(store.mappings_for_form(id).await?))
}

async fn assign_mapping_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
    Json(body): Json<AssignMapping>,
) -> ApiResult<FieldMapping> {
    Ok(Json(
        state
            .pipeline
            .store()
            .assign_mapping(id, body.lead_field)
            .await?,
    ))
}

async fn lead_fields_handler() -> Json<&'static [LeadField]> {
    Json(lead_fields())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> ApiResult<SyncRunSummary> {
    Ok(Json(state.pipeline.run_once().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use leadsync_adapters::{FixtureGraph, Qualifier, RemoteForm};
    use leadsync_storage::{LeadStore, MemoryStore};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn graph() -> FixtureGraph {
        let lead = json!({
            "created_time": "2020-01-01T10:00:00+0000",
            "id": "123",
            "field_data": [{"name": "email", "values": ["jane@example.com"]}]
        });
        let JsonValue::Object(lead) = lead else {
            unreachable!()
        };
        FixtureGraph::new()
            .with_forms(
                "1029",
                vec![RemoteForm {
                    id: "f1".into(),
                    name: "Promo".into(),
                }],
            )
            .with_qualifiers(
                "f1",
                vec![Qualifier {
                    field_key: "email".into(),
                    label: "Email".into(),
                }],
            )
            .with_lead_pages("f1", vec![vec![lead]])
            .with_failure("broken", "Unsupported get request.")
    }

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(SyncConfig::default(), store.clone(), Arc::new(graph()));
        (app(AppState::new(Arc::new(pipeline))), store)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn pages_never_expose_access_tokens() {
        let (app, _) = test_app();
        let (status, created) = call(
            &app,
            "POST",
            "/pages",
            Some(json!({"name": "1029", "access_token": "secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(created.get("access_token").is_none());

        let (_, pages) = call(&app, "GET", "/pages", None).await;
        assert_eq!(pages.as_array().unwrap().len(), 1);
        assert!(!pages.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn admin_flow_discovers_assigns_and_syncs() {
        let (app, store) = test_app();
        let (_, page) = call(
            &app,
            "POST",
            "/pages",
            Some(json!({"name": "1029", "access_token": "secret"})),
        )
        .await;
        let page_id = page["id"].as_i64().unwrap();

        let (status, forms) =
            call(&app, "POST", &format!("/pages/{page_id}/discover-forms"), None).await;
        assert_eq!(status, StatusCode::OK);
        let form_id = forms[0]["id"].as_i64().unwrap();

        let (_, mappings) = call(&app, "GET", &format!("/forms/{form_id}/mappings"), None).await;
        let mapping_id = mappings[0]["id"].as_i64().unwrap();
        assert_eq!(mappings[0]["external_key"], "email");

        let (status, assigned) = call(
            &app,
            "PUT",
            &format!("/mappings/{mapping_id}"),
            Some(json!({"lead_field": "email_from"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(assigned["lead_field"], "email_from");

        let (status, summary) = call(&app, "POST", "/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["leads_created"], 1);

        let lead = store.find_lead("123").await.unwrap().expect("lead");
        assert_eq!(lead.description, "Email: jane@example.com\ncreated_time: 2020-01-01T10:00:00+0000\nid: 123");
    }

    #[tokio::test]
    async fn form_routing_can_be_patched() {
        let (app, store) = test_app();
        let page = store
            .create_page(NewPage {
                name: "1029".into(),
                access_token: "t".into(),
            })
            .await
            .unwrap();
        let team = store.create_reference("team", "Direct Sales").await.unwrap();
        let (_, forms) = call(&app, "POST", &format!("/pages/{}/discover-forms", page.id), None).await;
        let form_id = forms[0]["id"].as_i64().unwrap();

        let (status, form) = call(
            &app,
            "PATCH",
            &format!("/forms/{form_id}"),
            Some(json!({"team_id": team.id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(form["team_id"], team.id);
        assert!(form["campaign_id"].is_null());
    }

    #[tokio::test]
    async fn store_errors_map_to_http_statuses() {
        let (app, store) = test_app();
        let page = store
            .create_page(NewPage {
                name: "1029".into(),
                access_token: "t".into(),
            })
            .await
            .unwrap();
        call(&app, "POST", &format!("/pages/{}/discover-forms", page.id), None).await;
        let form = store.list_forms().await.unwrap().remove(0);
        let mapping = store.mappings_for_form(form.id).await.unwrap().remove(0);

        let (status, body) = call(&app, "POST", "/forms/999/discover-fields", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("999"));

        let (status, _) = call(
            &app,
            "PUT",
            &format!("/mappings/{}", mapping.id),
            Some(json!({"lead_field": "favourite_colour"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&app, "DELETE", &format!("/pages/{}", page.id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(store.list_forms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn graph_failures_are_bad_gateway() {
        let (app, store) = test_app();
        let page = store
            .create_page(NewPage {
                name: "broken".into(),
                access_token: "t".into(),
            })
            .await
            .unwrap();
        let (status, body) =
            call(&app, "POST", &format!("/pages/{}/discover-forms", page.id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("Unsupported get request."));
    }

    #[tokio::test]
    async fn lead_field_catalog_is_listed() {
        let (app, _) = test_app();
        let (status, fields) = call(&app, "GET", "/lead-fields", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fields
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f["name"] == "email_from"));
    }
}
