//! Axum JSON surface over the mortality service, plus cached artifact serving.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mortviz_core::{ChartKind, Selection};
use mortviz_pipeline::{AppConfig, EnrichmentError, MortalityService, ServiceError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mortviz-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MortalityService>,
}

impl AppState {
    pub fn new(service: MortalityService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct BarsQuery {
    entities: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmptyBody {
    empty: bool,
    reason: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/countries", get(countries_handler))
        .route("/maps/{year}", get(maps_handler))
        .route("/bars", get(bars_handler))
        .route("/resources/{folder}/{file}", get(resource_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::new(mortviz_pipeline::build_service(&config)?);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "mortviz web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppConfig::from_env()).await
}

async fn index_handler() -> Response {
    Json(serde_json::json!({"message": "Hello World!"})).into_response()
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.countries()).into_response()
}

async fn maps_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
) -> Response {
    let Ok(year) = raw.trim().parse::<i32>() else {
        return empty(format!("invalid year {raw}"));
    };
    match state.service.enrich_for_year(year).await {
        Ok(Selection::Found(artifacts)) => Json(artifacts).into_response(),
        Ok(Selection::Empty) => empty(format!("no data for year {year}")),
        Err(err) => service_error(err),
    }
}

async fn bars_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BarsQuery>,
) -> Response {
    let entities = query
        .entities
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>();
    match state.service.enrich_for_entities(entities.as_slice()).await {
        Ok(Selection::Found(artifacts)) => Json(artifacts).into_response(),
        Ok(Selection::Empty) => empty("no data for the requested entities".to_string()),
        Err(err) => service_error(err),
    }
}

async fn resource_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((folder, file)): AxumPath<(String, String)>,
) -> Response {
    let known_folder = [ChartKind::WorldMap, ChartKind::PerPeriodBars]
        .iter()
        .any(|kind| kind.folder() == folder);
    if !known_folder || !is_plain_file_name(&file) {
        return not_found();
    }
    let path = state.service.cache().root().join(&folder).join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Err(_) => not_found(),
    }
}

fn is_plain_file_name(file: &str) -> bool {
    !file.is_empty()
        && !file.starts_with('.')
        && file.ends_with(".html")
        && !file.contains(['/', '\\'])
        && !file.contains("..")
}

fn empty(reason: String) -> Response {
    Json(EmptyBody {
        empty: true,
        reason,
    })
    .into_response()
}

fn service_error(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::Validation(validation) => return empty(validation.to_string()),
        ServiceError::Enrichment(EnrichmentError::Worker { .. }) | ServiceError::Artifact(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ServiceError::Enrichment(_) | ServiceError::Lookup(_) => StatusCode::BAD_GATEWAY,
    };
    warn!(error = %err, status = status.as_u16(), "request failed");
    (
        status,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use mortviz_core::Dataset;
    use mortviz_lookup::FixtureLookup;
    use mortviz_pipeline::{EnrichConfig, EnrichmentEngine, PlotlyHtmlRenderer};
    use mortviz_storage::ArtifactCache;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn test_app() -> (Router, tempfile::TempDir) {
        let root = workspace_root();
        let dataset = Dataset::load(root.join("fixtures/raw_data.csv")).unwrap();
        let lookup = FixtureLookup::load(root.join("fixtures/lookup/countries.json")).unwrap();
        let resources = tempfile::tempdir().unwrap();
        let service = MortalityService::new(
            Arc::new(dataset),
            EnrichmentEngine::new(Arc::new(lookup), EnrichConfig::default()),
            ArtifactCache::new(resources.path()),
            Arc::new(PlotlyHtmlRenderer::default()),
        );
        (app(AppState::new(service)), resources)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_index_and_countries() {
        let (app, _resources) = test_app();
        let (status, body) = get_json(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Hello World!");

        let (status, body) = get_json(app, "/countries").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(["Afghanistan", "Canada", "France", "Nigeria"]));
    }

    #[tokio::test]
    async fn map_paths_are_served_as_resources() {
        let (app, _resources) = test_app();
        let (status, body) = get_json(app.clone(), "/maps/2016").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["map"], "maps/map_2016.html");

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/resources/maps/map_2016.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/html; charset=utf-8"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("Plotly.newPlot"));
    }

    #[tokio::test]
    async fn empty_and_invalid_requests_are_not_errors() {
        let (app, _resources) = test_app();
        let (status, body) = get_json(app.clone(), "/maps/2999").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["empty"], true);

        for uri in ["/maps/abc", "/maps/99999999999"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body["empty"], true, "{uri}");
            assert!(body["reason"].as_str().unwrap().starts_with("invalid year"));
        }

        let (status, body) = get_json(app.clone(), "/bars").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["empty"], true);

        let (status, body) = get_json(app, "/bars?entities=A,B,C,D,E,F").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["reason"].as_str().unwrap().contains("at most 5"));
    }

    #[tokio::test]
    async fn bars_request_returns_sorted_paths() {
        let (app, _resources) = test_app();
        let (status, body) = get_json(app, "/bars?entities=France,%20Canada").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["per_period"], "bars/Canada_France_d.html");
        assert_eq!(body["cumulative"], "bars/Canada_France_c.html");
    }

    #[tokio::test]
    async fn resource_paths_are_restricted() {
        let (app, _resources) = test_app();
        for uri in [
            "/resources/secrets/map_2016.html",
            "/resources/maps/..%2Fsecret.html",
            "/resources/maps/.hidden.html",
            "/resources/maps/map_1900.html",
        ] {
            let (status, _) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
