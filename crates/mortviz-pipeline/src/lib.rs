//! Enrichment pipeline, chart production and service wiring for mortviz.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mortviz_core::Dataset;
use mortviz_lookup::{FixtureLookup, ReferenceLookup, RestCountriesClient, DEFAULT_BASE_URL};
use mortviz_storage::{ArtifactCache, BackoffPolicy, HttpClientConfig, HttpFetcher};
use tracing::info;

mod charts;
mod engine;
mod service;

pub use charts::{build_spec, ChartRenderer, ChartSpec, PlotlyHtmlRenderer, PLOTLY_CDN};
pub use engine::{
    partition, EnrichConfig, EnrichmentEngine, EnrichmentError, LookupCache, DEFAULT_WORKERS,
};
pub use service::{BarArtifacts, MapArtifacts, MortalityService, ServiceError};

pub const CRATE_NAME: &str = "mortviz-pipeline";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub dataset_path: PathBuf,
    pub resources_dir: PathBuf,
    pub lookup_base_url: String,
    pub lookup_fixture: Option<PathBuf>,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub lookup_retries: usize,
    pub web_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("./static/raw_data.csv"),
            resources_dir: PathBuf::from("./resources"),
            lookup_base_url: DEFAULT_BASE_URL.to_string(),
            lookup_fixture: None,
            workers: DEFAULT_WORKERS,
            http_timeout_secs: 20,
            user_agent: "mortviz/0.1".to_string(),
            lookup_retries: BackoffPolicy::default().max_retries,
            web_port: 8000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dataset_path: std::env::var("MORTVIZ_DATASET")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_path),
            resources_dir: std::env::var("MORTVIZ_RESOURCES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.resources_dir),
            lookup_base_url: std::env::var("MORTVIZ_LOOKUP_BASE_URL")
                .unwrap_or(defaults.lookup_base_url),
            lookup_fixture: std::env::var("MORTVIZ_LOOKUP_FIXTURE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            workers: parsed_env("MORTVIZ_WORKERS").unwrap_or(defaults.workers),
            http_timeout_secs: parsed_env("MORTVIZ_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("MORTVIZ_USER_AGENT").unwrap_or(defaults.user_agent),
            lookup_retries: parsed_env("MORTVIZ_LOOKUP_RETRIES")
                .unwrap_or(defaults.lookup_retries),
            web_port: parsed_env("MORTVIZ_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig {
            workers: self.workers.max(1),
            backoff: BackoffPolicy {
                max_retries: self.lookup_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn parsed_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Fixture-backed lookup when a fixture file is configured, the REST client otherwise.
pub fn build_lookup(config: &AppConfig) -> anyhow::Result<Arc<dyn ReferenceLookup>> {
    if let Some(path) = &config.lookup_fixture {
        let lookup = FixtureLookup::load(path)?;
        info!(path = %path.display(), countries = lookup.len(), "using fixture lookup");
        return Ok(Arc::new(lookup));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    let client = RestCountriesClient::new(Arc::new(http), &config.lookup_base_url)?;
    info!(base_url = %config.lookup_base_url, "using rest lookup");
    Ok(Arc::new(client))
}

pub fn build_service(config: &AppConfig) -> anyhow::Result<MortalityService> {
    let dataset = Dataset::load(&config.dataset_path)
        .with_context(|| format!("loading dataset {}", config.dataset_path.display()))?;
    info!(
        path = %config.dataset_path.display(),
        rows = dataset.len(),
        entities = dataset.entity_set().len(),
        "dataset loaded"
    );
    let engine = EnrichmentEngine::new(build_lookup(config)?, config.enrich_config());
    Ok(MortalityService::new(
        Arc::new(dataset),
        engine,
        ArtifactCache::new(&config.resources_dir),
        Arc::new(PlotlyHtmlRenderer::default()),
    ))
}
