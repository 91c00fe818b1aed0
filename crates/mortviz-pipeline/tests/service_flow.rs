use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mortviz_core::{Dataset, ReferenceAttributes, Selection};
use mortviz_lookup::{FixtureLookup, LookupError, LookupOutcome, ReferenceLookup};
use mortviz_pipeline::{
    ChartRenderer, ChartSpec, EnrichConfig, EnrichmentEngine, EnrichmentError, MortalityService,
    PlotlyHtmlRenderer, ServiceError,
};
use mortviz_storage::{ArtifactCache, ValidationError};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

struct CountingLookup {
    inner: FixtureLookup,
    calls: AtomicUsize,
}

#[async_trait]
impl ReferenceLookup for CountingLookup {
    fn source_id(&self) -> &'static str {
        "counting"
    }

    async fn lookup_by_name(&self, name: &str) -> Result<LookupOutcome, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup_by_name(name).await
    }

    async fn lookup_by_region(&self, region: &str) -> Result<Vec<ReferenceAttributes>, LookupError> {
        self.inner.lookup_by_region(region).await
    }
}

#[derive(Default)]
struct CountingRenderer {
    inner: PlotlyHtmlRenderer,
    renders: AtomicUsize,
}

impl ChartRenderer for CountingRenderer {
    fn render(&self, spec: &ChartSpec) -> anyhow::Result<Vec<u8>> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        self.inner.render(spec)
    }
}

struct Harness {
    service: MortalityService,
    lookup: Arc<CountingLookup>,
    renderer: Arc<CountingRenderer>,
    resources: tempfile::TempDir,
}

fn harness_with(inner: FixtureLookup) -> Harness {
    let root = workspace_root();
    let dataset = Dataset::load(root.join("fixtures/raw_data.csv")).unwrap();
    let lookup = Arc::new(CountingLookup {
        inner,
        calls: AtomicUsize::new(0),
    });
    let renderer = Arc::new(CountingRenderer::default());
    let resources = tempfile::tempdir().unwrap();
    let engine = EnrichmentEngine::new(
        lookup.clone(),
        EnrichConfig {
            workers: 3,
            ..EnrichConfig::default()
        },
    );
    let service = MortalityService::new(
        Arc::new(dataset),
        engine,
        ArtifactCache::new(resources.path()),
        renderer.clone(),
    );
    Harness {
        service,
        lookup,
        renderer,
        resources,
    }
}

fn harness() -> Harness {
    let fixture = FixtureLookup::load(workspace_root().join("fixtures/lookup/countries.json")).unwrap();
    harness_with(fixture)
}

#[tokio::test]
async fn countries_are_sorted_and_distinct() {
    let h = harness();
    assert_eq!(
        h.service.countries(),
        vec!["Afghanistan", "Canada", "France", "Nigeria"]
    );
}

#[tokio::test]
async fn year_request_renders_map_and_histogram_once() {
    let h = harness();
    let Selection::Found(first) = h.service.enrich_for_year(2016).await.unwrap() else {
        panic!("expected artifacts for 2016");
    };
    assert_eq!(first.map, PathBuf::from("maps/map_2016.html"));
    assert_eq!(first.histogram, PathBuf::from("maps/hist_2016.html"));
    assert!(h.resources.path().join(&first.map).exists());
    assert!(h.resources.path().join(&first.histogram).exists());
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 2);

    let html = std::fs::read_to_string(h.resources.path().join(&first.map)).unwrap();
    assert!(html.contains("\"FRA\""));
    assert!(html.contains("choropleth"));

    let second = h.service.enrich_for_year(2016).await.unwrap().into_option().unwrap();
    assert_eq!(second, first);
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn year_without_rows_is_empty_and_writes_nothing() {
    let h = harness();
    assert!(h.service.enrich_for_year(2999).await.unwrap().is_empty());
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 0);
    assert!(!h.resources.path().join("maps/map_2999.html").exists());
}

#[tokio::test]
async fn entity_requests_are_validated() {
    let h = harness();
    let none: [&str; 0] = [];
    assert!(matches!(
        h.service.enrich_for_entities(&none).await,
        Err(ServiceError::Validation(ValidationError::NoEntities))
    ));

    let six = ["Afghanistan", "Canada", "France", "Nigeria", "Canada", "France"];
    assert!(matches!(
        h.service.enrich_for_entities(&six).await,
        Err(ServiceError::Validation(ValidationError::TooManyEntities { count: 6, max: 5 }))
    ));

    assert!(matches!(
        h.service.enrich_for_entities(&["Narnia"]).await,
        Err(ServiceError::Validation(ValidationError::UnknownEntity(name))) if name == "Narnia"
    ));
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn permuted_entities_hit_the_same_artifacts() {
    let h = harness();
    let first = h
        .service
        .enrich_for_entities(&["France", "Canada"])
        .await
        .unwrap()
        .into_option()
        .unwrap();
    assert_eq!(first.entities, vec!["Canada", "France"]);
    assert_eq!(first.per_period, PathBuf::from("bars/Canada_France_d.html"));
    assert_eq!(first.cumulative, PathBuf::from("bars/Canada_France_c.html"));
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 2);

    let second = h
        .service
        .enrich_for_entities(&["Canada", "France"])
        .await
        .unwrap()
        .into_option()
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unresolved_entity_fails_the_pass_without_artifacts() {
    let canada = ReferenceAttributes {
        code: "CAN".into(),
        capital: "Ottawa".into(),
        population: 36_155_487,
        area: None,
        gini: None,
    };
    let h = harness_with(FixtureLookup::default().with_country("Canada", Some("Americas"), canada));
    let err = h.service.enrich_for_year(2017).await.unwrap_err();
    match err {
        ServiceError::Enrichment(EnrichmentError::Unresolved { entity }) => {
            assert_ne!(entity, "Canada");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.renderer.renders.load(Ordering::SeqCst), 0);
    assert!(!h.resources.path().join("maps/map_2017.html").exists());
}

#[tokio::test]
async fn region_lookup_goes_through_the_client() {
    let h = harness();
    let europe = h.service.reference_for_region("europe").await.unwrap();
    assert!(europe.iter().any(|c| c.code == "FRA"));
    assert!(h.service.reference_for_region("Atlantis").await.unwrap().is_empty());
}
