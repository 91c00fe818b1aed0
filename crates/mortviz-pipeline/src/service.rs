//! Controller-facing operations: entity listing and cached chart production.

use std::path::PathBuf;
use std::sync::Arc;

use mortviz_core::{
    ArtifactKey, ChartKind, Dataset, DatasetFilter, ReferenceAttributes, Selection,
};
use mortviz_lookup::LookupError;
use mortviz_storage::{validate_entities, ArtifactCache, ArtifactError, CachedArtifact, ValidationError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::charts::{build_spec, ChartRenderer};
use crate::engine::{EnrichmentEngine, EnrichmentError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Paths relative to the resources root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapArtifacts {
    pub year: i32,
    pub map: PathBuf,
    pub histogram: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarArtifacts {
    pub entities: Vec<String>,
    pub per_period: PathBuf,
    pub cumulative: PathBuf,
}

pub struct MortalityService {
    dataset: Arc<Dataset>,
    engine: EnrichmentEngine,
    cache: ArtifactCache,
    renderer: Arc<dyn ChartRenderer>,
}

impl MortalityService {
    pub fn new(
        dataset: Arc<Dataset>,
        engine: EnrichmentEngine,
        cache: ArtifactCache,
        renderer: Arc<dyn ChartRenderer>,
    ) -> Self {
        Self {
            dataset,
            engine,
            cache,
            renderer,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn countries(&self) -> Vec<String> {
        self.dataset.entities()
    }

    /// World map and histogram for one year, or `Empty` when the year has no rows.
    pub async fn enrich_for_year(&self, year: i32) -> Result<Selection<MapArtifacts>, ServiceError> {
        let keys = [
            ArtifactKey::for_year(ChartKind::WorldMap, year),
            ArtifactKey::for_year(ChartKind::Histogram, year),
        ];
        let filter = DatasetFilter::new().with_years([year]);
        let produced = self.produce(&keys, &filter).await?;
        Ok(produced.map(|mut paths| {
            let histogram = paths.pop().unwrap_or_default();
            let map = paths.pop().unwrap_or_default();
            MapArtifacts {
                year,
                map,
                histogram,
            }
        }))
    }

    /// Per-period and cumulative bar charts for up to five known entities.
    pub async fn enrich_for_entities<S: AsRef<str>>(
        &self,
        entities: &[S],
    ) -> Result<Selection<BarArtifacts>, ServiceError> {
        let names = validate_entities(entities, &self.dataset.entity_set())?;
        let keys = [
            ArtifactKey::new(ChartKind::PerPeriodBars, names.iter().cloned()),
            ArtifactKey::new(ChartKind::CumulativeBars, names.iter().cloned()),
        ];
        let filter = DatasetFilter::new().with_entities(names);
        let entities = keys[0].params().to_vec();
        let produced = self.produce(&keys, &filter).await?;
        Ok(produced.map(|mut paths| {
            let cumulative = paths.pop().unwrap_or_default();
            let per_period = paths.pop().unwrap_or_default();
            BarArtifacts {
                entities,
                per_period,
                cumulative,
            }
        }))
    }

    pub async fn reference_for_region(
        &self,
        region: &str,
    ) -> Result<Vec<ReferenceAttributes>, ServiceError> {
        Ok(self.engine.lookup().lookup_by_region(region).await?)
    }

    /// Relative paths for `keys`, in order. Enrichment runs only if at least one is missing.
    async fn produce(
        &self,
        keys: &[ArtifactKey],
        filter: &DatasetFilter,
    ) -> Result<Selection<Vec<PathBuf>>, ServiceError> {
        let mut all_cached = true;
        for key in keys {
            if !self.cache.probe(key).await?.exists {
                all_cached = false;
                break;
            }
        }
        if all_cached {
            debug!(keys = keys.len(), "all artifacts cached; skipping enrichment");
            return Ok(Selection::Found(
                keys.iter().map(ArtifactKey::relative_path).collect(),
            ));
        }

        let Selection::Found(view) = self.dataset.filter(filter) else {
            return Ok(Selection::Empty);
        };
        let enriched = self.engine.enrich(&view).await?;

        let renderer = self.renderer.as_ref();
        let rows = &enriched;
        let mut paths = Vec::with_capacity(keys.len());
        for key in keys {
            let artifact: CachedArtifact = self
                .cache
                .get_or_create(key, || async move { renderer.render(&build_spec(key, rows)) })
                .await?;
            info!(%key, generated = artifact.generated, "artifact ready");
            paths.push(artifact.relative_path);
        }
        Ok(Selection::Found(paths))
    }
}
