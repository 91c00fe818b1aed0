//! Enrichment engine: sharded concurrent lookups merged after a join barrier.

use std::collections::HashMap;
use std::sync::Arc;

use mortviz_core::{Dataset, EnrichedDataset, EnrichedRecord, ReferenceAttributes};
use mortviz_lookup::{LookupError, LookupOutcome, ReferenceLookup};
use mortviz_storage::{BackoffPolicy, RetryDisposition};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct EnrichConfig {
    pub workers: usize,
    pub backoff: BackoffPolicy,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("no reference data for entity `{entity}`")]
    Unresolved { entity: String },
    #[error("lookup for `{entity}` failed: {source}")]
    Lookup {
        entity: String,
        #[source]
        source: LookupError,
    },
    #[error("enrichment worker stopped: {message}")]
    Worker { message: String },
}

impl EnrichmentError {
    pub fn entity(&self) -> Option<&str> {
        match self {
            EnrichmentError::Unresolved { entity } | EnrichmentError::Lookup { entity, .. } => {
                Some(entity)
            }
            EnrichmentError::Worker { .. } => None,
        }
    }
}

/// Entity name -> reference attributes, or `None` for a not-found answer.
///
/// Built single-threaded from per-shard tables once every worker has finished.
#[derive(Debug, Clone, Default)]
pub struct LookupCache {
    entries: HashMap<String, Option<Arc<ReferenceAttributes>>>,
}

impl LookupCache {
    fn insert(&mut self, name: String, outcome: LookupOutcome) {
        let value = match outcome {
            LookupOutcome::Found(attrs) => Some(Arc::new(attrs)),
            LookupOutcome::NotFound => None,
        };
        self.entries.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Option<Arc<ReferenceAttributes>>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolved(&self) -> usize {
        self.entries.values().filter(|v| v.is_some()).count()
    }
}

/// Split `items` into at most `workers` contiguous, near-equal slices.
pub fn partition<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let workers = workers.max(1).min(items.len());
    let base = items.len() / workers;
    let extra = items.len() % workers;

    let mut shards = Vec::with_capacity(workers);
    let mut start = 0;
    for idx in 0..workers {
        let size = base + usize::from(idx < extra);
        shards.push(items[start..start + size].to_vec());
        start += size;
    }
    shards
}

type ShardTable = HashMap<String, LookupOutcome>;

struct ShardFailure {
    entity: String,
    error: LookupError,
}

pub struct EnrichmentEngine {
    lookup: Arc<dyn ReferenceLookup>,
    config: EnrichConfig,
}

impl EnrichmentEngine {
    pub fn new(lookup: Arc<dyn ReferenceLookup>, config: EnrichConfig) -> Self {
        Self { lookup, config }
    }

    pub fn lookup(&self) -> &Arc<dyn ReferenceLookup> {
        &self.lookup
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Append reference columns and the derived percent to every record, in input order.
    ///
    /// Fails as a whole if any entity is unresolved; no partially enriched output is produced.
    pub async fn enrich(&self, dataset: &Dataset) -> Result<EnrichedDataset, EnrichmentError> {
        let pass_id = Uuid::new_v4();
        let names = dataset.entities();
        let span = info_span!(
            "enrichment",
            %pass_id,
            source = self.lookup.source_id(),
            rows = dataset.len(),
            entities = names.len()
        );

        async {
            let cache = self.resolve(names).await?;
            let enriched = merge(dataset, &cache)?;
            info!(resolved = cache.resolved(), "enrichment pass complete");
            Ok::<_, EnrichmentError>(enriched)
        }
        .instrument(span)
        .await
    }

    /// Look up every name once across the worker pool.
    ///
    /// Each worker fills its own table; tables are merged in shard order after all workers
    /// have joined, so a name present in two shards resolves to the later shard's answer.
    pub async fn resolve(&self, names: Vec<String>) -> Result<LookupCache, EnrichmentError> {
        let shards = partition(&names, self.config.workers);
        let shard_count = shards.len();
        let mut set = JoinSet::new();
        for (idx, shard) in shards.into_iter().enumerate() {
            let lookup = Arc::clone(&self.lookup);
            let backoff = self.config.backoff;
            set.spawn(async move { (idx, run_shard(lookup, shard, backoff).await) });
        }

        let mut tables: Vec<Option<ShardTable>> = (0..shard_count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(table))) => {
                    debug!(shard = idx, lookups = table.len(), "shard finished");
                    tables[idx] = Some(table);
                }
                Ok((idx, Err(failure))) => {
                    set.abort_all();
                    warn!(shard = idx, entity = %failure.entity, error = %failure.error, "lookup failed; cancelling pass");
                    return Err(EnrichmentError::Lookup {
                        entity: failure.entity,
                        source: failure.error,
                    });
                }
                Err(err) => {
                    set.abort_all();
                    return Err(EnrichmentError::Worker {
                        message: err.to_string(),
                    });
                }
            }
        }

        let mut cache = LookupCache::default();
        for table in tables.into_iter().flatten() {
            for (name, outcome) in table {
                cache.insert(name, outcome);
            }
        }
        Ok(cache)
    }
}

async fn run_shard(
    lookup: Arc<dyn ReferenceLookup>,
    names: Vec<String>,
    backoff: BackoffPolicy,
) -> Result<ShardTable, ShardFailure> {
    let mut table = ShardTable::with_capacity(names.len());
    for name in names {
        if table.contains_key(&name) {
            continue;
        }
        match lookup_with_retry(lookup.as_ref(), &name, &backoff).await {
            Ok(outcome) => {
                table.insert(name, outcome);
            }
            Err(error) => return Err(ShardFailure { entity: name, error }),
        }
    }
    Ok(table)
}

async fn lookup_with_retry(
    lookup: &dyn ReferenceLookup,
    name: &str,
    backoff: &BackoffPolicy,
) -> Result<LookupOutcome, LookupError> {
    let mut attempt = 0;
    loop {
        match lookup.lookup_by_name(name).await {
            Ok(outcome) => return Ok(outcome),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < backoff.max_retries =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(entity = name, attempt, ?delay, error = %err, "lookup failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn merge(dataset: &Dataset, cache: &LookupCache) -> Result<EnrichedDataset, EnrichmentError> {
    dataset
        .records()
        .iter()
        .map(|record| match cache.get(&record.entity) {
            Some(Some(reference)) => Ok(EnrichedRecord::new(record.clone(), Arc::clone(reference))),
            _ => Err(EnrichmentError::Unresolved {
                entity: record.entity.clone(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(EnrichedDataset::from_rows)
}
