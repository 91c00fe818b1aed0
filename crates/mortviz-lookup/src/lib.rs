//! Reference lookup contracts + REST and fixture-backed implementations.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use mortviz_core::ReferenceAttributes;
use mortviz_storage::{classify_status, FetchError, HttpFetcher, RetryDisposition, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mortviz-lookup";

pub const DEFAULT_BASE_URL: &str = "https://restcountries.com/v2";

/// Outcome of an exact-name lookup. `NotFound` is a valid answer, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(ReferenceAttributes),
    NotFound,
}

impl LookupOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, LookupOutcome::Found(_))
    }
}

/// Transport-level failure talking to the lookup service.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid lookup url {url}")]
    InvalidUrl { url: String },
    #[error("decoding lookup response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("lookup service reported status {status} for {url}")]
    ServiceStatus { status: u16, url: String },
    #[error("unexpected lookup response shape from {url}")]
    UnexpectedBody { url: String },
}

impl LookupError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            LookupError::Fetch(err) => err.disposition(),
            LookupError::ServiceStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn lookup_by_name(&self, name: &str) -> Result<LookupOutcome, LookupError>;

    async fn lookup_by_region(&self, region: &str)
        -> Result<Vec<ReferenceAttributes>, LookupError>;
}

/// Country document as served by the v2 REST countries API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountryPayload {
    name: String,
    alpha3_code: String,
    #[serde(default)]
    capital: Option<String>,
    #[serde(default)]
    population: u64,
    #[serde(default)]
    area: Option<f64>,
    #[serde(default)]
    gini: Option<f64>,
}

impl CountryPayload {
    fn into_attributes(self) -> ReferenceAttributes {
        ReferenceAttributes {
            code: self.alpha3_code,
            capital: self.capital.unwrap_or_default(),
            population: self.population,
            area: self.area,
            gini: self.gini,
        }
    }
}

/// Decode a lookup body. The service reports "no match" as `{"status": 404, ...}` in the
/// body, so the body decides, whatever the HTTP status line said.
fn decode_countries(url: &str, body: &[u8]) -> Result<Option<Vec<CountryPayload>>, LookupError> {
    let decode = |source| LookupError::Decode {
        url: url.to_string(),
        source,
    };
    let value: JsonValue = serde_json::from_slice(body).map_err(decode)?;
    let status = match &value {
        JsonValue::Array(_) => None,
        JsonValue::Object(map) => map.get("status").and_then(JsonValue::as_u64),
        _ => {
            return Err(LookupError::UnexpectedBody {
                url: url.to_string(),
            })
        }
    };
    match status {
        Some(404) => Ok(None),
        Some(status) => Err(LookupError::ServiceStatus {
            status: u16::try_from(status).unwrap_or(u16::MAX),
            url: url.to_string(),
        }),
        None if value.is_array() => serde_json::from_value(value).map(Some).map_err(decode),
        None => serde_json::from_value(value)
            .map(|country| Some(vec![country]))
            .map_err(decode),
    }
}

/// Client for `{base}/name/{entity}?fullText=true` and `{base}/region/{region}`.
#[derive(Debug, Clone)]
pub struct RestCountriesClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
}

impl RestCountriesClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Result<Self, LookupError> {
        let base_url = Url::parse(base_url).map_err(|_| LookupError::InvalidUrl {
            url: base_url.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::InvalidUrl {
                url: base_url.to_string(),
            });
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn name_url(&self, name: &str) -> Url {
        let mut url = self.endpoint(&["name", name]);
        url.query_pairs_mut().append_pair("fullText", "true");
        url
    }

    pub fn region_url(&self, region: &str) -> Url {
        self.endpoint(&["region", region])
    }

    async fn fetch_countries(&self, url: &Url) -> Result<Option<Vec<CountryPayload>>, LookupError> {
        let resp = self.http.fetch(url).await?;
        decode_countries(&resp.final_url, &resp.body)
    }
}

#[async_trait]
impl ReferenceLookup for RestCountriesClient {
    fn source_id(&self) -> &'static str {
        "restcountries"
    }

    async fn lookup_by_name(&self, name: &str) -> Result<LookupOutcome, LookupError> {
        let url = self.name_url(name);
        let Some(countries) = self.fetch_countries(&url).await? else {
            debug!(entity = name, "lookup returned not-found status");
            return Ok(LookupOutcome::NotFound);
        };

        let idx = countries
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .unwrap_or(0);
        Ok(countries
            .into_iter()
            .nth(idx)
            .map(|c| LookupOutcome::Found(c.into_attributes()))
            .unwrap_or(LookupOutcome::NotFound))
    }

    async fn lookup_by_region(
        &self,
        region: &str,
    ) -> Result<Vec<ReferenceAttributes>, LookupError> {
        let url = self.region_url(region);
        Ok(self
            .fetch_countries(&url)
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(CountryPayload::into_attributes)
            .collect())
    }
}

/// One entry of a lookup fixture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureCountry {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(flatten)]
    pub attributes: ReferenceAttributes,
}

/// Offline lookup backed by a JSON array of [`FixtureCountry`] entries.
#[derive(Debug, Clone, Default)]
pub struct FixtureLookup {
    countries: Vec<FixtureCountry>,
}

impl FixtureLookup {
    pub fn from_countries(countries: Vec<FixtureCountry>) -> Self {
        Self { countries }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let countries = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { countries })
    }

    pub fn with_country(
        mut self,
        name: impl Into<String>,
        region: Option<&str>,
        attributes: ReferenceAttributes,
    ) -> Self {
        self.countries.push(FixtureCountry {
            name: name.into(),
            region: region.map(str::to_string),
            attributes,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

#[async_trait]
impl ReferenceLookup for FixtureLookup {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn lookup_by_name(&self, name: &str) -> Result<LookupOutcome, LookupError> {
        Ok(self
            .countries
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| LookupOutcome::Found(c.attributes.clone()))
            .unwrap_or(LookupOutcome::NotFound))
    }

    async fn lookup_by_region(
        &self,
        region: &str,
    ) -> Result<Vec<ReferenceAttributes>, LookupError> {
        Ok(self
            .countries
            .iter()
            .filter(|c| {
                c.region
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case(region))
            })
            .map(|c| c.attributes.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mortviz_storage::HttpClientConfig;
    use std::path::PathBuf;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FRANCE: &str = r#"[{
        "name": "France",
        "alpha3Code": "FRA",
        "capital": "Paris",
        "region": "Europe",
        "population": 67000000,
        "area": 640679.0,
        "gini": 32.7
    }]"#;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    async fn client_for(server: &MockServer) -> RestCountriesClient {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        RestCountriesClient::new(http, &format!("{}/v2", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn name_lookup_requests_exact_match_and_maps_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/name/France"))
            .and(query_param("fullText", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FRANCE))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let outcome = client.lookup_by_name("France").await.unwrap();
        assert_eq!(
            outcome,
            LookupOutcome::Found(ReferenceAttributes {
                code: "FRA".into(),
                capital: "Paris".into(),
                population: 67_000_000,
                area: Some(640679.0),
                gini: Some(32.7),
            })
        );
    }

    #[tokio::test]
    async fn not_found_is_read_from_body_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/name/Atlantis"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"status":404,"message":"Not Found"}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/name/Lemuria"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"status":404,"message":"Not Found"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.lookup_by_name("Atlantis").await.unwrap(), LookupOutcome::NotFound);
        assert_eq!(client.lookup_by_name("Lemuria").await.unwrap(), LookupOutcome::NotFound);
    }

    #[tokio::test]
    async fn server_errors_are_retryable_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/name/France"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/name/Chad"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"status":400,"message":"Bad Request"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.lookup_by_name("France").await.unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        let err = client.lookup_by_name("Chad").await.unwrap_err();
        assert!(matches!(err, LookupError::ServiceStatus { status: 400, .. }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn region_lookup_returns_every_country() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/region/Europe"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"name":"France","alpha3Code":"FRA","population":1},
                    {"name":"Spain","alpha3Code":"ESP","population":2,"gini":null}]"#,
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let countries = client.lookup_by_region("Europe").await.unwrap();
        let codes = countries.iter().map(|c| c.code.as_str()).collect::<Vec<_>>();
        assert_eq!(codes, vec!["FRA", "ESP"]);
        assert_eq!(countries[1].gini, None);
    }

    #[test]
    fn urls_encode_entity_names() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let client = RestCountriesClient::new(http, "https://example.test/v2/").unwrap();
        let url = client.name_url("Côte d'Ivoire");
        assert_eq!(url.path(), "/v2/name/C%C3%B4te%20d'Ivoire");
        assert_eq!(url.query(), Some("fullText=true"));
        assert_eq!(client.region_url("Americas").as_str(), "https://example.test/v2/region/Americas");
    }

    #[tokio::test]
    async fn fixture_lookup_serves_workspace_fixture() {
        let lookup = FixtureLookup::load(workspace_root().join("fixtures/lookup/countries.json"))
            .unwrap();
        let LookupOutcome::Found(france) = lookup.lookup_by_name("france").await.unwrap() else {
            panic!("France missing from fixture");
        };
        assert_eq!(france.code, "FRA");
        assert_eq!(
            lookup.lookup_by_name("Atlantis").await.unwrap(),
            LookupOutcome::NotFound
        );
        let europe = lookup.lookup_by_region("Europe").await.unwrap();
        assert!(europe.iter().any(|c| c.code == "FRA"));
    }
}
