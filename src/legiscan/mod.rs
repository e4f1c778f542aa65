//! LegiScan bill search (`op=getSearch`).

mod types;

use std::env;

use reqwest::Client;
use tracing::{debug, warn};

use crate::legal::{ResultRecord, SourceKind};
use types::{BillHit, SearchResponse};

const API_BASE: &str = "https://api.legiscan.com/";
/// Hits kept per search.
pub const MAX_RESULTS: usize = 10;
const SUMMARY_KEY: &str = "summary";

/// Errors returned by LegiScan API operations.
#[derive(Debug, thiserror::Error)]
pub enum LegiScanError {
    #[error("LEGISCAN_API_KEY not found in environment variables. Get one at https://legiscan.com/legiscan")]
    ApiKeyNotSet,

    #[error("LegiScan request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("LegiScan request failed: status {0}")]
    Status(u16),

    #[error("LegiScan returned an error: {0}")]
    Api(String),

    #[error("LegiScan response could not be parsed: {0}")]
    Parse(String),
}

impl LegiScanError {
    /// Configuration problems abort the run; everything else is a failed search.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LegiScanError::ApiKeyNotSet)
    }
}

/// Abstraction for legislative bill search.
/// Implemented by `LegiScanClient` for production; mock implementations used in tests.
pub trait BillSearch {
    async fn search_bills(&self, query: &str, state: &str) -> Result<Vec<ResultRecord>, LegiScanError>;
}

#[derive(Clone)]
struct ApiKey(String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// HTTP client for the LegiScan Pull API.
///
/// A missing key is not an error at construction; it is reported by the
/// first search.
#[derive(Clone, Debug)]
pub struct LegiScanClient {
    http: Client,
    api_key: Option<ApiKey>,
    base_url: String,
}

impl LegiScanClient {
    pub fn from_env(http: Client) -> Self {
        let api_key = env::var("LEGISCAN_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(ApiKey);
        if api_key.is_none() {
            warn!("LEGISCAN_API_KEY not set; legislative search will fail");
        }
        Self {
            http,
            api_key,
            base_url: API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(http: Client, base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            http,
            api_key: api_key.map(|k| ApiKey(k.to_string())),
            base_url: base_url.to_string(),
        }
    }
}

impl BillSearch for LegiScanClient {
    async fn search_bills(&self, query: &str, state: &str) -> Result<Vec<ResultRecord>, LegiScanError> {
        let key = self.api_key.as_ref().ok_or(LegiScanError::ApiKeyNotSet)?;

        let response = self
            .http
            .get(&self.base_url)
            .header("User-Agent", crate::USER_AGENT)
            .query(&[
                ("key", key.0.as_str()),
                ("op", "getSearch"),
                ("state", state),
                ("query", query),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LegiScanError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let records = parse_search(&body)?;
        debug!(state, hits = records.len(), "legiscan search complete");
        Ok(records)
    }
}

/// Maps a `getSearch` body to records, skipping the `summary` entry and
/// keeping the first [`MAX_RESULTS`] hits in response order.
fn parse_search(body: &str) -> Result<Vec<ResultRecord>, LegiScanError> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|e| LegiScanError::Parse(e.to_string()))?;

    if response.status.as_deref() == Some("ERROR") {
        let message = response
            .alert
            .and_then(|a| a.message)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(LegiScanError::Api(message));
    }

    response
        .searchresult
        .into_iter()
        .filter(|(key, _)| key != SUMMARY_KEY)
        .take(MAX_RESULTS)
        .map(|(key, value)| {
            let hit: BillHit = serde_json::from_value(value)
                .map_err(|e| LegiScanError::Parse(format!("entry {key}: {e}")))?;
            Ok(ResultRecord::new(
                SourceKind::LegiScan,
                hit.title.unwrap_or_default(),
                hit.description.unwrap_or_default(),
            ))
        })
        .collect()
}


#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_search_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "secret"))
            .and(query_param("op", "getSearch"))
            .and(query_param("state", "CA"))
            .and(query_param("query", "landlord notice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "OK",
                "searchresult": {
                    "summary": {"count": 1},
                    "0": {"title": "AB 2347", "description": "Unlawful detainer"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LegiScanClient::with_base_url(Client::new(), &server.uri(), Some("secret"));
        let records = client.search_bills("landlord notice", "CA").await.unwrap();

        assert_eq!(records, [ResultRecord::new(SourceKind::LegiScan, "AB 2347", "Unlawful detainer")]);
    }

    #[tokio::test]
    async fn http_failure_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = LegiScanClient::with_base_url(Client::new(), &server.uri(), Some("secret"));
        let result = client.search_bills("mold", "CA").await;
        assert!(matches!(result, Err(LegiScanError::Status(503))));
    }

    #[tokio::test]
    async fn non_json_body_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let client = LegiScanClient::with_base_url(Client::new(), &server.uri(), Some("secret"));
        let result = client.search_bills("mold", "CA").await;
        assert!(matches!(result, Err(LegiScanError::Parse(_))));
    }

    #[tokio::test]
    async fn missing_key_fails_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = LegiScanClient::with_base_url(Client::new(), &server.uri(), None);
        let result = client.search_bills("mold", "CA").await;
        assert!(matches!(result, Err(LegiScanError::ApiKeyNotSet)));
    }
}
