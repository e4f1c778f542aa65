use std::env;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::reply::extract_reply;
use super::types::{
    ApiError, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    GoogleSearch, ModelReply, Tool,
};
use crate::config::Platform;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
/// Per-call timeout; reasoning-tier calls over a full result list are slow.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("Gemini credentials not set: {0}")]
    CredentialsNotSet(&'static str),

    #[error("API rate limit exceeded. Please retry later.")]
    RateLimited,

    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// One model invocation: which model, the system instruction, and the user turn.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub instruction: &'a str,
    pub prompt: &'a str,
    pub grounded: bool,
    pub json_output: bool,
}

/// Abstraction over the hosted model runtime.
/// Implemented by `GeminiClient` for production; mock implementations used in tests.
pub trait ModelClient {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, GeminiError>;
}

#[derive(Clone)]
struct Secret(String);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Produces a fresh access token, or `None` when none can be obtained.
type TokenSource = fn() -> Option<String>;

#[derive(Debug)]
enum Credential {
    ApiKey(Secret),
    /// Vertex access token. Tokens minted by `gcloud` expire after about an
    /// hour and are fetched again when the API answers 401.
    Bearer {
        token: RwLock<Secret>,
        refresh: Option<TokenSource>,
    },
}

impl Credential {
    fn bearer(token: String, refresh: Option<TokenSource>) -> Self {
        Credential::Bearer {
            token: RwLock::new(Secret(token)),
            refresh,
        }
    }
}

#[derive(Debug)]
pub struct GeminiClient {
    http: Client,
    credential: Credential,
    base_url: String,
}

impl GeminiClient {
    /// Gemini API: `GEMINI_API_KEY` or `GOOGLE_API_KEY`.
    /// Vertex AI: `GOOGLE_CLOUD_ACCESS_TOKEN`, then `gcloud auth print-access-token`.
    pub fn from_env(http: Client, platform: &Platform) -> Result<Self, GeminiError> {
        let credential = match platform {
            Platform::GeminiApi => first_env(&["GEMINI_API_KEY", "GOOGLE_API_KEY"])
                .map(|k| Credential::ApiKey(Secret(k)))
                .ok_or(GeminiError::CredentialsNotSet(
                    "set GEMINI_API_KEY (https://aistudio.google.com/apikey)",
                ))?,
            Platform::VertexAi { .. } => first_env(&["GOOGLE_CLOUD_ACCESS_TOKEN"])
                .map(|t| Credential::bearer(t, None))
                .or_else(|| {
                    gcloud_access_token().map(|t| Credential::bearer(t, Some(gcloud_access_token)))
                })
                .ok_or(GeminiError::CredentialsNotSet(
                    "set GOOGLE_CLOUD_ACCESS_TOKEN or run `gcloud auth login`, or set GOOGLE_GENAI_USE_VERTEXAI=False with GEMINI_API_KEY",
                ))?,
        };
        Ok(Self {
            http,
            credential,
            base_url: base_url(platform),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            credential: Credential::ApiKey(Secret("test-key".to_string())),
            base_url: base_url.to_string(),
        }
    }

    #[cfg(test)]
    fn with_bearer(http: Client, base_url: &str, token: &str, refresh: Option<TokenSource>) -> Self {
        Self {
            http,
            credential: Credential::bearer(token.to_string(), refresh),
            base_url: base_url.to_string(),
        }
    }

    /// Replaces an expired bearer token. Returns `false` when the credential
    /// cannot be refreshed.
    async fn refresh_token(&self) -> bool {
        let Credential::Bearer {
            token,
            refresh: Some(refresh),
        } = &self.credential
        else {
            return false;
        };
        let refresh = *refresh;
        match tokio::task::spawn_blocking(refresh).await {
            Ok(Some(fresh)) => {
                *token.write().await = Secret(fresh);
                info!("refreshed Vertex AI access token");
                true
            }
            _ => {
                warn!("could not refresh Vertex AI access token");
                false
            }
        }
    }

    async fn generate_with_retry(&self, request: &ModelRequest<'_>) -> Result<ModelReply, GeminiError> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self.generate_once(request).await {
                Ok(response) => return Ok(extract_reply(&response)),
                Err(e) if is_retriable(&e) => {
                    last_err = Some(e);
                    if attempt + 1 < MAX_RETRIES {
                        let delay_ms = jittered_backoff(attempt);
                        debug!(
                            attempt = attempt + 1,
                            delay_ms, "retrying after transient error"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(GeminiError::RateLimited))
    }

    async fn generate_once(
        &self,
        request: &ModelRequest<'_>,
    ) -> Result<GenerateContentResponse, GeminiError> {
        let url = format!("{}/{}:generateContent", self.base_url, request.model);

        let body = GenerateContentRequest {
            system_instruction: Content::text(None, request.instruction),
            contents: vec![Content::text(Some("user"), request.prompt)],
            tools: if request.grounded {
                vec![Tool {
                    google_search: GoogleSearch {},
                }]
            } else {
                Vec::new()
            },
            generation_config: request.json_output.then(|| GenerationConfig {
                response_mime_type: "application/json".to_string(),
            }),
        };

        debug_assert!(
            url.starts_with("https://") || cfg!(test),
            "credentials must only be sent over HTTPS"
        );

        let builder = self.http.post(&url);
        let builder = match &self.credential {
            Credential::ApiKey(key) => builder.header("x-goog-api-key", &key.0),
            Credential::Bearer { token, .. } => builder.bearer_auth(&token.read().await.0),
        };

        let response = builder
            .header("User-Agent", crate::USER_AGENT)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(model = request.model, "Gemini API rate limited");
            return Err(GeminiError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Ok(body) = serde_json::from_str::<GenerateContentResponse>(&text)
                && let Some(err) = &body.error
            {
                let classified = classify_api_error(err);
                warn!(error = %classified, "Gemini API error");
                return Err(classified);
            }
            let snippet = &text[..text.floor_char_boundary(200)];
            warn!(status = %status, "Gemini API error (no structured body)");
            return Err(GeminiError::Api {
                code: status.as_u16(),
                message: format!("HTTP {status}: {snippet}"),
            });
        }

        let body: GenerateContentResponse = response.json().await?;
        debug!(model = request.model, grounded = request.grounded, "gemini call complete");

        if let Some(err) = &body.error {
            let classified = classify_api_error(err);
            warn!(error = %classified, "Gemini API error in 200 response");
            return Err(classified);
        }

        Ok(body)
    }
}

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

impl ModelClient for GeminiClient {
    async fn generate(&self, request: &ModelRequest<'_>) -> Result<ModelReply, GeminiError> {
        match self.generate_with_retry(request).await {
            Err(GeminiError::Api { code: 401, .. }) if self.refresh_token().await => {
                self.generate_with_retry(request).await
            }
            outcome => outcome,
        }
    }
}

fn base_url(platform: &Platform) -> String {
    match platform {
        Platform::GeminiApi => GEMINI_API_BASE.to_string(),
        Platform::VertexAi { project, location } => {
            let host = if location == "global" {
                "aiplatform.googleapis.com".to_string()
            } else {
                format!("{location}-aiplatform.googleapis.com")
            };
            format!("https://{host}/v1/projects/{project}/locations/{location}/publishers/google/models")
        }
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|var| env::var(var).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn gcloud_access_token() -> Option<String> {
    std::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .ok()
        .filter(|o| {
            if !o.status.success() {
                debug!(
                    stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                    "gcloud auth print-access-token failed"
                );
            }
            o.status.success()
        })
        .and_then(|o| {
            let token = String::from_utf8_lossy(&o.stdout).trim().to_string();
            if token.is_empty() { None } else { Some(token) }
        })
}

fn is_retriable(e: &GeminiError) -> bool {
    matches!(
        e,
        GeminiError::RateLimited
            | GeminiError::Api {
                code: 500..=599,
                ..
            }
    )
}

/// Equal jitter backoff: base/2 + rand(0, base/2).
fn jittered_backoff(attempt: u32) -> u64 {
    let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt);
    let half = base / 2;
    half + fastrand::u64(..half.max(1))
}

fn classify_api_error(err: &ApiError) -> GeminiError {
    let message = err
        .message
        .clone()
        .unwrap_or_else(|| "Unknown error".to_string());

    match err.code {
        Some(429) => GeminiError::RateLimited,
        Some(403) => GeminiError::QuotaExhausted(message),
        Some(code) => GeminiError::Api { code, message },
        None => GeminiError::Api {
            code: 0,
            message: format!("Unknown error (no status code): {message}"),
        },
    }
}


#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request<'a>(grounded: bool, json_output: bool) -> ModelRequest<'a> {
        ModelRequest {
            model: "gemini-2.5-flash",
            instruction: "You are a legal query interpreter.",
            prompt: "landlord entry",
            grounded,
            json_output,
        }
    }

    #[tokio::test]
    async fn generate_sends_instruction_and_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gemini-2.5-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "systemInstruction": {"parts": [{"text": "You are a legal query interpreter."}]},
                "contents": [{"role": "user", "parts": [{"text": "landlord entry"}]}],
                "generationConfig": {"responseMimeType": "application/json"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"parts": [{"text": "[\"landlord\"]"}], "role": "model"}
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let reply = client.generate(&request(false, true)).await.unwrap();

        assert_eq!(reply.text.as_deref(), Some("[\"landlord\"]"));
    }

    #[tokio::test]
    async fn grounded_request_carries_search_tool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "tools": [{"google_search": {}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"parts": [{"text": "[]"}]},
                    "groundingMetadata": {"groundingChunks": [{"web": {"title": "ca.gov"}}]}
                }]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let reply = client.generate(&request(true, false)).await.unwrap();

        assert_eq!(reply.grounding_titles, ["ca.gov"]);
    }

    #[tokio::test]
    async fn quota_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"code": 403, "message": "Quota exceeded"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let result = client.generate(&request(false, false)).await;
        assert!(matches!(result, Err(GeminiError::QuotaExhausted(_))));
    }

    #[tokio::test]
    async fn server_error_without_body_keeps_snippet() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request body"))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        match client.generate(&request(false, false)).await {
            Err(GeminiError::Api { code: 400, message }) => {
                assert!(message.contains("bad request body"), "got: {message}");
            }
            other => panic!("expected Api(400), got: {other:?}"),
        }
    }

    fn fresh_token() -> Option<String> {
        Some("fresh-token".to_string())
    }

    fn no_token() -> Option<String> {
        None
    }

    #[tokio::test]
    async fn expired_bearer_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer stale-token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"code": 401, "message": "Request had invalid authentication credentials."}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "ok"}]}}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = GeminiClient::with_bearer(Client::new(), &server.uri(), "stale-token", Some(fresh_token));
        let reply = client.generate(&request(false, false)).await.unwrap();
        assert_eq!(reply.text.as_deref(), Some("ok"));

        client.generate(&request(false, false)).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::with_bearer(Client::new(), &server.uri(), "env-token", None);
        let result = client.generate(&request(false, false)).await;
        assert!(matches!(result, Err(GeminiError::Api { code: 401, .. })));
    }

    #[tokio::test]
    async fn failed_refresh_returns_original_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::with_bearer(Client::new(), &server.uri(), "stale-token", Some(no_token));
        let result = client.generate(&request(false, false)).await;
        assert!(matches!(result, Err(GeminiError::Api { code: 401, .. })));
    }

    #[tokio::test]
    async fn error_field_in_200_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": 404, "message": "model not found"}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let result = client.generate(&request(false, false)).await;
        assert!(matches!(result, Err(GeminiError::Api { code: 404, .. })));
    }
}
