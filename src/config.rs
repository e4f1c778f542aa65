use std::env;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::legal::prompts::ModelTier;
use crate::session::SessionStore;

pub const APP_NAME: &str = "lawyer_agent";
pub const USER_ID: &str = "default";

const DEFAULT_WORKER_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_REASONING_MODEL: &str = "gemini-2.5-pro";
const DEFAULT_PROJECT: &str = "lawyer-agents";
const DEFAULT_LOCATION: &str = "global";
pub const DEFAULT_STATE: &str = "CA";

/// TCP connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Global HTTP client timeout covering DNS + connect + response body.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub worker: String,
    pub reasoning: String,
}

impl ModelSelection {
    pub fn model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Worker => &self.worker,
            ModelTier::Reasoning => &self.reasoning,
        }
    }
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            worker: DEFAULT_WORKER_MODEL.to_string(),
            reasoning: DEFAULT_REASONING_MODEL.to_string(),
        }
    }
}

/// Hosting platform for the Gemini models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    GeminiApi,
    VertexAi { project: String, location: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub models: ModelSelection,
    pub platform: Platform,
    /// Two-letter state code used for LegiScan searches.
    pub state: String,
}

impl Config {
    /// Resolves configuration from the process environment.
    ///
    /// - `GOOGLE_GENAI_USE_VERTEXAI` (default `True`), `GOOGLE_CLOUD_PROJECT`
    ///   (default `lawyer-agents`), `GOOGLE_CLOUD_LOCATION` (default `global`)
    /// - `LAWYER_WORKER_MODEL`, `LAWYER_REASONING_MODEL`
    /// - `LEGISCAN_STATE` (default `CA`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let use_vertex = var("GOOGLE_GENAI_USE_VERTEXAI")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(true);
        let platform = if use_vertex {
            Platform::VertexAi {
                project: var("GOOGLE_CLOUD_PROJECT").unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
                location: var("GOOGLE_CLOUD_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            }
        } else {
            Platform::GeminiApi
        };

        let models = ModelSelection {
            worker: var("LAWYER_WORKER_MODEL").unwrap_or_else(|| DEFAULT_WORKER_MODEL.to_string()),
            reasoning: var("LAWYER_REASONING_MODEL")
                .unwrap_or_else(|| DEFAULT_REASONING_MODEL.to_string()),
        };

        let state = var("LEGISCAN_STATE")
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_STATE.to_string());

        Self {
            models,
            platform,
            state,
        }
    }
}

/// Long-lived process context handed to whatever builds the pipeline.
pub struct AppContext {
    pub config: Config,
    pub http: Client,
    pub sessions: Arc<SessionStore>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            http,
            sessions: Arc::new(SessionStore::new()),
        })
    }
}
