//! Stage driver: intake, parallel web and bill search, combine, rerank, compose.
//!
//! Each stage publishes its output under the agent's `output_key`; later
//! stages read those slots by name when their instructions are rendered.

use futures::future::join;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ModelSelection;
use crate::gemini::{GeminiError, ModelClient, ModelRequest};
use crate::legal::parse::parse_model_json;
use crate::legal::prompts::{
    self, AgentSpec, COMBINER, COMPOSER, INTAKE, LEGISLATION, RERANK, WEB_SEARCH,
};
use crate::legal::records::{combine, retain_cited, retain_known};
use crate::legal::{ComposedResponse, ResultRecord, SearchTerms, SourceKind};
use crate::legiscan::{BillSearch, LegiScanError, MAX_RESULTS};

const TOP_RESULTS: usize = 5;
const NO_SOURCES_SUMMARY: &str =
    "No relevant legal sources were found for this question. Try rephrasing it or naming the state it concerns.";

/// Text produced by a stage, streamed to the caller as it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub author: String,
    pub text: String,
}

impl Event {
    fn new(author: &str, text: impl Into<String>) -> Self {
        Self {
            author: author.to_string(),
            text: text.into(),
        }
    }

    /// The text worth showing, or `None` for empty output and the literal
    /// placeholder `"None"`.
    pub fn display_text(&self) -> Option<&str> {
        let text = self.text.trim();
        (!text.is_empty() && text != "None").then_some(text)
    }
}

pub type EventSink = mpsc::UnboundedSender<Event>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage}: {source}")]
    Model {
        stage: &'static str,
        #[source]
        source: GeminiError,
    },

    #[error(transparent)]
    LegiScan(#[from] LegiScanError),

    #[error("{stage} returned malformed output: {reason}")]
    MalformedOutput { stage: &'static str, reason: String },
}

/// Values published by one run, keyed by output slot.
#[derive(Debug, Default, Clone)]
pub struct PipelineState {
    pub search_terms: SearchTerms,
    pub google_results: Vec<ResultRecord>,
    pub legiscan_results: Vec<ResultRecord>,
    pub raw_results: Vec<ResultRecord>,
    pub top_5_results: Vec<ResultRecord>,
    pub composed_response: Option<ComposedResponse>,
}

impl PipelineState {
    /// `(output_key, value)` pairs for every populated slot.
    pub fn slots(&self) -> Vec<(String, serde_json::Value)> {
        let mut slots = vec![
            (INTAKE.output_key, serde_json::to_value(&self.search_terms)),
            (WEB_SEARCH.output_key, serde_json::to_value(&self.google_results)),
            (LEGISLATION.output_key, serde_json::to_value(&self.legiscan_results)),
            (COMBINER.output_key, serde_json::to_value(&self.raw_results)),
            (RERANK.output_key, serde_json::to_value(&self.top_5_results)),
        ];
        if let Some(response) = &self.composed_response {
            slots.push((COMPOSER.output_key, serde_json::to_value(response)));
        }
        slots
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), value.ok()?)))
            .collect()
    }
}

/// Search hit as the web agent reports it; `source` is fixed to Google.
#[derive(Deserialize)]
struct WebHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

pub struct Pipeline<M, B> {
    model: M,
    bills: B,
    models: ModelSelection,
    state_code: String,
}

impl<M: ModelClient, B: BillSearch> Pipeline<M, B> {
    pub fn new(model: M, bills: B, models: ModelSelection, state_code: &str) -> Self {
        Self {
            model,
            bills,
            models,
            state_code: state_code.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn model(&self) -> &M {
        &self.model
    }

    /// Runs every stage for `query`. `earlier` holds the conversation's
    /// previous user questions, oldest first.
    pub async fn run(
        &self,
        query: &str,
        earlier: &[String],
        events: EventSink,
    ) -> Result<PipelineState, PipelineError> {
        let mut state = PipelineState::default();

        state.search_terms = self.intake(query, earlier).await?;
        let turn = prompts::with_earlier_questions(query.to_string(), earlier);
        emit(&events, &INTAKE, format!("Search terms: {}", state.search_terms.0.join(", ")));

        let (web, bills) = join(
            self.search_web(&turn, &state.search_terms),
            self.search_legislation(&state.search_terms),
        )
        .await;

        let web_error = match web {
            Ok(records) => {
                emit(&events, &WEB_SEARCH, format!("Found {} web results", records.len()));
                state.google_results = records;
                None
            }
            Err(e) => {
                warn!(error = %e, "web search failed (continuing with legislative results)");
                emit(&events, &WEB_SEARCH, format!("Web search failed: {e}"));
                Some(e)
            }
        };

        let legiscan_failed = match bills {
            Ok(records) => {
                emit(
                    &events,
                    &LEGISLATION,
                    format!("Found {} bills in {}", records.len(), self.state_code),
                );
                state.legiscan_results = records;
                false
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "legislative search failed");
                emit(&events, &LEGISLATION, format!("Legislative search failed: {e}"));
                state.legiscan_results = vec![ResultRecord::error(SourceKind::LegiScan, &e)];
                true
            }
        };

        if let Some(e) = web_error
            && legiscan_failed
        {
            return Err(e);
        }

        state.raw_results = combine(&state.google_results, &state.legiscan_results);
        info!(
            google = state.google_results.len(),
            legiscan = state.legiscan_results.len(),
            "results combined"
        );

        if state.raw_results.is_empty() {
            let response = ComposedResponse {
                reasoning: "No search results to compose from.".to_string(),
                summary: NO_SOURCES_SUMMARY.to_string(),
                sources: Vec::new(),
            };
            emit(&events, &COMPOSER, response.render());
            state.composed_response = Some(response);
            return Ok(state);
        }

        state.top_5_results = self
            .rerank(&turn, &state.search_terms, &state.raw_results)
            .await?;
        emit(
            &events,
            &RERANK,
            format!(
                "Selected {} of {} results",
                state.top_5_results.len(),
                state.raw_results.len()
            ),
        );

        let response = self.compose(&turn, &state.top_5_results).await?;
        emit(&events, &COMPOSER, response.render());
        state.composed_response = Some(response);

        Ok(state)
    }

    async fn intake(&self, query: &str, earlier: &[String]) -> Result<SearchTerms, PipelineError> {
        let prompt = prompts::with_earlier_questions(prompts::standardize_legal_query(query), earlier);
        let text = self.call(&INTAKE, INTAKE.instruction, &prompt).await?;

        let terms: Vec<String> = parse_model_json(&text).map_err(|reason| malformed(&INTAKE, reason))?;
        let terms: Vec<String> = terms
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Err(malformed(&INTAKE, "no search terms".to_string()));
        }
        if !(3..=6).contains(&terms.len()) {
            warn!(count = terms.len(), "intake returned an unusual number of search terms");
        }
        info!(terms = ?terms, "intake complete");
        Ok(SearchTerms(terms))
    }

    async fn search_web(&self, query: &str, terms: &SearchTerms) -> Result<Vec<ResultRecord>, PipelineError> {
        let terms_json = to_json(terms);
        let instruction = prompts::render(WEB_SEARCH.instruction, &[(prompts::SEARCH_TERMS, terms_json.as_str())]);
        let text = self.call(&WEB_SEARCH, &instruction, query).await?;

        let hits: Vec<WebHit> = parse_model_json(&text).map_err(|reason| malformed(&WEB_SEARCH, reason))?;
        Ok(hits
            .into_iter()
            .take(MAX_RESULTS)
            .map(|hit| ResultRecord::new(SourceKind::Google, hit.title, hit.description))
            .collect())
    }

    async fn search_legislation(&self, terms: &SearchTerms) -> Result<Vec<ResultRecord>, LegiScanError> {
        let records = self.bills.search_bills(&terms.as_query(), &self.state_code).await?;
        info!(bills = records.len(), state = %self.state_code, "legislative search complete");
        Ok(records.into_iter().take(MAX_RESULTS).collect())
    }

    async fn rerank(
        &self,
        query: &str,
        terms: &SearchTerms,
        raw: &[ResultRecord],
    ) -> Result<Vec<ResultRecord>, PipelineError> {
        let (terms_json, raw_json, today) = (to_json(terms), to_json(raw), prompts::today());
        let instruction = prompts::render(
            RERANK.instruction,
            &[
                (prompts::SEARCH_TERMS, terms_json.as_str()),
                (prompts::RAW_RESULTS, raw_json.as_str()),
                ("today", today.as_str()),
            ],
        );
        let text = self.call(&RERANK, &instruction, query).await?;

        let ranked: Vec<ResultRecord> = parse_model_json(&text).map_err(|reason| malformed(&RERANK, reason))?;
        let top = retain_known(&ranked, raw, TOP_RESULTS);
        info!(selected = top.len(), "rerank complete");
        Ok(top)
    }

    async fn compose(&self, query: &str, top: &[ResultRecord]) -> Result<ComposedResponse, PipelineError> {
        let (top_json, today) = (to_json(top), prompts::today());
        let instruction = prompts::render(
            COMPOSER.instruction,
            &[
                (prompts::TOP_5_RESULTS, top_json.as_str()),
                ("today", today.as_str()),
            ],
        );
        let text = self.call(&COMPOSER, &instruction, query).await?;

        let mut response: ComposedResponse =
            parse_model_json(&text).map_err(|reason| malformed(&COMPOSER, reason))?;
        if response.summary.trim().is_empty() {
            return Err(malformed(&COMPOSER, "empty summary".to_string()));
        }
        retain_cited(&mut response, top);
        info!(sources = response.sources.len(), "compose complete");
        Ok(response)
    }

    async fn call(&self, agent: &AgentSpec, instruction: &str, prompt: &str) -> Result<String, PipelineError> {
        let request = ModelRequest {
            model: self.models.model(agent.tier),
            instruction,
            prompt,
            grounded: agent.grounded,
            json_output: agent.json_output,
        };
        info!(agent = agent.name, model = request.model, "calling model");
        let reply = self
            .model
            .generate(&request)
            .await
            .map_err(|source| PipelineError::Model {
                stage: agent.name,
                source,
            })?;
        if !reply.grounding_titles.is_empty() {
            info!(agent = agent.name, grounded_on = ?reply.grounding_titles, "grounded reply");
        }
        reply
            .text
            .ok_or_else(|| malformed(agent, "empty response".to_string()))
    }
}

fn emit(events: &EventSink, agent: &AgentSpec, text: String) {
    // A closed receiver only means nobody is listening any more.
    let _ = events.send(Event::new(agent.name, text));
}

fn malformed(agent: &AgentSpec, reason: String) -> PipelineError {
    PipelineError::MalformedOutput {
        stage: agent.name,
        reason,
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
