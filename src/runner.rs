use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::gemini::ModelClient;
use crate::legiscan::BillSearch;
use crate::pipeline::{Event, EventSink, Pipeline, PipelineError};
use crate::session::{Acquired, Author, Message, SessionError, SessionKey, SessionStore};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

/// Runs the pipeline for turns of a stored conversation.
pub struct Runner<M, B> {
    app_name: String,
    user_id: String,
    pipeline: Pipeline<M, B>,
    sessions: Arc<SessionStore>,
}

impl<M: ModelClient, B: BillSearch> Runner<M, B> {
    pub fn new(app_name: &str, user_id: &str, pipeline: Pipeline<M, B>, sessions: Arc<SessionStore>) -> Self {
        Self {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            pipeline,
            sessions,
        }
    }

    pub fn session_key(&self, session_id: &str) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, session_id)
    }

    pub async fn acquire_session(&self, session_id: &str) -> Result<Acquired, SessionError> {
        self.sessions.acquire(self.session_key(session_id)).await
    }

    /// Runs one user turn against an existing session, forwarding every
    /// event to `sink` as soon as the pipeline produces it.
    pub async fn run_turn(&self, session_id: &str, message: Message, sink: &EventSink) -> Result<(), RunError> {
        let key = self.session_key(session_id);
        let Some(session) = self.sessions.get(&key).await else {
            return Err(SessionError::NotFound(key).into());
        };
        let earlier: Vec<String> = session
            .history
            .into_iter()
            .filter(|m| m.author == Author::User)
            .map(|m| m.text)
            .collect();
        self.sessions.append(&key, [message.clone()], []).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let forward = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                let _ = sink.send(event.clone());
                seen.push(event);
            }
            seen
        };
        let (outcome, seen) = tokio::join!(self.pipeline.run(&message.text, &earlier, tx), forward);

        let replies = seen
            .into_iter()
            .map(|event| Message::agent(event.author, event.text));
        let slots = outcome.as_ref().map(|state| state.slots()).unwrap_or_default();
        self.sessions.append(&key, replies, slots).await?;

        outcome.map(|_| ()).map_err(RunError::from)
    }
}

/// One query or an ordered list of queries for [`run_session`].
#[derive(Debug, Clone, Default)]
pub struct Queries(pub Vec<String>);

impl From<&str> for Queries {
    fn from(query: &str) -> Self {
        Self(vec![query.to_string()])
    }
}

impl From<String> for Queries {
    fn from(query: String) -> Self {
        Self(vec![query])
    }
}

impl From<Vec<String>> for Queries {
    fn from(queries: Vec<String>) -> Self {
        Self(queries)
    }
}

impl<const N: usize> From<[&str; N]> for Queries {
    fn from(queries: [&str; N]) -> Self {
        Self(queries.iter().map(|q| q.to_string()).collect())
    }
}

/// Creates or resumes `session_name` and runs each query in order, printing
/// every user turn and every non-empty agent reply to `out`.
pub async fn run_session<M, B>(
    runner: &Runner<M, B>,
    queries: impl Into<Queries>,
    session_name: &str,
    out: &mut impl Write,
) -> Result<(), RunError>
where
    M: ModelClient,
    B: BillSearch,
{
    writeln!(out, "\n### Session: {session_name}")?;

    let acquired = runner.acquire_session(session_name).await?;
    if acquired.is_new() {
        writeln!(out, "New session created: {session_name}")?;
    } else {
        let session = acquired.session();
        debug!(
            session = %session.key,
            created_at = %session.created_at,
            turns = session.history.len(),
            "resuming session"
        );
        writeln!(out, "Retrieved existing session: {session_name}")?;
    }

    let queries = queries.into();
    if queries.0.is_empty() {
        writeln!(out, "No queries provided!")?;
        return Ok(());
    }

    for query in &queries.0 {
        writeln!(out, "\nUser > {query}")?;
        run_query(runner, session_name, query, out).await?;
    }

    Ok(())
}

/// Runs one query against an existing session, printing every non-empty
/// agent reply to `out` as it arrives.
pub async fn run_query<M, B>(
    runner: &Runner<M, B>,
    session_name: &str,
    query: &str,
    out: &mut impl Write,
) -> Result<(), RunError>
where
    M: ModelClient,
    B: BillSearch,
{
    info!(session = session_name, "running turn");

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let print = async {
        while let Some(event) = rx.recv().await {
            if let Some(text) = event.display_text() {
                writeln!(out, "Agent > {text}")?;
                out.flush()?;
            }
        }
        Ok::<(), io::Error>(())
    };
    let (outcome, printed) = tokio::join!(
        async {
            let result = runner.run_turn(session_name, Message::user(query), &tx).await;
            drop(tx);
            result
        },
        print
    );
    printed?;
    outcome.inspect_err(|e| error!(error = %e, "turn failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSelection;
    use crate::legiscan::LegiScanError;
    use crate::pipeline::mocks::{MockBills, MockModel, bills};

    const INTAKE_REPLY: &str = r#"["contract", "breach", "remedies"]"#;
    const WEB_REPLY: &str = r#"[{"title": "Breach of contract basics", "description": "Overview."}]"#;
    const RERANK_REPLY: &str = r#"[{"source": "Google", "title": "Breach of contract basics", "description": "Overview."}]"#;
    const COMPOSE_REPLY: &str = r#"{"reasoning": "r", "summary": "A breach entitles you to damages.", "sources": [{"title": "Breach of contract basics", "source": "Google"}]}"#;

    fn runner(replies: &[&str]) -> Runner<MockModel, MockBills> {
        let pipeline = Pipeline::new(
            MockModel::with_texts(replies),
            MockBills::returning(Ok(bills(&[]))),
            ModelSelection::default(),
            "CA",
        );
        Runner::new("lawyer_agent", "default", pipeline, Arc::new(SessionStore::new()))
    }

    fn full_turn() -> Vec<&'static str> {
        vec![INTAKE_REPLY, WEB_REPLY, RERANK_REPLY, COMPOSE_REPLY]
    }

    #[tokio::test]
    async fn run_session_prints_turns_and_replies() {
        let runner = runner(&full_turn());
        let mut out = Vec::new();

        run_session(&runner, "What is contract law?", "legal-session", &mut out)
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("### Session: legal-session"));
        assert!(text.contains("New session created: legal-session"));
        assert!(text.contains("User > What is contract law?"));
        assert!(text.contains("Agent > Search terms: contract, breach, remedies"));
        assert!(text.contains("Agent > A breach entitles you to damages."));
    }

    #[tokio::test]
    async fn second_run_reuses_session() {
        let mut replies = full_turn();
        replies.extend(full_turn());
        let runner = runner(&replies);

        run_session(&runner, "first", "s", &mut io::sink()).await.unwrap();
        let mut out = Vec::new();
        run_session(&runner, "second", "s", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Retrieved existing session: s"));

        let session = runner.sessions.get(&runner.session_key("s")).await.unwrap();
        let user_turns: Vec<_> = session
            .history
            .iter()
            .filter(|m| m.author == Author::User)
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(user_turns, ["first", "second"]);
        assert!(session.state.contains_key("composed_response"));
    }

    #[tokio::test]
    async fn list_of_queries_runs_in_order() {
        let mut replies = full_turn();
        replies.extend(full_turn());
        let runner = runner(&replies);
        let mut out = Vec::new();

        run_session(&runner, ["Hello!", "Explain tort law"], "intro", &mut out)
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let hello = text.find("User > Hello!").unwrap();
        let tort = text.find("User > Explain tort law").unwrap();
        assert!(hello < tort);
    }

    #[tokio::test]
    async fn no_queries_skips_pipeline() {
        let runner = runner(&[]);
        let mut out = Vec::new();

        run_session(&runner, Queries::default(), "empty", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("No queries provided!"));
        assert!(runner.pipeline_model_calls().is_empty());
    }

    #[tokio::test]
    async fn run_turn_requires_existing_session() {
        let runner = runner(&full_turn());
        let (tx, _rx) = mpsc::unbounded_channel::<Event>();

        let err = runner.run_turn("missing", Message::user("hi"), &tx).await.unwrap_err();
        assert!(matches!(err, RunError::Session(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_turn_is_recorded_and_reported() {
        let pipeline = Pipeline::new(
            MockModel::with_texts(&[INTAKE_REPLY, WEB_REPLY]),
            MockBills::returning(Err(LegiScanError::ApiKeyNotSet)),
            ModelSelection::default(),
            "CA",
        );
        let runner = Runner::new("lawyer_agent", "default", pipeline, Arc::new(SessionStore::new()));
        let mut out = Vec::new();

        let err = run_session(&runner, "q", "s", &mut out).await.unwrap_err();

        assert!(err.to_string().contains("LEGISCAN_API_KEY"));
        let session = runner.sessions.get(&runner.session_key("s")).await.unwrap();
        assert_eq!(session.history[0], Message::user("q"));
        assert!(session.state.is_empty());
    }

    #[tokio::test]
    async fn run_query_appends_to_acquired_session() {
        let mut replies = full_turn();
        replies.extend(full_turn());
        let runner = runner(&replies);
        runner.acquire_session("interactive-session").await.unwrap();

        let mut out = Vec::new();
        run_query(&runner, "interactive-session", "first", &mut out).await.unwrap();
        run_query(&runner, "interactive-session", "second", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("### Session"));
        assert_eq!(text.matches("Agent > A breach entitles you to damages.").count(), 2);
        let session = runner.sessions.get(&runner.session_key("interactive-session")).await.unwrap();
        assert_eq!(session.history.iter().filter(|m| m.author == Author::User).count(), 2);
    }

    #[tokio::test]
    async fn follow_up_intake_sees_earlier_questions() {
        let mut replies = full_turn();
        replies.extend(full_turn());
        let runner = runner(&replies);

        run_session(&runner, ["What is contract law?", "Give me an example"], "follow-up", &mut io::sink())
            .await
            .unwrap();

        let calls = runner.pipeline_model_calls();
        assert_eq!(calls.len(), 8);
        assert!(!calls[0].prompt.contains("Earlier questions"));
        let second_intake = &calls[4].prompt;
        assert!(second_intake.contains("- What is contract law?"));
        assert!(second_intake.contains("\"Give me an example\""));
        assert!(calls[7].prompt.contains("What is contract law?"));
    }

    impl Runner<MockModel, MockBills> {
        fn pipeline_model_calls(&self) -> Vec<crate::pipeline::mocks::CapturedRequest> {
            self.pipeline.model().captured()
        }
    }
}
