mod config;
mod gemini;
mod legal;
mod legiscan;
mod pipeline;
mod repl;
mod runner;
mod session;

pub const USER_AGENT: &str = concat!("lawyer-agent/", env!("CARGO_PKG_VERSION"));

use std::io;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};

use config::{APP_NAME, AppContext, Config, USER_ID};
use gemini::GeminiClient;
use legiscan::LegiScanClient;
use pipeline::Pipeline;
use runner::{Runner, run_query, run_session};

const DEFAULT_SESSION: &str = "legal-consultation";
const INTERACTIVE_SESSION: &str = "interactive-session";

#[derive(Parser)]
#[command(name = "lawyer-agent")]
#[command(about = "Answer legal questions with cited web and legislative sources", long_about = None)]
struct Cli {
    /// Queries to run in order. Starts an interactive session when omitted.
    queries: Vec<String>,

    /// Session to create or resume for the given queries
    #[arg(long)]
    session: Option<String>,

    /// Two-letter state code for legislative search (overrides LEGISCAN_STATE)
    #[arg(long)]
    state: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lawyer_agent=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(state) = cli.state {
        config.state = state.trim().to_ascii_uppercase();
    }
    let ctx = AppContext::new(config)?;

    let model = GeminiClient::from_env(ctx.http.clone(), &ctx.config.platform)
        .inspect_err(|e| error!("failed to configure Gemini client: {e}"))?;
    let bills = LegiScanClient::from_env(ctx.http.clone());
    let pipeline = Pipeline::new(model, bills, ctx.config.models.clone(), &ctx.config.state);
    let runner = Runner::new(APP_NAME, USER_ID, pipeline, ctx.sessions.clone());

    info!(state = %ctx.config.state, platform = ?ctx.config.platform, "lawyer agent ready");

    if cli.queries.is_empty() {
        println!("Starting Lawyer Agent Interactive Session...");
        println!("Type 'exit' or 'quit' to end the session.\n");

        runner.acquire_session(INTERACTIVE_SESSION).await?;
        let input = BufReader::new(tokio::io::stdin());
        repl::run_loop(input, tokio::signal::ctrl_c(), |query| {
            let runner = &runner;
            async move {
                if let Err(e) = run_query(runner, INTERACTIVE_SESSION, &query, &mut io::stdout()).await {
                    println!("Error: {e}");
                }
            }
        })
        .await?;
    } else {
        let session = cli.session.as_deref().unwrap_or(DEFAULT_SESSION);
        run_session(&runner, cli.queries, session, &mut io::stdout()).await?;
    }

    Ok(())
}
