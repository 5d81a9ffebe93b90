use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod circuit_breaker;
mod cmd;
mod config;
mod costs;
mod dedup;
mod embedding;
mod errors;
mod generator;
mod judge;
mod metrics;
mod models;
mod observability;
mod pipeline;
mod prelude;
mod prompts;
mod providers;
mod reporter;
mod retry;
mod schema;
mod storage;
mod type_mapping;

/// Generate, judge and store IQ-test questions at scale.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_KEY: OpenAI key (also used for embeddings).
  - ANTHROPIC_API_KEY: Anthropic key.
  - GOOGLE_API_KEY: Google Generative Language key.
  - XAI_API_KEY: xAI key.
  - DATABASE_URL: PostgreSQL connection string for the question store.
  - BACKEND_API_URL, SERVICE_KEY: Run-report endpoint and its service key.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run one bounded generation run.
    Run(cmd::run::RunOpts),
    /// Print the JSON Schemas for structured LLM responses.
    Schema(cmd::schema::SchemaOpts),
}

/// Our entry point. The `run` subcommand reports its outcome through the
/// process exit code, so this function never returns for it.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing. Everything goes to stderr; stdout carries the
    // run summary.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            let exit_code = cmd::run::cmd_run(run_opts).await;
            std::process::exit(exit_code);
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
