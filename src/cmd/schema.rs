//! The `schema` subcommand: print the JSON Schemas used for structured
//! LLM responses.

use clap::{Args, ValueEnum};

use crate::models::{EvaluationResponse, QuestionResponse};
use crate::prelude::*;
use crate::schema::schema_for;

/// Which response schema to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum SchemaKind {
    /// The generated-question response schema.
    Generation,
    /// The judge evaluation response schema.
    Evaluation,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// Which schema to print.
    #[clap(value_enum)]
    pub kind: SchemaKind,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `schema` subcommand.
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.kind {
        SchemaKind::Generation => schema_for::<QuestionResponse>(),
        SchemaKind::Evaluation => schema_for::<EvaluationResponse>(),
    };
    let rendered = serde_json::to_string_pretty(&schema)?;
    match &opts.output_path {
        Some(path) => {
            tokio::fs::write(path, rendered.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
