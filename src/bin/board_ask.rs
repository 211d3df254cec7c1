//! One-shot question CLI.
//!
//! Asks a single question, printing answer tokens to stdout as they arrive. Logs go to stderr
//! and the log file so the answer stays clean when piped.
use std::io::Write;

use anyhow::{Context, Result};
use boardrag::{
    config, logging,
    pipeline::{AnswerPipeline, DocumentRef},
};
use clap::Parser;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "board-ask",
    about = "Ask a question about the board documents"
)]
struct Cli {
    /// Also print the documents the answer was drawn from.
    #[arg(long)]
    sources: bool,
    /// Question text; multiple words are joined with spaces.
    #[arg(required = true, num_args = 1..)]
    question: Vec<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("failed to load configuration")?;
    logging::init_tracing(logging::ConsoleTarget::Stderr);

    let pipeline = AnswerPipeline::from_config(config).context("failed to build pipeline")?;
    let question = cli.question.join(" ");

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let task = tokio::spawn(async move { pipeline.answer(&question, Some(&tx)).await });

    let mut stdout = std::io::stdout().lock();
    let mut interrupted = false;
    loop {
        tokio::select! {
            token = rx.recv() => {
                let Some(token) = token else { break };
                write!(stdout, "{token}").context("failed to write answer")?;
                stdout.flush().context("failed to flush stdout")?;
            }
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }
    writeln!(stdout).context("failed to write answer")?;

    if interrupted {
        // Dropping the receiver stops generation on the next token.
        drop(rx);
        let _ = task.await;
        anyhow::bail!("interrupted");
    }

    let state = task
        .await
        .context("answer task panicked")?
        .context("failed to answer question")?;

    if cli.sources {
        print_sources(&mut stdout, &state.sources())?;
    }
    Ok(())
}

fn print_sources(out: &mut impl Write, sources: &[DocumentRef]) -> Result<()> {
    if sources.is_empty() {
        return Ok(());
    }
    writeln!(out, "\nSources:")?;
    for source in sources {
        writeln!(
            out,
            "- Document '{}' from Board {} (id: {}, score: {:.3}, passages: {})",
            source.name, source.year, source.id, source.score, source.passages
        )?;
        if let Some(link) = &source.link {
            writeln!(out, "  {link}")?;
        }
    }
    Ok(())
}
