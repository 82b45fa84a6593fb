use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use shared::reference::{
    entries_from_output, fetch_reference, load_reference_file, parse_digest_markdown,
};
use shared::{
    default_config_path, find_gaps, get_default_runs_dir, latest_snapshot, load_snapshot,
    suggestion_report, AppConfig, FeedFetcher, Gap, GapAnalyzer, LlmSummarizer, Pipeline,
    PipelineRun, Session,
};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(name = "analyze-gap")]
#[command(about = "Explain why known security stories are missing from a digest and fix the config")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Page whose links are the stories the digest should have covered
    #[arg(short, long)]
    reference: Option<String>,

    /// File of `title<TAB>url` lines (or bare URLs) to compare against
    #[arg(long)]
    reference_file: Option<PathBuf>,

    /// Compare against this Markdown digest instead of the run's output
    #[arg(short, long)]
    digest: Option<PathBuf>,

    /// Run snapshot to analyze (defaults to the latest one)
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Fetch the feeds again instead of using a saved run
    #[arg(long)]
    refetch: bool,

    /// Apply interest filtering when refetching
    #[arg(short, long)]
    interests: bool,

    /// Print the report and exit without starting the session
    #[arg(long)]
    no_interactive: bool,

    /// Skip the LLM improvement plan and print only the heuristic report
    #[arg(long)]
    no_llm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::configure_logging();
    let args = Args::parse();

    if args.reference.is_none() && args.reference_file.is_none() {
        anyhow::bail!("Give a reference page with --reference or a list with --reference-file");
    }

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = AppConfig::load(&config_path)?;

    let run = load_run(&args, &config).await?;
    println!(
        "✓ Run from {}: {} fetched, {} stories, {} in the digest",
        run.generated_at.format("%Y-%m-%d %H:%M UTC"),
        run.fetched.len(),
        run.groups.len(),
        run.output.len()
    );

    let mut reference = Vec::new();
    if let Some(url) = &args.reference {
        println!("\n🌐 Collecting reference links from {}...", url);
        match fetch_reference(url).await {
            Ok(items) => reference.extend(items),
            Err(e) if args.reference_file.is_some() => {
                warn!(url = %url, error = %e, "reference page unavailable, using the reference file only")
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(path) = &args.reference_file {
        println!("\n📖 Reading reference list: {}", path.display());
        reference.extend(load_reference_file(path)?);
    }
    println!("✓ {} reference items", reference.len());

    let entries = match &args.digest {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read digest {}", path.display()))?;
            parse_digest_markdown(&text)
        }
        None => entries_from_output(&run.output),
    };

    println!("\n🔍 Comparing against {} digest entries...", entries.len());
    let missing = find_gaps(&reference, &entries, config.digest.similarity_threshold);
    let gaps = GapAnalyzer::new(&config.digest, &run, run.generated_at).diagnose_all(&missing);
    println!(
        "✓ {} of {} reference items are missing from the digest\n",
        gaps.len(),
        reference.len()
    );

    println!("{}", improvement_report(&args, &config, &gaps).await);

    if args.no_interactive || gaps.is_empty() {
        return Ok(());
    }

    let outcome = Session::new(gaps, config.digest.clone()).run(io::stdin().lock(), io::stdout())?;

    if outcome.applied.is_empty() {
        println!("\nNo changes applied; {} left untouched.", config_path.display());
        return Ok(());
    }

    config.digest = outcome.config;
    config
        .save(&config_path)
        .context("Failed to save updated config")?;

    println!("\n✅ Saved {} change(s) to {}:", outcome.applied.len(), config_path.display());
    for mutation in &outcome.applied {
        println!("  - {}", mutation.describe());
    }
    io::stdout().flush()?;

    Ok(())
}

async fn improvement_report(args: &Args, config: &AppConfig, gaps: &[Gap]) -> String {
    let llm = match (&config.llm, args.no_llm) {
        (Some(llm), false) if !gaps.is_empty() => llm,
        _ => return suggestion_report(gaps),
    };

    println!("🤖 Asking the LLM for an improvement plan...");
    match LlmSummarizer::new(llm.clone()) {
        Ok(summarizer) => summarizer.improvement_report(gaps).await,
        Err(e) => {
            warn!(error = %e, "LLM client unavailable, using the heuristic report");
            suggestion_report(gaps)
        }
    }
}

async fn load_run(args: &Args, config: &AppConfig) -> Result<PipelineRun> {
    if args.refetch {
        println!("📡 Fetching {} feeds...", config.digest.feeds.len());
        let fetcher = FeedFetcher::new()?;
        let articles = fetcher.fetch_all(&config.digest.feeds).await;
        return Ok(Pipeline::new(&config.digest).run(articles, args.interests, Utc::now()));
    }

    if let Some(path) = &args.snapshot {
        println!("📖 Loading run snapshot: {}", path.display());
        return Ok(load_snapshot(path)?.run);
    }

    let runs_dir = get_default_runs_dir()?;
    match latest_snapshot(&runs_dir)? {
        Some((path, snapshot)) => {
            println!("📖 Using latest run snapshot: {}", display_name(&path));
            Ok(snapshot.run)
        }
        None => anyhow::bail!(
            "No saved runs in {}. Run security-digest first or pass --refetch.",
            runs_dir.display()
        ),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
