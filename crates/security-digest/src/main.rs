use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use shared::{
    default_config_path, get_default_runs_dir, load_feeds_file, save_snapshot, AppConfig,
    Category, DigestFormatter, FeedFetcher, LlmSummarizer, Pipeline, RunSnapshot,
};
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser)]
#[command(name = "security-digest")]
#[command(about = "Fetch, deduplicate, rank and summarize security news into a Markdown digest")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only keep stories matching the configured interest keywords
    #[arg(short, long)]
    interests: bool,

    /// Skip LLM summarization and use the feeds' own summaries
    #[arg(long)]
    no_llm: bool,

    /// Override the output directory from the config
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Extra feeds, one `url[,lang[,name]]` per line
    #[arg(long)]
    feeds_file: Option<PathBuf>,

    /// Also print the digest to stdout
    #[arg(long)]
    print: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::configure_logging();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config = AppConfig::load(&config_path)?;

    if let Some(path) = &args.feeds_file {
        let extra = load_feeds_file(path)?;
        println!("✓ Loaded {} extra feeds from {}", extra.len(), path.display());
        config.digest.feeds.extend(extra);
    }
    if let Some(dir) = args.output_dir {
        config.output.directory = dir;
    }
    if args.interests && config.digest.interest_keywords.is_empty() {
        anyhow::bail!(
            "--interests needs interest_keywords in {}",
            config_path.display()
        );
    }

    let now = Utc::now();

    println!("\n📡 Fetching {} feeds...", config.digest.feeds.len());
    let fetcher = FeedFetcher::new()?;
    let articles = fetcher.fetch_all(&config.digest.feeds).await;

    if articles.is_empty() {
        println!("No articles found. Check the feed list in {}.", config_path.display());
        return Ok(());
    }
    println!("✓ Fetched {} articles", articles.len());

    println!("\n🔗 Deduplicating and ranking...");
    let mut run = Pipeline::new(&config.digest).run(articles, args.interests, now);
    println!(
        "✓ {} unique stories from {} in-window articles",
        run.groups.len(),
        run.groups.iter().map(|g| g.members.len()).sum::<usize>()
    );
    if args.interests {
        println!("✓ {} stories after interest filtering", run.kept.len());
    }
    for category in Category::ALL {
        let count = run.output.iter().filter(|r| r.category == category).count();
        if count > 0 {
            println!("  {}: {}", category, count);
        }
    }

    match (&config.llm, args.no_llm) {
        (_, true) => println!("\n⏭  Skipping LLM summarization"),
        (None, false) => println!("\n⏭  No [llm] section in config, skipping summarization"),
        (Some(llm), false) => {
            println!("\n🤖 Summarizing {} stories...", run.output.len());
            println!("  (This may take a minute...)");
            match LlmSummarizer::new(llm.clone()) {
                Ok(summarizer) => {
                    let attached = summarizer.summarize(&mut run.output).await;
                    println!("✓ Summarized {}/{} stories", attached, run.output.len());
                }
                Err(e) => warn!(error = %e, "summarizer unavailable, continuing without summaries"),
            }
        }
    }

    println!("\n📝 Generating digest...");
    let digest = DigestFormatter::generate(&run.output, now, Utc::now());
    let digest_path = DigestFormatter::save(&digest, &config.output, now)
        .context("Failed to save digest")?;

    if args.print {
        println!("\n{}", digest);
    }

    let snapshot_path = get_default_runs_dir()
        .and_then(|dir| save_snapshot(&RunSnapshot::new(run), &dir));
    match snapshot_path {
        Ok(path) => println!("✓ Run snapshot saved to: {}", path.display()),
        Err(e) => warn!(error = %e, "could not save run snapshot"),
    }

    println!("\n✅ Digest saved to: {}", digest_path.display());

    Ok(())
}
