// Public modules
pub mod clustering;
pub mod config;
pub mod fetcher;
pub mod formatter;
pub mod gap;
pub mod interests;
pub mod io;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod ranking;
pub mod reference;
pub mod session;
pub mod summarizer;

// Re-export commonly used types
pub use clustering::{Deduplicator, UnionFind};
pub use config::{default_config_path, load_feeds_file, AppConfig, DigestConfig, FeedConfig};
pub use fetcher::FeedFetcher;
pub use formatter::DigestFormatter;
pub use gap::{improvement_prompt, suggestion_report, Gap, GapAnalyzer, GapCause, ReferenceItem, SuggestedFix};
pub use interests::InterestFilter;
pub use io::{get_default_runs_dir, latest_snapshot, load_snapshot, save_snapshot, RunSnapshot};
pub use models::{Article, ArticleGroup, Category, MergeReason, MergeRule, RankedGroup};
pub use pipeline::{Pipeline, PipelineRun};
pub use ranking::Ranker;
pub use reference::{find_gaps, DigestEntry};
pub use session::{ConfigMutation, Session, SessionOutcome};
pub use summarizer::{LlmSummarizer, Summary};
