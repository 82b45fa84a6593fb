//! Command loop for walking through diagnosed gaps and applying fixes.
//!
//! States: idle -> viewing (after `detail`) -> confirming (after `apply`) -> idle.
//! Bad input is reported and never changes the state.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::mem;
use thiserror::Error;

use crate::config::{DigestConfig, FeedConfig};
use crate::gap::{suggestion_report, Gap, GapCause};
use crate::normalize::url_host;

const HELP: &str = "Commands:
  list                 show the numbered gaps
  detail <n>           show every field of gap n
  suggest              improvement suggestions grouped by cause
  show-fix <n>         config change that would fix gap n
  apply <n> [keyword]  apply the fix for gap n (keyword overrides the suggestion)
  help                 this list
  quit                 leave and keep the applied changes";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("a feed for {0} is already configured")]
    DuplicateFeed(String),
    #[error("interest keyword \"{0}\" is already configured")]
    DuplicateKeyword(String),
    #[error("interest keyword is empty")]
    EmptyKeyword,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}' (type 'help' for the command list)")]
    Unknown(String),
    #[error("'{0}' needs a gap number")]
    MissingArgument(&'static str),
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("no gap #{index}, choose 1-{count}")]
    OutOfRange { index: usize, count: usize },
    #[error("gap #{0} has no fix that can be applied automatically")]
    NoApplicableFix(usize),
    #[error("gap #{0} is not fixed with a keyword; use 'apply {0}' without one")]
    KeywordNotApplicable(usize),
    #[error(transparent)]
    Rejected(#[from] MutationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Detail(usize),
    Suggest,
    ShowFix(usize),
    Apply { index: usize, keyword: Option<String> },
    Help,
    Quit,
}

/// Parses one input line. Gap numbers are 1-based as shown in `list`.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or("").to_lowercase();

    match name.as_str() {
        "list" | "ls" => Ok(Command::List),
        "detail" => Ok(Command::Detail(parse_number(parts.next(), "detail")?)),
        "suggest" => Ok(Command::Suggest),
        "show-fix" => Ok(Command::ShowFix(parse_number(parts.next(), "show-fix")?)),
        "apply" => {
            let index = parse_number(parts.next(), "apply")?;
            let rest = parts.collect::<Vec<_>>().join(" ");
            let keyword = (!rest.is_empty()).then_some(rest);
            Ok(Command::Apply { index, keyword })
        }
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        _ => Err(CommandError::Unknown(name)),
    }
}

fn parse_number(raw: Option<&str>, command: &'static str) -> Result<usize, CommandError> {
    let raw = raw.ok_or(CommandError::MissingArgument(command))?;
    raw.parse::<usize>()
        .map_err(|_| CommandError::NotANumber(raw.to_string()))
}

/// A validated change to the digest configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigMutation {
    AddFeed(FeedConfig),
    AddInterestKeyword(String),
}

impl ConfigMutation {
    /// The mutation implementing `gap`'s suggested fix, if it has a structured one.
    pub fn for_gap(gap: &Gap, keyword_override: Option<String>) -> Option<Self> {
        if let Some(feed) = &gap.suggested_fix.feed_entry {
            return Some(ConfigMutation::AddFeed(feed.clone()));
        }
        if !Self::takes_keyword(gap) {
            return None;
        }
        keyword_override
            .or_else(|| gap.suggested_fix.keyword.clone())
            .map(|k| ConfigMutation::AddInterestKeyword(k.trim().to_lowercase()))
    }

    /// Whether `gap` is fixed by adding an interest keyword.
    pub fn takes_keyword(gap: &Gap) -> bool {
        gap.suggested_fix.feed_entry.is_none()
            && (gap.cause == GapCause::InterestFiltered || gap.suggested_fix.keyword.is_some())
    }

    /// Checks the mutation against `config` without changing it.
    pub fn validate(&self, config: &DigestConfig) -> Result<(), MutationError> {
        match self {
            ConfigMutation::AddFeed(feed) => {
                let host = url_host(&feed.url).unwrap_or_else(|| feed.url.clone());
                let duplicate = config
                    .feeds
                    .iter()
                    .any(|f| f.url == feed.url || url_host(&f.url).as_deref() == Some(host.as_str()));
                if duplicate {
                    return Err(MutationError::DuplicateFeed(host));
                }
            }
            ConfigMutation::AddInterestKeyword(keyword) => {
                if keyword.trim().is_empty() {
                    return Err(MutationError::EmptyKeyword);
                }
                if config
                    .interest_keywords
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(keyword))
                {
                    return Err(MutationError::DuplicateKeyword(keyword.clone()));
                }
            }
        }
        Ok(())
    }

    /// Applies the mutation, or leaves `config` untouched on error.
    pub fn apply_to(&self, config: &mut DigestConfig) -> Result<(), MutationError> {
        self.validate(config)?;
        match self {
            ConfigMutation::AddFeed(feed) => config.feeds.push(feed.clone()),
            ConfigMutation::AddInterestKeyword(keyword) => {
                config.interest_keywords.push(keyword.clone())
            }
        }
        Ok(())
    }

    /// The config file lines this mutation adds or changes, as a diff.
    pub fn preview(&self, config: &DigestConfig) -> String {
        match self {
            ConfigMutation::AddFeed(feed) => format!(
                "+ [[digest.feeds]]\n+ name = {:?}\n+ url = {:?}\n+ lang = {:?}\n",
                feed.name, feed.url, feed.lang
            ),
            ConfigMutation::AddInterestKeyword(keyword) => {
                let before: Vec<String> = config
                    .interest_keywords
                    .iter()
                    .map(|k| format!("{:?}", k))
                    .collect();
                let mut after = before.clone();
                after.push(format!("{:?}", keyword));
                format!(
                    "  [digest]\n- interest_keywords = [{}]\n+ interest_keywords = [{}]\n",
                    before.join(", "),
                    after.join(", ")
                )
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ConfigMutation::AddFeed(feed) => format!("add feed {} ({})", feed.name, feed.url),
            ConfigMutation::AddInterestKeyword(keyword) => {
                format!("add interest keyword \"{}\"", keyword)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Viewing(usize),
    Confirming { index: usize, mutation: ConfigMutation },
}

/// Result of handling one line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub output: String,
    pub done: bool,
}

impl Step {
    fn show(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            done: false,
        }
    }
}

/// What the caller persists once the session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub applied: Vec<ConfigMutation>,
    pub config: DigestConfig,
}

pub struct Session {
    gaps: Vec<Gap>,
    config: DigestConfig,
    state: SessionState,
    applied: Vec<ConfigMutation>,
}

impl Session {
    pub fn new(gaps: Vec<Gap>, config: DigestConfig) -> Self {
        Self {
            gaps,
            config,
            state: SessionState::Idle,
            applied: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    pub fn applied(&self) -> &[ConfigMutation] {
        &self.applied
    }

    pub fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            applied: self.applied,
            config: self.config,
        }
    }

    /// Handles one line of input.
    pub fn step(&mut self, input: &str) -> Step {
        let input = input.trim();

        if matches!(self.state, SessionState::Confirming { .. }) {
            if let SessionState::Confirming { index, mutation } =
                mem::replace(&mut self.state, SessionState::Idle)
            {
                return self.confirm(index, mutation, input);
            }
        }

        if input.is_empty() {
            return Step::show("");
        }

        match parse_command(input).and_then(|command| self.execute(command)) {
            Ok(step) => step,
            Err(e) => Step::show(format!("error: {}", e)),
        }
    }

    /// Drives the session until `quit` or end of input.
    pub fn run<R: BufRead, W: Write>(mut self, mut reader: R, mut writer: W) -> Result<SessionOutcome> {
        writeln!(writer, "{}", self.render_list()).context("Failed to write to session output")?;
        writeln!(writer, "Type 'help' for commands.").context("Failed to write to session output")?;

        loop {
            let prompt = match self.state {
                SessionState::Confirming { .. } => "apply? [y/N] ",
                _ => "gap> ",
            };
            write!(writer, "{}", prompt).context("Failed to write to session output")?;
            writer.flush().context("Failed to flush session output")?;

            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .context("Failed to read session input")?;
            if read == 0 {
                writeln!(writer).context("Failed to write to session output")?;
                break;
            }

            let step = self.step(&line);
            if !step.output.is_empty() {
                writeln!(writer, "{}", step.output).context("Failed to write to session output")?;
            }
            if step.done {
                break;
            }
        }

        Ok(self.into_outcome())
    }

    fn execute(&mut self, command: Command) -> Result<Step, CommandError> {
        match command {
            Command::List => Ok(Step::show(self.render_list())),
            Command::Detail(n) => {
                let index = self.index(n)?;
                self.state = SessionState::Viewing(index);
                Ok(Step::show(self.render_detail(index)))
            }
            Command::Suggest => Ok(Step::show(suggestion_report(&self.gaps))),
            Command::ShowFix(n) => {
                let index = self.index(n)?;
                let gap = &self.gaps[index];
                match ConfigMutation::for_gap(gap, None) {
                    Some(mutation) => Ok(Step::show(mutation.preview(&self.config))),
                    None => Ok(Step::show(format!(
                        "No automatic fix for gap #{}. {}",
                        n, gap.suggested_fix.note
                    ))),
                }
            }
            Command::Apply { index: n, keyword } => {
                let index = self.index(n)?;
                if keyword.is_some() && !ConfigMutation::takes_keyword(&self.gaps[index]) {
                    return Err(CommandError::KeywordNotApplicable(n));
                }
                let mutation = ConfigMutation::for_gap(&self.gaps[index], keyword)
                    .ok_or(CommandError::NoApplicableFix(n))?;
                mutation.validate(&self.config)?;

                let output = format!(
                    "{}\nApply this change ({})? Type 'y' to confirm.",
                    mutation.preview(&self.config),
                    mutation.describe()
                );
                self.state = SessionState::Confirming { index, mutation };
                Ok(Step::show(output))
            }
            Command::Help => Ok(Step::show(HELP)),
            Command::Quit => Ok(Step {
                output: format!("{} change(s) applied.", self.applied.len()),
                done: true,
            }),
        }
    }

    fn confirm(&mut self, index: usize, mutation: ConfigMutation, answer: &str) -> Step {
        let accepted = matches!(answer.to_lowercase().as_str(), "y" | "yes");
        if !accepted {
            return Step::show("Cancelled, no change applied.");
        }

        match mutation.apply_to(&mut self.config) {
            Ok(()) => {
                let message = format!("✓ Applied fix for gap #{}: {}", index + 1, mutation.describe());
                self.applied.push(mutation);
                Step::show(message)
            }
            Err(e) => Step::show(format!("error: {}", e)),
        }
    }

    fn index(&self, n: usize) -> Result<usize, CommandError> {
        if n == 0 || n > self.gaps.len() {
            return Err(CommandError::OutOfRange {
                index: n,
                count: self.gaps.len(),
            });
        }
        Ok(n - 1)
    }

    fn render_list(&self) -> String {
        if self.gaps.is_empty() {
            return "No gaps: every reference item is in the digest.".to_string();
        }
        let mut out = format!("{} gap(s):\n", self.gaps.len());
        for (i, gap) in self.gaps.iter().enumerate() {
            let fix = if gap.suggested_fix.is_applicable() { " [fix]" } else { "" };
            out.push_str(&format!(
                "  {}) [{}] {}{}\n",
                i + 1,
                gap.cause,
                title_or_url(gap),
                fix
            ));
        }
        out.trim_end().to_string()
    }

    fn render_detail(&self, index: usize) -> String {
        let gap = &self.gaps[index];
        let fix = &gap.suggested_fix;
        let mut out = format!(
            "Gap #{}\n  title:  {}\n  url:    {}\n  cause:  {}\n  detail: {}\n  fix:    {}",
            index + 1,
            gap.reference_title,
            gap.reference_url,
            gap.cause,
            gap.detail,
            fix.note
        );
        if let Some(feed) = &fix.feed_entry {
            out.push_str(&format!("\n  feed:   {} <{}> ({})", feed.name, feed.url, feed.lang));
        }
        if let Some(keyword) = &fix.keyword {
            out.push_str(&format!("\n  keyword: {}", keyword));
        }
        out
    }
}

fn title_or_url(gap: &Gap) -> &str {
    if gap.reference_title.is_empty() {
        &gap.reference_url
    } else {
        &gap.reference_title
    }
}
