#![forbid(unsafe_code)]
//! `crew-desk` command surface: run pipelines, inspect history, edit prompt overrides.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crew_desk_content::{format_file_list, scan_paths, ScanOptions, ScanReport};
use crew_desk_crews::{
    default_output_path, run_crew, stage_names, CrewOutcome, CrewRequest, NewsRequest,
    DEFAULT_ARTICLE_COUNT,
};
use crew_desk_domain::{HistoryCategory, ProgressEvent, RecordId};
use crew_desk_runtime::{api_key_env, route_runtime};
use crew_desk_store::{extract_urls, HistoryLog, HistoryRecord, PromptOverrides, ReadArticleLog};
use serde_json::{json, Value};

mod config;

pub use config::{AppConfig, StorageConfig, DEFAULT_CONFIG_PATH};

const SEARCH_KEY_ENV: &str = "SERPER_API_KEY";

#[derive(Debug, Parser)]
#[command(name = "crew-desk")]
#[command(about = "Run multi-agent LLM pipelines over code and research questions")]
pub struct Cli {
    /// YAML config file (defaults to ./crew-desk.yaml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate documentation for source files
    Docs(SourceArgs),
    /// Security audit, quality review and refactoring report for source files
    Review(SourceArgs),
    /// Research a technology question
    Research(ResearchArgs),
    /// Daily AI news digest
    News(NewsArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Prompts {
        #[command(subcommand)]
        command: PromptsCommand,
    },
    /// List the files a docs or review run would read
    Scan(ScanArgs),
    /// Report whether the configured API keys are usable
    Check,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    #[arg(required = true)]
    paths: Vec<String>,
    #[arg(long, default_value_t = false)]
    no_recursive: bool,
    #[arg(long, default_value_t = false)]
    include_sensitive: bool,
    /// File extension to pick up, without the dot
    #[arg(long = "ext", default_values_t = vec!["py".to_string()])]
    extensions: Vec<String>,
}

impl ScanArgs {
    fn options(&self) -> ScanOptions {
        ScanOptions {
            recursive: !self.no_recursive,
            exclude_sensitive: !self.include_sensitive,
            extensions: self.extensions.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    #[command(flatten)]
    scan: ScanArgs,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ResearchArgs {
    query: String,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct NewsArgs {
    #[arg(long = "topic")]
    topics: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_ARTICLE_COUNT)]
    count: usize,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Forget previously reported articles before searching
    #[arg(long, default_value_t = false)]
    reset_read: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    Documentation,
    Refactoring,
    Research,
    #[value(name = "daily_news")]
    DailyNews,
}

impl From<CategoryArg> for HistoryCategory {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Documentation => Self::Documentation,
            CategoryArg::Refactoring => Self::Refactoring,
            CategoryArg::Research => Self::Research,
            CategoryArg::DailyNews => Self::DailyNews,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List {
        #[arg(long)]
        category: Option<CategoryArg>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        succeeded_only: bool,
    },
    Delete {
        id: String,
    },
    Clear {
        #[arg(long)]
        category: Option<CategoryArg>,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum PromptsCommand {
    Show {
        #[arg(long)]
        section: Option<CategoryArg>,
    },
    SetGlobal {
        text: String,
    },
    Set {
        section: CategoryArg,
        key: String,
        text: String,
    },
}

/// Execute a parsed command line.
///
/// # Errors
/// Returns an error when config loading, a store operation, or a pipeline run fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Docs(args) => {
            let files = resolve_sources(&args.scan)?;
            run_file_crew(&config, CrewRequest::Documentation { files }, args.output)
        }
        Command::Review(args) => {
            let files = resolve_sources(&args.scan)?;
            run_file_crew(&config, CrewRequest::RefactorReview { files }, args.output)
        }
        Command::Research(args) => {
            if args.query.trim().is_empty() {
                return Err(anyhow!("research query MUST be non-empty"));
            }
            let request = CrewRequest::TechResearch { query: args.query };
            let (outcome, record, output) = execute_crew(&config, &request, args.output)?;
            print_json(&run_summary(&outcome, &record, &output))
        }
        Command::News(args) => run_news(&config, args),
        Command::History { command } => run_history(&config, command),
        Command::Prompts { command } => run_prompts(&config, command),
        Command::Scan(args) => {
            let report = scan_paths(&args.paths, &args.options());
            print_json(&scan_summary(&report))
        }
        Command::Check => print_json(&check_keys(&config)),
    }
}

fn resolve_sources(args: &ScanArgs) -> Result<Vec<PathBuf>> {
    let report = scan_paths(&args.paths, &args.options());
    if !report.excluded.is_empty() {
        tracing::warn!(
            count = report.excluded.len(),
            "skipping sensitive files:\n{}",
            format_file_list(&report.excluded, 20)
        );
    }
    if report.valid.is_empty() {
        return Err(anyhow!(
            "no source files with extension(s) {} found under {}",
            args.extensions.join(", "),
            args.paths.join(", ")
        ));
    }
    Ok(report.valid)
}

fn run_file_crew(config: &AppConfig, request: CrewRequest, output: Option<PathBuf>) -> Result<()> {
    let (outcome, record, output) = execute_crew(config, &request, output)?;
    print_json(&run_summary(&outcome, &record, &output))
}

fn run_news(config: &AppConfig, args: NewsArgs) -> Result<()> {
    let mut read_log = ReadArticleLog::open(&config.storage.read_articles_path)?;
    if args.reset_read {
        read_log.clear()?;
    }
    let mut news = NewsRequest {
        article_count: args.count,
        read_urls: read_log.urls(),
        ..NewsRequest::default()
    };
    if !args.topics.is_empty() {
        news.topics = args.topics;
    }

    let (outcome, record, output) =
        execute_crew(config, &CrewRequest::DailyNews(news), args.output)?;
    let added = read_log.record(extract_urls(&outcome.artifact))?;

    let mut summary = run_summary(&outcome, &record, &output);
    summary["new_articles_recorded"] = json!(added);
    print_json(&summary)
}

/// Run one pipeline and record the outcome in the history log either way.
///
/// The log is opened only once the run has finished, so records written by
/// other processes during the run are kept.
fn execute_crew(
    config: &AppConfig,
    request: &CrewRequest,
    output: Option<PathBuf>,
) -> Result<(CrewOutcome, HistoryRecord, PathBuf)> {
    let runtime = route_runtime(&config.runtime)?;
    let prompts = PromptOverrides::open(&config.storage.prompts_path)?;

    let output = match output {
        Some(path) => path,
        None => {
            std::fs::create_dir_all(&config.output_dir).with_context(|| {
                format!(
                    "failed to create output dir {}",
                    config.output_dir.display()
                )
            })?;
            let today = time::OffsetDateTime::now_utc().date();
            default_output_path(request, &config.output_dir, today)
        }
    };

    let category = request.category();
    match run_crew(request, &output, runtime, &prompts, print_progress) {
        Ok(outcome) => {
            let record = open_history(config)?.add(
                category,
                request.history_inputs(),
                Some(output.clone()),
                true,
                None,
            )?;
            tracing::info!(run_id = %outcome.run_id, record = %record.id, "crew run recorded");
            Ok((outcome, record, output))
        }
        Err(failure) => {
            let recorded = open_history(config).and_then(|mut history| {
                history
                    .add(
                        category,
                        request.history_inputs(),
                        Some(output),
                        false,
                        Some(failure.to_string()),
                    )
                    .map_err(anyhow::Error::from)
            });
            if let Err(err) = recorded {
                tracing::warn!(error = %err, "failed to record failed run in history");
            }
            Err(anyhow::Error::new(failure))
        }
    }
}

fn open_history(config: &AppConfig) -> Result<HistoryLog> {
    Ok(HistoryLog::open(
        &config.storage.history_path,
        config.storage.history_max_per_category,
    )?)
}

fn print_progress(event: &ProgressEvent) {
    eprintln!(
        "[{}/{}] {} {}",
        event.completed,
        event.total,
        event.stage_label,
        event.phase.as_str()
    );
}

fn run_summary(outcome: &CrewOutcome, record: &HistoryRecord, output: &Path) -> Value {
    json!({
        "run_id": outcome.run_id.to_string(),
        "category": record.category.as_str(),
        "history_id": record.id.to_string(),
        "output_path": output.display().to_string(),
        "stages": outcome.results.keys().collect::<Vec<_>>(),
        "artifact_chars": outcome.artifact.chars().count(),
    })
}

fn run_history(config: &AppConfig, command: HistoryCommand) -> Result<()> {
    let mut history = open_history(config)?;
    match command {
        HistoryCommand::List {
            category,
            limit,
            succeeded_only,
        } => {
            let records = history.list(category.map(Into::into), limit, succeeded_only);
            let rendered = records
                .iter()
                .map(record_json)
                .collect::<Result<Vec<_>>>()?;
            print_json(&Value::Array(rendered))
        }
        HistoryCommand::Delete { id } => {
            let id: RecordId = id.parse()?;
            let deleted = history.delete(id)?;
            print_json(&json!({ "id": id.to_string(), "deleted": deleted }))
        }
        HistoryCommand::Clear { category } => {
            let category: Option<HistoryCategory> = category.map(Into::into);
            history.clear(category)?;
            print_json(&json!({
                "cleared": category.map_or("all", HistoryCategory::as_str)
            }))
        }
        HistoryCommand::Stats => {
            let stats: serde_json::Map<String, Value> = history
                .statistics()
                .into_iter()
                .map(|(category, stats)| {
                    (
                        category.as_str().to_string(),
                        json!({
                            "total": stats.total,
                            "succeeded": stats.succeeded,
                            "failed": stats.failed,
                            "success_rate": stats.success_rate_label(),
                        }),
                    )
                })
                .collect();
            print_json(&Value::Object(stats))
        }
    }
}

fn record_json(record: &HistoryRecord) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("output_exists".to_string(), json!(record.output_exists));
    }
    Ok(value)
}

fn run_prompts(config: &AppConfig, command: PromptsCommand) -> Result<()> {
    let mut prompts = PromptOverrides::open(&config.storage.prompts_path)?;
    match command {
        PromptsCommand::Show { section } => {
            let sections: Vec<HistoryCategory> = match section {
                Some(section) => vec![section.into()],
                None => HistoryCategory::ALL.to_vec(),
            };
            let mut rendered = serde_json::Map::new();
            for category in sections {
                let section = category.as_str();
                let keys: serde_json::Map<String, Value> = stage_names(category)
                    .iter()
                    .map(|key| {
                        (
                            (*key).to_string(),
                            json!(prompts.get_override(section, key)),
                        )
                    })
                    .collect();
                rendered.insert(section.to_string(), Value::Object(keys));
            }
            print_json(&json!({
                "path": prompts.path().display().to_string(),
                "global_rules": prompts.get_global_rules(),
                "sections": rendered,
            }))
        }
        PromptsCommand::SetGlobal { text } => {
            prompts.set_global_rules(text)?;
            print_json(&json!({ "updated": "global_rules" }))
        }
        PromptsCommand::Set { section, key, text } => {
            let category: HistoryCategory = section.into();
            if !stage_names(category).contains(&key.as_str()) {
                return Err(anyhow!(
                    "unknown stage '{key}' for {}; expected one of: {}",
                    category.as_str(),
                    stage_names(category).join(", ")
                ));
            }
            prompts.set_override(category.as_str(), key.clone(), text)?;
            let updated = format!("{}.{key}", category.as_str());
            print_json(&json!({ "updated": updated }))
        }
    }
}

fn scan_summary(report: &ScanReport) -> Value {
    json!({
        "valid": display_paths(&report.valid),
        "excluded": display_paths(&report.excluded),
        "summary": format_file_list(&report.valid, 20),
    })
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn key_status(env_name: &str) -> &'static str {
    match std::env::var(env_name) {
        Ok(value) if value.trim().is_empty() => "missing",
        Ok(value) if value.starts_with("your_") && value.ends_with("_here") => "placeholder",
        Ok(_) => "ok",
        Err(_) => "missing",
    }
}

fn check_keys(config: &AppConfig) -> Value {
    let runtime_status = api_key_env(&config.runtime).map(|env| {
        let status = key_status(&env);
        (env, status)
    });
    let search_status = key_status(SEARCH_KEY_ENV);
    let runtime_key_status = runtime_status
        .as_ref()
        .map_or("not_required", |(_, status)| *status);
    let runtime_ready = matches!(runtime_key_status, "ok" | "not_required");

    json!({
        "runtime": {
            "provider_name": config.runtime.provider_name,
            "model_id": config.runtime.model_id,
            "api_key_env": runtime_status.as_ref().map(|(env, _)| env.clone()),
            "api_key_status": runtime_key_status,
        },
        "search": {
            "api_key_env": SEARCH_KEY_ENV,
            "api_key_status": search_status,
        },
        "ready": runtime_ready,
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{check_keys, key_status, AppConfig, Cli, Command, HistoryCommand};
    use clap::Parser;

    #[test]
    fn parses_history_list_flags() {
        let cli = Cli::try_parse_from([
            "crew-desk",
            "history",
            "list",
            "--category",
            "daily_news",
            "--limit",
            "3",
            "--succeeded-only",
        ]);
        match cli.map(|cli| cli.command) {
            Ok(Command::History {
                command:
                    HistoryCommand::List {
                        limit,
                        succeeded_only,
                        category,
                    },
            }) => {
                assert_eq!(limit, Some(3));
                assert!(succeeded_only);
                assert!(category.is_some());
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn docs_requires_at_least_one_path() {
        assert!(Cli::try_parse_from(["crew-desk", "docs"]).is_err());
        assert!(Cli::try_parse_from(["crew-desk", "docs", "src", "--ext", "rs"]).is_ok());
    }

    #[test]
    fn mock_runtime_needs_no_api_key() {
        let mut config = AppConfig::default();
        config.runtime.provider_name = "mock".to_string();
        let report = check_keys(&config);
        assert_eq!(report["runtime"]["api_key_status"], "not_required");
        assert_eq!(report["ready"], true);
    }

    #[test]
    fn unset_key_is_missing() {
        let name = format!("CREW_DESK_TEST_UNSET_{}", ulid::Ulid::new());
        assert_eq!(key_status(&name), "missing");
    }
}
