#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crew_desk_content::load_content;
use crew_desk_domain::{hash_bytes, HistoryCategory, Persona, ProgressEvent, RunId, Stage};
use crew_desk_pipeline::{run_with_progress, PipelineRun, RunFailure, StageResults};
use crew_desk_runtime::AgentRuntime;
use crew_desk_store::{PromptOverrides, READ_ARTICLE_WINDOW};
use time::Date;

pub const DEFAULT_ARTICLE_COUNT: usize = 7;

pub const DEFAULT_NEWS_TOPICS: [&str; 15] = [
    "Artificial Intelligence",
    "Machine Learning",
    "Deep Learning",
    "Large Language Models",
    "LLM",
    "GPT",
    "ChatGPT",
    "Generative AI",
    "Computer Vision",
    "Natural Language Processing",
    "NLP",
    "AI Agents",
    "AI Tools",
    "Neural Networks",
    "Transformer",
];

const LISTED_FILES: usize = 10;
const PERSONA_TOPICS: usize = 5;
const TASK_TOPICS: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsRequest {
    pub topics: Vec<String>,
    pub article_count: usize,
    /// Already reported URLs, oldest first.
    pub read_urls: Vec<String>,
}

impl Default for NewsRequest {
    fn default() -> Self {
        Self {
            topics: DEFAULT_NEWS_TOPICS
                .iter()
                .map(ToString::to_string)
                .collect(),
            article_count: DEFAULT_ARTICLE_COUNT,
            read_urls: Vec::new(),
        }
    }
}

/// Domain inputs for one of the four pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrewRequest {
    Documentation { files: Vec<PathBuf> },
    RefactorReview { files: Vec<PathBuf> },
    TechResearch { query: String },
    DailyNews(NewsRequest),
}

impl CrewRequest {
    #[must_use]
    pub fn category(&self) -> HistoryCategory {
        match self {
            Self::Documentation { .. } => HistoryCategory::Documentation,
            Self::RefactorReview { .. } => HistoryCategory::Refactoring,
            Self::TechResearch { .. } => HistoryCategory::Research,
            Self::DailyNews(_) => HistoryCategory::DailyNews,
        }
    }

    /// Prompt override section for this pipeline's personas.
    #[must_use]
    pub fn prompt_section(&self) -> &'static str {
        self.category().as_str()
    }

    /// What the history log records as this run's inputs.
    #[must_use]
    pub fn history_inputs(&self) -> Vec<String> {
        match self {
            Self::Documentation { files } | Self::RefactorReview { files } => files
                .iter()
                .map(|file| file.display().to_string())
                .collect(),
            Self::TechResearch { query } => vec![query.clone()],
            Self::DailyNews(news) => news.topics.clone(),
        }
    }
}

/// Stage names per pipeline, in execution order.
#[must_use]
pub fn stage_names(category: HistoryCategory) -> &'static [&'static str] {
    match category {
        HistoryCategory::Documentation => &["analyze", "write"],
        HistoryCategory::Refactoring => &["audit", "quality", "refactor"],
        HistoryCategory::Research => &["research", "compare", "recommend"],
        HistoryCategory::DailyNews => &["hunt", "analyze", "report"],
    }
}

/// Artifact file name used when the caller does not pick one.
#[must_use]
pub fn default_output_path(request: &CrewRequest, output_dir: &Path, today: Date) -> PathBuf {
    let name = match request {
        CrewRequest::Documentation { files } => file_based_name("DOCS", files),
        CrewRequest::RefactorReview { files } => file_based_name("REFACTORING", files),
        CrewRequest::TechResearch { query } => {
            let digest = hash_bytes(query.as_bytes());
            format!("TECH_RESEARCH_{}.md", &digest[..8])
        }
        CrewRequest::DailyNews(_) => format!(
            "TECH_NEWS_{:04}{:02}{:02}.md",
            today.year(),
            u8::from(today.month()),
            today.day()
        ),
    };
    output_dir.join(name)
}

fn file_based_name(prefix: &str, files: &[PathBuf]) -> String {
    match files {
        [single] => {
            let stem = single
                .file_stem()
                .map_or_else(
                    || "output".to_string(),
                    |s| s.to_string_lossy().into_owned(),
                );
            format!("{prefix}_{stem}.md")
        }
        many => format!("{prefix}_MultiFile_{}files.md", many.len()),
    }
}

fn target_description(files: &[PathBuf]) -> String {
    match files {
        [single] => single.display().to_string(),
        many => format!("{} files", many.len()),
    }
}

fn bullet_list(items: &[String], max: usize) -> String {
    let mut out = items
        .iter()
        .take(max)
        .map(|item| format!("  - {item}"))
        .collect::<Vec<_>>()
        .join("\n");
    if items.len() > max {
        out.push_str(&format!("\n  ... and {} more", items.len() - max));
    }
    out
}

fn absolute_listing(files: &[PathBuf]) -> String {
    let cwd = std::env::current_dir().unwrap_or_default();
    let listed: Vec<String> = files
        .iter()
        .map(|file| cwd.join(file).display().to_string())
        .collect();
    bullet_list(&listed, LISTED_FILES)
}

fn persona(
    prompts: &PromptOverrides,
    section: &str,
    stage: &str,
    role: &str,
    goal: String,
    backstory: &str,
) -> Persona {
    Persona::new(
        role,
        goal,
        prompts.get_enhanced_backstory(section, stage, backstory),
    )
}

/// Documentation pipeline: analyze the code, then write the docs from that analysis.
#[must_use]
pub fn documentation_stages(
    files: &[PathBuf],
    content: &str,
    output: &Path,
    prompts: &PromptOverrides,
) -> Vec<Stage> {
    let section = HistoryCategory::Documentation.as_str();
    let target = target_description(files);

    let analyze = Stage::new(
        "analyze",
        persona(
            prompts,
            section,
            "analyze",
            "Senior Python Developer",
            format!("Analyze the code in {target} and explain its functionality in depth"),
            "You are a software engineer with many years of experience reading unfamiliar \
             code. You recognize architecture patterns and design decisions quickly and can \
             explain how modules, classes and functions fit together.",
        ),
        format!(
            "Thoroughly analyze the following code files.\n\nFiles being analyzed:\n{}\n\n\
             Complete file contents:\n{content}\n\n\
             Cover the overall purpose, the main types and functions, key dependencies, data \
             flow, notable algorithms, inputs and outputs, error handling, and how the files \
             work together.",
            absolute_listing(files)
        ),
    );

    let write = Stage::new(
        "write",
        persona(
            prompts,
            section,
            "write",
            "Technical Documentation Writer",
            "Create comprehensive, user-friendly documentation based on technical analysis"
                .to_string(),
            "You are a technical writer who turns dense analysis into well structured \
             markdown with installation notes, usage examples and an API reference.",
        ),
        "Using the technical analysis below, write README-style markdown documentation with \
         sections for Overview, Installation, Usage, API Reference, Architecture, Important \
         Notes and at least two practical Examples. Respond with the markdown document only.",
    )
    .depends_on(["analyze"])
    .with_output_artifact(output);

    vec![analyze, write]
}

/// Refactor review: security audit and quality review, then a refactoring report from both.
#[must_use]
pub fn refactor_review_stages(
    files: &[PathBuf],
    content: &str,
    output: &Path,
    prompts: &PromptOverrides,
) -> Vec<Stage> {
    let section = HistoryCategory::Refactoring.as_str();
    let target = target_description(files);
    let listing = absolute_listing(files);

    let audit = Stage::new(
        "audit",
        persona(
            prompts,
            section,
            "audit",
            "Security Auditor",
            format!("Identify security vulnerabilities and potential risks in {target}"),
            "You are an application security specialist. You spot injection risks, unsafe \
             deserialization, secrets in code and weak input validation.",
        ),
        format!(
            "Perform a security audit of the following code.\n\nFiles:\n{listing}\n\n\
             Contents:\n{content}\n\n\
             List every finding with its severity, location and a suggested fix."
        ),
    );

    let quality = Stage::new(
        "quality",
        persona(
            prompts,
            section,
            "quality",
            "Clean Code Reviewer",
            "Analyze code quality, adherence to best practices, and suggest improvements"
                .to_string(),
            "You are a clean code advocate focused on naming, function size, duplication, \
             cohesion and testability.",
        ),
        format!(
            "Review the code quality of the following code.\n\nFiles:\n{listing}\n\n\
             Contents:\n{content}\n\n\
             Point out readability, structure and maintainability problems with concrete examples."
        ),
    );

    let refactor = Stage::new(
        "refactor",
        persona(
            prompts,
            section,
            "refactor",
            "Refactoring Specialist",
            "Synthesize feedback and provide concrete refactored code with improvements"
                .to_string(),
            "You are a refactoring expert who restructures code without changing behavior \
             and explains every change.",
        ),
        "Combine the security audit and the quality review below into one markdown \
         refactoring report. Prioritize the issues, show refactored code for the important \
         ones, and close with a checklist of remaining work.",
    )
    .depends_on(["audit", "quality"])
    .with_output_artifact(output);

    vec![audit, quality, refactor]
}

/// Tech research: research, compare using the research, recommend using both.
#[must_use]
pub fn tech_research_stages(query: &str, output: &Path, prompts: &PromptOverrides) -> Vec<Stage> {
    let section = HistoryCategory::Research.as_str();

    let research = Stage::new(
        "research",
        persona(
            prompts,
            section,
            "research",
            "Tech Research Analyst",
            format!("Conduct comprehensive research on: {query}"),
            "You are a technology researcher who finds current, credible information on \
             tools, frameworks and practices, and separates facts from marketing.",
        ),
        format!(
            "Research the following question: {query}\n\n\
             Gather the relevant technologies, their maturity, adoption, strengths, weaknesses \
             and recent developments. Cite sources."
        ),
    );

    let compare = Stage::new(
        "compare",
        persona(
            prompts,
            section,
            "compare",
            "Technology Comparison Specialist",
            "Analyze and compare technologies based on multiple criteria".to_string(),
            "You are an analyst who builds fair side-by-side comparisons across performance, \
             cost, ecosystem and learning curve.",
        ),
        format!(
            "Using the research below, compare the candidate technologies for: {query}\n\n\
             Present a comparison table and explain the trade-offs."
        ),
    )
    .depends_on(["research"]);

    let recommend = Stage::new(
        "recommend",
        persona(
            prompts,
            section,
            "recommend",
            "Technical Strategy Advisor (CTO)",
            "Provide strategic recommendations based on research and comparison".to_string(),
            "You are a seasoned CTO who turns research into clear, pragmatic technology \
             decisions with adoption plans and risk notes.",
        ),
        format!(
            "Write the final markdown research report for: {query}\n\n\
             Include an executive summary, the key findings, the comparison, a recommendation \
             with reasoning, an adoption roadmap and the main risks."
        ),
    )
    .depends_on(["research", "compare"])
    .with_output_artifact(output);

    vec![research, compare, recommend]
}

/// Daily news: hunt for articles, analyze them, then write the digest.
#[must_use]
pub fn daily_news_stages(
    news: &NewsRequest,
    output: &Path,
    prompts: &PromptOverrides,
) -> Vec<Stage> {
    let section = HistoryCategory::DailyNews.as_str();
    let count = news.article_count;
    let persona_topics = news
        .topics
        .iter()
        .take(PERSONA_TOPICS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let task_topics = news
        .topics
        .iter()
        .take(TASK_TOPICS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    let skip = news.read_urls.len().saturating_sub(READ_ARTICLE_WINDOW);
    let recent: Vec<String> = news.read_urls[skip..].to_vec();
    let mut already_read = if recent.is_empty() {
        "  (No articles read yet)".to_string()
    } else {
        bullet_list(&recent, READ_ARTICLE_WINDOW)
    };
    if skip > 0 {
        already_read.push_str(&format!("\n  ... and {skip} older articles"));
    }

    let hunt = Stage::new(
        "hunt",
        persona(
            prompts,
            section,
            "hunt",
            "AI News Hunter",
            format!("Find {count} fresh, high-quality AI/ML articles about: {persona_topics}"),
            "You are a news curator for AI and machine learning. You search research blogs, \
             preprint servers and trending repositories, and you skip clickbait.",
        ),
        format!(
            "Search for {count} new and unique AI/ML articles published recently.\n\n\
             Topics: {task_topics}\n\n\
             Do not include any of these already reported articles:\n{already_read}\n\n\
             For each article give the title, the URL, the source and the publication date."
        ),
    );

    let analyze = Stage::new(
        "analyze",
        persona(
            prompts,
            section,
            "analyze",
            "AI Content Analyzer",
            "Read and analyze each AI article deeply, extract key insights and create detailed \
             summaries"
                .to_string(),
            "You are a technical analyst who reads AI papers and articles and extracts the key \
             concepts, model architectures and practical applications.",
        ),
        format!(
            "For each article found below, write a detailed summary of 200 to 300 words, list \
             its key takeaways, and rate its relevance. Keep each article's URL. Analyze all \
             {count} articles."
        ),
    )
    .depends_on(["hunt"]);

    let report = Stage::new(
        "report",
        persona(
            prompts,
            section,
            "report",
            "AI News Report Writer",
            "Create a well-organized daily AI/ML news digest report with detailed summaries"
                .to_string(),
            "You are a technical writer who produces scannable daily digests with clear \
             categories and priorities.",
        ),
        "Write today's AI news digest in markdown from the articles and analyses below. Group \
         articles by category, keep every article's URL as a link, include the detailed \
         summaries, and end with the key trends of the day.",
    )
    .depends_on(["hunt", "analyze"])
    .with_output_artifact(output);

    vec![hunt, analyze, report]
}

/// Build the stage list for a request, reading input files where the pipeline needs them.
#[must_use]
pub fn build_stages(request: &CrewRequest, output: &Path, prompts: &PromptOverrides) -> Vec<Stage> {
    match request {
        CrewRequest::Documentation { files } => {
            documentation_stages(files, &load_content(files), output, prompts)
        }
        CrewRequest::RefactorReview { files } => {
            refactor_review_stages(files, &load_content(files), output, prompts)
        }
        CrewRequest::TechResearch { query } => tech_research_stages(query, output, prompts),
        CrewRequest::DailyNews(news) => daily_news_stages(news, output, prompts),
    }
}

#[derive(Debug, Clone)]
pub struct CrewOutcome {
    pub run_id: RunId,
    pub artifact: String,
    pub results: StageResults,
}

/// Run a pipeline to completion on a worker thread, reporting progress as stages finish.
///
/// The final stage writes `output_path`; its text is returned as the artifact.
///
/// # Errors
/// Returns `RunFailure` naming the failing stage and cause.
pub fn run_crew<F>(
    request: &CrewRequest,
    output_path: &Path,
    runtime: Arc<dyn AgentRuntime>,
    prompts: &PromptOverrides,
    on_progress: F,
) -> Result<CrewOutcome, RunFailure>
where
    F: FnMut(&ProgressEvent),
{
    let stages = build_stages(request, output_path, prompts);
    let run = PipelineRun::new(stages).map_err(|error| RunFailure {
        run_id: RunId::new(),
        error,
        completed: StageResults::new(),
    })?;
    let run_id = run.run_id();
    tracing::info!(
        run_id = %run_id,
        crew = request.category().as_str(),
        output = %output_path.display(),
        "crew run starting"
    );

    let run = run_with_progress(run, runtime, POLL_INTERVAL, on_progress)?;
    let artifact = run.final_result().unwrap_or_default().to_string();
    Ok(CrewOutcome {
        run_id,
        artifact,
        results: run.into_results(),
    })
}
