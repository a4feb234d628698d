//! CLI binary for sitedoc-analyzer.
//!
//! A thin shim over the library crate: maps flags to `AnalysisConfig`, runs
//! one of the pipelines (or the HTTP service) and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sitedoc_analyzer::pipeline::{input, llm, render};
use sitedoc_analyzer::{
    analyze_document_stream, grid, grid_channel, AnalysisConfig, AnalysisSection, AppState,
    ConstructionAnalysis, ConverterMode, DeltaFormat, DocumentAnalysisOutput, GridEvent,
    PipelineEvent,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the HTTP service
  sitedoc serve --addr 0.0.0.0:3000

  # 3x3 grid analysis of page 2 of a drawing set
  sitedoc grid --grid-size 3 --page 2 drawings.pdf

  # Grid analysis of a scanned sheet, JSON output
  sitedoc grid --json sheet.png > sheet.json

  # Convert and analyse a specification document
  sitedoc analyze --converter-url http://localhost:8000/convert spec.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          Vision provider key (tile + summary calls)
  ANTHROPIC_API_KEY       Alternative vision provider key
  GEMINI_API_KEY          Structured-analysis stream key
  SITEDOC_LLM_PROVIDER    Override vision provider (openai, anthropic, gemini, ollama)
  SITEDOC_MODEL           Override vision model ID
  SITEDOC_CONVERTER_URL   Document-to-markdown converter endpoint
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Analyse construction drawings and documents with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "sitedoc",
    version,
    about = "Analyse construction drawings and documents with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SITEDOC_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SITEDOC_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Listen address.
        #[arg(long, env = "SITEDOC_ADDR", default_value = "127.0.0.1:3000")]
        addr: String,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        document: DocumentArgs,
    },

    /// Tile a drawing and analyse every section.
    Grid {
        /// Local drawing (PDF, PNG, JPEG) or HTTP/HTTPS URL.
        input: String,

        /// Tiles per side (1–8).
        #[arg(short, long, env = "SITEDOC_GRID_SIZE", default_value_t = 2,
              value_parser = clap::value_parser!(u32).range(1..=8))]
        grid_size: u32,

        /// 1-indexed PDF page to analyse.
        #[arg(short, long, env = "SITEDOC_PAGE", default_value_t = 1)]
        page: usize,

        /// Maximum concurrent tile calls.
        #[arg(short, long, env = "SITEDOC_CONCURRENCY", default_value_t = 10)]
        concurrency: usize,

        /// Per-tile call timeout in seconds.
        #[arg(long, env = "SITEDOC_SECTION_TIMEOUT", default_value_t = 60)]
        section_timeout: u64,

        /// Summary call timeout in seconds.
        #[arg(long, env = "SITEDOC_SUMMARY_TIMEOUT", default_value_t = 120)]
        summary_timeout: u64,

        #[command(flatten)]
        model: ModelArgs,

        /// Output the CombinedGridResult as JSON.
        #[arg(long)]
        json: bool,

        /// Disable progress bar.
        #[arg(long, env = "SITEDOC_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Convert a document to markdown and stream a structured analysis of it.
    Analyze {
        /// Local document or HTTP/HTTPS URL.
        input: String,

        #[command(flatten)]
        document: DocumentArgs,

        /// Also write the converted markdown to this file.
        #[arg(long)]
        markdown_out: Option<PathBuf>,

        /// Output the final state as JSON.
        #[arg(long)]
        json: bool,

        /// Disable progress spinner.
        #[arg(long, env = "SITEDOC_NO_PROGRESS")]
        no_progress: bool,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Vision model ID for tile and summary calls (e.g. gpt-4o, claude-sonnet-4-20250514).
    #[arg(long, env = "SITEDOC_MODEL")]
    model: Option<String>,

    /// Vision provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "SITEDOC_LLM_PROVIDER")]
    provider: Option<String>,
}

#[derive(Args, Debug)]
struct DocumentArgs {
    /// Document-to-markdown converter endpoint.
    #[arg(long, env = "SITEDOC_CONVERTER_URL")]
    converter_url: Option<String>,

    /// Converter reply mode: atomic or streamed.
    #[arg(long, env = "SITEDOC_CONVERTER_MODE", default_value = "atomic")]
    converter_mode: ConverterMode,

    /// Structured-analysis model.
    #[arg(long, env = "SITEDOC_STRUCTURED_MODEL")]
    structured_model: Option<String>,

    /// Structured-analysis base URL (Gemini v1beta or OpenAI-compatible).
    #[arg(long, env = "SITEDOC_STRUCTURED_ENDPOINT")]
    structured_endpoint: Option<String>,

    /// Treat the structured endpoint as OpenAI chat-completions streaming.
    #[arg(long)]
    openai_stream: bool,

    /// Path to a text file containing a custom analysis directive.
    #[arg(long, env = "SITEDOC_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Budget for the whole structured-analysis stream, in seconds.
    #[arg(long, env = "SITEDOC_STREAM_TIMEOUT", default_value_t = 300)]
    stream_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if matches!(cli.command, Command::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve {
            addr,
            model,
            document,
        } => {
            let mut builder = AnalysisConfig::builder();
            builder = apply_model_args(builder, &model);
            builder = apply_document_args(builder, &document).await?;
            let config = builder.build().context("Invalid configuration")?;
            sitedoc_analyzer::start_server(&addr, AppState::new(config))
                .await
                .with_context(|| format!("Server on {addr} failed"))?;
        }
        Command::Grid {
            input,
            grid_size,
            page,
            concurrency,
            section_timeout,
            summary_timeout,
            model,
            json,
            no_progress,
        } => {
            let builder = AnalysisConfig::builder()
                .grid_size(grid_size)
                .page_number(page)
                .max_concurrency(concurrency)
                .section_timeout_secs(section_timeout)
                .summary_timeout_secs(summary_timeout);
            let config = apply_model_args(builder, &model)
                .build()
                .context("Invalid configuration")?;
            let show_progress = !cli.quiet && !no_progress && !json;
            run_grid(&input, &config, show_progress, json).await?;
        }
        Command::Analyze {
            input,
            document,
            markdown_out,
            json,
            no_progress,
        } => {
            let builder = apply_document_args(AnalysisConfig::builder(), &document).await?;
            let config = builder.build().context("Invalid configuration")?;
            let show_progress = !cli.quiet && !no_progress && !json;
            run_analyze(&input, &config, markdown_out, show_progress, json).await?;
        }
    }

    Ok(())
}

fn apply_model_args(
    mut builder: sitedoc_analyzer::AnalysisConfigBuilder,
    args: &ModelArgs,
) -> sitedoc_analyzer::AnalysisConfigBuilder {
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    builder
}

async fn apply_document_args(
    mut builder: sitedoc_analyzer::AnalysisConfigBuilder,
    args: &DocumentArgs,
) -> Result<sitedoc_analyzer::AnalysisConfigBuilder> {
    builder = builder
        .converter_mode(args.converter_mode)
        .stream_timeout_secs(args.stream_timeout);
    if let Some(ref url) = args.converter_url {
        builder = builder.converter_url(url);
    }
    if let Some(ref model) = args.structured_model {
        builder = builder.structured_model(model);
    }
    if let Some(ref endpoint) = args.structured_endpoint {
        builder = builder.structured_endpoint(endpoint);
    }
    if args.openai_stream {
        builder = builder.delta_format(DeltaFormat::OpenAi);
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    Ok(builder)
}

fn spinner(prefix: &'static str, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS),
    );
    bar.set_prefix(prefix);
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

// ── grid ─────────────────────────────────────────────────────────────────────

async fn run_grid(input_str: &str, config: &AnalysisConfig, show_progress: bool, json: bool) -> Result<()> {
    let start = Instant::now();
    let doc = input::resolve_input(input_str, config.download_timeout_secs)
        .await
        .with_context(|| format!("Cannot read {input_str}"))?;
    let model = llm::vision_model(config)?;

    let preparing = if doc.is_pdf() {
        let total = render::page_count(doc.bytes.clone()).await?;
        format!("Rendering page {} of {}…", config.page_number, total)
    } else {
        format!("Decoding {}…", doc.name)
    };

    let (tx, mut rx) = grid_channel();
    let bar = show_progress.then(|| spinner("Preparing", &preparing));
    let progress_bar = bar.clone();

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(ref bar) = progress_bar else { continue };
            match event {
                GridEvent::Started { grid_size, total } => {
                    bar.set_length(total as u64);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "{spinner:.cyan} {prefix:.bold}  \
                             [{bar:42.green/238}] {pos:>2}/{len} sections  {msg}",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("█▉▊▋▌▍▎▏  ")
                        .tick_strings(TICKS),
                    );
                    bar.set_prefix("Analysing");
                    bar.set_message(format!("{grid_size}x{grid_size} grid"));
                }
                GridEvent::SectionReady { result, .. } => {
                    bar.inc(1);
                    bar.set_message(format!(
                        "row {}, column {} done",
                        result.grid_position.y + 1,
                        result.grid_position.x + 1
                    ));
                }
                GridEvent::SummaryStarted => bar.set_message("summarising…".to_string()),
                GridEvent::Finished { .. } => {}
            }
        }
    });

    let outcome = grid::analyze_drawing_with(model, &doc, config, Some(&tx)).await;
    drop(tx);
    let _ = progress.await;

    let result = match outcome {
        Ok(result) => {
            if let Some(bar) = bar {
                bar.finish_and_clear();
                eprintln!(
                    "{} {} sections analysed in {:.1}s",
                    green("✔"),
                    bold(&result.sections.len().to_string()),
                    start.elapsed().as_secs_f64()
                );
            }
            result
        }
        Err(e) => {
            if let Some(bar) = bar {
                bar.finish_and_clear();
                eprintln!("{} {}", red("✘"), e);
            }
            return Err(e.into());
        }
    };

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut handle, &result)?;
        writeln!(handle)?;
    } else {
        for (i, section) in result.sections.iter().enumerate() {
            writeln!(
                handle,
                "{}\n{}\n",
                bold(&format!(
                    "Section {} (Row {}, Column {})",
                    i + 1,
                    section.grid_position.y + 1,
                    section.grid_position.x + 1
                )),
                section.analysis
            )?;
        }
        writeln!(handle, "{}\n{}", bold("Summary"), result.summary)?;
    }
    Ok(())
}

// ── analyze ──────────────────────────────────────────────────────────────────

async fn run_analyze(
    input_str: &str,
    config: &AnalysisConfig,
    markdown_out: Option<PathBuf>,
    show_progress: bool,
    json: bool,
) -> Result<()> {
    let start = Instant::now();
    let doc = input::resolve_input(input_str, config.download_timeout_secs)
        .await
        .with_context(|| format!("Cannot read {input_str}"))?;

    let bar = show_progress.then(|| spinner("Converting", &doc.name));
    let mut events = analyze_document_stream(doc, config);
    let mut output = DocumentAnalysisOutput::default();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                if let Some(ref bar) = bar {
                    bar.finish_and_clear();
                }
                eprintln!("{} {}", red("✘"), e);
                return Err(e.into());
            }
        };
        match event {
            PipelineEvent::Markdown { text } => {
                output.markdown.push_str(&text);
                if let Some(ref bar) = bar {
                    bar.set_message(format!("{} chars", output.markdown.len()));
                }
            }
            PipelineEvent::MarkdownComplete { chars } => {
                if let Some(ref bar) = bar {
                    bar.set_prefix("Analysing");
                    bar.set_message(format!("{chars} chars of markdown"));
                }
            }
            PipelineEvent::Snapshot { fragment } => {
                output.analysis = Some(fragment);
                output.fragments += 1;
            }
            PipelineEvent::SectionReady { section, .. } => {
                if let Some(ref bar) = bar {
                    bar.set_message(format!("{} ready", section.title()));
                }
            }
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    if let Some(path) = markdown_out {
        tokio::fs::write(&path, &output.markdown)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
    }

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut handle, &output)?;
        writeln!(handle)?;
        return Ok(());
    }

    match output.structured() {
        Some(analysis) => print_analysis(&mut handle, &analysis)?,
        None => match output.analysis {
            Some(ref raw) => writeln!(handle, "{}", serde_json::to_string_pretty(raw)?)?,
            None => {
                eprintln!(
                    "{} stream ended without a parseable analysis; treat as failed",
                    red("✘")
                );
                anyhow::bail!("no structured analysis produced");
            }
        },
    }
    eprintln!(
        "{} {} snapshots in {:.1}s",
        green("✔"),
        output.fragments,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn print_analysis(out: &mut impl Write, analysis: &ConstructionAnalysis) -> io::Result<()> {
    for section in AnalysisSection::ALL {
        let text = analysis.get(section).unwrap_or_default();
        if text.is_empty() {
            writeln!(out, "{}\n{}\n", bold(section.title()), dim("(not provided)"))?;
        } else {
            writeln!(out, "{}\n{}\n", bold(section.title()), text)?;
        }
    }
    Ok(())
}
