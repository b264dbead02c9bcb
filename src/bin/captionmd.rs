//! CLI binary for captionmd.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `CaptionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use captionmd::{
    convert, convert_to_file, CaptionConfig, CaptionProgressCallback, ProgressCallback, RunStats,
    Strategy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per image. Images complete in any
/// order, so start times are kept per index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Extracting document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl CaptionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_images: usize, strategy: Strategy) {
        self.bar.set_length(total_images as u64);
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} images  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_prefix("Captioning");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("Describing {total_images} images…")),
            dim(&format!("({strategy})"))
        ));
    }

    fn on_image_start(&self, index: usize, filename: &str) {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Instant::now());
        self.bar.set_message(filename.to_string());
    }

    fn on_image_described(&self, index: usize, filename: &str, chars: usize) {
        self.bar.println(format!(
            "  {} {:<32}  {:<8}  {}",
            green("✓"),
            filename,
            dim(&format!("{chars:>5} chars")),
            dim(&format!("{:.1}s", self.elapsed_secs(index))),
        ));
        self.bar.inc(1);
    }

    fn on_image_skipped(&self, index: usize, filename: &str) {
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            dim("–"),
            filename,
            dim("skipped"),
            dim(&format!("{:.1}s", self.elapsed_secs(index))),
        ));
        self.bar.inc(1);
    }

    fn on_image_failed(&self, index: usize, filename: &str, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            red("✗"),
            filename,
            red(&msg),
            dim(&format!("{:.1}s", self.elapsed_secs(index))),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, stats: &RunStats) {
        self.bar.finish_and_clear();
        if stats.failed == 0 {
            eprintln!(
                "{} {} described, {} skipped",
                green("✔"),
                bold(&stats.described.to_string()),
                stats.skipped
            );
        } else {
            eprintln!(
                "{} {}/{} described  ({} failed)",
                if stats.failed == stats.total {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&stats.described.to_string()),
                stats.total,
                red(&stats.failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Markdown with image descriptions on stdout
  captionmd report.pdf

  # Write to a file
  captionmd report.pdf -o report.md

  # A single chart image
  captionmd chart.png

  # Another provider and model
  captionmd --provider openai --model gpt-4.1-mini report.pdf

  # Custom prompt, no surrounding context, 5 calls in flight
  captionmd --prompt "Describe the figure in one sentence." --no-context -c 5 report.pdf

  # JSON output with descriptions and run statistics
  captionmd --json report.pdf > report.json

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default provider)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Provider override, paired with EDGEQUAKE_MODEL
  EDGEQUAKE_MODEL         Model override
  CAPTIONMD_ISOLATE       Force the subprocess worker strategy
  CAPTIONMD_WORKER_BIN    Path to the captionmd-worker executable
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Convert documents to Markdown with AI image descriptions.
#[derive(Parser, Debug)]
#[command(
    name = "captionmd",
    version,
    about = "Convert PDFs and images to Markdown with AI image descriptions",
    long_about = "Convert PDF documents and images to Markdown, inserting a vision-model \
description above every extracted image. Supports Google Gemini, OpenAI, Anthropic, \
Azure OpenAI and any OpenAI-compatible endpoint.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF, PNG or JPEG file.
    input: PathBuf,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "CAPTIONMD_OUTPUT")]
    output: Option<PathBuf>,

    /// Vision model ID (e.g. gemini-2.5-flash, gpt-4.1-mini).
    #[arg(long, env = "CAPTIONMD_MODEL")]
    model: Option<String>,

    /// Provider: gemini, openai, anthropic, azure, ollama.
    #[arg(long, env = "CAPTIONMD_PROVIDER")]
    provider: Option<String>,

    /// API key for the provider (defaults to the provider's env var).
    #[arg(long, env = "CAPTIONMD_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Maximum captioning calls in flight.
    #[arg(short, long, env = "CAPTIONMD_CONCURRENCY", default_value_t = captionmd::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Custom captioning prompt (document context is still appended).
    #[arg(long, env = "CAPTIONMD_PROMPT")]
    prompt: Option<String>,

    /// Read the custom captioning prompt from a file.
    #[arg(long, conflicts_with = "prompt")]
    prompt_file: Option<PathBuf>,

    /// Do not send surrounding document text with each image.
    #[arg(long, env = "CAPTIONMD_NO_CONTEXT")]
    no_context: bool,

    /// Characters of context on each side of an image reference.
    #[arg(long, env = "CAPTIONMD_CONTEXT_WINDOW", default_value_t = captionmd::config::DEFAULT_CONTEXT_WINDOW)]
    context_window: usize,

    /// Force a strategy: event-loop, thread-pool, subprocess.
    #[arg(long, env = "CAPTIONMD_STRATEGY")]
    strategy: Option<Strategy>,

    /// Max output tokens per description.
    #[arg(long, env = "CAPTIONMD_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "CAPTIONMD_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Per-call timeout in seconds.
    #[arg(long, env = "CAPTIONMD_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "CAPTIONMD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Output structured JSON (markdown, descriptions, stats).
    #[arg(long, env = "CAPTIONMD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "CAPTIONMD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CAPTIONMD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CAPTIONMD_QUIET")]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers what INFO logs would say.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn CaptionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;

    // ── Run conversion ───────────────────────────────────────────────────
    if let Some(ref output_path) = cli.output {
        let stats = convert_to_file(&cli.input, output_path, &config)
            .context("Conversion failed")?;

        if !cli.quiet {
            eprintln!(
                "{}  {}/{} images described  {}ms  →  {}",
                if stats.failed == 0 { green("✔") } else { cyan("⚠") },
                stats.described,
                stats.total,
                stats.duration_ms,
                bold(&output_path.display().to_string()),
            );
        }
    } else {
        let output = convert(&cli.input, &config).context("Conversion failed")?;

        if cli.json {
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
            println!("{json}");
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(output.markdown.as_bytes())
                .context("Failed to write to stdout")?;
            if !output.markdown.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }

        if !cli.quiet && !show_progress && !cli.json {
            eprintln!(
                "Described {}/{} images in {}ms",
                output.stats.described, output.stats.total, output.stats.duration_ms
            );
            if output.stats.failed > 0 {
                eprintln!("  {} images failed", output.stats.failed);
            }
        }
    }

    Ok(())
}

/// Map CLI args to `CaptionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<CaptionConfig> {
    let prompt = match cli.prompt_file {
        Some(ref path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        ),
        None => cli.prompt.clone(),
    };

    let mut builder = CaptionConfig::builder()
        .concurrency_limit(cli.concurrency)
        .context_enabled(!cli.no_context)
        .context_window(cli.context_window)
        .max_output_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .request_timeout_secs(cli.api_timeout);

    if let Some(p) = prompt {
        builder = builder.prompt_override(p);
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p.clone());
    }
    if let Some(ref k) = cli.api_key {
        builder = builder.api_key(k.clone());
    }
    if let Some(s) = cli.strategy {
        builder = builder.strategy(s);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
