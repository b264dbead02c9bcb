//! Out-of-process captioning.
//!
//! When in-process concurrency is unsafe, the whole task set is written to a
//! request file, a clean `captionmd-worker` process captions it with its own
//! in-process strategy, and the parent reads back `{filename: description}`
//! plus the child's outcome counts.
//!
//! The parent never trusts a partial run: a non-zero exit, a missing or
//! unreadable response, or any failure to set the child up yields
//! [`WorkerOutcome::Failure`], and the caller reprocesses everything.
//!
//! ```text
//! <tmp>/request.json   {"images":[{"path":…,"context_before":…,"context_after":…}],
//!                       "config":{"api_key":…,"model":…,"max_workers":…,"prompt":…, …}}
//! <tmp>/response.json        {"figure-1.png":"Bar Chart: …", …}
//! <tmp>/response.stats.json  {"total":3,"described":2,"skipped":0,"failed":1,…}
//! ```
//!
//! The stats file is optional on the parent side. Without it, images missing
//! from the response are counted as skipped.

use crate::client::{api_key_env_var, client_for_provider, CaptionClient};
use crate::config::CaptionConfig;
use crate::error::CaptionError;
use crate::output::{ImageSource, ImageTask, RunReport, RunResult, RunStats};
use crate::runner::Orchestrator;
use crate::runtime::{Strategy, ISOLATION_ENV};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Name of the worker executable.
pub const WORKER_BIN: &str = "captionmd-worker";

/// Env var naming the worker executable explicitly.
pub const WORKER_BIN_ENV: &str = "CAPTIONMD_WORKER_BIN";

const REQUEST_FILE: &str = "request.json";
const RESPONSE_FILE: &str = "response.json";

/// One image in a worker request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerImage {
    pub path: PathBuf,
    #[serde(default)]
    pub context_before: Option<String>,
    #[serde(default)]
    pub context_after: Option<String>,
}

/// Run settings the worker needs to rebuild its client and runner.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_workers: usize,
    #[serde(default)]
    pub prompt: Option<String>,
    pub provider: String,
    #[serde(default = "default_true")]
    pub context_enabled: bool,
    #[serde(default = "default_window")]
    pub context_window: usize,
}

fn default_true() -> bool {
    true
}

fn default_window() -> usize {
    crate::config::DEFAULT_CONTEXT_WINDOW
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_workers", &self.max_workers)
            .field("prompt", &self.prompt)
            .field("provider", &self.provider)
            .field("context_enabled", &self.context_enabled)
            .field("context_window", &self.context_window)
            .finish()
    }
}

/// The single payload handed to a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub images: Vec<WorkerImage>,
    pub config: WorkerConfig,
}

/// What came back from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Descriptions, and the child's own counts when it reported them.
    Success {
        result: RunResult,
        stats: Option<RunStats>,
    },
    Failure(String),
}

/// Runs a prepared request somewhere isolated.
///
/// `workdir` is a private temporary directory the invoker may use for
/// request and response files; it is removed after the call.
pub trait WorkerInvoker: Send + Sync {
    fn invoke(&self, request: &WorkerRequest, workdir: &Path) -> WorkerOutcome;
}

// ── Parent side ──────────────────────────────────────────────────────────

/// Serialize the tasks, hand them to `invoker`, and return its outcome.
pub fn run_isolated(
    tasks: &[ImageTask],
    config: &CaptionConfig,
    client: &dyn CaptionClient,
    invoker: &dyn WorkerInvoker,
) -> WorkerOutcome {
    let workdir = match tempfile::Builder::new().prefix("captionmd-").tempdir() {
        Ok(d) => d,
        Err(e) => return WorkerOutcome::Failure(format!("cannot create worker directory: {e}")),
    };
    let request = match build_request(tasks, config, client, workdir.path()) {
        Ok(r) => r,
        Err(reason) => return WorkerOutcome::Failure(reason),
    };
    debug!(
        "Worker request: {} images, provider {}, model {}",
        request.images.len(),
        request.config.provider,
        request.config.model
    );
    invoker.invoke(&request, workdir.path())
}

/// Build the request payload, writing in-memory images under `workdir`.
pub fn build_request(
    tasks: &[ImageTask],
    config: &CaptionConfig,
    client: &dyn CaptionClient,
    workdir: &Path,
) -> Result<WorkerRequest, String> {
    let descriptor = client
        .descriptor()
        .ok_or_else(|| "client cannot be rebuilt in a worker process".to_string())?;

    let mut images = Vec::with_capacity(tasks.len());
    for task in tasks {
        let path = match task.source() {
            ImageSource::Path(p) => p.clone(),
            ImageSource::Bytes(bytes) => {
                // One directory per task keeps the file name intact.
                let dir = workdir.join("images").join(task.sequence_index().to_string());
                std::fs::create_dir_all(&dir)
                    .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
                let name = Path::new(task.filename())
                    .file_name()
                    .ok_or_else(|| format!("image '{}' has no file name", task.filename()))?;
                let path = dir.join(name);
                std::fs::write(&path, bytes)
                    .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
                path
            }
        };
        images.push(WorkerImage {
            path,
            context_before: task.context_before().map(str::to_string),
            context_after: task.context_after().map(str::to_string),
        });
    }

    let run = config.run_config();
    Ok(WorkerRequest {
        images,
        config: WorkerConfig {
            api_key: descriptor.api_key.or_else(|| config.api_key.clone()),
            model: descriptor.model,
            max_workers: run.concurrency_limit,
            prompt: run.prompt_override,
            provider: descriptor.provider,
            context_enabled: run.context_enabled,
            context_window: config.context_window,
        },
    })
}

/// Locate the worker executable.
///
/// Order: explicit path → `CAPTIONMD_WORKER_BIN` → next to the current
/// executable → bare name (resolved through `PATH`).
pub fn resolve_worker_program(configured: Option<&Path>) -> PathBuf {
    if let Some(p) = configured {
        return p.to_path_buf();
    }
    if let Some(p) = std::env::var_os(WORKER_BIN_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX));
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from(WORKER_BIN)
}

/// Spawns the `captionmd-worker` binary.
#[derive(Debug, Clone)]
pub struct ProcessWorkerInvoker {
    program: PathBuf,
}

impl ProcessWorkerInvoker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &CaptionConfig) -> Self {
        Self::new(resolve_worker_program(config.worker_program.as_deref()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerInvoker for ProcessWorkerInvoker {
    fn invoke(&self, request: &WorkerRequest, workdir: &Path) -> WorkerOutcome {
        let request_path = workdir.join(REQUEST_FILE);
        let response_path = workdir.join(RESPONSE_FILE);

        let payload = match serde_json::to_vec(request) {
            Ok(p) => p,
            Err(e) => return WorkerOutcome::Failure(format!("cannot serialize request: {e}")),
        };
        if let Err(e) = std::fs::write(&request_path, payload) {
            return WorkerOutcome::Failure(format!("cannot write request: {e}"));
        }

        info!("Spawning caption worker {}", self.program.display());
        let mut child = match Command::new(&self.program)
            .arg(&request_path)
            .arg(&response_path)
            .env_remove(ISOLATION_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return WorkerOutcome::Failure(format!(
                    "cannot spawn {}: {e}",
                    self.program.display()
                ))
            }
        };

        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        info!(target: "captionmd::worker", "{}", line.trim_end())
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Worker stderr closed: {}", e);
                        break;
                    }
                }
            }
        }

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => return WorkerOutcome::Failure(format!("cannot wait for worker: {e}")),
        };
        if !status.success() {
            return WorkerOutcome::Failure(format!("worker exited with {status}"));
        }

        read_response(&response_path)
    }
}

/// Stats file written next to a response: `response.json` → `response.stats.json`.
pub fn stats_path(response_path: &Path) -> PathBuf {
    response_path.with_extension("stats.json")
}

/// Parse a response file (and its stats sibling, if any) into an outcome.
pub fn read_response(path: &Path) -> WorkerOutcome {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => return WorkerOutcome::Failure(format!("worker produced no response: {e}")),
    };
    let result = match serde_json::from_slice::<RunResult>(&bytes) {
        Ok(result) => result,
        Err(e) => return WorkerOutcome::Failure(format!("unreadable worker response: {e}")),
    };
    WorkerOutcome::Success {
        result,
        stats: read_stats(&stats_path(path)),
    }
}

fn read_stats(path: &Path) -> Option<RunStats> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            debug!("No worker stats at {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Ignoring unreadable worker stats {}: {}", path.display(), e);
            None
        }
    }
}

/// Write the stats file, then the response. The response appears last, so
/// a present response always has its stats beside it.
pub fn write_response(response_path: &Path, report: &RunReport) -> Result<(), CaptionError> {
    let stats = serde_json::to_vec(&report.stats)
        .map_err(|e| CaptionError::Internal(format!("cannot serialize worker stats: {e}")))?;
    write_atomic(&stats_path(response_path), &stats)?;

    let json = serde_json::to_vec(&report.result)
        .map_err(|e| CaptionError::Internal(format!("cannot serialize response: {e}")))?;
    write_atomic(response_path, &json)
}

// ── Child side ───────────────────────────────────────────────────────────

/// Worker entry point: read `request_path`, caption, write `response_path`.
///
/// Runs in-process only (event loop or thread pool), never spawning another
/// worker.
pub fn run_worker(request_path: &Path, response_path: &Path) -> Result<RunStats, CaptionError> {
    let raw = std::fs::read(request_path).map_err(|e| CaptionError::WorkerPayload {
        path: request_path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let request: WorkerRequest =
        serde_json::from_slice(&raw).map_err(|e| CaptionError::WorkerPayload {
            path: request_path.to_path_buf(),
            detail: e.to_string(),
        })?;
    debug!("Worker config: {:?}", request.config);

    let wc = &request.config;
    let mut builder = CaptionConfig::builder()
        .concurrency_limit(wc.max_workers.max(1))
        .context_enabled(wc.context_enabled)
        .context_window(wc.context_window.max(1))
        .provider_name(wc.provider.clone())
        .model(wc.model.clone());
    if let Some(ref prompt) = wc.prompt {
        builder = builder.prompt_override(prompt.clone());
    }
    if let Some(ref key) = wc.api_key {
        builder = builder.api_key(key.clone());
        // Non-Gemini providers read their key from the environment.
        if let Some(var) = api_key_env_var(&wc.provider) {
            if std::env::var_os(var).is_none() {
                std::env::set_var(var, key);
            }
        }
    }
    let mut config = builder.build()?;

    let client = client_for_provider(
        &wc.provider,
        Some(&wc.model),
        wc.api_key.as_deref(),
        &config,
    )?;
    config.strategy_override = Some(if client.supports_non_blocking() {
        Strategy::EventLoop
    } else {
        Strategy::ThreadPool
    });

    let tasks: Vec<ImageTask> = request
        .images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            let filename = img
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| img.path.display().to_string());
            let task = ImageTask::new(i + 1, filename, ImageSource::Path(img.path.clone()));
            if wc.context_enabled {
                task.with_context(img.context_before.clone(), img.context_after.clone())
            } else {
                task
            }
        })
        .collect();

    let report = Orchestrator::new(client).run(&tasks, &config);
    if report.stats.failed > 0 {
        warn!("{} of {} images failed in worker", report.stats.failed, report.stats.total);
    }

    write_response(response_path, &report)?;
    Ok(report.stats)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CaptionError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| CaptionError::OutputWriteFailed {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| CaptionError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}
