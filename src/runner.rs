//! Bounded parallel captioning.
//!
//! [`Orchestrator::run`] has one contract whatever the strategy: every task
//! gets exactly one [`CaptionOutcome`], at most `concurrency_limit` calls are
//! in flight, and one failing image never stops the others.
//!
//! ## Strategies
//!
//! * **Event loop**: a private current-thread tokio runtime drives the calls
//!   through `buffer_unordered(limit)`. Outcomes are recorded by the single
//!   consumer of that stream, so the ledger needs no lock. A client error of
//!   kind [`ProviderErrorKind::Setup`] stops admission; in-flight calls are
//!   drained and the run falls back to the thread pool for whatever is left.
//! * **Thread pool**: a rayon pool of exactly `limit` threads, one spawned
//!   job per task, the ledger behind a `Mutex`. Non-blocking clients are
//!   driven through one shared multi-thread "bridge" runtime so pooled HTTP
//!   connections are not tied to a short-lived per-thread runtime.
//! * **Subprocess**: see [`crate::worker`]. A failed worker means the thread
//!   pool reprocesses every task.
//!
//! The fallback happens at most once per run.

use crate::client::{CaptionClient, CaptionRequest};
use crate::config::CaptionConfig;
use crate::error::{is_rate_limit_like, ProviderError, ProviderErrorKind, SetupError};
use crate::output::{CaptionOutcome, ImageTask, RunReport, RunResult, RunStats};
use crate::progress::ProgressCallback;
use crate::runtime::{select_strategy, RuntimeEnvironment, Strategy};
use crate::worker::{self, ProcessWorkerInvoker, WorkerInvoker, WorkerOutcome};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ── Sustained rate-limit detection ───────────────────────────────────────

/// Counts consecutive rate-limit-like failures.
///
/// Purely advisory: crossing the threshold logs a suggestion to lower the
/// concurrency limit once per streak and changes nothing else.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: usize,
    streak: usize,
    advised: bool,
    advisories: usize,
}

impl FailureTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            streak: 0,
            advised: false,
            advisories: 0,
        }
    }

    /// Feed one outcome. Returns `true` when this outcome crossed the threshold.
    pub fn observe(&mut self, outcome: &CaptionOutcome) -> bool {
        match outcome {
            CaptionOutcome::Failed(e) if e.is_rate_limited() || is_rate_limit_like(&e.message) => {
                self.streak += 1;
                if self.streak >= self.threshold && !self.advised {
                    self.advised = true;
                    self.advisories += 1;
                    return true;
                }
                false
            }
            _ => {
                self.streak = 0;
                self.advised = false;
                false
            }
        }
    }

    /// Length of the current streak.
    pub fn streak(&self) -> usize {
        self.streak
    }

    /// How many times the advisory fired.
    pub fn advisories(&self) -> usize {
        self.advisories
    }
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// Outcomes recorded so far, keyed by sequence index.
///
/// The only mutable state shared during a run. Recording is idempotent per
/// task: a second outcome for an index already recorded is dropped, which is
/// what keeps a fallback pass from producing duplicates.
struct RunLedger {
    result: RunResult,
    recorded: HashSet<usize>,
    stats: RunStats,
    tracker: FailureTracker,
    concurrency_limit: usize,
    progress: Option<ProgressCallback>,
}

impl RunLedger {
    fn new(total: usize, config: &CaptionConfig) -> Self {
        Self {
            result: RunResult::new(),
            recorded: HashSet::with_capacity(total),
            stats: RunStats {
                total,
                ..Default::default()
            },
            tracker: FailureTracker::new(config.rate_limit_threshold),
            concurrency_limit: config.run_config().concurrency_limit,
            progress: config.progress_callback.clone(),
        }
    }

    fn is_recorded(&self, task: &ImageTask) -> bool {
        self.recorded.contains(&task.sequence_index())
    }

    fn record(&mut self, task: &ImageTask, outcome: CaptionOutcome) {
        if !self.recorded.insert(task.sequence_index()) {
            debug!("Outcome for image {} already recorded", task.sequence_index());
            return;
        }
        let (idx, name) = (task.sequence_index(), task.filename());

        if self.tracker.observe(&outcome) {
            warn!(
                "{} consecutive captioning calls look rate-limited; \
                consider lowering the concurrency limit (currently {})",
                self.tracker.streak(),
                self.concurrency_limit
            );
        }

        match outcome {
            CaptionOutcome::Described(text) => {
                debug!("Image {} ({}) described: {} chars", idx, name, text.len());
                self.stats.described += 1;
                if let Some(ref cb) = self.progress {
                    cb.on_image_described(idx, name, text.len());
                }
                self.result.insert(name, text);
            }
            CaptionOutcome::Skipped => {
                debug!("Image {} ({}) skipped by the provider", idx, name);
                self.stats.skipped += 1;
                if let Some(ref cb) = self.progress {
                    cb.on_image_skipped(idx, name);
                }
            }
            CaptionOutcome::Failed(e) => {
                warn!("Image {} ({}) failed: {}", idx, name, e);
                self.stats.failed += 1;
                if e.is_rate_limited() || is_rate_limit_like(&e.message) {
                    self.stats.rate_limited += 1;
                }
                if let Some(ref cb) = self.progress {
                    cb.on_image_failed(idx, name, &e.to_string());
                }
            }
        }
    }

    /// Take over a worker's result. Per-image events stayed in the child.
    ///
    /// Tasks without a description are split into failed and skipped using
    /// the child's counts, capped so the totals still add up. Without child
    /// counts they are all skipped.
    fn absorb_worker_result(
        &mut self,
        tasks: &[ImageTask],
        child: RunResult,
        child_stats: Option<&RunStats>,
    ) {
        let mut child = child.into_inner();
        let mut undescribed = 0;
        for task in tasks {
            if !self.recorded.insert(task.sequence_index()) {
                continue;
            }
            match child.remove(task.filename()) {
                Some(text) => {
                    self.stats.described += 1;
                    self.result.insert(task.filename(), text);
                }
                None => undescribed += 1,
            }
        }
        if !child.is_empty() {
            debug!("Dropped {} worker entries with no matching task", child.len());
        }

        let (failed, rate_limited) = match child_stats {
            Some(s) => {
                let failed = s.failed.min(undescribed);
                (failed, s.rate_limited.min(failed))
            }
            None => (0, 0),
        };
        self.stats.failed += failed;
        self.stats.rate_limited += rate_limited;
        self.stats.skipped += undescribed - failed;
        if failed > 0 {
            warn!("{} of {} images failed in the caption worker", failed, tasks.len());
        }
    }

    /// Fail every task not yet recorded. Used when no strategy could run them.
    fn fail_unrecorded(&mut self, tasks: &[&ImageTask], reason: &SetupError) {
        for task in tasks {
            if !self.is_recorded(task) {
                self.record(task, CaptionOutcome::Failed(ProviderError::setup(reason.to_string())));
            }
        }
    }
}

// ── Per-call plumbing ────────────────────────────────────────────────────

fn load_image(task: &ImageTask) -> Result<Arc<[u8]>, ProviderError> {
    task.source().load().map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::Other,
            format!("cannot read image {}: {}", task.filename(), e),
        )
    })
}

fn request_for<'a>(task: &'a ImageTask, image: &'a [u8], prompt: Option<&'a str>) -> CaptionRequest<'a> {
    CaptionRequest {
        image,
        filename: task.filename(),
        context_before: task.context_before(),
        context_after: task.context_after(),
        prompt_override: prompt,
    }
}

async fn caption_async(
    client: &dyn CaptionClient,
    task: &ImageTask,
    prompt: Option<&str>,
) -> Result<Option<String>, ProviderError> {
    let image = load_image(task)?;
    client.describe(&request_for(task, &image, prompt)).await
}

fn caption_blocking(
    client: &dyn CaptionClient,
    task: &ImageTask,
    prompt: Option<&str>,
) -> Result<Option<String>, ProviderError> {
    let image = load_image(task)?;
    client.describe_blocking(&request_for(task, &image, prompt))
}

fn panic_error(payload: Box<dyn Any + Send>) -> ProviderError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ProviderError::new(
        ProviderErrorKind::Other,
        format!("captioning call panicked: {detail}"),
    )
}

fn outcome_of(result: Result<Option<String>, ProviderError>) -> CaptionOutcome {
    match result {
        Ok(Some(text)) => CaptionOutcome::Described(text),
        Ok(None) => CaptionOutcome::Skipped,
        Err(e) => CaptionOutcome::Failed(e),
    }
}

fn notify_start(progress: Option<&ProgressCallback>, task: &ImageTask) {
    if let Some(cb) = progress {
        cb.on_image_start(task.sequence_index(), task.filename());
    }
}

// ── Event loop ───────────────────────────────────────────────────────────

fn run_event_loop(
    client: &dyn CaptionClient,
    tasks: &[&ImageTask],
    config: &CaptionConfig,
    ledger: &mut RunLedger,
) -> Result<(), SetupError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(SetupError::new(
            Strategy::EventLoop.as_str(),
            "a tokio runtime is already running on this thread",
        ));
    }
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SetupError::new(Strategy::EventLoop.as_str(), e.to_string()))?;

    let run = config.run_config();
    let limit = run.concurrency_limit.max(1);
    let prompt = run.prompt_override.as_deref();
    let progress = config.progress_callback.as_ref();
    let halted: RefCell<Option<ProviderError>> = RefCell::new(None);

    rt.block_on(async {
        let mut calls = stream::iter(tasks.iter().copied().map(|task| {
            let halted = &halted;
            async move {
                if halted.borrow().is_some() {
                    return (task, None);
                }
                notify_start(progress, task);
                let result = AssertUnwindSafe(caption_async(client, task, prompt))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|p| Err(panic_error(p)));
                (task, Some(result))
            }
        }))
        .buffer_unordered(limit);

        while let Some((task, result)) = calls.next().await {
            match result {
                None => {}
                Some(Err(e)) if e.kind == ProviderErrorKind::Setup => {
                    warn!("Image {} hit a setup-level error: {}", task.sequence_index(), e);
                    let mut halted = halted.borrow_mut();
                    if halted.is_none() {
                        *halted = Some(e);
                    }
                }
                Some(result) => ledger.record(task, outcome_of(result)),
            }
        }
    });

    match halted.into_inner() {
        Some(e) => Err(SetupError::new(Strategy::EventLoop.as_str(), e.message)),
        None => Ok(()),
    }
}

// ── Thread pool ──────────────────────────────────────────────────────────

fn run_thread_pool(
    client: &dyn CaptionClient,
    tasks: &[&ImageTask],
    config: &CaptionConfig,
    ledger: &Mutex<RunLedger>,
) -> Result<(), SetupError> {
    let run = config.run_config();
    let limit = run.concurrency_limit.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("caption-worker-{i}"))
        .build()
        .map_err(|e| SetupError::new(Strategy::ThreadPool.as_str(), e.to_string()))?;

    let bridge = if client.supports_non_blocking() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(limit.min(4))
            .thread_name("caption-bridge")
            .enable_all()
            .build()
            .map_err(|e| SetupError::new(Strategy::ThreadPool.as_str(), e.to_string()))?;
        Some(rt)
    } else {
        None
    };

    let prompt = run.prompt_override.as_deref();
    let progress = config.progress_callback.as_ref();
    let bridge_ref = bridge.as_ref();

    pool.scope(|scope| {
        for &task in tasks {
            scope.spawn(move |_| {
                notify_start(progress, task);
                let result = catch_unwind(AssertUnwindSafe(|| match bridge_ref {
                    Some(rt) => rt.block_on(caption_async(client, task, prompt)),
                    None => caption_blocking(client, task, prompt),
                }))
                .unwrap_or_else(|p| Err(panic_error(p)));
                ledger
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(task, outcome_of(result));
            });
        }
    });

    // Dropping a runtime from inside an async context panics; the caller
    // may be in one after a subprocess fallback.
    if let Some(rt) = bridge {
        rt.shutdown_background();
    }
    Ok(())
}

/// Thread-pool pass over the given tasks. Tasks the pool could not run are
/// recorded as failed.
fn thread_pool_pass(
    client: &dyn CaptionClient,
    tasks: &[&ImageTask],
    config: &CaptionConfig,
    ledger: RunLedger,
) -> RunLedger {
    let shared = Mutex::new(ledger);
    let outcome = run_thread_pool(client, tasks, config, &shared);
    let mut ledger = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = outcome {
        error!("{}", e);
        ledger.fail_unrecorded(tasks, &e);
    }
    ledger
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Runs captioning for a task set with the strategy the environment allows.
pub struct Orchestrator {
    client: Arc<dyn CaptionClient>,
    invoker: Option<Arc<dyn WorkerInvoker>>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn CaptionClient>) -> Self {
        Self {
            client,
            invoker: None,
        }
    }

    /// Replace the process-spawning worker invoker.
    pub fn with_invoker(mut self, invoker: Arc<dyn WorkerInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Strategy this run would use right now.
    pub fn strategy_for(&self, config: &CaptionConfig) -> Strategy {
        config.strategy_override.unwrap_or_else(|| {
            select_strategy(
                RuntimeEnvironment::probe(),
                self.client.supports_non_blocking(),
            )
        })
    }

    /// Caption every task. Never fails: per-image errors land in the stats.
    pub fn run(&self, tasks: &[ImageTask], config: &CaptionConfig) -> RunReport {
        let start = Instant::now();
        let family = self.client.family().to_string();

        if tasks.is_empty() {
            return RunReport {
                result: RunResult::new(),
                stats: RunStats {
                    provider_family: Some(family),
                    ..Default::default()
                },
            };
        }

        let strategy = self.strategy_for(config);
        info!(
            "Captioning {} images via {} strategy (limit {}, provider {})",
            tasks.len(),
            strategy,
            config.run_config().concurrency_limit,
            family
        );
        if let Some(ref cb) = config.progress_callback {
            cb.on_run_start(tasks.len(), strategy);
        }

        let client = self.client.as_ref();
        let mut ledger = RunLedger::new(tasks.len(), config);
        let mut fallback = None;

        match strategy {
            Strategy::EventLoop => {
                let all: Vec<&ImageTask> = tasks.iter().collect();
                if let Err(e) = run_event_loop(client, &all, config, &mut ledger) {
                    warn!("{}; continuing on the thread pool", e);
                    fallback = Some(Strategy::ThreadPool);
                }
            }
            Strategy::ThreadPool => {
                let all: Vec<&ImageTask> = tasks.iter().collect();
                ledger = thread_pool_pass(client, &all, config, ledger);
            }
            Strategy::Subprocess => {
                let process_invoker;
                let invoker: &dyn WorkerInvoker = match self.invoker {
                    Some(ref i) => i.as_ref(),
                    None => {
                        process_invoker = ProcessWorkerInvoker::from_config(config);
                        &process_invoker
                    }
                };
                match worker::run_isolated(tasks, config, client, invoker) {
                    WorkerOutcome::Success { result, stats } => {
                        ledger.absorb_worker_result(tasks, result, stats.as_ref())
                    }
                    WorkerOutcome::Failure(reason) => {
                        warn!("Caption worker failed ({}); reprocessing all images on the thread pool", reason);
                        fallback = Some(Strategy::ThreadPool);
                    }
                }
            }
        }

        if fallback.is_some() {
            let remaining: Vec<&ImageTask> = tasks.iter().filter(|t| !ledger.is_recorded(t)).collect();
            info!("Thread-pool fallback for {} images", remaining.len());
            ledger = thread_pool_pass(client, &remaining, config, ledger);
        }

        let mut stats = ledger.stats;
        stats.strategy = Some(strategy);
        stats.fallback = fallback;
        stats.provider_family = Some(family);
        stats.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Captioning done: {} described, {} skipped, {} failed in {}ms",
            stats.described, stats.skipped, stats.failed, stats.duration_ms
        );
        if let Some(ref cb) = config.progress_callback {
            cb.on_run_complete(&stats);
        }

        RunReport {
            result: ledger.result,
            stats,
        }
    }
}

/// Caption `tasks` with `client`. See [`Orchestrator::run`].
pub fn run(tasks: &[ImageTask], config: &CaptionConfig, client: Arc<dyn CaptionClient>) -> RunReport {
    Orchestrator::new(client).run(tasks, config)
}
