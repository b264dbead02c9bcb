//! Orchestrator behaviour with in-process fake clients (no network).

use async_trait::async_trait;
use captionmd::client::{CaptionRequest, ClientDescriptor, ProviderFamily};
use captionmd::worker;
use captionmd::{
    CaptionClient, CaptionConfig, CaptionProgressCallback, ImageSource, ImageTask, Orchestrator,
    ProviderError, ProviderErrorKind, RunStats, Strategy, WorkerInvoker, WorkerOutcome,
    WorkerRequest,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Fakes ────────────────────────────────────────────────────────────────────

fn tasks(n: usize) -> Vec<ImageTask> {
    (1..=n)
        .map(|i| {
            ImageTask::new(
                i,
                format!("file{i}.png"),
                ImageSource::Bytes(Arc::from(&b"\x89PNG\r\n\x1a\n"[..])),
            )
        })
        .collect()
}

fn config(strategy: Strategy, limit: usize) -> CaptionConfig {
    CaptionConfig::builder()
        .concurrency_limit(limit)
        .strategy(strategy)
        .build()
        .unwrap()
}

/// Tracks how many calls overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sleeps, then describes the image by name.
struct SlowClient {
    gauge: Gauge,
    delay: Duration,
    non_blocking: bool,
}

impl SlowClient {
    fn new(non_blocking: bool) -> Arc<Self> {
        Arc::new(Self {
            gauge: Gauge::default(),
            delay: Duration::from_millis(30),
            non_blocking,
        })
    }
}

#[async_trait]
impl CaptionClient for SlowClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Other("slow".into())
    }

    fn supports_non_blocking(&self) -> bool {
        self.non_blocking
    }

    async fn describe(&self, req: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        self.gauge.enter();
        tokio::time::sleep(self.delay).await;
        self.gauge.exit();
        Ok(Some(format!("about {}", req.filename)))
    }

    fn describe_blocking(&self, req: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        self.gauge.enter();
        std::thread::sleep(self.delay);
        self.gauge.exit();
        Ok(Some(format!("about {}", req.filename)))
    }
}

type Reply = Result<Option<String>, ProviderError>;

/// Answers per filename from a table; unknown files fail.
struct ScriptedClient {
    replies: HashMap<String, Reply>,
    calls: Mutex<HashMap<String, usize>>,
    /// Filename whose first call reports a setup-level failure.
    setup_fails_once: Option<String>,
    descriptor: Option<ClientDescriptor>,
}

impl ScriptedClient {
    fn new(replies: &[(&str, Reply)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            calls: Mutex::new(HashMap::new()),
            setup_fails_once: None,
            descriptor: None,
        }
    }

    fn calls_for(&self, filename: &str) -> usize {
        self.calls.lock().unwrap().get(filename).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn answer(&self, filename: &str) -> Reply {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(filename.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if self.setup_fails_once.as_deref() == Some(filename) && n == 1 {
            return Err(ProviderError::setup("connector shut down"));
        }
        self.replies
            .get(filename)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::classify("no scripted reply")))
    }
}

#[async_trait]
impl CaptionClient for ScriptedClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    async fn describe(&self, req: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        tokio::task::yield_now().await;
        self.answer(req.filename)
    }

    fn describe_blocking(&self, req: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        self.answer(req.filename)
    }

    fn descriptor(&self) -> Option<ClientDescriptor> {
        self.descriptor.clone()
    }
}

fn described(text: &str) -> Reply {
    Ok(Some(text.to_string()))
}

fn transient() -> Reply {
    Err(ProviderError::new(
        ProviderErrorKind::Transient,
        "connection reset by peer",
    ))
}

/// Returns a canned outcome and remembers the request it saw.
struct FakeInvoker {
    outcome: WorkerOutcome,
    seen: Mutex<Option<WorkerRequest>>,
}

impl FakeInvoker {
    fn new(outcome: WorkerOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            seen: Mutex::new(None),
        })
    }
}

impl WorkerInvoker for FakeInvoker {
    fn invoke(&self, request: &WorkerRequest, _workdir: &Path) -> WorkerOutcome {
        *self.seen.lock().unwrap() = Some(request.clone());
        self.outcome.clone()
    }
}

/// Plays the worker process in-process: captions the request's image files
/// with its own client and hands the report back through the response files.
struct InProcessInvoker {
    client: Arc<ScriptedClient>,
}

impl WorkerInvoker for InProcessInvoker {
    fn invoke(&self, request: &WorkerRequest, workdir: &Path) -> WorkerOutcome {
        let tasks: Vec<ImageTask> = request
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| {
                let name = img.path.file_name().unwrap().to_string_lossy().into_owned();
                ImageTask::new(i + 1, name, ImageSource::Path(img.path.clone()))
            })
            .collect();
        let cfg = config(Strategy::EventLoop, request.config.max_workers);
        let report = Orchestrator::new(self.client.clone()).run(&tasks, &cfg);

        let response = workdir.join("response.json");
        worker::write_response(&response, &report).unwrap();
        worker::read_response(&response)
    }
}

fn gemini_descriptor() -> ClientDescriptor {
    ClientDescriptor {
        provider: "gemini".into(),
        model: "gemini-2.5-flash".into(),
        api_key: Some("test-key".into()),
    }
}

// ── Bounded concurrency ─────────────────────────────────────────────────────

#[test]
fn event_loop_never_exceeds_the_limit() {
    let client = SlowClient::new(true);
    let report = Orchestrator::new(client.clone()).run(&tasks(12), &config(Strategy::EventLoop, 3));

    assert_eq!(report.result.len(), 12);
    assert_eq!(client.gauge.calls.load(Ordering::SeqCst), 12);
    let peak = client.gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight {peak} exceeded limit 3");
    assert!(peak >= 2, "calls never overlapped (peak {peak})");
}

#[test]
fn thread_pool_never_exceeds_the_limit_with_blocking_client() {
    let client = SlowClient::new(false);
    let report = Orchestrator::new(client.clone()).run(&tasks(10), &config(Strategy::ThreadPool, 4));

    assert_eq!(report.result.len(), 10);
    let peak = client.gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak in-flight {peak} exceeded limit 4");
    assert_eq!(report.stats.strategy, Some(Strategy::ThreadPool));
}

#[test]
fn thread_pool_drives_non_blocking_client_within_the_limit() {
    let client = SlowClient::new(true);
    let report = Orchestrator::new(client.clone()).run(&tasks(9), &config(Strategy::ThreadPool, 2));

    assert_eq!(report.result.len(), 9);
    assert!(client.gauge.peak.load(Ordering::SeqCst) <= 2);
}

// ── Outcomes ────────────────────────────────────────────────────────────────

#[test]
fn three_task_scenario_event_loop() {
    let client = Arc::new(ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", transient()),
        ("file3.png", described("C")),
    ]));
    let report = Orchestrator::new(client.clone()).run(&tasks(3), &config(Strategy::EventLoop, 20));

    let expected: captionmd::RunResult = [("file1.png", "A"), ("file3.png", "C")].into_iter().collect();
    assert_eq!(report.result, expected);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.described, 2);
    assert!(report.stats.is_complete());
    assert_eq!(report.stats.fallback, None);
}

#[test]
fn three_task_scenario_thread_pool() {
    let client = Arc::new(ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", transient()),
        ("file3.png", described("C")),
    ]));
    let report = Orchestrator::new(client).run(&tasks(3), &config(Strategy::ThreadPool, 20));

    assert_eq!(report.result.get("file1.png"), Some("A"));
    assert_eq!(report.result.get("file3.png"), Some("C"));
    assert!(!report.result.contains("file2.png"));
    assert_eq!(report.stats.failed, 1);
}

#[test]
fn failure_does_not_stop_later_tasks() {
    let mut replies: Vec<(String, Reply)> = (1..=8)
        .map(|i| (format!("file{i}.png"), described(&format!("D{i}"))))
        .collect();
    replies[0].1 = transient();
    let refs: Vec<(&str, Reply)> = replies.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    let client = Arc::new(ScriptedClient::new(&refs));

    let report = Orchestrator::new(client.clone()).run(&tasks(8), &config(Strategy::EventLoop, 1));

    assert_eq!(report.result.len(), 7);
    for i in 2..=8 {
        assert!(report.result.contains(&format!("file{i}.png")));
    }
    assert_eq!(client.total_calls(), 8);
}

#[test]
fn skip_is_neither_failure_nor_retried() {
    let client = Arc::new(ScriptedClient::new(&[
        ("file1.png", Ok(None)),
        ("file2.png", described("B")),
    ]));
    let report = Orchestrator::new(client.clone()).run(&tasks(2), &config(Strategy::EventLoop, 4));

    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(client.calls_for("file1.png"), 1);
    assert!(!report.result.contains("file1.png"));
}

#[test]
fn sustained_rate_limiting_is_advisory_only() {
    let replies: Vec<(String, Reply)> = (1..=6)
        .map(|i| {
            (
                format!("file{i}.png"),
                Err(ProviderError::classify("HTTP 429 Too Many Requests: RESOURCE_EXHAUSTED")),
            )
        })
        .collect();
    let refs: Vec<(&str, Reply)> = replies.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    let client = Arc::new(ScriptedClient::new(&refs));
    let mut cfg = config(Strategy::EventLoop, 2);
    cfg.rate_limit_threshold = 2;

    let report = Orchestrator::new(client.clone()).run(&tasks(6), &cfg);

    assert_eq!(client.total_calls(), 6);
    assert_eq!(report.stats.failed, 6);
    assert_eq!(report.stats.rate_limited, 6);
    assert_eq!(cfg.concurrency_limit, 2);
}

#[test]
fn panicking_client_is_isolated() {
    struct Flaky;

    #[async_trait]
    impl CaptionClient for Flaky {
        fn family(&self) -> ProviderFamily {
            ProviderFamily::Other("flaky".into())
        }
        async fn describe(&self, req: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
            if req.filename == "file2.png" {
                panic!("decoder exploded");
            }
            Ok(Some("ok".into()))
        }
    }

    for strategy in [Strategy::EventLoop, Strategy::ThreadPool] {
        let report = Orchestrator::new(Arc::new(Flaky)).run(&tasks(3), &config(strategy, 2));
        assert_eq!(report.result.len(), 2, "{strategy}");
        assert_eq!(report.stats.failed, 1, "{strategy}");
    }
}

#[test]
fn empty_task_set_is_a_no_op() {
    let client = Arc::new(ScriptedClient::new(&[]));
    let report = Orchestrator::new(client.clone()).run(&[], &config(Strategy::EventLoop, 4));
    assert!(report.result.is_empty());
    assert_eq!(report.stats.total, 0);
    assert_eq!(client.total_calls(), 0);
}

// ── Fallback ────────────────────────────────────────────────────────────────

#[test]
fn setup_error_falls_back_without_duplicates() {
    let replies: Vec<(String, Reply)> = (1..=6)
        .map(|i| (format!("file{i}.png"), described(&format!("D{i}"))))
        .collect();
    let refs: Vec<(&str, Reply)> = replies.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    let mut client = ScriptedClient::new(&refs);
    client.setup_fails_once = Some("file3.png".into());
    let client = Arc::new(client);

    let report = Orchestrator::new(client.clone()).run(&tasks(6), &config(Strategy::EventLoop, 1));

    assert_eq!(report.stats.fallback, Some(Strategy::ThreadPool));
    assert_eq!(report.result.len(), 6);
    assert_eq!(report.stats.described, 6);
    assert!(report.stats.is_complete());
    // Finished before the failure: called once, never again.
    assert_eq!(client.calls_for("file1.png"), 1);
    assert_eq!(client.calls_for("file2.png"), 1);
    // The interrupted task runs again on the pool.
    assert_eq!(client.calls_for("file3.png"), 2);
    for i in 4..=6 {
        assert_eq!(client.calls_for(&format!("file{i}.png")), 1);
    }
}

#[test]
fn worker_failure_reprocesses_everything_on_the_pool() {
    let mut client = ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", transient()),
        ("file3.png", described("C")),
    ]);
    client.descriptor = Some(gemini_descriptor());
    let client = Arc::new(client);
    let invoker = FakeInvoker::new(WorkerOutcome::Failure("exit status: 1".into()));

    let report = Orchestrator::new(client.clone())
        .with_invoker(invoker.clone())
        .run(&tasks(3), &config(Strategy::Subprocess, 5));

    let seen = invoker.seen.lock().unwrap().clone().expect("invoker was called");
    assert_eq!(seen.images.len(), 3);
    assert_eq!(seen.config.api_key.as_deref(), Some("test-key"));
    assert_eq!(seen.config.max_workers, 5);

    assert_eq!(report.stats.strategy, Some(Strategy::Subprocess));
    assert_eq!(report.stats.fallback, Some(Strategy::ThreadPool));
    assert_eq!(report.result.len(), 2);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(client.total_calls(), 3);
}

#[test]
fn worker_success_is_taken_as_is() {
    let client = Arc::new({
        let mut c = ScriptedClient::new(&[]);
        c.descriptor = Some(ClientDescriptor {
            provider: "gemini".into(),
            model: "m".into(),
            api_key: None,
        });
        c
    });
    let child: captionmd::RunResult = [("file1.png", "A"), ("file3.png", "C")].into_iter().collect();
    let invoker = FakeInvoker::new(WorkerOutcome::Success {
        result: child.clone(),
        stats: None,
    });

    let report = Orchestrator::new(client.clone())
        .with_invoker(invoker)
        .run(&tasks(3), &config(Strategy::Subprocess, 2));

    assert_eq!(report.result, child);
    assert_eq!(report.stats.fallback, None);
    assert_eq!(client.total_calls(), 0);
    // No counts from the child: the undescribed image counts as skipped.
    assert_eq!(report.stats.skipped, 1);
    assert!(report.stats.is_complete());
}

#[test]
fn three_task_scenario_subprocess() {
    let parent = Arc::new({
        let mut c = ScriptedClient::new(&[]);
        c.descriptor = Some(gemini_descriptor());
        c
    });
    let child = Arc::new(ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", transient()),
        ("file3.png", described("C")),
    ]));
    let invoker = Arc::new(InProcessInvoker {
        client: child.clone(),
    });

    let report = Orchestrator::new(parent.clone())
        .with_invoker(invoker)
        .run(&tasks(3), &config(Strategy::Subprocess, 20));

    let expected: captionmd::RunResult = [("file1.png", "A"), ("file3.png", "C")].into_iter().collect();
    assert_eq!(report.result, expected);
    assert_eq!(report.stats.described, 2);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.skipped, 0);
    assert!(report.stats.is_complete());
    assert_eq!(report.stats.strategy, Some(Strategy::Subprocess));
    assert_eq!(report.stats.fallback, None);
    assert_eq!(parent.total_calls(), 0);
    assert_eq!(child.total_calls(), 3);
}

#[test]
fn client_without_descriptor_cannot_use_a_worker() {
    let client = Arc::new(ScriptedClient::new(&[("file1.png", described("A"))]));
    let invoker = FakeInvoker::new(WorkerOutcome::Success {
        result: Default::default(),
        stats: None,
    });

    let report = Orchestrator::new(client.clone())
        .with_invoker(invoker.clone())
        .run(&tasks(1), &config(Strategy::Subprocess, 2));

    assert!(invoker.seen.lock().unwrap().is_none());
    assert_eq!(report.stats.fallback, Some(Strategy::ThreadPool));
    assert_eq!(report.result.get("file1.png"), Some("A"));
}

// ── Strategy selection ──────────────────────────────────────────────────────

#[test]
fn plain_process_picks_event_loop_or_pool() {
    let cfg = CaptionConfig::default();
    assert_eq!(
        Orchestrator::new(SlowClient::new(true)).strategy_for(&cfg),
        Strategy::EventLoop
    );
    assert_eq!(
        Orchestrator::new(SlowClient::new(false)).strategy_for(&cfg),
        Strategy::ThreadPool
    );
}

#[tokio::test]
async fn running_runtime_selects_subprocess_and_still_completes() {
    assert!(!captionmd::runtime_allows_nested_async());

    let client = Arc::new(ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", described("B")),
    ]));
    let orchestrator = Orchestrator::new(client.clone())
        .with_invoker(FakeInvoker::new(WorkerOutcome::Failure("not spawned".into())));
    assert_eq!(
        orchestrator.strategy_for(&CaptionConfig::default()),
        Strategy::Subprocess
    );

    let report = orchestrator.run(&tasks(2), &CaptionConfig::default());
    assert_eq!(report.stats.strategy, Some(Strategy::Subprocess));
    assert_eq!(report.stats.fallback, Some(Strategy::ThreadPool));
    assert_eq!(report.result.len(), 2);
}

#[tokio::test]
async fn forced_event_loop_inside_a_runtime_falls_back() {
    let client = Arc::new(ScriptedClient::new(&[("file1.png", described("A"))]));
    let report = Orchestrator::new(client).run(&tasks(1), &config(Strategy::EventLoop, 2));
    assert_eq!(report.stats.fallback, Some(Strategy::ThreadPool));
    assert_eq!(report.result.get("file1.png"), Some("A"));
}

// ── Progress ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counting {
    started: AtomicUsize,
    described: AtomicUsize,
    failed: AtomicUsize,
    runs: Mutex<Vec<(usize, Strategy)>>,
    completed: Mutex<Option<RunStats>>,
}

impl CaptionProgressCallback for Counting {
    fn on_run_start(&self, total: usize, strategy: Strategy) {
        self.runs.lock().unwrap().push((total, strategy));
    }
    fn on_image_start(&self, _: usize, _: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_image_described(&self, _: usize, _: &str, _: usize) {
        self.described.fetch_add(1, Ordering::SeqCst);
    }
    fn on_image_failed(&self, _: usize, _: &str, _: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_run_complete(&self, stats: &RunStats) {
        *self.completed.lock().unwrap() = Some(stats.clone());
    }
}

#[test]
fn progress_events_cover_every_image() {
    let progress = Arc::new(Counting::default());
    let cfg = CaptionConfig::builder()
        .strategy(Strategy::ThreadPool)
        .concurrency_limit(2)
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let client = Arc::new(ScriptedClient::new(&[
        ("file1.png", described("A")),
        ("file2.png", transient()),
        ("file3.png", described("C")),
    ]));

    Orchestrator::new(client).run(&tasks(3), &cfg);

    assert_eq!(progress.started.load(Ordering::SeqCst), 3);
    assert_eq!(progress.described.load(Ordering::SeqCst), 2);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
    assert_eq!(*progress.runs.lock().unwrap(), vec![(3, Strategy::ThreadPool)]);
    let done = progress.completed.lock().unwrap().clone().unwrap();
    assert_eq!(done.described, 2);
}
