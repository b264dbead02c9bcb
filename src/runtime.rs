//! Runtime-environment probe and execution-strategy selection.
//!
//! The selector answers one question per run: which concurrency model is
//! safe in the *caller's* process right now?
//!
//! 1. The host marked itself as isolation-required → [`Strategy::Subprocess`].
//! 2. A tokio runtime is already driving the current thread → [`Strategy::Subprocess`].
//!    Blocking on a fresh runtime from inside one panics, and blocking the
//!    host's executor thread would stall every other task it runs.
//! 3. The caption client has a non-blocking call form → [`Strategy::EventLoop`].
//! 4. Otherwise → [`Strategy::ThreadPool`].
//!
//! Nothing here is cached: embedding contexts differ between callers, so the
//! probe runs again for every run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Environment variable that forces subprocess isolation when set to a truthy value.
pub const ISOLATION_ENV: &str = "CAPTIONMD_ISOLATE";

static ISOLATION_MARKER: AtomicBool = AtomicBool::new(false);

/// Execution model for a captioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Single-threaded cooperative scheduler over non-blocking calls.
    EventLoop,
    /// Fixed-size pool of OS threads, one call per worker at a time.
    ThreadPool,
    /// A clean child process running its own in-process strategy.
    Subprocess,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::EventLoop => "event-loop",
            Strategy::ThreadPool => "thread-pool",
            Strategy::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "event-loop" | "eventloop" | "async" => Ok(Strategy::EventLoop),
            "thread-pool" | "threadpool" | "threads" => Ok(Strategy::ThreadPool),
            "subprocess" | "process" => Ok(Strategy::Subprocess),
            other => Err(format!(
                "unknown strategy '{other}' (expected event-loop, thread-pool or subprocess)"
            )),
        }
    }
}

/// Mark (or unmark) this process as requiring subprocess isolation.
///
/// For hosts that have patched or wrapped the async machinery in ways the
/// probe cannot see.
pub fn set_isolation_marker(active: bool) {
    ISOLATION_MARKER.store(active, Ordering::SeqCst);
}

fn env_marker_active() -> bool {
    std::env::var(ISOLATION_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// What the probe saw in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeEnvironment {
    /// An explicit isolation marker is active (API or env var).
    pub isolation_marker: bool,
    /// A tokio runtime is entered on the current thread.
    pub running_event_loop: bool,
}

impl RuntimeEnvironment {
    /// Inspect the current thread and process.
    pub fn probe() -> Self {
        Self {
            isolation_marker: ISOLATION_MARKER.load(Ordering::SeqCst) || env_marker_active(),
            running_event_loop: tokio::runtime::Handle::try_current().is_ok(),
        }
    }
}

/// Whether the current context can safely nest its own async execution.
///
/// Tokio cannot block on a runtime from within a runtime, and there is no
/// reliable way to tell a re-entrant host from a non-re-entrant one, so
/// the answer is `false` whenever a runtime is present and always `false`
/// under an isolation marker.
pub fn runtime_allows_nested_async() -> bool {
    let env = RuntimeEnvironment::probe();
    !env.isolation_marker && !env.running_event_loop
}

/// Pick a strategy from an already-probed environment.
pub fn select_strategy(env: RuntimeEnvironment, client_non_blocking: bool) -> Strategy {
    let strategy = if env.isolation_marker || env.running_event_loop {
        Strategy::Subprocess
    } else if client_non_blocking {
        Strategy::EventLoop
    } else {
        Strategy::ThreadPool
    };
    debug!(
        "Strategy probe: marker={}, running_loop={}, non_blocking={} → {}",
        env.isolation_marker, env.running_event_loop, client_non_blocking, strategy
    );
    strategy
}
