use std::path::PathBuf;
use std::time::Duration;

use shared_types::SyncMode;

/// Timer and threshold knobs shared by every engine variant.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Interval between `GET {base}/latest` calls.
    pub poll_interval: Duration,
    /// Shortest delay between two scripted events.
    pub step_floor: Duration,
    /// Multiplier applied to recorded gaps so replays stay perceptible.
    pub slowdown: f64,
    /// Gap after which a stream step is shown as still running.
    pub running_gap: Duration,
    /// How often the stream engine re-evaluates its wall-clock cutoff.
    pub reveal_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            step_floor: Duration::from_millis(500),
            slowdown: 3.0,
            running_gap: Duration::from_millis(1000),
            reveal_interval: Duration::from_millis(100),
        }
    }
}

impl TimingConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: Duration::from_millis(env_parse(
                "VISUALIZER_POLL_INTERVAL_MS",
                millis(defaults.poll_interval),
            )?),
            step_floor: Duration::from_millis(env_parse(
                "VISUALIZER_STEP_FLOOR_MS",
                millis(defaults.step_floor),
            )?),
            slowdown: env_parse("VISUALIZER_SLOWDOWN", defaults.slowdown)?,
            running_gap: Duration::from_millis(env_parse(
                "VISUALIZER_RUNNING_GAP_MS",
                millis(defaults.running_gap),
            )?),
            reveal_interval: Duration::from_millis(env_parse(
                "VISUALIZER_REVEAL_INTERVAL_MS",
                millis(defaults.reveal_interval),
            )?),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Settings for the headless `trace-viz` runner.
#[derive(Debug, Clone)]
pub struct VisualizerConfig {
    /// Proxy base for one workflow, e.g. `http://localhost:8090/api/llm-router`.
    pub base_url: Option<String>,
    pub workflow: String,
    pub scenario: Option<String>,
    /// Forces an engine variant regardless of the workflow's declared mode.
    pub mode: Option<SyncMode>,
    /// TOML or JSON file with extra workflow definitions.
    pub workflow_file: Option<PathBuf>,
    /// Submitted on start when the engine accepts queries.
    pub query: Option<String>,
    pub speed: f64,
    /// Print every notified state as a JSON line.
    pub emit_json: bool,
    /// Confirm approval gates without waiting for a human.
    pub auto_approve: bool,
    pub timing: TimingConfig,
}

impl VisualizerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: env_opt("VISUALIZER_BASE_URL"),
            workflow: env_str("VISUALIZER_WORKFLOW", shared_types::catalog::SUPPORT_AGENT),
            scenario: env_opt("VISUALIZER_SCENARIO"),
            mode: env_opt("VISUALIZER_MODE")
                .map(|raw| {
                    raw.parse::<SyncMode>()
                        .map_err(|e| anyhow::anyhow!("Failed to parse env var VISUALIZER_MODE: {e}"))
                })
                .transpose()?,
            workflow_file: env_opt("VISUALIZER_WORKFLOW_FILE").map(PathBuf::from),
            query: env_opt("VISUALIZER_QUERY"),
            speed: env_parse("VISUALIZER_SPEED", 1.0)?,
            emit_json: env_parse("VISUALIZER_EMIT_JSON", false)?,
            auto_approve: env_parse("VISUALIZER_AUTO_APPROVE", false)?,
            timing: TimingConfig::from_env()?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
