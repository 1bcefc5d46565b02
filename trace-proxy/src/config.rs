use std::collections::BTreeMap;
use std::time::Duration;

const UPSTREAM_PREFIX: &str = "TRACE_PROXY_UPSTREAM_";

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the proxy listens on
    pub port: u16,
    /// Origins allowed by CORS. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Workflow id -> upstream run endpoint. Workflows without one are replayed
    /// from their first scenario.
    pub upstreams: BTreeMap<String, String>,
    /// Multiplier applied to scenario timing during replay.
    pub replay_speed: f64,
    /// Timeout for a single upstream request, streaming included.
    pub upstream_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let replay_speed: f64 = env_parse("TRACE_PROXY_REPLAY_SPEED", 1.0)?;
        if !replay_speed.is_finite() || replay_speed <= 0.0 {
            anyhow::bail!("TRACE_PROXY_REPLAY_SPEED must be a positive number, got {replay_speed}");
        }

        Ok(Self {
            port: env_parse("TRACE_PROXY_PORT", 8787)?,
            allowed_origins: env_csv(
                "TRACE_PROXY_ALLOWED_ORIGINS",
                &["http://localhost:3000", "http://127.0.0.1:3000"],
            ),
            upstreams: upstreams_from(std::env::vars()),
            replay_speed,
            upstream_timeout: Duration::from_secs(env_parse(
                "TRACE_PROXY_UPSTREAM_TIMEOUT_SECS",
                300,
            )?),
        })
    }
}

/// `TRACE_PROXY_UPSTREAM_LLM_ROUTER=...` configures workflow `llm-router`.
fn upstreams_from(vars: impl Iterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.filter_map(|(key, value)| {
        let suffix = key.strip_prefix(UPSTREAM_PREFIX)?;
        let url = value.trim();
        if suffix.is_empty() || url.is_empty() {
            return None;
        }
        Some((workflow_id_from_env(suffix), url.to_string()))
    })
    .collect()
}

fn workflow_id_from_env(suffix: &str) -> String {
    suffix.to_ascii_lowercase().replace('_', "-")
}

/// Environment key that configures `workflow_id`'s upstream.
pub fn upstream_env_key(workflow_id: &str) -> String {
    format!(
        "{UPSTREAM_PREFIX}{}",
        workflow_id.to_ascii_uppercase().replace('-', "_")
    )
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

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstreams_are_keyed_by_workflow_id() {
        let vars = vec![
            (
                "TRACE_PROXY_UPSTREAM_LLM_ROUTER".to_string(),
                " http://router:8000/v1/chat ".to_string(),
            ),
            ("TRACE_PROXY_UPSTREAM_RAG_PIPELINE".to_string(), String::new()),
            ("TRACE_PROXY_PORT".to_string(), "9000".to_string()),
        ];
        let upstreams = upstreams_from(vars.into_iter());
        assert_eq!(upstreams.len(), 1);
        assert_eq!(
            upstreams.get("llm-router").map(String::as_str),
            Some("http://router:8000/v1/chat")
        );
    }

    #[test]
    fn test_env_key_matches_parsing() {
        let key = upstream_env_key("rag-pipeline");
        assert_eq!(key, "TRACE_PROXY_UPSTREAM_RAG_PIPELINE");
        let parsed = upstreams_from(vec![(key, "http://rag".to_string())].into_iter());
        assert!(parsed.contains_key("rag-pipeline"));
    }
}
