use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout as deadline;

use super::secrets;
use super::snmp::SnmpV3Checker;
use super::types::{Details, Outcome, Params, int_param, millis};

/// Check executor contract: one implementation per check kind.
///
/// Implementations never fail. Every problem (bad params, refused connection,
/// missing binary) is reported as a `down` outcome carrying `details.error`.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Kind string this checker is registered under
    fn kind(&self) -> &str;

    /// Check `target`, returning within roughly `timeout`
    async fn run(&self, target: &str, timeout: Duration, params: &Params) -> Outcome;
}

pub(super) fn classify(latency: Duration, threshold: Duration, details: Details) -> Outcome {
    let latency_ms = Some(millis(latency));
    if latency > threshold {
        Outcome::degraded(latency_ms, details).with_detail("slow", true)
    } else {
        Outcome::up(latency_ms, details)
    }
}

static RTT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)time[=<]\s*(\d+(?:\.\d+)?)\s*ms").ok());

/// Round-trip time reported by the system ping utility
fn parse_rtt(output: &str) -> Option<f64> {
    RTT_PATTERN.as_ref()?.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Gap between echo requests. Only Linux `ping` lets us shorten the
/// one second default without root.
pub const PING_SPACING: Duration =
    if cfg!(target_os = "linux") { Duration::from_millis(200) } else { Duration::from_secs(1) };

pub const MAX_PING_COUNT: u32 = 10;

/// Largest echo count that fits in `timeout`, a full spacing left for the last reply
pub fn max_ping_count(timeout: Duration) -> u32 {
    let fits = timeout.as_nanos() / PING_SPACING.as_nanos();
    u32::try_from(fits).unwrap_or(MAX_PING_COUNT).clamp(1, MAX_PING_COUNT)
}

/// ICMP reachability through the system `ping` binary
pub struct PingChecker {
    program: PathBuf,
}

impl Default for PingChecker {
    fn default() -> Self {
        Self { program: PathBuf::from("ping") }
    }
}

impl PingChecker {
    /// Use another `ping` executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// The whole run, all echoes included, is bounded by `timeout`
    fn command(&self, target: &str, timeout: Duration, count: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        let deadline_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        if cfg!(windows) {
            // No whole-run deadline on Windows; the per-reply wait is split instead
            let per_reply = (timeout / count).as_millis().max(1);
            cmd.args(["-n", &count.to_string(), "-w", &per_reply.to_string()]);
        } else if cfg!(target_os = "linux") {
            let spacing = format!("{:.1}", PING_SPACING.as_secs_f64());
            cmd.args(["-c", &count.to_string(), "-i", &spacing, "-w", &deadline_secs.to_string()]);
        } else {
            cmd.args(["-c", &count.to_string(), "-t", &deadline_secs.to_string()]);
        }
        cmd.arg(target).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl Checker for PingChecker {
    fn kind(&self) -> &str {
        "ping"
    }

    async fn run(&self, target: &str, timeout: Duration, params: &Params) -> Outcome {
        let target = target.trim();
        if target.is_empty() {
            return Outcome::down("empty host");
        }
        let requested = int_param(params, "count").unwrap_or(1).clamp(1, i64::from(MAX_PING_COUNT)) as u32;
        let count = requested.min(max_ping_count(timeout));
        if count < requested {
            tracing::debug!(target, requested, count, "Ping count reduced to fit the timeout");
        }

        let start = Instant::now();
        // Dropping the pending future on overrun kills the child
        let output = match deadline(timeout, self.command(target, timeout, count).output()).await {
            Err(_) => return Outcome::down(format!("ping timed out after {:.1}s", timeout.as_secs_f64())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Outcome::down("ping command not found");
            }
            Ok(Err(e)) => return Outcome::down(format!("failed to run ping: {e}")),
            Ok(Ok(output)) => output,
        };
        let elapsed = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return if stderr.is_empty() {
                Outcome::down(format!("ping exited with {}", output.status))
            } else {
                Outcome::down(stderr)
            };
        }

        let latency_ms = parse_rtt(&stdout).unwrap_or_else(|| millis(elapsed));
        let mut details = Details::new();
        details.insert("count".into(), count.into());
        Outcome::up(Some(latency_ms), details)
    }
}

/// TCP connect check against `target:port`
pub struct TcpChecker {
    degraded_threshold: Duration,
}

impl TcpChecker {
    pub fn new(degraded_threshold: Duration) -> Self {
        Self { degraded_threshold }
    }
}

#[async_trait::async_trait]
impl Checker for TcpChecker {
    fn kind(&self) -> &str {
        "tcp"
    }

    async fn run(&self, target: &str, timeout: Duration, params: &Params) -> Outcome {
        let Some(port) = int_param(params, "port").and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0)
        else {
            return Outcome::down("tcp check requires a valid 'port' param");
        };

        let start = Instant::now();
        let connect = tokio::net::TcpStream::connect((target, port));

        match deadline(timeout, connect).await {
            Err(_) => Outcome::down("TCP connection timeout"),
            Ok(Err(e)) => Outcome::down(format!("TCP connection failed: {e}")),
            Ok(Ok(_stream)) => {
                let mut details = Details::new();
                details.insert("port".into(), port.into());
                classify(start.elapsed(), self.degraded_threshold, details)
            }
        }
    }
}

/// HTTP GET check
pub struct HttpChecker {
    client: reqwest::Client,
    degraded_threshold: Duration,
}

impl HttpChecker {
    pub fn new(degraded_threshold: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netdash/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, degraded_threshold })
    }

    /// `url` param, or one assembled from `scheme`, `port` and `path`
    fn target_url(target: &str, params: &Params) -> std::result::Result<url::Url, String> {
        let raw = match secrets::param(params, "url").map_err(|e| e.to_string())? {
            Some(url) => url,
            None => {
                let scheme = params.get("scheme").and_then(Value::as_str).unwrap_or("http");
                let path = params.get("path").and_then(Value::as_str).unwrap_or("/");
                let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
                match int_param(params, "port") {
                    Some(port) => format!("{scheme}://{target}:{port}{path}"),
                    None => format!("{scheme}://{target}{path}"),
                }
            }
        };

        let url = url::Url::parse(&raw).map_err(|e| format!("invalid URL: {e}"))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(format!("unsupported scheme '{other}'")),
        }
    }

    fn request(
        &self,
        url: url::Url,
        timeout: Duration,
        params: &Params,
    ) -> std::result::Result<reqwest::RequestBuilder, String> {
        let mut request = self.client.get(url).timeout(timeout);

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (name, value) in headers {
                let Some(raw) = value.as_str() else {
                    return Err(format!("header '{name}' must be a string"));
                };
                let value = secrets::resolve(raw).map_err(|e| e.to_string())?;
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(token) = secrets::param(params, "bearer_token").map_err(|e| e.to_string())? {
            request = request.bearer_auth(token);
        }

        Ok(request)
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    fn kind(&self) -> &str {
        "http"
    }

    async fn run(&self, target: &str, timeout: Duration, params: &Params) -> Outcome {
        let request = match Self::target_url(target, params).and_then(|url| self.request(url, timeout, params)) {
            Ok(request) => request,
            Err(e) => return Outcome::down(e),
        };

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Outcome::down("HTTP request timed out"),
            // Without the URL, which may carry a resolved secret
            Err(e) => return Outcome::down(format!("HTTP request failed: {}", e.without_url())),
        };
        let latency = start.elapsed();

        status_outcome(response.status(), latency, self.degraded_threshold, params)
    }
}

/// 2xx and 3xx are healthy. Any other answer still proves the server is
/// reachable and counts as degraded, unless its code is listed in the
/// `down_on_status` param.
fn status_outcome(status: reqwest::StatusCode, latency: Duration, threshold: Duration, params: &Params) -> Outcome {
    let code = status.as_u16();
    let mut details = Details::new();
    details.insert("status_code".into(), code.into());

    if status.is_success() || status.is_redirection() {
        return classify(latency, threshold, details);
    }

    let error = format!("HTTP check failed with status code: {code}");
    let fatal = params
        .get("down_on_status")
        .and_then(Value::as_array)
        .is_some_and(|codes| codes.iter().any(|c| c.as_u64() == Some(u64::from(code))));
    if fatal {
        Outcome::down(error).with_detail("status_code", code)
    } else {
        Outcome::degraded(Some(millis(latency)), details).with_detail("error", error)
    }
}

/// Checkers by kind string
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `ping`, `tcp`, `http` and `snmpv3_get`
    pub fn with_builtin(degraded_threshold: Duration) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(PingChecker::default()));
        registry.register(Arc::new(TcpChecker::new(degraded_threshold)));
        registry.register(Arc::new(HttpChecker::new(degraded_threshold)?));
        registry.register(Arc::new(SnmpV3Checker::new(degraded_threshold)));
        Ok(registry)
    }

    /// Replaces any checker already registered for the same kind
    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        self.checkers.insert(checker.kind().to_string(), checker);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Checker>> {
        self.checkers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.checkers.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.checkers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
