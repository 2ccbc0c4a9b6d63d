//! Gateway configuration loading and validation.
//!
//! The configuration store itself is external; this module only turns an
//! ordered set of records (YAML or JSON) into typed values. Environment
//! variables are interpolated before parsing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::backoff::BackoffPolicy;
use super::errors::GatewayError;
use super::translator::{AuthStrategy, ParamSpec};
use super::types::TransportKind;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCPGATE_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Downstream protocol servers, applied in order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// REST APIs exposed as synthetic tools, applied in order.
    #[serde(default)]
    pub api_wrappers: Vec<ApiWrapperConfig>,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// One downstream server.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Owner id; used as the disambiguation prefix. Must not contain `:`.
    pub id: String,
    #[serde(default = "default_transport", alias = "type")]
    pub transport: TransportKind,
    /// Executable for stdio backends.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Endpoint for HTTP backends.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra headers sent with every HTTP request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `session.max_concurrency` for this backend.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}
fn default_true() -> bool {
    true
}

impl BackendConfig {
    /// A stdio backend launched from `command`.
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            transport: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            enabled: true,
            max_concurrency: None,
        }
    }

    /// An HTTP backend reachable at `url`.
    pub fn http(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.to_string()),
            headers: HashMap::new(),
            enabled: true,
            max_concurrency: None,
        }
    }

    /// Problems with this record, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("backend id must not be empty".to_string());
        }
        if self.id.contains(':') {
            problems.push(format!("backend id '{}' must not contain ':'", self.id));
        }
        match self.transport {
            TransportKind::Stdio if self.command.as_deref().map_or(true, str::is_empty) => {
                problems.push(format!("stdio backend '{}' requires a command", self.id));
            }
            TransportKind::Http if self.url.as_deref().map_or(true, str::is_empty) => {
                problems.push(format!("http backend '{}' requires a url", self.id));
            }
            _ => {}
        }
        if self.max_concurrency == Some(0) {
            problems.push(format!("backend '{}' max_concurrency must be > 0", self.id));
        }
        problems
    }
}

/// One wrapped REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiWrapperConfig {
    pub name: String,
    pub base_url: String,
    /// Named auth profiles that endpoints reference.
    #[serde(default)]
    pub auth: HashMap<String, AuthStrategy>,
    /// Profile applied to endpoints that do not name one.
    #[serde(default)]
    pub default_auth: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One REST endpoint of a wrapped API.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered parameter specs.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Schema of a whole-body argument named `body`.
    #[serde(default)]
    pub body_schema: Option<serde_json::Value>,
    /// Defaults to true for GET/HEAD/OPTIONS.
    #[serde(default)]
    pub read_only: Option<bool>,
    /// Auth profile name; falls back to the wrapper's `default_auth`.
    #[serde(default)]
    pub auth: Option<String>,
    /// Response headers copied into the payload (content-type is always kept).
    #[serde(default)]
    pub response_headers: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "BackoffPolicy::reconnect")]
    pub reconnect: BackoffPolicy,
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_max_missed() -> u32 {
    3
}
fn default_max_concurrency() -> usize {
    8
}
fn default_init_timeout_ms() -> u64 {
    30_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_missed_heartbeats: default_max_missed(),
            max_concurrency: default_max_concurrency(),
            init_timeout_ms: default_init_timeout_ms(),
            reconnect: BackoffPolicy::reconnect(),
        }
    }
}

impl SessionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Dispatch tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Deadline applied when the caller does not give one.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    #[serde(default = "BackoffPolicy::retry")]
    pub retry: BackoffPolicy,
}

fn default_deadline_ms() -> u64 {
    30_000
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            retry: BackoffPolicy::retry(),
        }
    }
}

impl DispatchSettings {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}

impl GatewayConfig {
    /// Check cross-record consistency, reporting every problem at once.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut problems = Vec::new();

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            problems.extend(backend.problems());
            if !backend_ids.insert(backend.id.as_str()) {
                problems.push(format!("duplicate backend id '{}'", backend.id));
            }
        }

        let mut wrapper_names = HashSet::new();
        for wrapper in &self.api_wrappers {
            if wrapper.name.trim().is_empty() || wrapper.name.contains(':') {
                problems.push(format!("invalid api wrapper name '{}'", wrapper.name));
            }
            if !wrapper_names.insert(wrapper.name.as_str()) {
                problems.push(format!("duplicate api wrapper name '{}'", wrapper.name));
            }
        }

        if self.session.heartbeat_interval_ms == 0 {
            problems.push("session.heartbeat_interval_ms must be > 0".to_string());
        }
        if self.session.max_missed_heartbeats == 0 {
            problems.push("session.max_missed_heartbeats must be > 0".to_string());
        }
        if self.session.max_concurrency == 0 {
            problems.push("session.max_concurrency must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config {
                reason: problems.join("; "),
            })
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to load.
///
/// Order: explicit path, `MCPGATE_CONFIG`, then `<config dir>/mcpgate/config.yaml`.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, GatewayError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(expand_tilde(&path)));
        }
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("mcpgate").join("config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(GatewayError::Config {
        reason: format!("no config file given and {CONFIG_ENV_VAR} is not set"),
    })
}

/// Load, interpolate, parse, and validate a config file (YAML or JSON).
pub fn load_config(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_config(&raw)
}

/// Parse config text after environment interpolation.
pub fn parse_config(raw: &str) -> Result<GatewayConfig, GatewayError> {
    let interpolated = interpolate_env_vars(raw);

    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| GatewayError::Config {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::translator::ParamLocation;
    use std::io::Write;

    const SAMPLE: &str = r#"
backends:
  - id: notes
    transport: stdio
    command: python3
    args: ["-m", "notes_server"]
  - id: search
    transport: http
    url: "http://localhost:3000/mcp"
    max_concurrency: 2
api_wrappers:
  - name: jsonplaceholder
    base_url: "https://jsonplaceholder.typicode.com"
    endpoints:
      - name: get_user
        path: "/users/{id}"
        params:
          - name: id
            type: integer
            location: path
            required: true
session:
  heartbeat_interval_ms: 500
"#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].transport, TransportKind::Stdio);
        assert_eq!(config.backends[1].max_concurrency, Some(2));
        assert_eq!(config.session.heartbeat_interval_ms, 500);
        assert_eq!(config.session.max_missed_heartbeats, 3);
        assert_eq!(config.dispatch.retry.max_attempts, 1);

        let endpoint = &config.api_wrappers[0].endpoints[0];
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.params[0].location, ParamLocation::Path);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let yaml = r#"
backends:
  - id: "bad:id"
    command: x
  - id: web
    transport: http
  - id: web
    transport: http
    url: "http://x"
"#;
        let err = parse_config(yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("must not contain ':'"));
        assert!(msg.contains("requires a url"));
        assert!(msg.contains("duplicate backend id 'web'"));
    }

    #[test]
    fn test_json_config_accepted() {
        let json = r#"{"backends": [{"id": "a", "type": "http", "url": "http://a"}]}"#;
        let config = parse_config(json).unwrap();
        assert_eq!(config.backends[0].transport, TransportKind::Http);
    }

    #[test]
    fn test_load_config_interpolates_env() {
        std::env::set_var("__MCPGATE_TEST_TOKEN__", "s3cret");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
api_wrappers:
  - name: svc
    base_url: "${{__MCPGATE_TEST_BASE__:-http://localhost:9}}"
    auth:
      main:
        type: bearer
        token: "${{__MCPGATE_TEST_TOKEN__}}"
    default_auth: main
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let wrapper = &config.api_wrappers[0];
        assert_eq!(wrapper.base_url, "http://localhost:9");
        match wrapper.auth.get("main").unwrap() {
            AuthStrategy::Bearer { token } => assert_eq!(token, "s3cret"),
            other => panic!("expected bearer, got {other:?}"),
        }
        std::env::remove_var("__MCPGATE_TEST_TOKEN__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_find_config_path_explicit_wins() {
        let path = find_config_path(Some(Path::new("/tmp/gw.yaml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/gw.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/mcpgate.yaml")).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }
}
