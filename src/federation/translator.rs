//! Schema translator — exposes REST endpoints as synthetic tools.
//!
//! Translation is a pure function from an [`EndpointConfig`] to a
//! [`CapabilityDescriptor`] plus an [`EndpointAdapter`]. The adapter validates
//! call arguments and renders a [`PreparedRequest`] without touching the
//! network; only [`EndpointAdapter::invoke`] issues the HTTP call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use base64::Engine;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::{ApiWrapperConfig, EndpointConfig};
use super::errors::GatewayError;
use super::types::{CapabilityDescriptor, CapabilityKind, Origin};

// ─── Parameter Specs ─────────────────────────────────────────────────────────

/// Where a parameter travels in the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Body,
    Header,
}

/// JSON type of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Whether `value` has this JSON type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// One endpoint parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    /// Defaults to `true` for path parameters, `false` otherwise.
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default = "default_location")]
    pub location: ParamLocation,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_location() -> ParamLocation {
    ParamLocation::Query
}

impl ParamSpec {
    pub fn new(name: &str, param_type: ParamType, location: ParamLocation) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: None,
            location,
            description: None,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn is_required(&self) -> bool {
        self.required
            .unwrap_or(self.location == ParamLocation::Path)
    }
}

// ─── Auth ────────────────────────────────────────────────────────────────────

/// How a wrapped API call authenticates.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(alias = "api_key")]
    ApiKeyHeader {
        #[serde(default = "default_api_key_header", alias = "key_name")]
        header: String,
        #[serde(alias = "api_key")]
        key: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bearer { .. } => write!(f, "Bearer(***)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}:***)"),
            Self::ApiKeyHeader { header, .. } => write!(f, "ApiKeyHeader({header}: ***)"),
        }
    }
}

impl AuthStrategy {
    /// Headers this strategy adds to every request.
    fn headers(&self) -> Vec<(String, String)> {
        match self {
            Self::None => Vec::new(),
            Self::Bearer { token } => vec![("Authorization".into(), format!("Bearer {token}"))],
            Self::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}").as_bytes());
                vec![("Authorization".into(), format!("Basic {encoded}"))]
            }
            Self::ApiKeyHeader { header, key } => vec![(header.clone(), key.clone())],
        }
    }
}

// ─── Endpoint Model ──────────────────────────────────────────────────────────

/// A validated REST endpoint.
#[derive(Debug, Clone)]
pub struct WrappedEndpoint {
    pub api_name: String,
    pub name: String,
    pub method: Method,
    pub path_template: String,
    pub params: Vec<ParamSpec>,
    pub body_schema: Option<serde_json::Value>,
    pub auth: AuthStrategy,
    pub description: String,
    pub read_only: bool,
    pub response_headers: Vec<String>,
}

/// A fully rendered HTTP request, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// Owner id used for a wrapped API's capabilities.
pub fn wrapper_owner_id(api_name: &str) -> String {
    format!("api:{api_name}")
}

// ─── Translation ─────────────────────────────────────────────────────────────

/// Translate every endpoint of a wrapper.
///
/// Fails with a single `Schema` error listing every invalid endpoint
/// definition, so callers can fix them all at once.
pub fn translate_wrapper(
    config: &ApiWrapperConfig,
) -> Result<Vec<(CapabilityDescriptor, EndpointAdapter)>, GatewayError> {
    let subject = wrapper_owner_id(&config.name);
    let mut issues = Vec::new();

    let base_url = match Url::parse(&config.base_url) {
        Ok(url) if !url.cannot_be_a_base() => Some(url),
        Ok(_) => {
            issues.push(format!("base_url '{}' cannot be a base", config.base_url));
            None
        }
        Err(e) => {
            issues.push(format!("invalid base_url '{}': {e}", config.base_url));
            None
        }
    };

    if let Some(default) = &config.default_auth {
        if !config.auth.contains_key(default) {
            issues.push(format!("default_auth '{default}' is not a defined auth profile"));
        }
    }

    let mut seen = HashSet::new();
    let mut translated = Vec::new();
    for endpoint in &config.endpoints {
        if !seen.insert(endpoint.name.as_str()) {
            issues.push(format!("endpoint '{}': duplicate name", endpoint.name));
            continue;
        }
        match build_endpoint(config, endpoint) {
            Ok(wrapped) => translated.push(wrapped),
            Err(errs) => issues.extend(
                errs.into_iter()
                    .map(|e| format!("endpoint '{}': {e}", endpoint.name)),
            ),
        }
    }

    match base_url {
        Some(base_url) if issues.is_empty() => Ok(translated
            .into_iter()
            .map(|endpoint| {
                let adapter = EndpointAdapter::new(endpoint, base_url.clone());
                (adapter.descriptor(), adapter)
            })
            .collect()),
        _ => Err(GatewayError::Schema { subject, issues }),
    }
}

/// Validate one endpoint definition, collecting every problem.
fn build_endpoint(
    config: &ApiWrapperConfig,
    endpoint: &EndpointConfig,
) -> Result<WrappedEndpoint, Vec<String>> {
    let mut issues = Vec::new();

    if endpoint.name.trim().is_empty() {
        issues.push("name must not be empty".to_string());
    }
    if endpoint.name.contains(':') {
        issues.push("name must not contain ':'".to_string());
    }

    let method = match Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()) {
        Ok(m) if is_supported_method(&m) => Some(m),
        _ => {
            issues.push(format!("unsupported HTTP method '{}'", endpoint.method));
            None
        }
    };

    let placeholders = match parse_placeholders(&endpoint.path) {
        Ok(p) => p,
        Err(e) => {
            issues.push(e);
            Vec::new()
        }
    };

    let mut names = HashSet::new();
    for param in &endpoint.params {
        if param.name.trim().is_empty() {
            issues.push("parameter name must not be empty".to_string());
            continue;
        }
        if !names.insert(param.name.as_str()) {
            issues.push(format!("duplicate parameter '{}'", param.name));
        }
        match param.location {
            ParamLocation::Path => {
                if !placeholders.contains(&param.name) {
                    issues.push(format!(
                        "path parameter '{}' has no placeholder in '{}'",
                        param.name, endpoint.path
                    ));
                }
                if !param.is_required() {
                    issues.push(format!("path parameter '{}' must be required", param.name));
                }
            }
            ParamLocation::Header => {
                if HeaderName::from_bytes(param.name.as_bytes()).is_err() {
                    issues.push(format!("invalid header name '{}'", param.name));
                }
            }
            ParamLocation::Body => {
                if matches!(method, Some(Method::GET) | Some(Method::HEAD)) {
                    issues.push(format!(
                        "body parameter '{}' not allowed on {}",
                        param.name, endpoint.method
                    ));
                }
            }
            ParamLocation::Query => {}
        }
    }

    for placeholder in &placeholders {
        let resolved = endpoint
            .params
            .iter()
            .any(|p| p.location == ParamLocation::Path && &p.name == placeholder);
        if !resolved {
            issues.push(format!(
                "path placeholder '{{{placeholder}}}' has no path parameter"
            ));
        }
    }

    if endpoint.body_schema.is_some() {
        if names.contains("body") {
            issues.push("parameter 'body' clashes with body_schema".to_string());
        }
        if matches!(method, Some(Method::GET) | Some(Method::HEAD)) {
            issues.push(format!("body_schema not allowed on {}", endpoint.method));
        }
    }

    let auth_ref = endpoint.auth.as_ref().or(config.default_auth.as_ref());
    let auth = match auth_ref {
        None => AuthStrategy::None,
        Some(name) if name == "none" => AuthStrategy::None,
        Some(name) => match config.auth.get(name) {
            Some(strategy) => strategy.clone(),
            None => {
                issues.push(format!("unknown auth profile '{name}'"));
                AuthStrategy::None
            }
        },
    };

    for header in &endpoint.response_headers {
        if HeaderName::from_bytes(header.as_bytes()).is_err() {
            issues.push(format!("invalid response header name '{header}'"));
        }
    }

    let Some(method) = method else {
        return Err(issues);
    };
    if !issues.is_empty() {
        return Err(issues);
    }

    let read_only = endpoint
        .read_only
        .unwrap_or(matches!(method, Method::GET | Method::HEAD | Method::OPTIONS));

    Ok(WrappedEndpoint {
        api_name: config.name.clone(),
        name: endpoint.name.clone(),
        description: endpoint
            .description
            .clone()
            .unwrap_or_else(|| format!("{} {}", method, endpoint.path)),
        method,
        path_template: endpoint.path.clone(),
        params: endpoint.params.clone(),
        body_schema: endpoint.body_schema.clone(),
        auth,
        read_only,
        response_headers: endpoint
            .response_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect(),
    })
}

fn is_supported_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::POST
            | Method::PUT
            | Method::PATCH
            | Method::DELETE
            | Method::HEAD
            | Method::OPTIONS
    )
}

/// Extract `{name}` placeholders from a path template, in order.
pub fn parse_placeholders(template: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            return Err(format!("malformed placeholder in '{template}'"));
        }
        out.push(name.to_string());
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(format!("unbalanced '}}' in '{template}'"));
    }
    Ok(out)
}

/// Build the JSON schema mirroring an endpoint's parameter specs.
pub fn build_input_schema(
    params: &[ParamSpec],
    body_schema: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for param in params {
        let description = param.description.clone().unwrap_or_else(|| {
            format!("{:?} parameter: {}", param.location, param.name).to_lowercase()
        });
        properties.insert(
            param.name.clone(),
            serde_json::json!({
                "type": param.param_type.as_str(),
                "description": description,
            }),
        );
        if param.is_required() {
            required.push(serde_json::Value::String(param.name.clone()));
        }
    }

    if let Some(body) = body_schema {
        properties.insert("body".to_string(), body.clone());
        required.push(serde_json::Value::String("body".to_string()));
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

/// Call-time half of a translated endpoint.
#[derive(Debug, Clone)]
pub struct EndpointAdapter {
    endpoint: WrappedEndpoint,
    base_url: Url,
}

impl EndpointAdapter {
    fn new(endpoint: WrappedEndpoint, base_url: Url) -> Self {
        Self { endpoint, base_url }
    }

    pub fn endpoint(&self) -> &WrappedEndpoint {
        &self.endpoint
    }

    /// Raw name of the synthetic tool (`api:<wrapper>:<endpoint>`).
    pub fn tool_name(&self) -> String {
        format!("{}:{}", wrapper_owner_id(&self.endpoint.api_name), self.endpoint.name)
    }

    /// The descriptor this endpoint is registered under.
    pub fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            CapabilityKind::Tool,
            &self.tool_name(),
            &wrapper_owner_id(&self.endpoint.api_name),
            Origin::WrappedApi,
        )
        .with_description(&self.endpoint.description)
        .with_schema(build_input_schema(
            &self.endpoint.params,
            self.endpoint.body_schema.as_ref(),
        ))
        .with_read_only(self.endpoint.read_only)
    }

    /// Check arguments against the parameter specs, collecting every issue.
    pub fn validate<'a>(
        &'a self,
        arguments: &'a serde_json::Value,
    ) -> Result<HashMap<&'a str, &'a serde_json::Value>, GatewayError> {
        static EMPTY: OnceLock<serde_json::Map<String, serde_json::Value>> = OnceLock::new();
        let args = match arguments {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => EMPTY.get_or_init(serde_json::Map::new),
            _ => return Err(GatewayError::schema(self.tool_name(), "arguments must be an object")),
        };

        let mut issues = Vec::new();
        let mut accepted = HashMap::new();

        for param in &self.endpoint.params {
            match args.get(&param.name).filter(|v| !v.is_null()) {
                Some(value) if param.param_type.matches(value) => {
                    accepted.insert(param.name.as_str(), value);
                }
                Some(value) => issues.push(format!(
                    "parameter '{}' expects {}, got {}",
                    param.name,
                    param.param_type.as_str(),
                    json_type_name(value)
                )),
                None if param.is_required() => {
                    issues.push(format!("missing required parameter '{}'", param.name));
                }
                None => {}
            }
        }

        if self.endpoint.body_schema.is_some() {
            match args.get("body").filter(|v| !v.is_null()) {
                Some(body) => {
                    accepted.insert("body", body);
                }
                None => issues.push("missing required parameter 'body'".to_string()),
            }
        }

        for key in args.keys() {
            if !accepted.contains_key(key.as_str()) && !self.is_known_param(key) {
                tracing::debug!(tool = %self.tool_name(), arg = %key, "ignoring unknown argument");
            }
        }

        if issues.is_empty() {
            Ok(accepted)
        } else {
            Err(GatewayError::Schema {
                subject: self.tool_name(),
                issues,
            })
        }
    }

    fn is_known_param(&self, key: &str) -> bool {
        self.endpoint.params.iter().any(|p| p.name == key)
            || (key == "body" && self.endpoint.body_schema.is_some())
    }

    /// Validate and render the HTTP request. Performs no I/O.
    pub fn prepare(&self, arguments: &serde_json::Value) -> Result<PreparedRequest, GatewayError> {
        let args = self.validate(arguments)?;
        let path_values: HashMap<&str, String> = self
            .endpoint
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
            .filter_map(|p| args.get(p.name.as_str()).map(|v| (p.name.as_str(), scalar_to_string(v))))
            .collect();
        let mut url = self.base_url.clone();

        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                GatewayError::schema(self.tool_name(), "base url cannot carry a path")
            })?;
            segments.pop_if_empty();
            for segment in self.endpoint.path_template.split('/').filter(|s| !s.is_empty()) {
                segments.push(&render_segment(segment, &path_values));
            }
        }

        let query: Vec<(&str, String)> = self
            .endpoint
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Query)
            .filter_map(|p| args.get(p.name.as_str()).map(|v| (p.name.as_str(), *v)))
            .flat_map(|(name, value)| match value {
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|item| (name, scalar_to_string(item)))
                    .collect::<Vec<_>>(),
                other => vec![(name, scalar_to_string(other))],
            })
            .collect();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &query {
                pairs.append_pair(name, value);
            }
        }

        let mut headers = self.endpoint.auth.headers();
        let mut issues = Vec::new();
        for param in &self.endpoint.params {
            if param.location == ParamLocation::Header {
                if let Some(value) = args.get(param.name.as_str()) {
                    let value = scalar_to_string(value);
                    if HeaderValue::from_str(&value).is_err() {
                        issues.push(format!(
                            "header parameter '{}' is not a valid header value",
                            param.name
                        ));
                        continue;
                    }
                    headers.push((param.name.clone(), value));
                }
            }
        }
        if !issues.is_empty() {
            return Err(GatewayError::Schema {
                subject: self.tool_name(),
                issues,
            });
        }

        let mut body = match self.endpoint.body_schema {
            Some(_) => args.get("body").map(|v| (*v).clone()),
            None => None,
        };
        let body_params: Vec<&ParamSpec> = self
            .endpoint
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Body)
            .collect();
        if !body_params.is_empty() {
            let mut object = match body.take() {
                Some(serde_json::Value::Object(map)) => map,
                Some(_) => {
                    return Err(GatewayError::schema(
                        self.tool_name(),
                        "'body' must be an object when body parameters are declared",
                    ))
                }
                None => serde_json::Map::new(),
            };
            for param in body_params {
                if let Some(value) = args.get(param.name.as_str()) {
                    object.insert(param.name.clone(), (*value).clone());
                }
            }
            body = Some(serde_json::Value::Object(object));
        }

        Ok(PreparedRequest {
            method: self.endpoint.method.clone(),
            url,
            headers,
            body,
        })
    }

    /// Validate, issue the call, and normalize the response.
    ///
    /// Returns `{status, headers, body}` on success; HTTP status >= 400 becomes
    /// a `Remote` error carrying the status as its code.
    pub async fn invoke(
        &self,
        client: &reqwest::Client,
        arguments: &serde_json::Value,
        deadline: Instant,
    ) -> Result<serde_json::Value, GatewayError> {
        let prepared = self.prepare(arguments)?;
        let target = self.tool_name();
        let started = Instant::now();

        let mut builder = client.request(prepared.method.clone(), prepared.url.clone());
        for (name, value) in &prepared.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &prepared.body {
            builder = builder.json(body);
        }

        tracing::debug!(tool = %target, method = %prepared.method, url = %prepared.url, "calling wrapped endpoint");

        let call = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = self.selected_headers(response.headers());
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, text))
        };

        let (status, headers, text) = tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| GatewayError::Timeout {
                target: target.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|e| map_reqwest_error(&target, e, started))?;

        let body = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or(serde_json::Value::String(text));

        if status.as_u16() >= 400 {
            return Err(GatewayError::Remote {
                code: i64::from(status.as_u16()),
                message: format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("error")
                ),
                data: Some(body),
            });
        }

        Ok(serde_json::json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }

    fn selected_headers(&self, headers: &reqwest::header::HeaderMap) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        let wanted = std::iter::once("content-type")
            .chain(self.endpoint.response_headers.iter().map(String::as_str));
        for name in wanted {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                out.insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
        serde_json::Value::Object(out)
    }
}

/// Map a `reqwest` failure onto the taxonomy.
pub(crate) fn map_reqwest_error(target: &str, e: reqwest::Error, started: Instant) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout {
            target: target.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else if e.is_decode() || e.is_body() {
        GatewayError::Protocol {
            target: target.to_string(),
            reason: e.to_string(),
        }
    } else {
        GatewayError::Connection {
            target: target.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Substitute `{name}` placeholders inside one path segment in a single
/// left-to-right pass. Substituted text is never rescanned. Encoding happens
/// when the segment is pushed onto the URL.
fn render_segment(segment: &str, path_values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match path_values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "number",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    fn endpoint(name: &str, method: &str, path: &str, params: Vec<ParamSpec>) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            description: None,
            params,
            body_schema: None,
            read_only: None,
            auth: None,
            response_headers: vec![],
        }
    }

    fn wrapper(base_url: &str, endpoints: Vec<EndpointConfig>) -> ApiWrapperConfig {
        ApiWrapperConfig {
            name: "users".to_string(),
            base_url: base_url.to_string(),
            auth: HashMap::new(),
            default_auth: None,
            endpoints,
            enabled: true,
        }
    }

    fn get_user() -> EndpointConfig {
        endpoint(
            "get_user",
            "GET",
            "/users/{id}",
            vec![
                ParamSpec::new("id", ParamType::String, ParamLocation::Path),
                ParamSpec::new("verbose", ParamType::Boolean, ParamLocation::Query),
            ],
        )
    }

    fn single_adapter(config: &ApiWrapperConfig) -> (CapabilityDescriptor, EndpointAdapter) {
        translate_wrapper(config).unwrap().into_iter().next().unwrap()
    }

    /// Start a test server and return its base URL.
    async fn start_test_server(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_schema_marks_path_param_required() {
        let (descriptor, _) = single_adapter(&wrapper("http://api.local", vec![get_user()]));
        assert_eq!(descriptor.raw_name, "api:users:get_user");
        assert_eq!(descriptor.owner_id, "api:users");
        assert_eq!(descriptor.origin, Origin::WrappedApi);
        assert!(descriptor.read_only, "GET defaults to read-only");

        let required = descriptor.schema["required"].as_array().unwrap();
        assert_eq!(required, &vec![serde_json::json!("id")]);
        assert_eq!(descriptor.schema["properties"]["verbose"]["type"], "boolean");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let config = wrapper("http://api.local", vec![get_user()]);
        let (a, _) = single_adapter(&config);
        let (b, _) = single_adapter(&config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unresolved_placeholder_is_construction_error() {
        let config = wrapper(
            "http://api.local",
            vec![endpoint("get_post", "GET", "/users/{id}/posts/{post_id}", vec![
                ParamSpec::new("id", ParamType::String, ParamLocation::Path),
            ])],
        );
        let err = translate_wrapper(&config).unwrap_err();
        match err {
            GatewayError::Schema { issues, .. } => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].contains("{post_id}"));
            }
            other => panic!("expected Schema, got {other:?}"),
        }
    }

    #[test]
    fn test_every_invalid_endpoint_reported() {
        let mut bad_auth = get_user();
        bad_auth.name = "with_auth".into();
        bad_auth.auth = Some("missing".into());

        let config = wrapper(
            "http://api.local",
            vec![
                endpoint("a", "FETCH", "/a", vec![]),
                endpoint("b", "GET", "/b", vec![
                    ParamSpec::new("payload", ParamType::Object, ParamLocation::Body),
                ]),
                endpoint("c", "GET", "/c", vec![
                    ParamSpec::new("id", ParamType::String, ParamLocation::Path).required(false),
                ]),
                bad_auth,
            ],
        );
        let GatewayError::Schema { issues, subject } = translate_wrapper(&config).unwrap_err()
        else {
            panic!("expected Schema error");
        };
        assert_eq!(subject, "api:users");
        assert!(issues.iter().any(|i| i.starts_with("endpoint 'a'") && i.contains("FETCH")));
        assert!(issues.iter().any(|i| i.starts_with("endpoint 'b'") && i.contains("body")));
        assert!(issues.iter().any(|i| i.starts_with("endpoint 'c'") && i.contains("placeholder")));
        assert!(issues.iter().any(|i| i.starts_with("endpoint 'c'") && i.contains("must be required")));
        assert!(issues.iter().any(|i| i.starts_with("endpoint 'with_auth'") && i.contains("missing")));
    }

    #[test]
    fn test_prepare_encodes_path_and_query() {
        let (_, adapter) = single_adapter(&wrapper("http://api.local/v1/", vec![get_user()]));
        let prepared = adapter
            .prepare(&serde_json::json!({"id": "a b/c", "verbose": true}))
            .unwrap();
        assert_eq!(prepared.method, Method::GET);
        assert_eq!(
            prepared.url.as_str(),
            "http://api.local/v1/users/a%20b%2Fc?verbose=true"
        );
        assert!(prepared.body.is_none());
    }

    #[test]
    fn test_prepare_missing_and_mistyped_args() {
        let (_, adapter) = single_adapter(&wrapper("http://api.local", vec![get_user()]));
        let err = adapter
            .prepare(&serde_json::json!({"verbose": "yes"}))
            .unwrap_err();
        let GatewayError::Schema { issues, .. } = err else {
            panic!("expected Schema error");
        };
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.contains("missing required parameter 'id'")));
        assert!(issues.iter().any(|i| i.contains("expects boolean, got string")));
    }

    #[test]
    fn test_prepare_body_header_and_auth() {
        let mut create = endpoint(
            "create_user",
            "POST",
            "/users",
            vec![
                ParamSpec::new("name", ParamType::String, ParamLocation::Body).required(true),
                ParamSpec::new("age", ParamType::Integer, ParamLocation::Body),
                ParamSpec::new("X-Trace", ParamType::String, ParamLocation::Header),
            ],
        );
        create.auth = Some("basic".into());

        let mut config = wrapper("http://api.local", vec![create]);
        config.auth.insert(
            "basic".into(),
            AuthStrategy::Basic {
                username: "user".into(),
                password: "pass".into(),
            },
        );

        let (descriptor, adapter) = single_adapter(&config);
        assert!(!descriptor.read_only, "POST defaults to side-effecting");

        let prepared = adapter
            .prepare(&serde_json::json!({"name": "Ada", "age": 36, "X-Trace": "t1"}))
            .unwrap();
        assert_eq!(prepared.body.unwrap(), serde_json::json!({"name": "Ada", "age": 36}));
        assert!(prepared
            .headers
            .contains(&("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string())));
        assert!(prepared
            .headers
            .contains(&("X-Trace".to_string(), "t1".to_string())));
    }

    #[test]
    fn test_body_schema_whole_body_argument() {
        let mut create = endpoint("create_post", "POST", "/posts", vec![]);
        create.body_schema = Some(serde_json::json!({
            "type": "object",
            "properties": {"title": {"type": "string"}}
        }));
        let (descriptor, adapter) = single_adapter(&wrapper("http://api.local", vec![create]));
        assert_eq!(descriptor.schema["required"], serde_json::json!(["body"]));

        let prepared = adapter
            .prepare(&serde_json::json!({"body": {"title": "hi"}}))
            .unwrap();
        assert_eq!(prepared.body.unwrap()["title"], "hi");
    }

    #[test]
    fn test_api_key_alias_deserializes() {
        let yaml = "type: api_key\nkey_name: X-Token\napi_key: abc";
        let auth: AuthStrategy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            auth.headers(),
            vec![("X-Token".to_string(), "abc".to_string())]
        );
        assert_eq!(format!("{auth:?}"), "ApiKeyHeader(X-Token: ***)");
    }

    #[test]
    fn test_path_substitution_is_single_pass() {
        let mut config = wrapper("http://api.local", vec![get_user()]);
        config.endpoints[0]
            .params
            .push(ParamSpec::new("X-Secret", ParamType::String, ParamLocation::Header));
        let (_, adapter) = single_adapter(&config);

        let args = serde_json::json!({"id": "{X-Secret}", "X-Secret": "tok123"});
        for _ in 0..50 {
            let prepared = adapter.prepare(&args).unwrap();
            assert_eq!(prepared.url.as_str(), "http://api.local/users/%7BX-Secret%7D");
        }
    }

    #[test]
    fn test_body_argument_only_sent_when_declared() {
        let search = endpoint(
            "search",
            "GET",
            "/search",
            vec![ParamSpec::new("body", ParamType::String, ParamLocation::Query)],
        );
        let (_, adapter) = single_adapter(&wrapper("http://api.local", vec![search]));

        let prepared = adapter.prepare(&serde_json::json!({"body": "hello"})).unwrap();
        assert_eq!(prepared.url.as_str(), "http://api.local/search?body=hello");
        assert!(prepared.body.is_none());
    }

    #[test]
    fn test_invalid_header_value_is_schema_error() {
        let traced = endpoint(
            "get",
            "GET",
            "/items",
            vec![ParamSpec::new("X-Trace", ParamType::String, ParamLocation::Header)],
        );
        let (_, adapter) = single_adapter(&wrapper("http://api.local", vec![traced]));

        let err = adapter
            .prepare(&serde_json::json!({"X-Trace": "a\nb"}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::federation::errors::ErrorKind::Schema);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_null_arguments_accepted_without_required_params() {
        let list = endpoint("list", "GET", "/items", vec![]);
        let (_, adapter) = single_adapter(&wrapper("http://api.local", vec![list]));

        assert!(adapter.validate(&serde_json::Value::Null).unwrap().is_empty());
        let prepared = adapter.prepare(&serde_json::Value::Null).unwrap();
        assert_eq!(prepared.url.as_str(), "http://api.local/items");
    }

    #[test]
    fn test_parse_placeholders() {
        assert_eq!(
            parse_placeholders("/a/{x}/b/{y}.json").unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(parse_placeholders("/a/{x").is_err());
        assert!(parse_placeholders("/a/x}").is_err());
    }

    #[tokio::test]
    async fn test_invoke_without_required_arg_makes_no_call() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/users/:id",
            get(move |Path(id): Path<String>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"id": id}))
                }
            }),
        );
        let base = start_test_server(app).await;
        let (_, adapter) = single_adapter(&wrapper(&base, vec![get_user()]));
        let client = reqwest::Client::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = adapter
            .invoke(&client, &serde_json::json!({}), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Schema { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let payload = adapter
            .invoke(&client, &serde_json::json!({"id": "42"}), deadline)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["body"]["id"], "42");
        assert_eq!(payload["headers"]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_invoke_maps_error_status_and_auth() {
        let app = Router::new().route(
            "/orders",
            post(|headers: HeaderMap| async move {
                if headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some("k1") {
                    (StatusCode::CONFLICT, Json(serde_json::json!({"error": "exists"})))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "no key"})))
                }
            }),
        );
        let base = start_test_server(app).await;

        let mut create = endpoint("create_order", "POST", "/orders", vec![]);
        create.auth = Some("key".into());
        let mut config = wrapper(&base, vec![create]);
        config.auth.insert(
            "key".into(),
            AuthStrategy::ApiKeyHeader {
                header: "X-API-Key".into(),
                key: "k1".into(),
            },
        );
        let (_, adapter) = single_adapter(&config);

        let err = adapter
            .invoke(
                &reqwest::Client::new(),
                &serde_json::json!({}),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::Remote { code, data, .. } => {
                assert_eq!(code, 409);
                assert_eq!(data.unwrap()["error"], "exists");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_unreachable_is_connection_error() {
        let (_, adapter) = single_adapter(&wrapper("http://127.0.0.1:1", vec![get_user()]));
        let err = adapter
            .invoke(
                &reqwest::Client::new(),
                &serde_json::json!({"id": "1"}),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }
}
