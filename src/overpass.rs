use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FailureKind, VaultError};

pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://overpass-api.de/api/interpreter",
    "https://overpass.kumi.systems/api/interpreter",
    "https://overpass.private.coffee/api/interpreter",
];

static TOO_LARGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)out of memory|string length|too large|payload").expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub endpoint: String,
    pub payload: Value,
    pub raw_text: String,
}

impl FetchResponse {
    pub fn elements(&self) -> &[Value] {
        elements(&self.payload)
    }
}

pub fn elements(payload: &Value) -> &[Value] {
    payload
        .get("elements")
        .and_then(|value| value.as_array())
        .map(|array| array.as_slice())
        .unwrap_or(&[])
}

pub trait OverpassClient {
    fn fetch(&self, query: &str) -> Result<FetchResponse, VaultError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if TOO_LARGE.is_match(&message) {
            FailureKind::TooLarge
        } else {
            kind
        };
        Self { kind, message }
    }
}

pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        200..=299 => None,
        413 => Some(FailureKind::TooLarge),
        429 | 502 | 503 | 504 => Some(FailureKind::Transient),
        _ => Some(FailureKind::Rejected),
    }
}

fn classify_remark(remark: &str) -> Option<FailureKind> {
    let lower = remark.to_ascii_lowercase();
    if lower.contains("out of memory") {
        Some(FailureKind::TooLarge)
    } else if lower.contains("timed out") || lower.contains("dispatcher") {
        Some(FailureKind::Transient)
    } else if lower.contains("runtime error") {
        Some(FailureKind::Malformed)
    } else {
        None
    }
}

fn looks_like_json(content_type: Option<&str>, body: &str) -> bool {
    if let Some(content_type) = content_type {
        if !content_type.to_ascii_lowercase().contains("json") {
            return false;
        }
    }
    matches!(body.trim_start().chars().next(), Some('{') | Some('['))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

pub fn interpret_reply(reply: &HttpReply) -> Result<Value, AttemptError> {
    if let Some(kind) = classify_status(reply.status) {
        return Err(AttemptError::new(
            kind,
            format!("status {}: {}", reply.status, snippet(&reply.body)),
        ));
    }
    if !looks_like_json(reply.content_type.as_deref(), &reply.body) {
        return Err(AttemptError::new(
            FailureKind::Malformed,
            format!(
                "expected JSON, got {}: {}",
                reply.content_type.as_deref().unwrap_or("no content-type"),
                snippet(&reply.body)
            ),
        ));
    }
    let payload: Value = serde_json::from_str(&reply.body)
        .map_err(|err| AttemptError::new(FailureKind::Malformed, err.to_string()))?;
    if let Some(remark) = payload.get("remark").and_then(|value| value.as_str()) {
        if let Some(kind) = classify_remark(remark) {
            return Err(AttemptError::new(kind, format!("remark: {remark}")));
        }
    }
    Ok(payload)
}

/// Tries every endpoint in order, each up to `policy.max_attempts` times with
/// exponential backoff between attempts. Only the last failure is surfaced.
pub fn fetch_with_rotation<S, D>(
    endpoints: &[String],
    policy: &RetryPolicy,
    mut send: S,
    mut sleep: D,
) -> Result<FetchResponse, VaultError>
where
    S: FnMut(&str) -> Result<HttpReply, AttemptError>,
    D: FnMut(Duration),
{
    let mut last: Option<(String, AttemptError)> = None;
    for endpoint in endpoints {
        for attempt in 1..=policy.max_attempts {
            debug!(endpoint = %endpoint, attempt, "overpass.request");
            let outcome = send(endpoint).and_then(|reply| {
                let payload = interpret_reply(&reply)?;
                Ok((payload, reply.body))
            });
            match outcome {
                Ok((payload, raw_text)) => {
                    return Ok(FetchResponse {
                        endpoint: endpoint.clone(),
                        payload,
                        raw_text,
                    });
                }
                Err(err) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        kind = %err.kind,
                        "overpass attempt failed: {}",
                        err.message
                    );
                    last = Some((endpoint.clone(), err));
                    if attempt < policy.max_attempts {
                        let delay = policy.delay_for(attempt);
                        debug!(delay_ms = delay.as_millis() as u64, "overpass.backoff");
                        sleep(delay);
                    }
                }
            }
        }
    }

    let (endpoint, err) = last.unwrap_or_else(|| {
        (
            String::new(),
            AttemptError::new(FailureKind::Rejected, "no overpass endpoints configured"),
        )
    });
    Err(VaultError::FetchFailed {
        endpoint,
        kind: err.kind,
        message: err.message,
    })
}

pub struct Throttle<'a> {
    delay: Duration,
    requests: usize,
    sleep: Box<dyn FnMut(Duration) + 'a>,
}

impl<'a> Throttle<'a> {
    pub fn with_sleep(delay: Duration, sleep: impl FnMut(Duration) + 'a) -> Self {
        Self {
            delay,
            requests: 0,
            sleep: Box::new(sleep),
        }
    }

    pub fn pause(&mut self) {
        if self.requests > 0 && !self.delay.is_zero() {
            debug!(delay_ms = self.delay.as_millis() as u64, "throttle");
            (self.sleep)(self.delay);
        }
        self.requests += 1;
    }

    pub fn requests(&self) -> usize {
        self.requests
    }
}

#[derive(Clone)]
pub struct OverpassHttpClient {
    client: Client,
    endpoints: Vec<String>,
    policy: RetryPolicy,
}

impl OverpassHttpClient {
    pub fn new(
        endpoints: Vec<String>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, VaultError> {
        if endpoints.len() < 2 {
            return Err(VaultError::TooFewEndpoints(endpoints.len()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("boundary-vault/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| VaultError::ClientSetup(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| VaultError::ClientSetup(err.to_string()))?;
        Ok(Self {
            client,
            endpoints,
            policy,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn send(&self, endpoint: &str, query: &str) -> Result<HttpReply, AttemptError> {
        let response = self
            .client
            .post(endpoint)
            .form(&[("data", query)])
            .send()
            .map_err(|err| AttemptError::new(FailureKind::Transient, describe(&err)))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let body = response
            .text()
            .map_err(|err| AttemptError::new(FailureKind::Transient, describe(&err)))?;
        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }
}

impl OverpassClient for OverpassHttpClient {
    fn fetch(&self, query: &str) -> Result<FetchResponse, VaultError> {
        fetch_with_rotation(
            &self.endpoints,
            &self.policy,
            |endpoint| self.send(endpoint, query),
            thread::sleep,
        )
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
