//! Layer C: advisory oracle verification for ambiguous candidates.
//!
//! The oracle is an OpenAI-compatible chat endpoint that returns a strict
//! JSON verdict. It is consulted only for candidates Layer B left Unknown,
//! and its answer never authorizes an injection by itself — every Layer C
//! result stays review-gated.
//!
//! Resilience contract:
//! - **Cache**: persistent, keyed by (candidate_id, model, prompt_hash);
//!   hits bypass the network entirely, which is what makes interrupted runs
//!   resumable with no lost work. Writes are temp-file + rename atomic.
//! - **Throttle**: a token bucket with a configured refill rate; requests
//!   wait until a token is available.
//! - **Backoff**: exponential (base 2, capped at 32s) with bounded jitter.
//!   HTTP 429/5xx, network errors, timeouts, and malformed replies are
//!   retried; other 4xx responses fail immediately.
//! - On retry exhaustion the candidate is tagged `oracle_error` and its
//!   suggestion stays Unknown.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::artifacts;
use crate::config::OracleConfig;
use crate::error::PipelineError;
use crate::models::{Candidate, OracleVerdict};

/// The fixed prompt template. Hashed into the cache key, so any change to it
/// invalidates cached verdicts.
const PROMPT_TEMPLATE: &str = "You classify one line from an Arabic book as a heading or not. \
Reply with strict JSON only, exactly these keys: \
is_heading (bool), level (2 or 3), normalized_title (string), \
confidence (number in [0,1]), reason (one of: title, metadata, footnote, pagehead, body_line). \
No prose, no markdown fences, no null values.";

const BACKOFF_CAP_SECS: u64 = 32;
const JITTER_MAX_MS: u64 = 250;

/// A verdict plus where it came from.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub verdict: OracleVerdict,
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Persistent verdict cache. Single-writer (the run process); external
/// inspectors may read the JSON file at any time and never see a partial
/// write.
pub struct OracleCache {
    path: PathBuf,
    entries: BTreeMap<String, OracleVerdict>,
}

impl OracleCache {
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            artifacts::read_json(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn key(candidate_id: &str, model: &str, prompt_hash: &str) -> String {
        format!("{candidate_id}|{model}|{prompt_hash}")
    }

    pub fn get(&self, key: &str) -> Option<&OracleVerdict> {
        self.entries.get(key)
    }

    /// Insert and persist. Cached records never contain null fields: the
    /// verdict type has none.
    pub fn put(&mut self, key: String, verdict: OracleVerdict) -> Result<()> {
        self.entries.insert(key, verdict);
        artifacts::write_json(&self.path, &self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Simple token bucket: `rate` tokens per second, up to `burst` capacity.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            refill_per_sec: rate_per_sec,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    /// Block until a token is available, then take it.
    pub async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait = deficit / self.refill_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

pub struct OracleVerifier {
    http: Option<reqwest::Client>,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    max_retries: u32,
    cache: OracleCache,
    bucket: TokenBucket,
}

impl OracleVerifier {
    /// Build a verifier. With `dry_run` the network side is disabled
    /// entirely; only cache hits are served.
    pub fn new(cfg: &OracleConfig, cache_path: PathBuf, dry_run: bool) -> Result<Self> {
        let model = cfg.resolved_model();
        let (http, api_key) = if dry_run {
            (None, None)
        } else {
            let key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.timeout_secs))
                .build()?;
            (Some(client), Some(key))
        };
        Ok(Self {
            http,
            api_key,
            endpoint: cfg.endpoint.clone(),
            model,
            max_retries: cfg.max_retries,
            cache: OracleCache::open(cache_path)?,
            bucket: TokenBucket::new(cfg.rate_per_sec.max(0.001), cfg.burst.max(1)),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn cache(&self) -> &OracleCache {
        &self.cache
    }

    /// Verify one candidate. Returns `Ok(None)` when the oracle is disabled
    /// and the cache has no answer; `Err` means the retry budget is spent
    /// (the caller tags the candidate `oracle_error`).
    pub async fn verify(&mut self, candidate: &Candidate) -> Result<Option<VerifyOutcome>> {
        let payload = candidate_payload(candidate);
        let prompt_hash = prompt_hash(&payload);
        let key = OracleCache::key(&candidate.candidate_id, &self.model, &prompt_hash);

        if let Some(verdict) = self.cache.get(&key) {
            return Ok(Some(VerifyOutcome {
                verdict: verdict.clone(),
                from_cache: true,
            }));
        }

        let (Some(http), Some(api_key)) = (self.http.clone(), self.api_key.clone()) else {
            return Ok(None);
        };

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            self.bucket.acquire().await;

            match self.request_once(&http, &api_key, &payload).await {
                Ok(verdict) => {
                    self.cache.put(key.clone(), verdict.clone())?;
                    return Ok(Some(VerifyOutcome {
                        verdict,
                        from_cache: false,
                    }));
                }
                Err(RequestFailure::Fatal(err)) => return Err(err),
                Err(RequestFailure::Retriable(err)) => {
                    tracing::warn!(
                        candidate_id = %candidate.candidate_id,
                        attempt,
                        error = %err,
                        "oracle request failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(PipelineError::OracleTransient(format!(
            "retries exhausted for candidate {}: {}",
            candidate.candidate_id,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
        .into())
    }

    async fn request_once(
        &self,
        http: &reqwest::Client,
        api_key: &str,
        payload: &str,
    ) -> std::result::Result<OracleVerdict, RequestFailure> {
        let url = format!("{}/v1/chat/completions", self.endpoint.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: PROMPT_TEMPLATE,
                },
                ChatMessage {
                    role: "user",
                    content: payload,
                },
            ],
            temperature: 0.0,
        };

        let response = http
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                RequestFailure::Retriable(PipelineError::OracleTransient(e.to_string()).into())
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestFailure::Retriable(
                PipelineError::OracleTransient(format!("HTTP {status}: {body}")).into(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestFailure::Fatal(
                PipelineError::OracleTransient(format!("HTTP {status}: {body}")).into(),
            ));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            RequestFailure::Retriable(PipelineError::OracleProtocol(e.to_string()).into())
        })?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        validate_verdict(content).map_err(|e| RequestFailure::Retriable(e.into()))
    }
}

enum RequestFailure {
    Retriable(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Exponential backoff with bounded jitter: 1s, 2s, 4s, … capped at 32s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 1u64 << (attempt - 1).min(5);
    let jitter = rand::thread_rng().gen_range(0..JITTER_MAX_MS);
    Duration::from_secs(base.min(BACKOFF_CAP_SECS)) + Duration::from_millis(jitter)
}

/// The candidate fields shipped to the oracle.
pub fn candidate_payload(candidate: &Candidate) -> String {
    serde_json::json!({
        "text": candidate.text,
        "kind": candidate.kind,
        "html_excerpt": candidate.html_excerpt,
        "context_before": candidate.context_before,
        "context_after": candidate.context_after,
        "page_index": candidate.page_index,
    })
    .to_string()
}

/// sha256(prompt_template ‖ candidate_payload), hex-truncated.
pub fn prompt_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PROMPT_TEMPLATE.as_bytes());
    hasher.update(payload.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

/// Parse and strictly validate an oracle reply. Any missing or null field,
/// wrong type, out-of-range confidence, or unknown level is a protocol error.
pub fn validate_verdict(content: &str) -> std::result::Result<OracleVerdict, PipelineError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let verdict: OracleVerdict = serde_json::from_str(trimmed)
        .map_err(|e| PipelineError::OracleProtocol(format!("malformed verdict: {e}")))?;
    if verdict.level != 2 && verdict.level != 3 {
        return Err(PipelineError::OracleProtocol(format!(
            "level must be 2 or 3, got {}",
            verdict.level
        )));
    }
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(PipelineError::OracleProtocol(format!(
            "confidence must be in [0,1], got {}",
            verdict.confidence
        )));
    }
    if verdict.normalized_title.trim().is_empty() && verdict.is_heading {
        return Err(PipelineError::OracleProtocol(
            "normalized_title empty for a heading verdict".into(),
        ));
    }
    Ok(verdict)
}
