/**
 * MIT License
 *
 * podscan - Copyright (c) 2025 podscan developers
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use lazy_static::lazy_static;
use log::{error, warn};
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Settings;
use crate::error::clip_error_message;
use crate::retry::{backoff_delay, is_retryable_status, parse_retry_after_seconds};

const ENRICHMENT_PROMPT: &str = r#"Analyze this podcast transcript segment where the keyword "{keyword}" was mentioned.

Transcript segment:
---
{segment}
---

Respond with ONLY valid JSON (no markdown, no explanation):
{
  "sentiment": "positive" | "negative" | "neutral" | "mixed",
  "sentiment_score": 0.0 to 1.0 (0=very negative, 1=very positive),
  "context_summary": "1-2 sentence summary of how the keyword is discussed",
  "topics": ["topic1", "topic2"],
  "is_buying_signal": true/false (speaker expresses intent to purchase/adopt),
  "is_pain_point": true/false (speaker describes a problem or frustration),
  "is_recommendation": true/false (speaker recommends or endorses)
}"#;

lazy_static! {
    // Process-wide deadline enforcing a minimum interval between LLM calls.
    // Callers sleep while holding the lock, deterministically serializing.
    static ref NEXT_ALLOWED: Mutex<Option<Instant>> = Mutex::new(None);
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("openrouter api key is not configured")]
    MissingApiKey,
    #[error("llm model '{0}' not found on the ollama server; pull it first (e.g. `ollama pull {0}`)")]
    ModelNotFound(String),
    #[error("llm request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("llm request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("llm response was not the expected shape: {0}")]
    InvalidResponse(String),
}

/// The structured record the LLM produces for one mention. This is also what
/// gets persisted as the raw response payload after validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub sentiment: String,
    pub sentiment_score: f64,
    pub context_summary: String,
    pub topics: Vec<String>,
    pub is_buying_signal: bool,
    pub is_pain_point: bool,
    pub is_recommendation: bool,
}

impl Enrichment {
    /// Sentinel record used when enrichment cannot be obtained and the caller
    /// did not ask for strict behavior.
    pub fn unavailable() -> Self {
        Self {
            sentiment: "neutral".to_string(),
            sentiment_score: 0.5,
            context_summary: "Enrichment unavailable".to_string(),
            topics: Vec::new(),
            is_buying_signal: false,
            is_pain_point: false,
            is_recommendation: false,
        }
    }
}

/// Calls the configured LLM provider to analyze one transcript segment.
/// With `strict` the error propagates so a retry payload can resume at the
/// failed match; otherwise the sentinel record comes back.
pub fn enrich_mention(
    settings: &Settings,
    keyword: &str,
    segment: &str,
    strict: bool,
) -> Result<Enrichment, EnrichError> {
    let prompt = build_prompt(keyword, segment);

    let outcome = call_llm(settings, &prompt).and_then(|content| {
        let parsed: Value = serde_json::from_str(&content)
            .map_err(|err| EnrichError::InvalidResponse(err.to_string()))?;
        Ok(validate_enrichment(&parsed))
    });

    match outcome {
        Ok(enrichment) => Ok(enrichment),
        Err(err) => {
            error!(
                "enrichment failed for provider '{}': {err}",
                settings.llm_provider
            );
            if strict {
                Err(err)
            } else {
                Ok(Enrichment::unavailable())
            }
        }
    }
}

pub fn build_prompt(keyword: &str, segment: &str) -> String {
    ENRICHMENT_PROMPT
        .replace("{keyword}", keyword)
        .replace("{segment}", segment)
}

fn call_llm(settings: &Settings, prompt: &str) -> Result<String, EnrichError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(settings.llm_enrich_timeout_seconds))
        .build()?;

    if settings.llm_provider == "openrouter" {
        if settings.openrouter_api_key.is_empty() {
            return Err(EnrichError::MissingApiKey);
        }

        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", settings.openrouter_api_key),
        )];
        if !settings.openrouter_site_url.is_empty() {
            headers.push(("HTTP-Referer".to_string(), settings.openrouter_site_url.clone()));
        }
        if !settings.openrouter_app_name.is_empty() {
            headers.push(("X-Title".to_string(), settings.openrouter_app_name.clone()));
        }

        let body = json!({
            "model": settings.openrouter_model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
        });
        let response = post_with_backoff(
            &client,
            settings,
            &openrouter_endpoint(&settings.openrouter_base_url),
            &headers,
            &body,
        )?;
        if !response.status().is_success() {
            return Err(http_error(response));
        }
        let result: Value = response
            .json()
            .map_err(|err| EnrichError::InvalidResponse(err.to_string()))?;
        return result
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EnrichError::InvalidResponse("missing choices content".to_string()));
    }

    let base = settings.ollama_base_url.trim_end_matches('/');
    let chat_body = json!({
        "model": settings.ollama_model,
        "messages": [{"role": "user", "content": prompt}],
        "stream": false,
        "format": "json",
    });
    let chat_response = post_with_backoff(&client, settings, &format!("{base}/api/chat"), &[], &chat_body)?;

    if chat_response.status().as_u16() == 404 {
        let body = chat_response.text().unwrap_or_default();
        check_ollama_model_error(&body, &settings.ollama_model)?;
        warn!("ollama /api/chat returned 404, trying /api/generate fallback");

        let generate_body = json!({
            "model": settings.ollama_model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
        });
        let generate_response = post_with_backoff(
            &client,
            settings,
            &format!("{base}/api/generate"),
            &[],
            &generate_body,
        )?;
        if generate_response.status().as_u16() == 404 {
            let body = generate_response.text().unwrap_or_default();
            check_ollama_model_error(&body, &settings.ollama_model)?;
            return Err(EnrichError::Http {
                status: 404,
                body: clip_error_message(&body),
            });
        }
        if !generate_response.status().is_success() {
            return Err(http_error(generate_response));
        }
        let result: Value = generate_response
            .json()
            .map_err(|err| EnrichError::InvalidResponse(err.to_string()))?;
        return result
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EnrichError::InvalidResponse("missing generate response".to_string()));
    }

    if !chat_response.status().is_success() {
        return Err(http_error(chat_response));
    }
    let result: Value = chat_response
        .json()
        .map_err(|err| EnrichError::InvalidResponse(err.to_string()))?;
    result
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EnrichError::InvalidResponse("missing chat message content".to_string()))
}

/// Both `…/api/v1` and `…/v1` base forms reach `…/chat/completions`.
pub fn openrouter_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/api/v1") || base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/api/v1/chat/completions")
    }
}

/// POSTs the JSON body, retrying {408, 425, 429, 500, 502, 503, 504} and
/// transport errors with exponential backoff. 429 Retry-After wins over the
/// computed delay, clamped to the configured max. Non-retryable responses
/// come back as-is for the caller to interpret.
fn post_with_backoff(
    client: &Client,
    settings: &Settings,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
) -> Result<Response, EnrichError> {
    let max_attempts = settings.llm_enrich_max_retries.saturating_add(1).max(1);
    let base = settings.llm_enrich_retry_base_seconds;
    let max_delay = settings.llm_enrich_retry_max_seconds.max(1.0);

    for attempt in 0..max_attempts {
        apply_rate_limit(settings.llm_enrich_min_interval_seconds);

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                if attempt + 1 == max_attempts {
                    return Err(err.into());
                }
                let delay = backoff_delay(base, attempt, max_delay);
                warn!(
                    "llm request failed ({url}); retrying in {:.2}s ({}/{max_attempts}): {err}",
                    delay.as_secs_f64(),
                    attempt + 1
                );
                thread::sleep(delay);
                continue;
            }
        };

        let status = response.status().as_u16();
        if is_retryable_status(status) {
            if attempt + 1 == max_attempts {
                return Err(http_error(response));
            }
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_seconds);
            let delay = match retry_after {
                Some(seconds) if status == 429 => {
                    Duration::from_secs_f64((seconds as f64).min(max_delay))
                }
                _ => backoff_delay(base, attempt, max_delay),
            };
            warn!(
                "llm request got retryable status {status} ({url}); retrying in {:.2}s ({}/{max_attempts})",
                delay.as_secs_f64(),
                attempt + 1
            );
            thread::sleep(delay);
            continue;
        }

        return Ok(response);
    }

    unreachable!("retry loop exhausted without returning")
}

/// After each issued call the next permitted time advances by the minimum
/// interval; concurrent callers queue up on the lock.
fn apply_rate_limit(min_interval_seconds: f64) {
    if min_interval_seconds <= 0.0 {
        return;
    }
    let mut deadline = NEXT_ALLOWED.lock().expect("rate limit lock poisoned");
    if let Some(next_allowed) = *deadline {
        let now = Instant::now();
        if next_allowed > now {
            thread::sleep(next_allowed - now);
        }
    }
    *deadline = Some(Instant::now() + Duration::from_secs_f64(min_interval_seconds));
}

fn http_error(response: Response) -> EnrichError {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    EnrichError::Http {
        status,
        body: clip_error_message(&body),
    }
}

fn check_ollama_model_error(body: &str, model: &str) -> Result<(), EnrichError> {
    let Ok(payload) = serde_json::from_str::<Value>(body) else {
        return Ok(());
    };
    let error_text = payload
        .get("error")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
        .to_lowercase();
    if error_text.contains("model") && error_text.contains("not found") {
        return Err(EnrichError::ModelNotFound(model.to_string()));
    }
    Ok(())
}

/// Field-by-field validation of the untrusted LLM payload: coerce types and
/// fill anything missing with the sentinel defaults.
pub fn validate_enrichment(data: &Value) -> Enrichment {
    Enrichment {
        sentiment: data
            .get("sentiment")
            .map(json_to_string)
            .unwrap_or_else(|| "neutral".to_string()),
        sentiment_score: data
            .get("sentiment_score")
            .and_then(json_to_f64)
            .unwrap_or(0.5),
        context_summary: data
            .get("context_summary")
            .map(json_to_string)
            .unwrap_or_default(),
        topics: data
            .get("topics")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(json_to_string).collect())
            .unwrap_or_default(),
        is_buying_signal: data.get("is_buying_signal").map(json_truthy).unwrap_or(false),
        is_pain_point: data.get("is_pain_point").map(json_truthy).unwrap_or(false),
        is_recommendation: data
            .get("is_recommendation")
            .map(json_truthy)
            .unwrap_or(false),
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
