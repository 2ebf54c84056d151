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
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::queue::QUEUE_NAMES;

pub const DEFAULT_CONFIG_FILE: &str = "podscan.toml";

/// Every tunable of the service. Loaded from defaults, then an optional
/// `podscan.toml`, then `PODSCAN_*` environment variables, each layer
/// overriding the previous one. A subset of the transcription settings can
/// additionally be overridden at runtime through the app_settings store (see
/// `transcribe::runtime_config`), which wins over all of these.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    pub database_path: PathBuf,
    pub audio_dir: PathBuf,
    pub api_addr: String,
    /// Named queues this process consumes. Defaults to all of them.
    pub worker_queues: Vec<String>,
    pub workers_per_queue: usize,
    pub poll_interval_secs: u64,
    /// Upper bound on episodes queued for processing per poll. 0 = unbounded.
    pub max_episodes_per_feed: u32,
    pub audio_download_max_bytes: u64,
    pub audio_download_timeout_seconds: u64,
    pub whisper_api_url: String,
    pub transcription_provider: String,
    pub transcription_model: String,
    pub cloud_transcription_base_url: String,
    pub cloud_transcription_api_key: String,
    pub transcription_timeout_seconds: u64,
    pub transcription_tasks_per_minute: u32,
    pub transcription_429_retry_base_seconds: u64,
    pub transcription_429_retry_max_seconds: u64,
    pub transcription_external_max_upload_bytes: u64,
    pub transcription_external_chunk_seconds: u32,
    pub transcription_external_chunk_bitrate_kbps: u32,
    pub llm_provider: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub openrouter_base_url: String,
    pub openrouter_api_key: String,
    pub openrouter_model: String,
    pub openrouter_site_url: String,
    pub openrouter_app_name: String,
    pub llm_enrich_timeout_seconds: u64,
    pub llm_enrich_min_interval_seconds: f64,
    pub llm_enrich_max_retries: u32,
    pub llm_enrich_retry_base_seconds: f64,
    pub llm_enrich_retry_max_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("podscan.db"),
            audio_dir: PathBuf::from("data/audio"),
            api_addr: "127.0.0.1:8080".to_string(),
            worker_queues: QUEUE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            workers_per_queue: 2,
            poll_interval_secs: 900,
            max_episodes_per_feed: 10,
            audio_download_max_bytes: 500 * 1024 * 1024,
            audio_download_timeout_seconds: 600,
            whisper_api_url: "http://127.0.0.1:8000".to_string(),
            transcription_provider: "local".to_string(),
            transcription_model: "Systran/faster-whisper-small".to_string(),
            cloud_transcription_base_url: "https://api.openai.com/v1".to_string(),
            cloud_transcription_api_key: String::new(),
            transcription_timeout_seconds: 900,
            transcription_tasks_per_minute: 6,
            transcription_429_retry_base_seconds: 30,
            transcription_429_retry_max_seconds: 600,
            transcription_external_max_upload_bytes: 25 * 1024 * 1024,
            transcription_external_chunk_seconds: 600,
            transcription_external_chunk_bitrate_kbps: 32,
            llm_provider: "ollama".to_string(),
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            ollama_model: "llama3.2:3b".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            openrouter_api_key: String::new(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            openrouter_site_url: String::new(),
            openrouter_app_name: "podscan".to_string(),
            llm_enrich_timeout_seconds: 120,
            llm_enrich_min_interval_seconds: 1.0,
            llm_enrich_max_retries: 3,
            llm_enrich_retry_base_seconds: 2.0,
            llm_enrich_retry_max_seconds: 60.0,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match config_path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        };
        figment
            .merge(Env::prefixed("PODSCAN_"))
            .extract()
            .context("failed to load configuration")
    }
}
