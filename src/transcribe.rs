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
use log::{info, warn};
use reqwest::blocking::multipart::Form;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::Settings;
use crate::db::Database;
use crate::retry::parse_retry_after_seconds;

pub const PROVIDER_KEY: &str = "transcription.provider";
pub const EXTERNAL_URL_KEY: &str = "transcription.external_url";
pub const EXTERNAL_API_KEY_KEY: &str = "transcription.external_api_key";
pub const MODEL_KEY: &str = "transcription.model";

pub const SETTING_KEYS: [&str; 4] = [
    PROVIDER_KEY,
    EXTERNAL_URL_KEY,
    EXTERNAL_API_KEY_KEY,
    MODEL_KEY,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    Local,
    External,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }

    /// Anything that is not an external/cloud selection falls back to local.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "external" | "cloud" => Self::External,
            _ => Self::Local,
        }
    }
}

/// The live transcription routing, merged from the app_settings store over
/// the static configuration.
#[derive(Clone, Debug)]
pub struct TranscriptionConfig {
    pub provider: Provider,
    pub external_url: String,
    pub external_api_key: String,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error(
        "transcription upload rejected as too large: {} (configured max {} for external uploads)",
        format_mb(*.size),
        format_mb(*.max)
    )]
    UploadTooLarge { size: u64, max: u64 },
    #[error(
        "chunk {chunk} is too large for external transcription: {} (max {}); \
         reduce chunk seconds or bitrate",
        format_mb(*.size),
        format_mb(*.max)
    )]
    ChunkTooLarge { chunk: String, size: u64, max: u64 },
    #[error("ffmpeg is required for chunked external transcription but is not installed")]
    TranscoderMissing,
    #[error("failed to chunk audio for transcription: {0}")]
    Transcoder(String),
    /// Non-2xx transcription response. 429 keeps its Retry-After seconds so
    /// the pipeline's countdown classifier can honor it.
    #[error("transcription request failed with status {status}")]
    Http { status: u16, retry_after: Option<u64> },
    #[error("transcription request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads the live app settings and resolves the effective routing.
pub fn runtime_config(db: &Database, settings: &Settings) -> rusqlite::Result<TranscriptionConfig> {
    let stored = db.app_settings(&SETTING_KEYS)?;
    Ok(resolve_config(&stored, settings))
}

pub fn resolve_config(
    stored: &HashMap<String, Option<String>>,
    settings: &Settings,
) -> TranscriptionConfig {
    let provider = stored
        .get(PROVIDER_KEY)
        .and_then(|v| v.as_deref())
        .unwrap_or(&settings.transcription_provider);
    let provider = Provider::normalize(provider);

    let external_url = stored
        .get(EXTERNAL_URL_KEY)
        .and_then(|v| v.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_external_url(settings));

    // A stored key row wins even when blank (the user cleared it); only a
    // missing row falls back to the static configuration.
    let external_api_key = match stored.get(EXTERNAL_API_KEY_KEY) {
        Some(value) => value.clone().unwrap_or_default(),
        None => settings.cloud_transcription_api_key.clone(),
    };

    let model = stored
        .get(MODEL_KEY)
        .and_then(|v| v.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| settings.transcription_model.clone());

    TranscriptionConfig {
        provider,
        external_url,
        external_api_key,
        model,
    }
}

pub fn default_external_url(settings: &Settings) -> String {
    format!(
        "{}/audio/transcriptions",
        settings.cloud_transcription_base_url.trim_end_matches('/')
    )
}

/// Transcribes the audio file, chunking it through ffmpeg first when it
/// exceeds the external upload cap.
pub fn transcribe_audio(
    config: &TranscriptionConfig,
    settings: &Settings,
    audio_path: &Path,
) -> Result<String, TranscribeError> {
    let (url, api_key) = match config.provider {
        Provider::External => {
            let key = Some(config.external_api_key.as_str()).filter(|k| !k.is_empty());
            (config.external_url.clone(), key)
        }
        Provider::Local => (
            format!(
                "{}/v1/audio/transcriptions",
                settings.whisper_api_url.trim_end_matches('/')
            ),
            None,
        ),
    };

    let client = Client::builder()
        .timeout(Duration::from_secs(settings.transcription_timeout_seconds))
        .build()?;

    let file_size = fs::metadata(audio_path)?.len();
    let max_upload = settings.transcription_external_max_upload_bytes;
    info!(
        "transcribing {} ({}) via provider={} url={} model={}",
        audio_path.display(),
        format_mb(file_size),
        config.provider.as_str(),
        url,
        config.model
    );

    let result = if config.provider == Provider::External && file_size > max_upload {
        info!(
            "audio exceeds external upload max ({} > {}); chunking for transcription",
            format_mb(file_size),
            format_mb(max_upload)
        );
        transcribe_chunked(&client, &url, api_key, config, settings, audio_path, max_upload)
    } else {
        submit_request(&client, &url, api_key, &config.model, audio_path)
    };

    match result {
        Err(TranscribeError::Http { status: 413, .. }) => Err(TranscribeError::UploadTooLarge {
            size: file_size,
            max: max_upload,
        }),
        other => other,
    }
}

fn transcribe_chunked(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    config: &TranscriptionConfig,
    settings: &Settings,
    audio_path: &Path,
    max_upload: u64,
) -> Result<String, TranscribeError> {
    let chunk_seconds = settings.transcription_external_chunk_seconds.max(60);
    let bitrate_kbps = settings.transcription_external_chunk_bitrate_kbps.max(16);
    let (tmpdir, chunks) = split_into_chunks(audio_path, chunk_seconds, bitrate_kbps, max_upload)?;
    let text = transcribe_chunks(client, url, api_key, &config.model, &chunks);
    drop(tmpdir);
    text
}

/// Uploads the chunks in order and joins their transcripts with a single
/// line separator.
fn transcribe_chunks(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    model: &str,
    chunks: &[PathBuf],
) -> Result<String, TranscribeError> {
    let mut texts = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        info!(
            "transcribing chunk {}/{} ({})",
            index + 1,
            chunks.len(),
            format_mb(fs::metadata(chunk)?.len())
        );
        let text = submit_request(client, url, api_key, model, chunk)?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(texts.join("\n").trim().to_string())
}

fn submit_request(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    model: &str,
    audio_path: &Path,
) -> Result<String, TranscribeError> {
    let form = Form::new()
        .text("model", model.to_string())
        .text("response_format", "text")
        .file("file", audio_path)?;

    let mut request = client.post(url).multipart(form);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send()?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_seconds);
        return Err(TranscribeError::Http {
            status: status.as_u16(),
            retry_after,
        });
    }

    Ok(response.text()?.trim().to_string())
}

/// Splits the audio into sequential mono 16 kHz chunks and validates every
/// chunk against the upload cap. The TempDir removes the staging directory
/// on every exit path.
fn split_into_chunks(
    audio_path: &Path,
    chunk_seconds: u32,
    bitrate_kbps: u32,
    max_upload_bytes: u64,
) -> Result<(TempDir, Vec<PathBuf>), TranscribeError> {
    let tmpdir = tempfile::Builder::new()
        .prefix("podscan-chunks-")
        .tempdir()?;
    let pattern = tmpdir.path().join("chunk_%04d.mp3");

    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(audio_path)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-b:a"])
        .arg(format!("{bitrate_kbps}k"))
        .args(["-f", "segment", "-segment_time"])
        .arg(chunk_seconds.to_string())
        .args(["-reset_timestamps", "1"])
        .arg(&pattern)
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TranscribeError::TranscoderMissing)
        }
        Err(err) => return Err(err.into()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            format!("ffmpeg exited with {}", output.status)
        } else {
            stderr
        };
        return Err(TranscribeError::Transcoder(detail));
    }

    let chunks = collect_chunks(tmpdir.path())?;
    validate_chunks(&chunks, max_upload_bytes)?;
    Ok((tmpdir, chunks))
}

fn collect_chunks(dir: &Path) -> Result<Vec<PathBuf>, TranscribeError> {
    let mut chunks: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("chunk_") && n.ends_with(".mp3"))
        })
        .collect();
    chunks.sort();

    if chunks.is_empty() {
        return Err(TranscribeError::Transcoder(
            "no chunks were generated".to_string(),
        ));
    }
    Ok(chunks)
}

fn validate_chunks(chunks: &[PathBuf], max_upload_bytes: u64) -> Result<(), TranscribeError> {
    for chunk in chunks {
        let size = fs::metadata(chunk)?.len();
        if size > max_upload_bytes {
            warn!("chunk {} exceeds the upload cap", chunk.display());
            return Err(TranscribeError::ChunkTooLarge {
                chunk: chunk
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size,
                max: max_upload_bytes,
            });
        }
    }
    Ok(())
}

fn format_mb(num_bytes: u64) -> String {
    format!("{:.1}MB", num_bytes as f64 / (1024.0 * 1024.0))
}
