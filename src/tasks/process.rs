//! The five-stage episode pipeline: download -> transcribe -> detect ->
//! enrich -> persist. Every stage is idempotent against the episode row and
//! commits its status change before the expensive work, so at-least-once
//! redelivery can re-enter any intermediate state.

use anyhow::{anyhow, bail, Context};
use log::{error, info, warn};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::Runner;
use crate::config::Settings;
use crate::db::{Database, EpisodeStatus};
use crate::detect;
use crate::enrich;
use crate::error::{TaskError, TaskResult};
use crate::queue::{DetectPayload, EnrichPayload, Task, TaskContext};
use crate::transcribe::{self, TranscribeError};

pub fn audio_path(settings: &Settings, episode_id: Uuid) -> PathBuf {
    settings.audio_dir.join(format!("{episode_id}.mp3"))
}

/// Removes the staged audio file on every exit path of the final stage.
struct AudioCleanup(PathBuf);

impl Drop for AudioCleanup {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(err) = fs::remove_file(&self.0) {
                warn!("failed to remove audio file {}: {err}", self.0.display());
            }
        }
    }
}

/// Fan-out stub: starts the chain for one episode.
pub(crate) fn process_episode(ctx: &TaskContext, episode_id: Uuid) -> TaskResult {
    info!("episode {episode_id}: queueing processing chain");
    ctx.queue.enqueue(Task::DownloadEpisodeAudio { episode_id });
    Ok(())
}

/// A store error inside a stage gets the same treatment as the stage's own
/// failures: persist the reason (best effort) and let the bounded retry
/// re-run the stage from its intermediate status.
fn store_failure_retry(db: &Database, episode_id: Uuid, err: &rusqlite::Error) -> TaskError {
    error!("episode {episode_id}: store update failed: {err}");
    if let Err(mark_err) = db.mark_episode_failed(episode_id, &err.to_string()) {
        warn!("episode {episode_id}: could not record the failure: {mark_err}");
    }
    TaskError::retry_in(120, format!("store update failed: {err}"))
}

/// Transcription spends its retry budget on store errors too, marking the
/// episode failed only once the attempts run out.
fn transcription_store_retry(
    db: &Database,
    episode_id: Uuid,
    ctx: &TaskContext,
    err: &rusqlite::Error,
) -> TaskError {
    error!("episode {episode_id}: store update failed: {err}");
    if ctx.retries >= ctx.max_retries {
        if let Err(mark_err) = db.mark_episode_failed(episode_id, &err.to_string()) {
            warn!("episode {episode_id}: could not record the failure: {mark_err}");
        }
        return TaskError::fatal(anyhow!("store update failed: {err}"));
    }
    TaskError::retry_in(120, format!("store update failed: {err}"))
}

pub(crate) fn download_episode_audio(
    runner: &Runner,
    ctx: &TaskContext,
    episode_id: Uuid,
) -> TaskResult {
    let db = runner.db()?;
    let Some(episode) = db.episode_by_id(episode_id)? else {
        warn!("episode {episode_id} not found yet; retrying");
        return Err(TaskError::retry_in(10, format!("episode {episode_id} not found")));
    };

    info!("episode {episode_id}: starting download");
    if let Err(err) = db.set_episode_status(episode_id, EpisodeStatus::Downloading) {
        return Err(store_failure_retry(&db, episode_id, &err));
    }

    let Some(audio_url) = episode.audio_url.as_deref() else {
        if let Err(mark_err) = db.mark_episode_failed(episode_id, "episode has no audio url") {
            warn!("episode {episode_id}: could not record the failure: {mark_err}");
        }
        return Err(TaskError::fatal(anyhow!(
            "episode {episode_id} has no audio url"
        )));
    };

    match download_audio(&runner.settings, audio_url, episode_id) {
        Ok(path) => {
            info!("episode {episode_id}: download completed ({})", path.display());
            ctx.queue.enqueue(Task::TranscribeEpisodeAudio { episode_id });
            Ok(())
        }
        Err(err) => {
            error!("audio download failed for episode {episode_id}: {err:#}");
            if let Err(mark_err) = db.mark_episode_failed(episode_id, &format!("{err:#}")) {
                warn!("episode {episode_id}: could not record the failure: {mark_err}");
            }
            Err(TaskError::retry_in(120, format!("{err:#}")))
        }
    }
}

/// Streams the audio to `{audio_dir}/{episode_id}.mp3` with chunked writes,
/// guarding both total bytes and wall time. Both guards are retried by the
/// task and fail the episode on exhaustion.
fn download_audio(settings: &Settings, audio_url: &str, episode_id: Uuid) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&settings.audio_dir)?;
    let path = audio_path(settings, episode_id);

    let agent = ureq::builder()
        .timeout_connect(Duration::from_secs(20))
        .timeout_read(Duration::from_secs(30))
        .build();
    let response = agent
        .get(audio_url)
        .call()
        .with_context(|| format!("audio request failed for {audio_url}"))?;

    let mut reader = response.into_reader();
    let mut file = File::create(&path)?;
    let mut buffer = [0u8; 8192];
    let started_at = Instant::now();
    let mut bytes_written: u64 = 0;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        bytes_written += read as u64;

        if bytes_written > settings.audio_download_max_bytes {
            bail!(
                "audio exceeds max size ({} bytes)",
                settings.audio_download_max_bytes
            );
        }
        if started_at.elapsed() > Duration::from_secs(settings.audio_download_timeout_seconds) {
            bail!(
                "audio download exceeded {} seconds",
                settings.audio_download_timeout_seconds
            );
        }
    }

    Ok(path)
}

pub(crate) fn transcribe_episode_audio(
    runner: &Runner,
    ctx: &TaskContext,
    episode_id: Uuid,
) -> TaskResult {
    let db = runner.db()?;
    if db.episode_by_id(episode_id)?.is_none() {
        warn!("episode {episode_id} not found yet; retrying");
        return Err(TaskError::retry_in(10, format!("episode {episode_id} not found")));
    }

    let path = audio_path(&runner.settings, episode_id);
    if !path.exists() {
        warn!("episode {episode_id} audio file missing; retrying");
        return Err(TaskError::retry_in(30, format!("audio file missing: {}", path.display())));
    }

    info!("episode {episode_id}: starting transcription");
    if let Err(err) = db.set_episode_status(episode_id, EpisodeStatus::Transcribing) {
        return Err(transcription_store_retry(&db, episode_id, ctx, &err));
    }

    let config = match transcribe::runtime_config(&db, &runner.settings) {
        Ok(config) => config,
        Err(err) => return Err(transcription_store_retry(&db, episode_id, ctx, &err)),
    };
    match transcribe::transcribe_audio(&config, &runner.settings, &path) {
        Ok(transcript) => {
            if let Err(err) = db.set_episode_transcript(episode_id, &transcript) {
                return Err(transcription_store_retry(&db, episode_id, ctx, &err));
            }
            info!("episode {episode_id}: transcription complete");
            ctx.queue.enqueue(Task::DetectEpisodeKeywords(DetectPayload {
                episode_id,
                transcription_done: true,
            }));
            Ok(())
        }
        Err(err) => {
            let non_retryable = matches!(
                err,
                TranscribeError::UploadTooLarge { .. }
                    | TranscribeError::ChunkTooLarge { .. }
                    | TranscribeError::TranscoderMissing
                    | TranscribeError::Transcoder(_)
            );
            if non_retryable || ctx.retries >= ctx.max_retries {
                error!("transcription failed for episode {episode_id} (giving up): {err}");
                if let Err(mark_err) = db.mark_episode_failed(episode_id, &err.to_string()) {
                    warn!("episode {episode_id}: could not record the failure: {mark_err}");
                }
                return Err(TaskError::fatal(err));
            }
            let countdown = transcription_retry_countdown(&err, ctx.retries, &runner.settings);
            warn!(
                "transcription failed for episode {episode_id}; retrying in {}s ({}/{}): {err}",
                countdown.as_secs(),
                ctx.retries + 1,
                ctx.max_retries
            );
            Err(TaskError::Retry {
                countdown,
                replacement: None,
                reason: err.to_string(),
            })
        }
    }
}

/// Retry countdown with 429-aware backoff: an explicit Retry-After wins
/// (clamped into `[30, max]`), a bare 429 backs off exponentially from the
/// configured base, anything else waits a flat 120 seconds.
fn transcription_retry_countdown(
    err: &TranscribeError,
    retries_used: u32,
    settings: &Settings,
) -> Duration {
    if let TranscribeError::Http {
        status: 429,
        retry_after,
    } = err
    {
        let max = settings.transcription_429_retry_max_seconds;
        if let Some(seconds) = retry_after {
            return Duration::from_secs((*seconds).clamp(30, max.max(30)));
        }
        let base = settings.transcription_429_retry_base_seconds.max(30);
        let countdown = base.saturating_mul(2u64.saturating_pow(retries_used));
        return Duration::from_secs(countdown.min(max));
    }
    Duration::from_secs(120)
}

pub(crate) fn detect_episode_keywords(
    runner: &Runner,
    ctx: &TaskContext,
    payload: &DetectPayload,
) -> TaskResult {
    let episode_id = payload.episode_id;
    if !payload.transcription_done {
        warn!("episode {episode_id} transcription not marked done; retrying");
        return Err(TaskError::retry_in(10, "transcription not complete"));
    }

    let db = runner.db()?;
    let Some(episode) = db.episode_by_id(episode_id)? else {
        warn!("episode {episode_id} not found yet; retrying");
        return Err(TaskError::retry_in(10, format!("episode {episode_id} not found")));
    };
    // Empty string is a valid transcript; only NULL means not persisted yet.
    let Some(transcript) = episode.transcript_text else {
        warn!("episode {episode_id} transcript missing; retrying");
        return Err(TaskError::retry_in(30, format!("episode {episode_id} transcript missing")));
    };

    info!("episode {episode_id}: starting keyword detection");
    if let Err(err) = db.set_episode_status(episode_id, EpisodeStatus::Analyzing) {
        return Err(store_failure_retry(&db, episode_id, &err));
    }

    let keywords = match db.all_keywords() {
        Ok(keywords) => keywords,
        Err(err) => return Err(store_failure_retry(&db, episode_id, &err)),
    };
    if keywords.is_empty() {
        if let Err(err) = db.set_episode_status(episode_id, EpisodeStatus::Completed) {
            return Err(store_failure_retry(&db, episode_id, &err));
        }
        info!("episode {episode_id}: completed (no keywords)");
        return Ok(());
    }

    let matches = detect::detect_keywords(&transcript, &keywords);
    info!("episode {episode_id}: found {} matches", matches.len());

    // Queued explicitly so manual re-triggers of detection still enrich.
    ctx.queue.enqueue(Task::EnrichEpisodeMentions(EnrichPayload {
        episode_id,
        matches,
        start_index: 0,
    }));
    Ok(())
}

pub(crate) fn enrich_episode_mentions(
    runner: &Runner,
    ctx: &TaskContext,
    payload: &EnrichPayload,
) -> TaskResult {
    let episode_id = payload.episode_id;
    let _cleanup = AudioCleanup(audio_path(&runner.settings, episode_id));

    let db = runner.db()?;
    if db.episode_by_id(episode_id)?.is_none() {
        warn!("episode {episode_id} not found yet; retrying");
        return Err(TaskError::retry_in(10, format!("episode {episode_id} not found")));
    }

    if payload.matches.is_empty() {
        if let Err(err) = db.set_episode_status(episode_id, EpisodeStatus::Completed) {
            warn!("episode {episode_id}: store update failed: {err}");
            return Err(TaskError::retry_in(120, format!("store update failed: {err}")));
        }
        info!("episode {episode_id}: completed (no matches)");
        return Ok(());
    }

    let mut next_index = payload.start_index.min(payload.matches.len());
    info!(
        "episode {episode_id}: enriching {} matches (starting at index {next_index})",
        payload.matches.len()
    );

    // the completed flip rides the same retry path as the enrichment itself;
    // on re-run every mention is already present and only the flip remains
    let outcome = run_enrichment(&db, &runner.settings, payload, &mut next_index).and_then(|()| {
        db.set_episode_status(episode_id, EpisodeStatus::Completed)?;
        Ok(())
    });

    match outcome {
        Ok(()) => {
            info!("episode {episode_id}: completed");
            Ok(())
        }
        Err(err) => {
            // configuration problems never fix themselves by waiting
            let non_retryable = err.downcast_ref::<enrich::EnrichError>().map_or(false, |e| {
                matches!(
                    e,
                    enrich::EnrichError::MissingApiKey | enrich::EnrichError::ModelNotFound(_)
                )
            });
            if non_retryable || ctx.retries >= ctx.max_retries {
                error!("enrichment failed for episode {episode_id} (giving up): {err:#}");
                if let Err(mark_err) = db.mark_episode_failed(episode_id, &format!("{err:#}")) {
                    warn!("episode {episode_id}: could not record the failure: {mark_err}");
                }
                return Err(TaskError::fatal(err));
            }
            let mut replacement = payload.clone();
            replacement.start_index = next_index;
            warn!(
                "enrichment failed for episode {episode_id}; retrying in 120s from match index \
                 {next_index} ({}/{}): {err:#}",
                ctx.retries + 1,
                ctx.max_retries
            );
            Err(TaskError::retry_with(
                Duration::from_secs(120),
                Task::EnrichEpisodeMentions(replacement),
                format!("{err:#}"),
            ))
        }
    }
}

/// Walks the matches from `next_index`, committing one mention at a time so
/// a failure loses at most the in-flight match. `next_index` advances only
/// past persisted (or already-present) mentions, making it the resume cursor
/// for the retry payload.
fn run_enrichment(
    db: &Database,
    settings: &Settings,
    payload: &EnrichPayload,
    next_index: &mut usize,
) -> anyhow::Result<()> {
    // Full reprocess starts from a clean slate.
    if *next_index == 0 {
        db.delete_mentions_for_episode(payload.episode_id)?;
    }

    while *next_index < payload.matches.len() {
        let m = &payload.matches[*next_index];
        if db.mention_exists(
            payload.episode_id,
            m.keyword_id,
            &m.matched_text,
            &m.transcript_segment,
        )? {
            *next_index += 1;
            continue;
        }

        let enrichment = enrich::enrich_mention(settings, &m.phrase, &m.transcript_segment, true)?;
        db.insert_mention(
            payload.episode_id,
            m.keyword_id,
            &m.matched_text,
            &m.transcript_segment,
            &enrichment,
        )?;
        *next_index += 1;
    }
    Ok(())
}
