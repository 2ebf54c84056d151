//! Feed polling: periodic and on-demand fan-out into the episode pipeline.

use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use super::Runner;
use crate::db::NewEpisode;
use crate::error::{TaskError, TaskResult};
use crate::feed;
use crate::queue::{Task, TaskContext};

/// Fans polling out to one task per feed.
pub(crate) fn poll_all_feeds(runner: &Runner, ctx: &TaskContext) -> TaskResult {
    let db = runner.db()?;
    let feeds = db.all_feeds()?;
    for feed in &feeds {
        ctx.queue.enqueue(Task::PollSingleFeed { feed_id: feed.id });
    }
    info!("queued polling for {} feeds", feeds.len());
    Ok(())
}

/// Parses one feed and creates episodes for new entries. Episode creation is
/// idempotent by GUID, so re-polling identical content creates nothing. The
/// `pending -> queued` flip before enqueueing keeps a concurrent poll from
/// starting duplicate pipelines.
pub(crate) fn poll_single_feed(runner: &Runner, ctx: &TaskContext, feed_id: Uuid) -> TaskResult {
    let mut db = runner.db()?;
    let Some(feed) = db.feed_by_id(feed_id)? else {
        warn!("feed {feed_id} not found");
        return Ok(());
    };

    let parsed = match feed::fetch_feed(&feed.rss_url) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!("failed to parse feed {}: {err}", feed.rss_url);
            return Err(TaskError::retry_in(60, err.to_string()));
        }
    };

    db.fill_feed_metadata(
        feed.id,
        parsed.meta.title.as_deref(),
        parsed.meta.image_url.as_deref(),
    )?;

    let mut new_count = 0;
    for candidate in &parsed.episodes {
        if candidate.guid.is_empty() {
            warn!("feed {}: skipping entry without a guid", feed.rss_url);
            continue;
        }
        if candidate.audio_url.is_none() {
            continue;
        }
        let (_, created) = db.upsert_episode(&NewEpisode {
            feed_id: feed.id,
            guid: candidate.guid.clone(),
            title: candidate.title.clone(),
            audio_url: candidate.audio_url.clone(),
            published_at: candidate.published_at,
        })?;
        if created {
            new_count += 1;
        }
    }

    db.touch_feed_polled(feed.id, Utc::now())?;

    let queued = db.requeue_pending(feed.id, runner.settings.max_episodes_per_feed)?;
    for episode_id in &queued {
        ctx.queue.enqueue(Task::ProcessEpisode {
            episode_id: *episode_id,
        });
    }

    info!(
        "feed '{}': {} new episodes, queued {} for processing",
        feed.title.as_deref().unwrap_or(&feed.rss_url),
        new_count,
        queued.len()
    );
    Ok(())
}
