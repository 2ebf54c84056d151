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
// database
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::enrich::Enrichment;
use crate::error::clip_error_message;

const DB_VERSION: u32 = 1;

const FEED_COLS: &str = "id, rss_url, title, image_url, last_polled_at, created_at, updated_at";
const EPISODE_COLS: &str = "id, feed_id, guid, title, audio_url, published_at, status, \
                            transcript_text, error_message, created_at, updated_at";
const KEYWORD_COLS: &str = "id, phrase, match_type, created_at, updated_at";
const MENTION_COLS: &str = "id, episode_id, keyword_id, matched_text, transcript_segment, \
                            sentiment, sentiment_score, context_summary, topics, \
                            is_buying_signal, is_pain_point, is_recommendation, \
                            raw_llm_response, created_at, updated_at";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Queued,
    Downloading,
    Transcribing,
    Analyzing,
    Completed,
    Failed,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown episode status '{0}'")]
pub struct ParseEpisodeStatusError(String);

impl FromStr for EpisodeStatus {
    type Err = ParseEpisodeStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "transcribing" => Ok(Self::Transcribing),
            "analyzing" => Ok(Self::Analyzing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEpisodeStatusError(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    ExactWord,
    Regex,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::ExactWord => "exact_word",
            Self::Regex => "regex",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown match type '{0}'")]
pub struct ParseMatchTypeError(String);

impl FromStr for MatchType {
    type Err = ParseMatchTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "contains" => Ok(Self::Contains),
            "exact_word" => Ok(Self::ExactWord),
            "regex" => Ok(Self::Regex),
            other => Err(ParseMatchTypeError(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Feed {
    pub id: Uuid,
    pub rss_url: String,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Episode {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub guid: String,
    pub title: Option<String>,
    pub audio_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: EpisodeStatus,
    pub transcript_text: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Episode data as produced by the feed parser, before it exists in the
/// database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewEpisode {
    pub feed_id: Uuid,
    pub guid: String,
    pub title: Option<String>,
    pub audio_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Keyword {
    pub id: Uuid,
    pub phrase: String,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Mention {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub keyword_id: Uuid,
    pub matched_text: String,
    pub transcript_segment: String,
    pub sentiment: Option<String>,
    pub sentiment_score: Option<f64>,
    pub context_summary: Option<String>,
    pub topics: Vec<String>,
    pub is_buying_signal: Option<bool>,
    pub is_pain_point: Option<bool>,
    pub is_recommendation: Option<bool>,
    pub raw_llm_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mention joined with the titles a browsing UI wants next to it.
#[derive(Clone, Debug)]
pub struct MentionDetail {
    pub mention: Mention,
    pub episode_title: Option<String>,
    pub podcast_title: Option<String>,
    pub keyword_phrase: String,
}

#[derive(Clone, Debug, Default)]
pub struct MentionFilter {
    pub feed_id: Option<Uuid>,
    pub keyword_id: Option<Uuid>,
    pub sentiment: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct DashboardStats {
    pub feeds: i64,
    pub episodes: i64,
    pub keywords: i64,
    pub mentions: i64,
    pub episodes_completed: i64,
    pub episodes_processing: i64,
    pub episodes_failed: i64,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (and if needed creates) the database at `path`. Every worker
    /// task and API request opens its own short-lived connection.
    pub fn connect(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let user_version: u32 =
            conn.query_row("SELECT user_version FROM pragma_user_version", [], |r| {
                r.get(0)
            })?;
        conn.execute_batch(SCHEMA)?;
        if user_version < DB_VERSION {
            conn.pragma_update(None, "user_version", DB_VERSION)?;
        }

        Ok(Self { conn })
    }

    // ---- feeds ----

    pub fn insert_feed(&self, rss_url: &str) -> Result<Feed> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO feeds (id, rss_url, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, rss_url, now, now],
        )?;
        Ok(Feed {
            id,
            rss_url: rss_url.to_string(),
            title: None,
            image_url: None,
            last_polled_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn feed_by_id(&self, id: Uuid) -> Result<Option<Feed>> {
        self.conn
            .query_row(
                &format!("SELECT {FEED_COLS} FROM feeds WHERE id = ?1"),
                params![id],
                feed_from_row,
            )
            .optional()
    }

    pub fn feed_by_url(&self, rss_url: &str) -> Result<Option<Feed>> {
        self.conn
            .query_row(
                &format!("SELECT {FEED_COLS} FROM feeds WHERE rss_url = ?1"),
                params![rss_url],
                feed_from_row,
            )
            .optional()
    }

    pub fn all_feeds(&self) -> Result<Vec<Feed>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {FEED_COLS} FROM feeds ORDER BY created_at DESC"))?;
        let rows = stmt.query_map([], feed_from_row)?;
        rows.collect()
    }

    pub fn feeds_with_episode_count(&self) -> Result<Vec<(Feed, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.rss_url, f.title, f.image_url, f.last_polled_at, f.created_at, \
                    f.updated_at, COUNT(e.id) \
             FROM feeds f LEFT JOIN episodes e ON e.feed_id = f.id \
             GROUP BY f.id ORDER BY f.created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((feed_from_row(row)?, row.get(7)?)))?;
        rows.collect()
    }

    pub fn delete_feed(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Fills title and image only where they are still NULL. User-visible
    /// metadata is never overwritten once set.
    pub fn fill_feed_metadata(
        &self,
        id: Uuid,
        title: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE feeds SET title = COALESCE(title, ?2), \
             image_url = COALESCE(image_url, ?3), updated_at = ?4 WHERE id = ?1",
            params![id, title, image_url, Utc::now()],
        )?;
        Ok(())
    }

    pub fn touch_feed_polled(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE feeds SET last_polled_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, at],
        )?;
        Ok(())
    }

    // ---- episodes ----

    /// Returns the episode with the given GUID, inserting it first when it
    /// does not exist yet. The boolean reports whether an insert happened.
    /// The conflict clause makes concurrent polls race-free: the loser simply
    /// reads back the winner's row.
    pub fn upsert_episode(&mut self, new: &NewEpisode) -> Result<(Episode, bool)> {
        let tx = self.conn.transaction()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let created = tx.execute(
            "INSERT INTO episodes (id, feed_id, guid, title, audio_url, published_at, status, \
                                   created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(guid) DO NOTHING",
            params![
                id,
                new.feed_id,
                new.guid,
                new.title,
                new.audio_url,
                new.published_at,
                EpisodeStatus::Pending.as_str(),
                now,
                now
            ],
        )? > 0;
        let episode = tx.query_row(
            &format!("SELECT {EPISODE_COLS} FROM episodes WHERE guid = ?1"),
            params![new.guid],
            episode_from_row,
        )?;
        tx.commit()?;
        Ok((episode, created))
    }

    pub fn episode_by_id(&self, id: Uuid) -> Result<Option<Episode>> {
        self.conn
            .query_row(
                &format!("SELECT {EPISODE_COLS} FROM episodes WHERE id = ?1"),
                params![id],
                episode_from_row,
            )
            .optional()
    }

    pub fn episode_by_guid(&self, guid: &str) -> Result<Option<Episode>> {
        self.conn
            .query_row(
                &format!("SELECT {EPISODE_COLS} FROM episodes WHERE guid = ?1"),
                params![guid],
                episode_from_row,
            )
            .optional()
    }

    pub fn episodes_by_feed_with_mention_count(
        &self,
        feed_id: Uuid,
    ) -> Result<Vec<(Episode, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.feed_id, e.guid, e.title, e.audio_url, e.published_at, e.status, \
                    e.transcript_text, e.error_message, e.created_at, e.updated_at, COUNT(m.id) \
             FROM episodes e LEFT JOIN mentions m ON m.episode_id = e.id \
             WHERE e.feed_id = ?1 GROUP BY e.id \
             ORDER BY e.published_at IS NULL, e.published_at DESC, e.created_at DESC",
        )?;
        let rows = stmt.query_map(params![feed_id], |row| {
            Ok((episode_from_row(row)?, row.get(11)?))
        })?;
        rows.collect()
    }

    /// Selects the top-`limit` episodes of the feed ordered by
    /// `published_at DESC NULLS LAST, created_at DESC` and flips those still
    /// `pending` to `queued`, all inside one transaction. Returns the moved
    /// ids. A second concurrent poll finds nothing left to claim.
    pub fn requeue_pending(&mut self, feed_id: Uuid, limit: u32) -> Result<Vec<Uuid>> {
        let limit = if limit == 0 { -1 } else { i64::from(limit) };
        let tx = self.conn.transaction()?;
        let candidates: Vec<Uuid> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM episodes WHERE feed_id = ?1 \
                 ORDER BY published_at IS NULL, published_at DESC, created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![feed_id, limit], |row| row.get(0))?;
            rows.collect::<Result<_>>()?
        };

        let now = Utc::now();
        let mut moved = Vec::new();
        for id in candidates {
            let changed = tx.execute(
                "UPDATE episodes SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
                params![
                    id,
                    EpisodeStatus::Queued.as_str(),
                    now,
                    EpisodeStatus::Pending.as_str()
                ],
            )?;
            if changed > 0 {
                moved.push(id);
            }
        }
        tx.commit()?;
        Ok(moved)
    }

    pub fn set_episode_status(&self, id: Uuid, status: EpisodeStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    /// Status reset for the manual reprocess / retry-enrichment entry points:
    /// also clears the stored failure reason.
    pub fn reset_episode(&self, id: Uuid, status: EpisodeStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET status = ?2, error_message = NULL, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    pub fn mark_episode_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                EpisodeStatus::Failed.as_str(),
                clip_error_message(reason),
                Utc::now()
            ],
        )?;
        Ok(())
    }

    pub fn set_episode_transcript(&self, id: Uuid, transcript: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE episodes SET transcript_text = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, transcript, Utc::now()],
        )?;
        Ok(())
    }

    // ---- keywords ----

    pub fn insert_keyword(&self, phrase: &str, match_type: MatchType) -> Result<Keyword> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO keywords (id, phrase, match_type, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, phrase, match_type.as_str(), now, now],
        )?;
        Ok(Keyword {
            id,
            phrase: phrase.to_string(),
            match_type,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn keyword_by_phrase(&self, phrase: &str) -> Result<Option<Keyword>> {
        self.conn
            .query_row(
                &format!("SELECT {KEYWORD_COLS} FROM keywords WHERE phrase = ?1"),
                params![phrase],
                keyword_from_row,
            )
            .optional()
    }

    pub fn all_keywords(&self) -> Result<Vec<Keyword>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {KEYWORD_COLS} FROM keywords ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], keyword_from_row)?;
        rows.collect()
    }

    pub fn delete_keyword(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM keywords WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ---- mentions ----

    pub fn delete_mentions_for_episode(&self, episode_id: Uuid) -> Result<usize> {
        self.conn.execute(
            "DELETE FROM mentions WHERE episode_id = ?1",
            params![episode_id],
        )
    }

    /// The `(episode, keyword, matched_text, transcript_segment)` tuple is
    /// the idempotency key within an episode.
    pub fn mention_exists(
        &self,
        episode_id: Uuid,
        keyword_id: Uuid,
        matched_text: &str,
        transcript_segment: &str,
    ) -> Result<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM mentions WHERE episode_id = ?1 AND keyword_id = ?2 \
             AND matched_text = ?3 AND transcript_segment = ?4)",
            params![episode_id, keyword_id, matched_text, transcript_segment],
            |row| row.get(0),
        )
    }

    pub fn insert_mention(
        &self,
        episode_id: Uuid,
        keyword_id: Uuid,
        matched_text: &str,
        transcript_segment: &str,
        enrichment: &Enrichment,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let topics = serde_json::to_string(&enrichment.topics).unwrap_or_else(|_| "[]".to_string());
        let raw = serde_json::to_value(enrichment).unwrap_or(serde_json::Value::Null);
        self.conn.execute(
            "INSERT INTO mentions (id, episode_id, keyword_id, matched_text, transcript_segment, \
                                   sentiment, sentiment_score, context_summary, topics, \
                                   is_buying_signal, is_pain_point, is_recommendation, \
                                   raw_llm_response, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                id,
                episode_id,
                keyword_id,
                matched_text,
                transcript_segment,
                enrichment.sentiment,
                enrichment.sentiment_score,
                enrichment.context_summary,
                topics,
                enrichment.is_buying_signal,
                enrichment.is_pain_point,
                enrichment.is_recommendation,
                raw,
                now,
                now
            ],
        )?;
        Ok(id)
    }

    pub fn mentions_for_episode(&self, episode_id: Uuid) -> Result<Vec<Mention>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MENTION_COLS} FROM mentions WHERE episode_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![episode_id], mention_from_row)?;
        rows.collect()
    }

    pub fn browse_mentions(&self, filter: &MentionFilter) -> Result<Vec<MentionDetail>> {
        let mut sql = String::from(
            "SELECT m.id, m.episode_id, m.keyword_id, m.matched_text, m.transcript_segment, \
                    m.sentiment, m.sentiment_score, m.context_summary, m.topics, \
                    m.is_buying_signal, m.is_pain_point, m.is_recommendation, \
                    m.raw_llm_response, m.created_at, m.updated_at, \
                    e.title, f.title, k.phrase \
             FROM mentions m \
             JOIN episodes e ON e.id = m.episode_id \
             JOIN feeds f ON f.id = e.feed_id \
             JOIN keywords k ON k.id = m.keyword_id",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(feed_id) = filter.feed_id {
            clauses.push("e.feed_id = ?");
            values.push(SqlValue::Blob(feed_id.as_bytes().to_vec()));
        }
        if let Some(keyword_id) = filter.keyword_id {
            clauses.push("m.keyword_id = ?");
            values.push(SqlValue::Blob(keyword_id.as_bytes().to_vec()));
        }
        if let Some(sentiment) = &filter.sentiment {
            clauses.push("m.sentiment = ?");
            values.push(SqlValue::Text(sentiment.clone()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY m.created_at DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(i64::from(filter.limit.min(100).max(1))));
        values.push(SqlValue::Integer(i64::from(filter.offset)));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), mention_detail_from_row)?;
        rows.collect()
    }

    pub fn mention_detail(&self, id: Uuid) -> Result<Option<MentionDetail>> {
        self.conn
            .query_row(
                "SELECT m.id, m.episode_id, m.keyword_id, m.matched_text, m.transcript_segment, \
                        m.sentiment, m.sentiment_score, m.context_summary, m.topics, \
                        m.is_buying_signal, m.is_pain_point, m.is_recommendation, \
                        m.raw_llm_response, m.created_at, m.updated_at, \
                        e.title, f.title, k.phrase \
                 FROM mentions m \
                 JOIN episodes e ON e.id = m.episode_id \
                 JOIN feeds f ON f.id = e.feed_id \
                 JOIN keywords k ON k.id = m.keyword_id \
                 WHERE m.id = ?1",
                params![id],
                mention_detail_from_row,
            )
            .optional()
    }

    // ---- dashboard ----

    pub fn dashboard_stats(&self) -> Result<DashboardStats> {
        let count = |sql: &str| -> Result<i64> { self.conn.query_row(sql, [], |r| r.get(0)) };
        Ok(DashboardStats {
            feeds: count("SELECT COUNT(*) FROM feeds")?,
            episodes: count("SELECT COUNT(*) FROM episodes")?,
            keywords: count("SELECT COUNT(*) FROM keywords")?,
            mentions: count("SELECT COUNT(*) FROM mentions")?,
            episodes_completed: count("SELECT COUNT(*) FROM episodes WHERE status = 'completed'")?,
            episodes_processing: count(
                "SELECT COUNT(*) FROM episodes WHERE status IN \
                 ('pending', 'queued', 'downloading', 'transcribing', 'analyzing')",
            )?,
            episodes_failed: count("SELECT COUNT(*) FROM episodes WHERE status = 'failed'")?,
        })
    }

    // ---- app settings ----

    pub fn app_settings(&self, keys: &[&str]) -> Result<HashMap<String, Option<String>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("SELECT key, value FROM app_settings WHERE key IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        rows.collect()
    }

    pub fn set_app_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feeds (
    id BLOB PRIMARY KEY,
    rss_url TEXT NOT NULL UNIQUE,
    title TEXT,
    image_url TEXT,
    last_polled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS episodes (
    id BLOB PRIMARY KEY,
    feed_id BLOB NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    guid TEXT NOT NULL UNIQUE,
    title TEXT,
    audio_url TEXT,
    published_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    transcript_text TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_feed ON episodes(feed_id);
CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);
CREATE TABLE IF NOT EXISTS keywords (
    id BLOB PRIMARY KEY,
    phrase TEXT NOT NULL UNIQUE,
    match_type TEXT NOT NULL DEFAULT 'contains',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mentions (
    id BLOB PRIMARY KEY,
    episode_id BLOB NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    keyword_id BLOB NOT NULL REFERENCES keywords(id) ON DELETE CASCADE,
    matched_text TEXT NOT NULL,
    transcript_segment TEXT NOT NULL,
    sentiment TEXT,
    sentiment_score REAL,
    context_summary TEXT,
    topics TEXT,
    is_buying_signal INTEGER,
    is_pain_point INTEGER,
    is_recommendation INTEGER,
    raw_llm_response TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mentions_episode ON mentions(episode_id);
CREATE INDEX IF NOT EXISTS idx_mentions_keyword ON mentions(keyword_id);
CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT,
    updated_at TEXT NOT NULL
);
";

fn feed_from_row(row: &Row<'_>) -> Result<Feed> {
    Ok(Feed {
        id: row.get(0)?,
        rss_url: row.get(1)?,
        title: row.get(2)?,
        image_url: row.get(3)?,
        last_polled_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> Result<Episode> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<EpisodeStatus>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err)))?;
    Ok(Episode {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        guid: row.get(2)?,
        title: row.get(3)?,
        audio_url: row.get(4)?,
        published_at: row.get(5)?,
        status,
        transcript_text: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn keyword_from_row(row: &Row<'_>) -> Result<Keyword> {
    let match_type: String = row.get(2)?;
    let match_type = match_type
        .parse::<MatchType>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;
    Ok(Keyword {
        id: row.get(0)?,
        phrase: row.get(1)?,
        match_type,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn mention_from_row(row: &Row<'_>) -> Result<Mention> {
    let topics: Option<String> = row.get(8)?;
    let topics = topics
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    Ok(Mention {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        keyword_id: row.get(2)?,
        matched_text: row.get(3)?,
        transcript_segment: row.get(4)?,
        sentiment: row.get(5)?,
        sentiment_score: row.get(6)?,
        context_summary: row.get(7)?,
        topics,
        is_buying_signal: row.get(9)?,
        is_pain_point: row.get(10)?,
        is_recommendation: row.get(11)?,
        raw_llm_response: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn mention_detail_from_row(row: &Row<'_>) -> Result<MentionDetail> {
    Ok(MentionDetail {
        mention: mention_from_row(row)?,
        episode_title: row.get(15)?,
        podcast_title: row.get(16)?,
        keyword_phrase: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn new_episode(feed_id: Uuid, guid: &str, published_at: Option<DateTime<Utc>>) -> NewEpisode {
        NewEpisode {
            feed_id,
            guid: guid.to_string(),
            title: Some(format!("episode {guid}")),
            audio_url: Some(format!("https://cdn.example.com/{guid}.mp3")),
            published_at,
        }
    }

    #[test]
    fn upsert_episode_is_idempotent_by_guid() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();

        let (first, created) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();
        assert!(created);
        let (second, created) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn requeue_orders_by_published_then_created_with_nulls_last() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();

        let old = Utc::now() - chrono::Duration::days(30);
        let recent = Utc::now() - chrono::Duration::days(1);
        let (no_date, _) = db.upsert_episode(&new_episode(feed.id, "no-date", None)).unwrap();
        let (oldest, _) = db.upsert_episode(&new_episode(feed.id, "old", Some(old))).unwrap();
        let (newest, _) = db
            .upsert_episode(&new_episode(feed.id, "recent", Some(recent)))
            .unwrap();

        let moved = db.requeue_pending(feed.id, 2).unwrap();
        assert_eq!(moved, vec![newest.id, oldest.id]);

        // the undated episode was past the limit and stays pending
        let status = db.episode_by_id(no_date.id).unwrap().unwrap().status;
        assert_eq!(status, EpisodeStatus::Pending);

        // a second pass finds nothing pending inside the window
        let moved = db.requeue_pending(feed.id, 2).unwrap();
        assert!(moved.is_empty());
    }

    #[test]
    fn requeue_without_limit_moves_everything_pending() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        for n in 0..5 {
            db.upsert_episode(&new_episode(feed.id, &format!("ep-{n}"), None))
                .unwrap();
        }
        let moved = db.requeue_pending(feed.id, 0).unwrap();
        assert_eq!(moved.len(), 5);
    }

    #[test]
    fn fill_feed_metadata_never_overwrites() {
        let (_dir, db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();

        db.fill_feed_metadata(feed.id, Some("First Title"), None).unwrap();
        db.fill_feed_metadata(feed.id, Some("Second Title"), Some("https://img.example.com/a.png"))
            .unwrap();

        let feed = db.feed_by_id(feed.id).unwrap().unwrap();
        assert_eq!(feed.title.as_deref(), Some("First Title"));
        assert_eq!(feed.image_url.as_deref(), Some("https://img.example.com/a.png"));
    }

    #[test]
    fn deleting_a_feed_cascades_to_episodes_and_mentions() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();
        let keyword = db.insert_keyword("acme", MatchType::Contains).unwrap();
        db.insert_mention(
            episode.id,
            keyword.id,
            "acme",
            "...about acme...",
            &Enrichment::unavailable(),
        )
        .unwrap();

        assert!(db.delete_feed(feed.id).unwrap());
        assert!(db.episode_by_id(episode.id).unwrap().is_none());
        assert!(db.mentions_for_episode(episode.id).unwrap().is_empty());
    }

    #[test]
    fn mention_tuple_exists_check() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();
        let keyword = db.insert_keyword("acme", MatchType::Contains).unwrap();

        assert!(!db.mention_exists(episode.id, keyword.id, "Acme", "...Acme...").unwrap());
        db.insert_mention(episode.id, keyword.id, "Acme", "...Acme...", &Enrichment::unavailable())
            .unwrap();
        assert!(db.mention_exists(episode.id, keyword.id, "Acme", "...Acme...").unwrap());
        // differing segment is a different tuple
        assert!(!db.mention_exists(episode.id, keyword.id, "Acme", "...Acme!...").unwrap());
    }

    #[test]
    fn mark_failed_clips_long_reasons() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();

        db.mark_episode_failed(episode.id, &"e".repeat(2000)).unwrap();
        let episode = db.episode_by_id(episode.id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert_eq!(episode.error_message.unwrap().chars().count(), 500);
    }

    #[test]
    fn empty_transcript_is_distinct_from_null() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();

        assert!(db.episode_by_id(episode.id).unwrap().unwrap().transcript_text.is_none());
        db.set_episode_transcript(episode.id, "").unwrap();
        assert_eq!(
            db.episode_by_id(episode.id).unwrap().unwrap().transcript_text,
            Some(String::new())
        );
    }

    #[test]
    fn browse_mentions_filters_by_sentiment() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = db.upsert_episode(&new_episode(feed.id, "ep-001", None)).unwrap();
        let keyword = db.insert_keyword("acme", MatchType::Contains).unwrap();

        let mut positive = Enrichment::unavailable();
        positive.sentiment = "positive".to_string();
        db.insert_mention(episode.id, keyword.id, "acme", "seg-a", &positive).unwrap();
        db.insert_mention(episode.id, keyword.id, "acme", "seg-b", &Enrichment::unavailable())
            .unwrap();

        let filter = MentionFilter {
            sentiment: Some("positive".to_string()),
            limit: 50,
            ..MentionFilter::default()
        };
        let found = db.browse_mentions(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mention.transcript_segment, "seg-a");
        assert_eq!(found[0].keyword_phrase, "acme");
    }

    #[test]
    fn dashboard_counts_by_status() {
        let (_dir, mut db) = test_db();
        let feed = db.insert_feed("https://example.com/feed.xml").unwrap();
        let (a, _) = db.upsert_episode(&new_episode(feed.id, "a", None)).unwrap();
        let (b, _) = db.upsert_episode(&new_episode(feed.id, "b", None)).unwrap();
        db.upsert_episode(&new_episode(feed.id, "c", None)).unwrap();
        db.set_episode_status(a.id, EpisodeStatus::Completed).unwrap();
        db.mark_episode_failed(b.id, "boom").unwrap();

        let stats = db.dashboard_stats().unwrap();
        assert_eq!(stats.feeds, 1);
        assert_eq!(stats.episodes, 3);
        assert_eq!(stats.episodes_completed, 1);
        assert_eq!(stats.episodes_failed, 1);
        assert_eq!(stats.episodes_processing, 1);
    }

    #[test]
    fn app_settings_upsert_and_read() {
        let (_dir, db) = test_db();
        db.set_app_setting("transcription.provider", "external").unwrap();
        db.set_app_setting("transcription.provider", "local").unwrap();
        db.set_app_setting("transcription.model", "whisper-1").unwrap();

        let stored = db
            .app_settings(&["transcription.provider", "transcription.model", "absent"])
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored["transcription.provider"].as_deref(), Some("local"));
        assert_eq!(stored["transcription.model"].as_deref(), Some("whisper-1"));
    }
}
