use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Episode, EpisodeStatus, Feed, Keyword, MatchType, MentionDetail};

#[derive(Debug, Deserialize)]
pub struct FeedCreate {
    pub rss_url: String,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub id: Uuid,
    pub rss_url: String,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub episode_count: i64,
}

impl FeedResponse {
    pub fn from_feed(feed: Feed, episode_count: i64) -> Self {
        Self {
            id: feed.id,
            rss_url: feed.rss_url,
            title: feed.title,
            image_url: feed.image_url,
            last_polled_at: feed.last_polled_at,
            created_at: feed.created_at,
            episode_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EpisodeResponse {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub guid: String,
    pub title: Option<String>,
    pub audio_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: EpisodeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub mention_count: i64,
}

impl EpisodeResponse {
    pub fn from_episode(episode: Episode, mention_count: i64) -> Self {
        Self {
            id: episode.id,
            feed_id: episode.feed_id,
            guid: episode.guid,
            title: episode.title,
            audio_url: episode.audio_url,
            published_at: episode.published_at,
            status: episode.status,
            error_message: episode.error_message,
            created_at: episode.created_at,
            mention_count,
        }
    }
}

/// Episode detail additionally exposes the transcript.
#[derive(Debug, Serialize)]
pub struct EpisodeDetailResponse {
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
}

impl From<Episode> for EpisodeDetailResponse {
    fn from(episode: Episode) -> Self {
        Self {
            id: episode.id,
            feed_id: episode.feed_id,
            guid: episode.guid,
            title: episode.title,
            audio_url: episode.audio_url,
            published_at: episode.published_at,
            status: episode.status,
            transcript_text: episode.transcript_text,
            error_message: episode.error_message,
            created_at: episode.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KeywordCreate {
    pub phrase: String,
    // validated by hand so a bad value yields a 422, not a body-parse reject
    pub match_type: String,
}

#[derive(Debug, Serialize)]
pub struct KeywordResponse {
    pub id: Uuid,
    pub phrase: String,
    pub match_type: MatchType,
    pub created_at: DateTime<Utc>,
}

impl From<Keyword> for KeywordResponse {
    fn from(keyword: Keyword) -> Self {
        Self {
            id: keyword.id,
            phrase: keyword.phrase,
            match_type: keyword.match_type,
            created_at: keyword.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MentionQuery {
    pub feed_id: Option<Uuid>,
    pub keyword_id: Option<Uuid>,
    pub sentiment: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MentionResponse {
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
    pub created_at: DateTime<Utc>,
    pub episode_title: Option<String>,
    pub podcast_title: Option<String>,
    pub keyword_phrase: String,
}

impl From<MentionDetail> for MentionResponse {
    fn from(detail: MentionDetail) -> Self {
        let mention = detail.mention;
        Self {
            id: mention.id,
            episode_id: mention.episode_id,
            keyword_id: mention.keyword_id,
            matched_text: mention.matched_text,
            transcript_segment: mention.transcript_segment,
            sentiment: mention.sentiment,
            sentiment_score: mention.sentiment_score,
            context_summary: mention.context_summary,
            topics: mention.topics,
            is_buying_signal: mention.is_buying_signal,
            is_pain_point: mention.is_pain_point,
            is_recommendation: mention.is_recommendation,
            created_at: mention.created_at,
            episode_title: detail.episode_title,
            podcast_title: detail.podcast_title,
            keyword_phrase: detail.keyword_phrase,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub episode_id: Uuid,
}

/// The API key is write-only: responses expose only whether one is stored.
#[derive(Debug, Serialize)]
pub struct TranscriptionSettingsResponse {
    pub provider: &'static str,
    pub external_url: String,
    pub model: String,
    pub has_external_api_key: bool,
}

#[derive(Debug, Deserialize)]
pub struct TranscriptionSettingsUpdate {
    pub provider: String,
    pub external_url: String,
    pub model: String,
    pub external_api_key: Option<String>,
    #[serde(default)]
    pub clear_external_api_key: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}
