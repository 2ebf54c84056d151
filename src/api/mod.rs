// HTTP JSON API consumed by the UI. Runs on its own thread with its own
// tokio runtime so the synchronous worker core stays unaware of it.
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

pub mod model;

use self::model::{
    AcceptedResponse, ApiError, EpisodeDetailResponse, EpisodeResponse, FeedCreate, FeedResponse,
    KeywordCreate, KeywordResponse, MentionQuery, MentionResponse, TranscriptionSettingsResponse,
    TranscriptionSettingsUpdate,
};
use crate::config::Settings;
use crate::db::{Database, DashboardStats, EpisodeStatus, MatchType, MentionFilter};
use crate::queue::{DetectPayload, QueueHandle, Task};
use crate::transcribe;

pub struct AppState {
    db_path: PathBuf,
    settings: Settings,
    // mpsc senders are not Sync; the mutex makes the handle shareable
    queue: Mutex<QueueHandle>,
}

impl AppState {
    pub fn new(settings: Settings, queue: QueueHandle) -> Self {
        Self {
            db_path: settings.database_path.clone(),
            settings,
            queue: Mutex::new(queue),
        }
    }
}

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<T, ApiFailure>;

fn failure(status: StatusCode, message: impl Into<String>) -> ApiFailure {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

fn internal(err: impl std::fmt::Display) -> ApiFailure {
    failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn open_db(state: &AppState) -> Result<Database, ApiFailure> {
    Database::connect(&state.db_path).map_err(internal)
}

fn enqueue(state: &AppState, task: Task) {
    match state.queue.lock() {
        Ok(queue) => queue.enqueue(task),
        Err(_) => error!("queue handle lock poisoned; dropping task"),
    }
}

// ---- dashboard ----

#[allow(clippy::unused_async)]
async fn dashboard_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<DashboardStats>> {
    let db = open_db(&state)?;
    let stats = db.dashboard_stats().map_err(internal)?;
    Ok(Json(stats))
}

// ---- feeds ----

#[allow(clippy::unused_async)]
async fn list_feeds(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<FeedResponse>>> {
    let db = open_db(&state)?;
    let feeds = db.feeds_with_episode_count().map_err(internal)?;
    Ok(Json(
        feeds
            .into_iter()
            .map(|(feed, count)| FeedResponse::from_feed(feed, count))
            .collect(),
    ))
}

#[allow(clippy::unused_async)]
async fn create_feed(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FeedCreate>,
) -> ApiResult<(StatusCode, Json<FeedResponse>)> {
    let rss_url = payload.rss_url.trim();
    if !rss_url.starts_with("http://") && !rss_url.starts_with("https://") {
        return Err(failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            "rss_url must be an http(s) URL",
        ));
    }

    let db = open_db(&state)?;
    if db.feed_by_url(rss_url).map_err(internal)?.is_some() {
        return Err(failure(StatusCode::CONFLICT, "Feed already exists"));
    }

    let feed = db.insert_feed(rss_url).map_err(internal)?;
    // kick off initial ingestion instead of waiting for the beat window
    enqueue(&state, Task::PollSingleFeed { feed_id: feed.id });

    Ok((StatusCode::CREATED, Json(FeedResponse::from_feed(feed, 0))))
}

#[allow(clippy::unused_async)]
async fn delete_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let db = open_db(&state)?;
    if db.delete_feed(feed_id).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(failure(StatusCode::NOT_FOUND, "Feed not found"))
    }
}

// ---- episodes ----

#[allow(clippy::unused_async)]
async fn list_episodes_by_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<Uuid>,
) -> ApiResult<Json<Vec<EpisodeResponse>>> {
    let db = open_db(&state)?;
    let episodes = db
        .episodes_by_feed_with_mention_count(feed_id)
        .map_err(internal)?;
    Ok(Json(
        episodes
            .into_iter()
            .map(|(episode, count)| EpisodeResponse::from_episode(episode, count))
            .collect(),
    ))
}

#[allow(clippy::unused_async)]
async fn get_episode(
    State(state): State<Arc<AppState>>,
    Path(episode_id): Path<Uuid>,
) -> ApiResult<Json<EpisodeDetailResponse>> {
    let db = open_db(&state)?;
    let episode = db
        .episode_by_id(episode_id)
        .map_err(internal)?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, "Episode not found"))?;
    Ok(Json(episode.into()))
}

/// Full restart of the pipeline for one episode.
#[allow(clippy::unused_async)]
async fn reprocess_episode(
    State(state): State<Arc<AppState>>,
    Path(episode_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let db = open_db(&state)?;
    if db.episode_by_id(episode_id).map_err(internal)?.is_none() {
        return Err(failure(StatusCode::NOT_FOUND, "Episode not found"));
    }

    db.reset_episode(episode_id, EpisodeStatus::Pending)
        .map_err(internal)?;
    enqueue(&state, Task::ProcessEpisode { episode_id });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "reprocessing",
            episode_id,
        }),
    ))
}

/// Re-runs detection and enrichment only; needs a persisted transcript.
#[allow(clippy::unused_async)]
async fn retry_episode_enrichment(
    State(state): State<Arc<AppState>>,
    Path(episode_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let db = open_db(&state)?;
    let episode = db
        .episode_by_id(episode_id)
        .map_err(internal)?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, "Episode not found"))?;
    if episode.transcript_text.is_none() {
        return Err(failure(
            StatusCode::CONFLICT,
            "Cannot retry enrichment without transcript",
        ));
    }

    db.reset_episode(episode_id, EpisodeStatus::Analyzing)
        .map_err(internal)?;
    enqueue(
        &state,
        Task::DetectEpisodeKeywords(DetectPayload {
            episode_id,
            transcription_done: true,
        }),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "retrying_enrichment",
            episode_id,
        }),
    ))
}

// ---- keywords ----

#[allow(clippy::unused_async)]
async fn list_keywords(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<KeywordResponse>>> {
    let db = open_db(&state)?;
    let keywords = db.all_keywords().map_err(internal)?;
    Ok(Json(keywords.into_iter().map(Into::into).collect()))
}

#[allow(clippy::unused_async)]
async fn create_keyword(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<KeywordCreate>,
) -> ApiResult<(StatusCode, Json<KeywordResponse>)> {
    let phrase = payload.phrase.trim();
    if phrase.is_empty() {
        return Err(failure(StatusCode::UNPROCESSABLE_ENTITY, "phrase must not be empty"));
    }
    let Ok(match_type) = MatchType::from_str(&payload.match_type) else {
        return Err(failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            "match_type must be contains, exact_word, or regex",
        ));
    };

    let db = open_db(&state)?;
    if db.keyword_by_phrase(phrase).map_err(internal)?.is_some() {
        return Err(failure(StatusCode::CONFLICT, "Keyword already exists"));
    }

    let keyword = db.insert_keyword(phrase, match_type).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(keyword.into())))
}

#[allow(clippy::unused_async)]
async fn delete_keyword(
    State(state): State<Arc<AppState>>,
    Path(keyword_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let db = open_db(&state)?;
    if db.delete_keyword(keyword_id).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(failure(StatusCode::NOT_FOUND, "Keyword not found"))
    }
}

// ---- mentions ----

#[allow(clippy::unused_async)]
async fn list_mentions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MentionQuery>,
) -> ApiResult<Json<Vec<MentionResponse>>> {
    let db = open_db(&state)?;
    let filter = MentionFilter {
        feed_id: query.feed_id,
        keyword_id: query.keyword_id,
        sentiment: query.sentiment,
        limit: query.limit.unwrap_or(50).min(100),
        offset: query.offset.unwrap_or(0),
    };
    let mentions = db.browse_mentions(&filter).map_err(internal)?;
    Ok(Json(mentions.into_iter().map(Into::into).collect()))
}

#[allow(clippy::unused_async)]
async fn get_mention(
    State(state): State<Arc<AppState>>,
    Path(mention_id): Path<Uuid>,
) -> ApiResult<Json<MentionResponse>> {
    let db = open_db(&state)?;
    let mention = db
        .mention_detail(mention_id)
        .map_err(internal)?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, "Mention not found"))?;
    Ok(Json(mention.into()))
}

// ---- settings ----

#[allow(clippy::unused_async)]
async fn get_transcription_settings(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TranscriptionSettingsResponse>> {
    let db = open_db(&state)?;
    let config = transcribe::runtime_config(&db, &state.settings).map_err(internal)?;
    Ok(Json(TranscriptionSettingsResponse {
        provider: config.provider.as_str(),
        external_url: config.external_url,
        model: config.model,
        has_external_api_key: !config.external_api_key.is_empty(),
    }))
}

#[allow(clippy::unused_async)]
async fn put_transcription_settings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TranscriptionSettingsUpdate>,
) -> ApiResult<Json<TranscriptionSettingsResponse>> {
    if !matches!(payload.provider.as_str(), "local" | "external" | "cloud") {
        return Err(failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            "provider must be local or external",
        ));
    }

    let db = open_db(&state)?;
    let provider = transcribe::Provider::normalize(&payload.provider);
    db.set_app_setting(transcribe::PROVIDER_KEY, provider.as_str())
        .map_err(internal)?;
    db.set_app_setting(transcribe::EXTERNAL_URL_KEY, payload.external_url.trim())
        .map_err(internal)?;
    db.set_app_setting(transcribe::MODEL_KEY, payload.model.trim())
        .map_err(internal)?;

    if payload.clear_external_api_key {
        db.set_app_setting(transcribe::EXTERNAL_API_KEY_KEY, "")
            .map_err(internal)?;
    } else if let Some(api_key) = payload.external_api_key.as_deref() {
        db.set_app_setting(transcribe::EXTERNAL_API_KEY_KEY, api_key)
            .map_err(internal)?;
    }

    let config = transcribe::runtime_config(&db, &state.settings).map_err(internal)?;
    Ok(Json(TranscriptionSettingsResponse {
        provider: config.provider.as_str(),
        external_url: config.external_url,
        model: config.model,
        has_external_api_key: !config.external_api_key.is_empty(),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/dashboard/stats", get(dashboard_stats))
        .route("/api/v1/feeds", get(list_feeds).post(create_feed))
        .route("/api/v1/feeds/:feed_id", delete(delete_feed))
        .route("/api/v1/episodes/by-feed/:feed_id", get(list_episodes_by_feed))
        .route("/api/v1/episodes/:episode_id", get(get_episode))
        .route("/api/v1/episodes/:episode_id/reprocess", post(reprocess_episode))
        .route(
            "/api/v1/episodes/:episode_id/retry-enrichment",
            post(retry_episode_enrichment),
        )
        .route("/api/v1/keywords", get(list_keywords).post(create_keyword))
        .route("/api/v1/keywords/:keyword_id", delete(delete_keyword))
        .route("/api/v1/mentions", get(list_mentions))
        .route("/api/v1/mentions/:mention_id", get(get_mention))
        .route(
            "/api/v1/settings/transcription",
            get(get_transcription_settings).put(put_transcription_settings),
        )
        .with_state(state)
}

/// Serves the API from a dedicated thread with its own tokio runtime, so the
/// synchronous worker core needs no async plumbing of its own.
pub fn run_api_service(settings: &Settings, queue: QueueHandle) -> anyhow::Result<thread::JoinHandle<()>> {
    let addr = SocketAddr::from_str(&settings.api_addr)?;
    let state = Arc::new(AppState::new(settings.clone(), queue));

    let handle = thread::Builder::new()
        .name("api".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("failed to build api runtime: {err}");
                    return;
                }
            };
            runtime.block_on(async {
                info!("api listening on {addr}");
                if let Err(err) = axum::Server::bind(&addr)
                    .serve(router(state).into_make_service())
                    .await
                {
                    error!("api server terminated: {err}");
                }
            });
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewEpisode;
    use crate::queue::Task;
    use crate::tasks::testutil::{recorded, recording_queue, wait_for};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct ApiFixture {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
        queue: Option<crate::queue::JobQueue>,
        handler: Arc<crate::tasks::testutil::RecordingHandler>,
    }

    impl Drop for ApiFixture {
        fn drop(&mut self) {
            if let Some(queue) = self.queue.take() {
                queue.shutdown();
            }
        }
    }

    fn api_fixture() -> ApiFixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database_path = dir.path().join("test.db");
        settings.audio_dir = dir.path().join("audio");
        Database::connect(&settings.database_path).unwrap();

        let (handler, queue) = recording_queue();
        let state = Arc::new(AppState::new(settings, queue.handle()));
        ApiFixture {
            _dir: dir,
            state,
            queue: Some(queue),
            handler,
        }
    }

    fn db(fx: &ApiFixture) -> Database {
        Database::connect(&fx.state.db_path).unwrap()
    }

    #[tokio::test]
    async fn create_feed_returns_201_and_enqueues_poll() {
        let fx = api_fixture();
        let (status, Json(feed)) = create_feed(
            State(fx.state.clone()),
            Json(FeedCreate {
                rss_url: "https://example.com/feed.xml".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(feed.rss_url, "https://example.com/feed.xml");
        assert_eq!(feed.episode_count, 0);
        assert!(wait_for(
            || recorded(&fx.handler).len() == 1,
            Duration::from_secs(2)
        ));
        assert!(matches!(recorded(&fx.handler)[0], Task::PollSingleFeed { .. }));
    }

    #[tokio::test]
    async fn duplicate_feed_is_a_conflict() {
        let fx = api_fixture();
        db(&fx).insert_feed("https://example.com/feed.xml").unwrap();

        let (status, _) = create_feed(
            State(fx.state.clone()),
            Json(FeedCreate {
                rss_url: "https://example.com/feed.xml".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn feed_url_must_be_http() {
        let fx = api_fixture();
        let (status, _) = create_feed(
            State(fx.state.clone()),
            Json(FeedCreate {
                rss_url: "ftp://example.com/feed.xml".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn retry_enrichment_without_transcript_is_409_and_leaves_status() {
        let fx = api_fixture();
        let mut handle = db(&fx);
        let feed = handle.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = handle
            .upsert_episode(&NewEpisode {
                feed_id: feed.id,
                guid: "ep-001".to_string(),
                title: None,
                audio_url: None,
                published_at: None,
            })
            .unwrap();
        handle.mark_episode_failed(episode.id, "llm down").unwrap();

        let (status, _) =
            retry_episode_enrichment(State(fx.state.clone()), Path(episode.id))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        let episode = db(&fx).episode_by_id(episode.id).unwrap().unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(recorded(&fx.handler).is_empty());
    }

    #[tokio::test]
    async fn retry_enrichment_with_transcript_resets_and_enqueues_detection() {
        let fx = api_fixture();
        let mut handle = db(&fx);
        let feed = handle.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = handle
            .upsert_episode(&NewEpisode {
                feed_id: feed.id,
                guid: "ep-001".to_string(),
                title: None,
                audio_url: None,
                published_at: None,
            })
            .unwrap();
        handle.set_episode_transcript(episode.id, "").unwrap();
        handle.mark_episode_failed(episode.id, "llm down").unwrap();

        let (status, Json(body)) =
            retry_episode_enrichment(State(fx.state.clone()), Path(episode.id))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.status, "retrying_enrichment");

        let episode_row = db(&fx).episode_by_id(episode.id).unwrap().unwrap();
        assert_eq!(episode_row.status, EpisodeStatus::Analyzing);
        assert_eq!(episode_row.error_message, None);

        assert!(wait_for(
            || recorded(&fx.handler).len() == 1,
            Duration::from_secs(2)
        ));
        assert_eq!(
            recorded(&fx.handler)[0],
            Task::DetectEpisodeKeywords(DetectPayload {
                episode_id: episode.id,
                transcription_done: true,
            })
        );
    }

    #[tokio::test]
    async fn reprocess_resets_to_pending_and_enqueues_chain() {
        let fx = api_fixture();
        let mut handle = db(&fx);
        let feed = handle.insert_feed("https://example.com/feed.xml").unwrap();
        let (episode, _) = handle
            .upsert_episode(&NewEpisode {
                feed_id: feed.id,
                guid: "ep-001".to_string(),
                title: None,
                audio_url: None,
                published_at: None,
            })
            .unwrap();
        handle.mark_episode_failed(episode.id, "download died").unwrap();

        let (status, _) = reprocess_episode(State(fx.state.clone()), Path(episode.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let episode_row = db(&fx).episode_by_id(episode.id).unwrap().unwrap();
        assert_eq!(episode_row.status, EpisodeStatus::Pending);
        assert_eq!(episode_row.error_message, None);
        assert!(wait_for(
            || recorded(&fx.handler).len() == 1,
            Duration::from_secs(2)
        ));
        assert_eq!(
            recorded(&fx.handler)[0],
            Task::ProcessEpisode { episode_id: episode.id }
        );
    }

    #[tokio::test]
    async fn keyword_validation_and_conflicts() {
        let fx = api_fixture();

        let (status, _) = create_keyword(
            State(fx.state.clone()),
            Json(KeywordCreate {
                phrase: "acme".to_string(),
                match_type: "fuzzy".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, Json(keyword)) = create_keyword(
            State(fx.state.clone()),
            Json(KeywordCreate {
                phrase: "acme".to_string(),
                match_type: "exact_word".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(keyword.match_type, MatchType::ExactWord);

        let (status, _) = create_keyword(
            State(fx.state.clone()),
            Json(KeywordCreate {
                phrase: "acme".to_string(),
                match_type: "contains".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn transcription_settings_roundtrip_hides_the_key() {
        let fx = api_fixture();

        let Json(initial) = get_transcription_settings(State(fx.state.clone())).await.unwrap();
        assert_eq!(initial.provider, "local");
        assert!(!initial.has_external_api_key);

        let Json(updated) = put_transcription_settings(
            State(fx.state.clone()),
            Json(TranscriptionSettingsUpdate {
                provider: "external".to_string(),
                external_url: "https://stt.example.com/v1/audio/transcriptions".to_string(),
                model: "whisper-1".to_string(),
                external_api_key: Some("sk-secret".to_string()),
                clear_external_api_key: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.provider, "external");
        assert!(updated.has_external_api_key);

        // the key itself never appears in a response; clearing works
        let Json(cleared) = put_transcription_settings(
            State(fx.state.clone()),
            Json(TranscriptionSettingsUpdate {
                provider: "external".to_string(),
                external_url: "https://stt.example.com/v1/audio/transcriptions".to_string(),
                model: "whisper-1".to_string(),
                external_api_key: None,
                clear_external_api_key: true,
            }),
        )
        .await
        .unwrap();
        assert!(!cleared.has_external_api_key);
    }

    #[tokio::test]
    async fn unknown_episode_detail_is_404() {
        let fx = api_fixture();
        let (status, _) = get_episode(State(fx.state.clone()), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
