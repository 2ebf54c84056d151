//! Queue task handlers: the feed poller and the episode processing pipeline.

pub mod poll;
pub mod process;

use crate::config::Settings;
use crate::db::Database;
use crate::error::{TaskError, TaskResult};
use crate::queue::{Task, TaskContext, TaskHandler};

/// The worker-side task dispatcher. Each invocation opens its own short-lived
/// database connection.
pub struct Runner {
    pub settings: Settings,
}

impl Runner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn db(&self) -> Result<Database, TaskError> {
        Database::connect(&self.settings.database_path).map_err(TaskError::from)
    }
}

impl TaskHandler for Runner {
    fn run(&self, task: &Task, ctx: &TaskContext) -> TaskResult {
        match task {
            Task::PollAllFeeds => poll::poll_all_feeds(self, ctx),
            Task::PollSingleFeed { feed_id } => poll::poll_single_feed(self, ctx, *feed_id),
            Task::ProcessEpisode { episode_id } => process::process_episode(ctx, *episode_id),
            Task::DownloadEpisodeAudio { episode_id } => {
                process::download_episode_audio(self, ctx, *episode_id)
            }
            Task::TranscribeEpisodeAudio { episode_id } => {
                process::transcribe_episode_audio(self, ctx, *episode_id)
            }
            Task::DetectEpisodeKeywords(payload) => {
                process::detect_episode_keywords(self, ctx, payload)
            }
            Task::EnrichEpisodeMentions(payload) => {
                process::enrich_episode_mentions(self, ctx, payload)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::queue::{JobQueue, QueueConfig, QUEUE_NAMES};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Records every task routed through a real queue without executing any
    /// pipeline logic; lets handler tests assert what got enqueued.
    pub(crate) struct RecordingHandler {
        pub calls: Mutex<Vec<Task>>,
    }

    impl TaskHandler for RecordingHandler {
        fn run(&self, task: &Task, _ctx: &TaskContext) -> TaskResult {
            self.calls.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    pub(crate) fn recording_queue() -> (Arc<RecordingHandler>, JobQueue) {
        let handler = Arc::new(RecordingHandler {
            calls: Mutex::new(Vec::new()),
        });
        let config = QueueConfig {
            queues: QUEUE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            workers_per_queue: 1,
            transcription_tasks_per_minute: 6000,
        };
        let queue = JobQueue::start(handler.clone(), &config);
        (handler, queue)
    }

    pub(crate) fn context_for(queue: &JobQueue, retries: u32, max_retries: u32) -> TaskContext {
        TaskContext {
            retries,
            max_retries,
            queue: queue.handle(),
        }
    }

    pub(crate) fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    pub(crate) fn recorded(handler: &RecordingHandler) -> Vec<Task> {
        handler.calls.lock().unwrap().clone()
    }
}
