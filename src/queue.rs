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
// In-process task broker: named queues with their own worker threads, delayed
// retries and a per-task token bucket. Delivery is at-least-once; handlers
// are keyed by episode id and must stay idempotent.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::Settings;
use crate::detect::KeywordMatch;
use crate::error::{TaskError, TaskResult};

pub const QUEUE_NAMES: [&str; 6] = [
    "poll",
    "process",
    "download",
    "transcription",
    "keywords",
    "llm",
];

/// How long the dispatcher sleeps when nothing is scheduled.
const DISPATCH_IDLE: Duration = Duration::from_secs(60);

/// Handoff payload for keyword detection. Manual re-triggers set
/// `transcription_done` to true themselves.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DetectPayload {
    pub episode_id: Uuid,
    pub transcription_done: bool,
}

/// Handoff payload for mention enrichment. `start_index` is the durable
/// cursor carried across retries so persisted mentions are not re-enriched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichPayload {
    pub episode_id: Uuid,
    pub matches: Vec<KeywordMatch>,
    pub start_index: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    PollAllFeeds,
    PollSingleFeed { feed_id: Uuid },
    ProcessEpisode { episode_id: Uuid },
    DownloadEpisodeAudio { episode_id: Uuid },
    TranscribeEpisodeAudio { episode_id: Uuid },
    DetectEpisodeKeywords(DetectPayload),
    EnrichEpisodeMentions(EnrichPayload),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PollAllFeeds => "poll_all_feeds",
            Self::PollSingleFeed { .. } => "poll_single_feed",
            Self::ProcessEpisode { .. } => "process_episode",
            Self::DownloadEpisodeAudio { .. } => "download_episode_audio",
            Self::TranscribeEpisodeAudio { .. } => "transcribe_episode_audio",
            Self::DetectEpisodeKeywords(_) => "detect_episode_keywords",
            Self::EnrichEpisodeMentions(_) => "enrich_episode_mentions",
        }
    }

    /// Routing keeps the slow and rate-limited stages away from the fast ones.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::PollAllFeeds | Self::PollSingleFeed { .. } => "poll",
            Self::ProcessEpisode { .. } => "process",
            Self::DownloadEpisodeAudio { .. } => "download",
            Self::TranscribeEpisodeAudio { .. } => "transcription",
            Self::DetectEpisodeKeywords(_) => "keywords",
            Self::EnrichEpisodeMentions(_) => "llm",
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::PollAllFeeds | Self::ProcessEpisode { .. } => 0,
            Self::PollSingleFeed { .. } => 3,
            Self::DownloadEpisodeAudio { .. }
            | Self::TranscribeEpisodeAudio { .. }
            | Self::DetectEpisodeKeywords(_)
            | Self::EnrichEpisodeMentions(_) => 2,
        }
    }
}

#[derive(Clone, Debug)]
struct Job {
    task: Task,
    retries: u32,
    eta: Instant,
}

/// Context a handler sees for one invocation.
pub struct TaskContext {
    pub retries: u32,
    pub max_retries: u32,
    pub queue: QueueHandle,
}

pub trait TaskHandler: Send + Sync + 'static {
    fn run(&self, task: &Task, ctx: &TaskContext) -> TaskResult;
}

enum Message {
    Job(Job),
    Shutdown,
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<Message>,
}

impl QueueHandle {
    pub fn enqueue(&self, task: Task) {
        self.enqueue_in(task, Duration::ZERO);
    }

    pub fn enqueue_in(&self, task: Task, delay: Duration) {
        self.submit(task, 0, delay);
    }

    fn submit(&self, task: Task, retries: u32, delay: Duration) -> bool {
        let name = task.name();
        let job = Job {
            task,
            retries,
            eta: Instant::now() + delay,
        };
        if self.tx.send(Message::Job(job)).is_err() {
            warn!("job queue is shut down; dropping task {name}");
            return false;
        }
        true
    }
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Queue names this process consumes; tasks routed elsewhere are dropped.
    pub queues: Vec<String>,
    pub workers_per_queue: usize,
    pub transcription_tasks_per_minute: u32,
}

impl QueueConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            queues: settings.worker_queues.clone(),
            workers_per_queue: settings.workers_per_queue,
            transcription_tasks_per_minute: settings.transcription_tasks_per_minute,
        }
    }
}

pub struct JobQueue {
    handle: QueueHandle,
    threads: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Spawns one dispatcher thread plus `workers_per_queue` workers for each
    /// subscribed queue.
    pub fn start(handler: Arc<dyn TaskHandler>, config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let handle = QueueHandle { tx };

        let mut rate_limits: HashMap<&'static str, Arc<TokenBucket>> = HashMap::new();
        rate_limits.insert(
            "transcribe_episode_audio",
            Arc::new(TokenBucket::per_minute(config.transcription_tasks_per_minute)),
        );
        let rate_limits = Arc::new(rate_limits);

        let mut threads = Vec::new();
        let mut queues: HashMap<&'static str, Sender<Job>> = HashMap::new();

        for name in QUEUE_NAMES {
            if !config.queues.iter().any(|q| q == name) {
                continue;
            }
            let (queue_tx, queue_rx) = mpsc::channel::<Job>();
            let queue_rx = Arc::new(Mutex::new(queue_rx));
            for n in 0..config.workers_per_queue.max(1) {
                let worker = Worker {
                    queue: name,
                    receiver: Arc::clone(&queue_rx),
                    handler: Arc::clone(&handler),
                    handle: handle.clone(),
                    rate_limits: Arc::clone(&rate_limits),
                };
                let thread = thread::Builder::new()
                    .name(format!("worker-{name}-{n}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread");
                threads.push(thread);
            }
            queues.insert(name, queue_tx);
        }

        let dispatcher = Dispatcher {
            rx,
            queues,
            delayed: BinaryHeap::new(),
            seq: 0,
        };
        let thread = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn dispatcher thread");
        threads.push(thread);

        Self { handle, threads }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Stops the dispatcher; workers drain their channels and exit. Pending
    /// delayed jobs are discarded (the broker is in-memory; the beat and the
    /// stored episode statuses recover the work on next start).
    pub fn shutdown(self) {
        let _ = self.handle.tx.send(Message::Shutdown);
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Enqueues `poll_all_feeds` on a fixed interval.
pub fn start_beat(handle: QueueHandle, interval: Duration) -> JoinHandle<()> {
    thread::Builder::new()
        .name("beat".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if !handle.submit(Task::PollAllFeeds, 0, Duration::ZERO) {
                break;
            }
        })
        .expect("failed to spawn beat thread")
}

struct DelayedJob {
    eta: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.eta == other.eta && self.seq == other.seq
    }
}
impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest eta first.
impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .eta
            .cmp(&self.eta)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Dispatcher {
    rx: Receiver<Message>,
    queues: HashMap<&'static str, Sender<Job>>,
    delayed: BinaryHeap<DelayedJob>,
    seq: u64,
}

impl Dispatcher {
    fn run(mut self) {
        loop {
            let timeout = self
                .delayed
                .peek()
                .map(|d| d.eta.saturating_duration_since(Instant::now()))
                .unwrap_or(DISPATCH_IDLE);

            match self.rx.recv_timeout(timeout) {
                Ok(Message::Job(job)) => {
                    if job.eta <= Instant::now() {
                        self.route(job);
                    } else {
                        self.seq += 1;
                        self.delayed.push(DelayedJob {
                            eta: job.eta,
                            seq: self.seq,
                            job,
                        });
                    }
                }
                Ok(Message::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while self
                .delayed
                .peek()
                .map_or(false, |d| d.eta <= Instant::now())
            {
                let due = self.delayed.pop().expect("peeked job vanished").job;
                self.route(due);
            }
        }
    }

    fn route(&self, job: Job) {
        let queue = job.task.queue();
        match self.queues.get(queue) {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!("workers for queue '{queue}' are gone");
                }
            }
            None => warn!(
                "no worker subscribed to queue '{queue}'; dropping task {}",
                job.task.name()
            ),
        }
    }
}

struct Worker {
    queue: &'static str,
    receiver: Arc<Mutex<Receiver<Job>>>,
    handler: Arc<dyn TaskHandler>,
    handle: QueueHandle,
    rate_limits: Arc<HashMap<&'static str, Arc<TokenBucket>>>,
}

impl Worker {
    fn run(self) {
        loop {
            let job = self
                .receiver
                .lock()
                .expect("worker queue lock poisoned")
                .recv();
            let Ok(job) = job else {
                break;
            };

            if let Some(bucket) = self.rate_limits.get(job.task.name()) {
                bucket.acquire();
            }

            let max_retries = job.task.max_retries();
            let ctx = TaskContext {
                retries: job.retries,
                max_retries,
                queue: self.handle.clone(),
            };

            match self.handler.run(&job.task, &ctx) {
                Ok(()) => {}
                Err(TaskError::Retry {
                    countdown,
                    replacement,
                    reason,
                }) => {
                    if job.retries < max_retries {
                        let task = replacement.unwrap_or_else(|| job.task.clone());
                        warn!(
                            "[{}] task {} retrying in {:.0}s ({}/{}): {reason}",
                            self.queue,
                            task.name(),
                            countdown.as_secs_f64(),
                            job.retries + 1,
                            max_retries
                        );
                        self.handle.submit(task, job.retries + 1, countdown);
                    } else {
                        error!(
                            "[{}] task {} gave up after {} retries: {reason}",
                            self.queue,
                            job.task.name(),
                            max_retries
                        );
                    }
                }
                Err(TaskError::Fatal(err)) => {
                    error!("[{}] task {} failed: {err:#}", self.queue, job.task.name());
                }
            }
        }
        info!("worker for queue '{}' stopped", self.queue);
    }
}

/// Token bucket keyed by task name. `acquire` blocks the calling worker until
/// a token is available, which throttles the queue globally across its
/// workers.
pub struct TokenBucket {
    rate_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(events: u32) -> Self {
        Self {
            rate_per_sec: f64::from(events.max(1)) / 60.0,
            state: Mutex::new(BucketState {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn acquire(&self) {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(1.0);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return;
        }

        let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec);
        thread::sleep(wait);
        state.last_refill = Instant::now();
        state.tokens = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Behavior = Box<dyn Fn(&Task, &TaskContext, usize) -> TaskResult + Send + Sync>;

    struct ScriptedHandler {
        calls: Mutex<Vec<(Task, u32, Instant)>>,
        behavior: Behavior,
    }

    impl ScriptedHandler {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                behavior,
            })
        }

        fn calls(&self) -> Vec<(Task, u32, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskHandler for ScriptedHandler {
        fn run(&self, task: &Task, ctx: &TaskContext) -> TaskResult {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((task.clone(), ctx.retries, Instant::now()));
                calls.len() - 1
            };
            (self.behavior)(task, ctx, index)
        }
    }

    fn all_queues_config() -> QueueConfig {
        QueueConfig {
            queues: QUEUE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            workers_per_queue: 1,
            transcription_tasks_per_minute: 6000,
        }
    }

    fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn task_routing_table() {
        let feed_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let cases = [
            (Task::PollAllFeeds, "poll_all_feeds", "poll", 0),
            (Task::PollSingleFeed { feed_id }, "poll_single_feed", "poll", 3),
            (Task::ProcessEpisode { episode_id }, "process_episode", "process", 0),
            (
                Task::DownloadEpisodeAudio { episode_id },
                "download_episode_audio",
                "download",
                2,
            ),
            (
                Task::TranscribeEpisodeAudio { episode_id },
                "transcribe_episode_audio",
                "transcription",
                2,
            ),
            (
                Task::DetectEpisodeKeywords(DetectPayload {
                    episode_id,
                    transcription_done: true,
                }),
                "detect_episode_keywords",
                "keywords",
                2,
            ),
            (
                Task::EnrichEpisodeMentions(EnrichPayload {
                    episode_id,
                    matches: Vec::new(),
                    start_index: 0,
                }),
                "enrich_episode_mentions",
                "llm",
                2,
            ),
        ];
        for (task, name, queue, max_retries) in cases {
            assert_eq!(task.name(), name);
            assert_eq!(task.queue(), queue);
            assert_eq!(task.max_retries(), max_retries);
        }
    }

    #[test]
    fn runs_an_enqueued_task() {
        let handler = ScriptedHandler::new(Box::new(|_, _, _| Ok(())));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        queue.handle().enqueue(Task::PollAllFeeds);
        assert!(wait_for(|| handler.calls().len() == 1, Duration::from_secs(2)));
        queue.shutdown();

        let calls = handler.calls();
        assert_eq!(calls[0].0, Task::PollAllFeeds);
        assert_eq!(calls[0].1, 0);
    }

    #[test]
    fn retry_is_delayed_and_counts_attempts() {
        let handler = ScriptedHandler::new(Box::new(|_, _, index| {
            if index == 0 {
                Err(TaskError::Retry {
                    countdown: Duration::from_millis(60),
                    replacement: None,
                    reason: "not yet".to_string(),
                })
            } else {
                Ok(())
            }
        }));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        queue
            .handle()
            .enqueue(Task::PollSingleFeed { feed_id: Uuid::new_v4() });
        assert!(wait_for(|| handler.calls().len() == 2, Duration::from_secs(2)));
        queue.shutdown();

        let calls = handler.calls();
        assert_eq!(calls[0].1, 0);
        assert_eq!(calls[1].1, 1);
        assert!(calls[1].2.duration_since(calls[0].2) >= Duration::from_millis(60));
    }

    #[test]
    fn retries_stop_at_the_per_task_limit() {
        let handler = ScriptedHandler::new(Box::new(|_, _, _| {
            Err(TaskError::retry_in(0, "always failing"))
        }));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        // download_episode_audio allows 2 retries: 3 invocations total
        queue
            .handle()
            .enqueue(Task::DownloadEpisodeAudio { episode_id: Uuid::new_v4() });
        assert!(wait_for(|| handler.calls().len() == 3, Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handler.calls().len(), 3);
        queue.shutdown();
    }

    #[test]
    fn retry_replacement_payload_is_used() {
        let episode_id = Uuid::new_v4();
        let handler = ScriptedHandler::new(Box::new(move |task, _, index| {
            if index == 0 {
                let Task::EnrichEpisodeMentions(payload) = task else {
                    panic!("unexpected task");
                };
                let mut advanced = payload.clone();
                advanced.start_index = 2;
                Err(TaskError::retry_with(
                    Duration::from_millis(10),
                    Task::EnrichEpisodeMentions(advanced),
                    "failed at match 2",
                ))
            } else {
                Ok(())
            }
        }));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        queue.handle().enqueue(Task::EnrichEpisodeMentions(EnrichPayload {
            episode_id,
            matches: Vec::new(),
            start_index: 0,
        }));
        assert!(wait_for(|| handler.calls().len() == 2, Duration::from_secs(2)));
        queue.shutdown();

        let calls = handler.calls();
        let Task::EnrichEpisodeMentions(second) = &calls[1].0 else {
            panic!("unexpected task on retry");
        };
        assert_eq!(second.start_index, 2);
        assert_eq!(second.episode_id, episode_id);
    }

    #[test]
    fn enqueue_in_defers_execution() {
        let handler = ScriptedHandler::new(Box::new(|_, _, _| Ok(())));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        let enqueued_at = Instant::now();
        queue
            .handle()
            .enqueue_in(Task::PollAllFeeds, Duration::from_millis(80));
        assert!(wait_for(|| handler.calls().len() == 1, Duration::from_secs(2)));
        queue.shutdown();

        let ran_at = handler.calls()[0].2;
        assert!(ran_at.duration_since(enqueued_at) >= Duration::from_millis(80));
    }

    #[test]
    fn unsubscribed_queue_drops_the_task() {
        let handler = ScriptedHandler::new(Box::new(|_, _, _| Ok(())));
        let config = QueueConfig {
            queues: vec!["poll".to_string()],
            workers_per_queue: 1,
            transcription_tasks_per_minute: 6000,
        };
        let queue = JobQueue::start(handler.clone(), &config);

        queue
            .handle()
            .enqueue(Task::DownloadEpisodeAudio { episode_id: Uuid::new_v4() });
        queue.handle().enqueue(Task::PollAllFeeds);
        assert!(wait_for(|| handler.calls().len() == 1, Duration::from_secs(2)));
        queue.shutdown();

        assert_eq!(handler.calls()[0].0, Task::PollAllFeeds);
    }

    #[test]
    fn token_bucket_spaces_out_acquisitions() {
        // 1200/min = one token every 50ms
        let bucket = TokenBucket::per_minute(1200);
        let start = Instant::now();
        bucket.acquire();
        bucket.acquire();
        bucket.acquire();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn beat_enqueues_poll_all_feeds() {
        let handler = ScriptedHandler::new(Box::new(|_, _, _| Ok(())));
        let queue = JobQueue::start(handler.clone(), &all_queues_config());

        let beat = start_beat(queue.handle(), Duration::from_millis(30));
        assert!(wait_for(
            || handler.calls().len() >= 2,
            Duration::from_secs(2)
        ));
        queue.shutdown();
        let _ = beat.join();

        assert!(handler
            .calls()
            .iter()
            .all(|(task, _, _)| *task == Task::PollAllFeeds));
    }
}
