/// Task orchestration: submission, scheduling, engine runs, retries.
///
/// One manager owns the queue, the engine runner, and the policy numbers.
/// Route handlers call into it; two background loops (scheduler and progress
/// flush) drive it for the lifetime of the server.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use you_get_web_shared::db;
use you_get_web_shared::engine::{self, EngineContext, EngineEvent};
use you_get_web_shared::errors::{EngineError, WebGuiError};
use you_get_web_shared::models::{
    human_size, human_speed, percent_done, MediaInfo, TaskOptions, TaskRecord, TaskStatus,
};
use you_get_web_shared::task_queue::{QueueStats, TaskQueue, TaskState, TrackedTask};

use crate::config::{Config, COOKIES_FILENAME, DEFAULT_PRIORITY, FLUSH_INTERVAL_SECS};
use crate::eventlog::EventLog;
use crate::links::{self, SubmittedUrl};
use crate::proxy_filter::ProxyFilter;
use crate::workers::youget::{EngineRunner, RunMessage};

/// Finished entries fall out of live tracking after an hour; the database
/// keeps the durable record.
const TRACKED_RETENTION_SECS: i64 = 3600;

/// Options applied to every URL of one submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub output_dir: Option<String>,
    /// None lets the URL shape decide.
    pub playlist: Option<bool>,
    pub stream_id: Option<String>,
    pub extractor_proxy: Option<String>,
    pub use_extractor_proxy: bool,
    pub merge: bool,
    pub priority: Option<i64>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        SubmitOptions {
            output_dir: None,
            playlist: None,
            stream_id: None,
            extractor_proxy: None,
            use_extractor_proxy: false,
            merge: true,
            priority: None,
        }
    }
}

/// Per-URL result of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub url: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    pub detail: String,
}

impl SubmitOutcome {
    fn accepted(url: &str, task_id: i64, detail: &str) -> SubmitOutcome {
        SubmitOutcome {
            url: url.to_string(),
            accepted: true,
            task_id: Some(task_id),
            detail: detail.to_string(),
        }
    }

    fn rejected(url: &str, detail: impl Into<String>) -> SubmitOutcome {
        SubmitOutcome {
            url: url.to_string(),
            accepted: false,
            task_id: None,
            detail: detail.into(),
        }
    }
}

/// Task row merged with live queue state, as the API serves it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: i64,
    pub origin: String,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub filepath: Option<String>,
    pub status: String,
    pub failures: i64,
    pub priority: i64,
    pub total_size: i64,
    pub received: i64,
    pub percent: u8,
    pub size_human: String,
    pub speed_bps: f64,
    pub speed_human: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TaskView {
    /// Live counters win over the row for a running task; everything else
    /// reads from the row.
    fn merge(record: TaskRecord, live: Option<&TrackedTask>) -> TaskView {
        let (received, total_size, speed_bps) = match live {
            Some(t) if t.state == TaskState::Running => (
                t.received.max(record.received),
                if t.total_size > 0 {
                    t.total_size
                } else {
                    record.total_size
                },
                t.speed_bps,
            ),
            _ => (record.received, record.total_size, 0.0),
        };
        let filename = record
            .filepath
            .as_deref()
            .and_then(|p| std::path::Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .or_else(|| record.title.clone());

        TaskView {
            id: record.id,
            origin: record.origin,
            title: record.title,
            filename,
            filepath: record.filepath,
            status: record.status,
            failures: record.failures,
            priority: record.priority,
            total_size,
            received,
            percent: percent_done(received, total_size),
            size_human: human_size(total_size),
            speed_bps,
            speed_human: human_speed(speed_bps),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Single task detail payload: the view plus its decoded options.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: TaskView,
    pub options: TaskOptions,
}

/// Owns download orchestration for the whole server.
pub struct TaskManager {
    pool: SqlitePool,
    queue: TaskQueue,
    runner: EngineRunner,
    events: EventLog,
    proxy: Arc<ProxyFilter>,
    output_dir: PathBuf,
    data_dir: PathBuf,
    debug: bool,
    max_retry: i64,
    auto_proxy: bool,
}

impl TaskManager {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        events: EventLog,
        proxy: Arc<ProxyFilter>,
    ) -> Self {
        Self {
            queue: TaskQueue::new(config.max_tasks),
            runner: EngineRunner::new(config.engine_path.clone()),
            pool,
            events,
            proxy,
            output_dir: config.output_dir.clone(),
            data_dir: config.data_dir.clone(),
            debug: config.debug,
            max_retry: config.max_retry,
            auto_proxy: config.auto_extractor_proxy,
        }
    }

    /// Engine version banner, checked once at startup.
    pub async fn engine_version(&self) -> Result<String, EngineError> {
        self.runner.version().await
    }

    /// Invocation context for a run. The cookie jar is re-checked each time
    /// so one dropped into the data dir later is picked up without a restart.
    fn engine_ctx(&self) -> EngineContext {
        let cookies = self.data_dir.join(COOKIES_FILENAME);
        EngineContext {
            output_dir: self.output_dir.display().to_string(),
            cookies_file: cookies.exists().then(|| cookies.display().to_string()),
            debug: self.debug,
        }
    }

    // ====== SUBMISSION ======

    /// Split pasted text into URLs and queue each one. Origins already
    /// queued or running are rejected; finished origins restart with the
    /// new options.
    pub async fn submit(&self, text: &str, opts: &SubmitOptions) -> Vec<SubmitOutcome> {
        let urls = links::extract_urls(text);
        let mut outcomes = Vec::with_capacity(urls.len());
        for submitted in &urls {
            outcomes.push(self.submit_one(submitted, opts).await);
        }
        outcomes
    }

    async fn submit_one(&self, submitted: &SubmittedUrl, opts: &SubmitOptions) -> SubmitOutcome {
        let origin = submitted.url.as_str();
        let priority = opts.priority.unwrap_or(DEFAULT_PRIORITY);
        let task_opts = self.build_task_options(submitted, opts).await;
        let options_json = match serde_json::to_string(&task_opts) {
            Ok(json) => json,
            Err(e) => return SubmitOutcome::rejected(origin, format!("options: {}", e)),
        };

        let existing = match db::get_task_by_origin(&self.pool, origin).await {
            Ok(row) => row,
            Err(e) => return SubmitOutcome::rejected(origin, format!("database: {}", e)),
        };

        match existing {
            None => {
                let task_id =
                    match db::insert_task(&self.pool, origin, &options_json, priority).await {
                        Ok(id) => id,
                        Err(e) => return SubmitOutcome::rejected(origin, format!("database: {}", e)),
                    };
                self.queue.enqueue(task_id, origin, priority).await;
                self.events
                    .push(format!("Task {} queued: {}", task_id, origin))
                    .await;
                SubmitOutcome::accepted(origin, task_id, "queued")
            }
            Some(row) if matches!(row.status.as_str(), "queued" | "running") => {
                SubmitOutcome::rejected(origin, "already queued")
            }
            Some(row) => {
                // finished one way or another; run again with the fresh options
                if let Err(e) =
                    db::set_task_options(&self.pool, row.id, &options_json, priority).await
                {
                    return SubmitOutcome::rejected(origin, format!("database: {}", e));
                }
                if let Err(e) = db::reset_task(&self.pool, row.id).await {
                    return SubmitOutcome::rejected(origin, format!("database: {}", e));
                }
                self.queue.enqueue(row.id, origin, priority).await;
                self.events
                    .push(format!("Task {} restarted: {}", row.id, origin))
                    .await;
                SubmitOutcome::accepted(origin, row.id, "restarted")
            }
        }
    }

    /// Per-URL options: an explicit extractor proxy wins, then the rule
    /// filter when enabled; the playlist toggle falls back to the URL shape.
    async fn build_task_options(
        &self,
        submitted: &SubmittedUrl,
        opts: &SubmitOptions,
    ) -> TaskOptions {
        let explicit_proxy = if opts.use_extractor_proxy {
            opts.extractor_proxy
                .clone()
                .filter(|p| !p.trim().is_empty())
        } else {
            None
        };
        let extractor_proxy = match explicit_proxy {
            Some(proxy) => Some(proxy),
            None if self.auto_proxy => self.proxy.proxy_for(&submitted.url).await,
            None => None,
        };

        TaskOptions {
            output_dir: opts.output_dir.clone().filter(|d| !d.trim().is_empty()),
            playlist: opts.playlist.unwrap_or(submitted.playlist_hint),
            stream_id: opts.stream_id.clone().filter(|s| !s.trim().is_empty()),
            extractor_proxy,
            merge: opts.merge,
        }
    }

    // ====== MEDIA INFO ======

    /// Run a `--json` probe so the GUI can offer a format picker before
    /// queueing.
    pub async fn probe(
        &self,
        url: &str,
        extractor_proxy: Option<String>,
    ) -> Result<MediaInfo, WebGuiError> {
        let mut opts = TaskOptions::default();
        opts.extractor_proxy = match extractor_proxy.filter(|p| !p.trim().is_empty()) {
            Some(proxy) => Some(proxy),
            None if self.auto_proxy => self.proxy.proxy_for(url).await,
            None => None,
        };

        let ctx = self.engine_ctx();
        let args = engine::probe_args(&ctx, url, &opts);
        let payload = self.runner.probe(&args).await?;
        let info = engine::parse_media_info(url, &payload)?;
        self.events
            .push(format!("Probed {}: {}", url, info.title))
            .await;
        Ok(info)
    }

    // ====== LIFECYCLE ======

    /// Stop a queued or running task. Returns false when there was nothing
    /// to stop.
    pub async fn stop(&self, task_id: i64) -> Result<bool> {
        let killed = self.runner.kill(task_id).await;
        let dequeued = self.queue.stop(task_id).await;
        let row_stopped = db::stop_task(&self.pool, task_id).await?;

        let stopped = killed || dequeued || row_stopped;
        if stopped {
            info!(
                "Task {} stopped (killed: {}, dequeued: {})",
                task_id, killed, dequeued
            );
            self.events.push(format!("Task {} stopped", task_id)).await;
        }
        Ok(stopped)
    }

    /// Reset progress and failure state and put the task back on the queue.
    /// Returns false for unknown ids.
    pub async fn restart(&self, task_id: i64) -> Result<bool> {
        let Some(record) = db::get_task(&self.pool, task_id).await? else {
            return Ok(false);
        };
        self.runner.kill(task_id).await;
        self.queue.stop(task_id).await;
        db::reset_task(&self.pool, task_id).await?;
        self.queue
            .enqueue(task_id, &record.origin, record.priority)
            .await;
        self.events
            .push(format!("Task {} restarted: {}", task_id, record.origin))
            .await;
        Ok(true)
    }

    /// Stop if needed and delete the row. Downloaded files stay on disk.
    pub async fn remove(&self, task_id: i64) -> Result<bool> {
        let Some(record) = db::get_task(&self.pool, task_id).await? else {
            return Ok(false);
        };
        self.runner.kill(task_id).await;
        self.queue.stop(task_id).await;
        db::delete_task(&self.pool, task_id).await?;
        self.queue.forget(task_id).await;
        self.events
            .push(format!("Task {} removed: {}", task_id, record.origin))
            .await;
        Ok(true)
    }

    /// Bulk-delete every row in a finished status.
    pub async fn clear_status(&self, status: TaskStatus) -> Result<u64> {
        let name = status.to_string();
        let rows = db::list_tasks(&self.pool, Some(&name)).await?;
        let cleared = db::clear_tasks_by_status(&self.pool, &name).await?;
        for row in rows {
            self.queue.forget(row.id).await;
        }
        if cleared > 0 {
            self.events
                .push(format!("Cleared {} {} task(s)", cleared, name))
                .await;
        }
        Ok(cleared)
    }

    /// Put unfinished rows back on the queue after a restart. Stopped rows
    /// stay stopped until the user restarts them.
    pub async fn requeue_unfinished(&self) -> Result<usize> {
        let rows = db::load_resumable_tasks(&self.pool, self.max_retry).await?;
        let mut requeued = 0;
        for row in &rows {
            if row.status != "queued" {
                db::requeue_task(&self.pool, row.id).await?;
            }
            if self.queue.enqueue(row.id, &row.origin, row.priority).await {
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!("Requeued {} unfinished task(s)", requeued);
            self.events
                .push(format!("Requeued {} unfinished task(s)", requeued))
                .await;
        }
        Ok(requeued)
    }

    // ====== VIEWS ======

    /// Task listing with live counters merged in.
    pub async fn list_views(&self, status: Option<&str>) -> Result<Vec<TaskView>> {
        let rows = db::list_tasks(&self.pool, status).await?;
        let tracked = self.queue.all_tracked().await;
        Ok(rows
            .into_iter()
            .map(|row| {
                let live = tracked.get(&row.id);
                TaskView::merge(row, live)
            })
            .collect())
    }

    /// One task with its decoded options, or None for unknown ids.
    pub async fn view(&self, task_id: i64) -> Result<Option<TaskDetail>> {
        let Some(record) = db::get_task(&self.pool, task_id).await? else {
            return Ok(None);
        };
        let live = self.queue.get_status(task_id).await;
        let options = record.parsed_options();
        Ok(Some(TaskDetail {
            task: TaskView::merge(record, live.as_ref()),
            options,
        }))
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    // ====== SCHEDULING ======

    /// Scheduler loop: pop ready tasks in priority order, wait for a free
    /// slot, and spawn a run for each. Lives for the whole server.
    pub async fn run_scheduler(self: Arc<Self>) {
        loop {
            while let Some(task_id) = self.queue.next_ready().await {
                if !self.queue.acquire(task_id).await {
                    // stopped or removed while waiting for a slot
                    continue;
                }
                let manager = self.clone();
                tokio::spawn(async move { manager.run_task(task_id).await });
            }
            self.queue.wait_for_work().await;
        }
    }

    /// Drive one engine run to completion and settle the task's fate.
    async fn run_task(self: Arc<Self>, task_id: i64) {
        let record = match db::get_task(&self.pool, task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Task {} vanished before starting", task_id);
                self.queue.forget(task_id).await;
                return;
            }
            Err(e) => {
                warn!("Task {} could not be loaded: {}", task_id, e);
                self.queue.fail(task_id).await;
                return;
            }
        };

        if let Err(e) = db::mark_task_running(&self.pool, task_id).await {
            warn!("Task {} could not be marked running: {}", task_id, e);
        }
        self.events
            .push(format!("Task {} started: {}", task_id, record.origin))
            .await;

        let opts = record.parsed_options();
        let ctx = self.engine_ctx();
        let args = engine::download_args(&ctx, &record.origin, &opts);
        let output_dir = opts.output_dir.clone().unwrap_or_else(|| ctx.output_dir.clone());

        let mut rx = match self.runner.run(task_id, &args).await {
            Ok(rx) => rx,
            Err(e) => {
                self.settle_failure(task_id, &record, e).await;
                return;
            }
        };

        let mut filepath: Option<String> = None;
        let mut has_title = record.title.is_some();

        let outcome = loop {
            match rx.recv().await {
                Some(RunMessage::Event(event)) => {
                    self.apply_event(task_id, event, &output_dir, &mut filepath, &mut has_title)
                        .await;
                }
                Some(RunMessage::Finished(result)) => break result,
                None => break Err(EngineError::SpawnFailed("event channel closed early".into())),
            }
        };

        match outcome {
            Ok(()) => {
                self.queue.complete(task_id).await;
                if let Some(live) = self.queue.get_status(task_id).await {
                    let _ = db::update_task_progress(
                        &self.pool,
                        task_id,
                        live.received,
                        live.total_size,
                    )
                    .await;
                }
                if let Err(e) = db::complete_task(&self.pool, task_id, filepath.as_deref()).await {
                    warn!("Task {} done but not persisted: {}", task_id, e);
                }
                info!("Task {} done: {}", task_id, record.origin);
                self.events
                    .push(format!("Task {} done: {}", task_id, record.origin))
                    .await;
            }
            Err(EngineError::Killed) => {
                // stop() or shutdown already settled this task's fate
                debug!("Task {} run ended by kill", task_id);
            }
            Err(e) => self.settle_failure(task_id, &record, e).await,
        }
    }

    /// Feed one console event into live state and the row.
    async fn apply_event(
        &self,
        task_id: i64,
        event: EngineEvent,
        output_dir: &str,
        filepath: &mut Option<String>,
        has_title: &mut bool,
    ) {
        match event {
            EngineEvent::Progress {
                received,
                total_size,
                ..
            } => {
                self.queue.update_progress(task_id, received, total_size).await;
            }
            EngineEvent::Title { title } => {
                if !*has_title {
                    *has_title = true;
                    if let Err(e) = db::set_task_title(&self.pool, task_id, &title).await {
                        warn!("Task {} title not stored: {}", task_id, e);
                    }
                }
            }
            EngineEvent::Site { name } => {
                debug!("Task {} site: {}", task_id, name);
            }
            EngineEvent::Downloading { filename } | EngineEvent::Skipped { filename } => {
                if filepath.is_none() {
                    let full = join_artifact(output_dir, &filename);
                    if let Err(e) = db::set_task_filepath(&self.pool, task_id, &full).await {
                        warn!("Task {} filepath not stored: {}", task_id, e);
                    }
                    *filepath = Some(full);
                }
            }
            EngineEvent::Merged { filename } => {
                // the merged file supersedes whichever part came first
                let full = join_artifact(output_dir, &filename);
                if let Err(e) = db::set_task_filepath(&self.pool, task_id, &full).await {
                    warn!("Task {} filepath not stored: {}", task_id, e);
                }
                *filepath = Some(full);
            }
            EngineEvent::Raw { line } => {
                debug!(target: "you_get", "task {}: {}", task_id, line);
            }
        }
    }

    /// Count the failure and either requeue within the retry budget or mark
    /// the task error terminally.
    async fn settle_failure(&self, task_id: i64, record: &TaskRecord, err: EngineError) {
        self.queue.fail(task_id).await;
        let failures = match db::fail_task(&self.pool, task_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Task {} failure not persisted: {}", task_id, e);
                self.max_retry
            }
        };

        if err.is_retriable() && failures < self.max_retry {
            warn!(
                "Task {} failed ({}), retry {}/{}",
                task_id, err, failures, self.max_retry
            );
            if let Err(e) = db::requeue_task(&self.pool, task_id).await {
                warn!("Task {} not requeued: {}", task_id, e);
                return;
            }
            self.queue
                .enqueue(task_id, &record.origin, record.priority)
                .await;
            self.events
                .push(format!(
                    "Task {} failed ({}), retrying {}/{}",
                    task_id, err, failures, self.max_retry
                ))
                .await;
        } else {
            warn!("Task {} failed terminally: {}", task_id, err);
            self.events
                .push(format!("Task {} failed: {}", task_id, err))
                .await;
        }
    }

    // ====== PERSISTENCE ======

    /// Flush loop: push live byte counters of running tasks into their rows
    /// every few seconds, and age out old finished entries from tracking.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
        let mut last_flushed: HashMap<i64, i64> = HashMap::new();
        loop {
            interval.tick().await;
            self.flush_progress(&mut last_flushed).await;
            self.queue.cleanup_old(TRACKED_RETENTION_SECS).await;
        }
    }

    /// One flush pass; only rows whose counters moved get written.
    async fn flush_progress(&self, last_flushed: &mut HashMap<i64, i64>) {
        let tracked = self.queue.all_tracked().await;
        for (task_id, live) in &tracked {
            if live.state != TaskState::Running {
                continue;
            }
            if last_flushed.get(task_id) == Some(&live.received) {
                continue;
            }
            match db::update_task_progress(&self.pool, *task_id, live.received, live.total_size)
                .await
            {
                Ok(()) => {
                    last_flushed.insert(*task_id, live.received);
                }
                Err(e) => warn!("Task {} progress not flushed: {}", task_id, e),
            }
        }
        last_flushed.retain(|task_id, _| tracked.contains_key(task_id));
    }

    /// Kill every engine, take a final progress snapshot, and vacuum when
    /// the freelist grew enough to be worth it.
    pub async fn shutdown(&self) {
        info!(
            "Stopping task manager ({} active engine(s))",
            self.runner.active_count().await
        );
        self.runner.kill_all().await;

        let tracked = self.queue.all_tracked().await;
        for (task_id, live) in &tracked {
            if matches!(live.state, TaskState::Running | TaskState::Queued) {
                if let Err(e) =
                    db::update_task_progress(&self.pool, *task_id, live.received, live.total_size)
                        .await
                {
                    warn!("Task {} final flush failed: {}", task_id, e);
                }
            }
        }

        match db::try_vacuum(&self.pool).await {
            Ok(true) => info!("Database vacuumed"),
            Ok(false) => debug!("Vacuum skipped, not worth it yet"),
            Err(e) => warn!("Vacuum failed: {}", e),
        }
    }
}

/// Resolve an artifact name printed by the engine against the run's output
/// directory. Names that are already absolute stay as they are.
fn join_artifact(output_dir: &str, filename: &str) -> String {
    let path = std::path::Path::new(filename);
    if path.is_absolute() {
        filename.to_string()
    } else {
        std::path::Path::new(output_dir)
            .join(filename)
            .display()
            .to_string()
    }
}
