//! Polling scheduler and per-tuple pipeline
//!
//! The scheduler enumerates active `(component, branch)` tuples, enforces
//! per-tuple cadence and a global concurrency cap, and drives each eligible
//! tuple through the pipeline: probe → download → extract → history append →
//! prune. Distinct tuples interleave freely; within a tuple the pipeline is
//! strictly ordered under a per-tuple lock held for its whole duration.
//!
//! Failures never escape a tuple: every error lands in the tracking row and
//! the activity log, and the scheduler moves on. The only scheduler-level
//! faults are database unavailability (retried once, then the tick is
//! skipped or the single cycle aborts) and startup configuration errors.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::activity::ActivityLog;
use crate::clock::Clock;
use crate::download::DownloadManager;
use crate::error::{
    DownloadError, ExtractError, ProbeError, SettingsError, SourceError, StoreError, WincoreError,
};
use crate::extract::ExtractionManager;
use crate::jfrog::{ArtifactSource, Discovery, RetryPolicy, build_artifact_url};
use crate::layout::ComponentLayout;
use crate::retention::RetentionManager;
use crate::settings::Settings;
use crate::store::{NewHistoryEntry, Store};
use crate::types::{LogLevel, Operation, PollTuple, StepStatus, TupleKey};

/// Cadence of the continuous-mode tick loop.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for in-flight pipelines before cancelling them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// After cancellation, how long pipelines get to clean up partial state.
const CANCEL_DRAIN: Duration = Duration::from_secs(10);

/// A tuple whose lock cannot be had within this window is skipped this tick.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before the single database retry.
const DB_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Internal queue bound as a multiple of the concurrency cap; tuples beyond
/// it are deferred to the next tick.
const BACKPRESSURE_FACTOR: usize = 10;

/// Aggregate counts for one polling cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleReport {
    pub probed: usize,
    pub new_builds: usize,
    pub downloaded: usize,
    pub extracted: usize,
    pub failed: usize,
    pub pruned: usize,
}

impl CycleReport {
    fn absorb(&mut self, outcome: &TupleOutcome) {
        if outcome.skipped {
            return;
        }
        self.probed += 1;
        if outcome.new_build {
            self.new_builds += 1;
        }
        if outcome.downloaded {
            self.downloaded += 1;
        }
        if outcome.extracted {
            self.extracted += 1;
        }
        if outcome.failed {
            self.failed += 1;
        }
        self.pruned += outcome.pruned;
    }
}

/// What happened to one tuple this cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleOutcome {
    pub new_build: bool,
    pub downloaded: bool,
    pub extracted: bool,
    pub pruned: usize,
    pub failed: bool,
    /// The tuple was not processed (lock busy); it does not count as probed.
    pub skipped: bool,
}

/// Settings snapshot taken at the start of a pipeline run, with per-tuple
/// overrides applied.
struct PipelineParams {
    base_url: Url,
    base_drive: PathBuf,
    retry: RetryPolicy,
    keep: u32,
    lookback_days: u32,
    download_timeout: Duration,
    extraction_timeout: Duration,
}

/// The managers and shared state one pipeline run needs.
pub struct Engine {
    pub store: Arc<Store>,
    pub settings: Arc<Settings>,
    pub source: Arc<dyn ArtifactSource>,
    pub clock: Arc<dyn Clock>,
    pub activity: Arc<ActivityLog>,
    download: DownloadManager,
    extract: ExtractionManager,
    retention: RetentionManager,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        settings: Arc<Settings>,
        source: Arc<dyn ArtifactSource>,
        clock: Arc<dyn Clock>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            download: DownloadManager::new(Arc::clone(&source)),
            extract: ExtractionManager::new(),
            retention: RetentionManager::new(Arc::clone(&store)),
            store,
            settings,
            source,
            clock,
            activity,
        }
    }

    fn params_for(&self, tuple: &PollTuple) -> Result<PipelineParams, SettingsError> {
        let raw_url = self.settings.jfrog_base_url()?;
        let base_url = Url::parse(&raw_url).map_err(|_| SettingsError::InvalidValue {
            key: crate::settings::keys::JFROG_BASE_URL.to_string(),
            value: raw_url,
        })?;
        let attempts = match tuple.polling.retry_attempts {
            Some(n) => n,
            None => self.settings.retry_attempts()?,
        };
        let download_timeout = match tuple.polling.download_timeout_seconds {
            Some(s) => Duration::from_secs(s),
            None => self.settings.download_timeout()?,
        };
        let extraction_timeout = match tuple.polling.extraction_timeout_seconds {
            Some(s) => Duration::from_secs(s),
            None => self.settings.extraction_timeout()?,
        };
        Ok(PipelineParams {
            base_url,
            base_drive: self.settings.base_drive()?,
            retry: RetryPolicy::with_attempts(attempts),
            keep: self.settings.max_builds_to_keep()?,
            lookback_days: self.settings.max_lookback_days()?,
            download_timeout,
            extraction_timeout,
        })
    }

    /// Run one store verb, retrying once on failure. A second failure is a
    /// scheduler-level fault and escalates to CRITICAL at the call site.
    async fn retry_store<T>(
        &self,
        op: impl Fn(&Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match op(&self.store) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, "store operation failed, retrying once");
                tokio::time::sleep(DB_RETRY_DELAY).await;
                op(&self.store)
            }
        }
    }

    fn db_fault(&self, key: TupleKey, err: &StoreError) {
        self.activity
            .entry(LogLevel::Critical)
            .tuple(key)
            .emit(format!("database error: {err}"));
    }

    /// The per-tuple pipeline. Caller must hold the tuple lock.
    async fn poll_tuple(&self, tuple: &PollTuple, cancel: &CancellationToken) -> TupleOutcome {
        let key = tuple.key();
        let mut out = TupleOutcome::default();

        let params = match self.params_for(tuple) {
            Ok(params) => params,
            Err(err) => {
                self.activity
                    .entry(LogLevel::Error)
                    .op(Operation::Poll)
                    .tuple(key)
                    .emit(format!("configuration error: {err}"));
                out.failed = true;
                return out;
            }
        };

        let tracked = match self.retry_store(|s| s.tracking(key)).await {
            Ok(tracked) => tracked,
            Err(err) => {
                self.db_fault(key, &err);
                out.failed = true;
                return out;
            }
        };
        let hint = tracked.as_ref().map(|t| t.coordinate);

        let probe_started = Instant::now();
        let discovery = Discovery {
            source: self.source.as_ref(),
            clock: self.clock.as_ref(),
            lookback_days: params.lookback_days,
            retry: params.retry,
        };
        let probed = discovery
            .latest_for(
                &params.base_url,
                &tuple.component,
                &tuple.branch.name,
                hint,
                cancel,
            )
            .await;
        let probe_elapsed = probe_started.elapsed();

        let found = match probed {
            Ok(found) => found,
            Err(err) => {
                let message = probe_failure_message(&err);
                self.activity
                    .entry(LogLevel::Error)
                    .op(Operation::Poll)
                    .tuple(key)
                    .duration(probe_elapsed)
                    .emit(message.clone());
                if tracked.is_some() {
                    if let Err(db_err) = self
                        .retry_store(|s| s.record_probe_error(key, &message, self.clock.now()))
                        .await
                    {
                        self.db_fault(key, &db_err);
                    }
                }
                out.failed = true;
                return out;
            }
        };

        // A coordinate equal to the tracked one is still actionable when a
        // previous attempt at it never completed; otherwise a failed
        // download would wedge the tuple until the next upstream build.
        let is_new = match (&found, &tracked) {
            (Some(coord), Some(t)) => {
                *coord > t.coordinate
                    || (*coord == t.coordinate
                        && (t.download_status != StepStatus::Completed
                            || t.extraction_status != StepStatus::Completed))
            }
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !is_new {
            self.activity
                .entry(LogLevel::Debug)
                .op(Operation::Poll)
                .tuple(key)
                .duration(probe_elapsed)
                .emit(match found {
                    Some(coord) => format!("no new build (latest {coord})"),
                    None => "no build found within lookback".to_string(),
                });
            if tracked.is_some() {
                if let Err(err) = self
                    .retry_store(|s| s.touch_checked(key, self.clock.now()))
                    .await
                {
                    self.db_fault(key, &err);
                    out.failed = true;
                }
            }
            return out;
        }

        // Unwrap is safe by construction of is_new, but stay explicit.
        let Some(coord) = found else { return out };
        out.new_build = true;
        self.activity
            .entry(LogLevel::Info)
            .op(Operation::Poll)
            .tuple(key)
            .coordinate(&coord)
            .duration(probe_elapsed)
            .emit("new build discovered");

        let url = match build_artifact_url(
            &params.base_url,
            &tuple.component,
            &tuple.branch.name,
            &coord,
        ) {
            Ok(url) => url,
            Err(err) => {
                self.activity
                    .entry(LogLevel::Error)
                    .op(Operation::Poll)
                    .tuple(key)
                    .emit(format!("configuration error: {err}"));
                out.failed = true;
                return out;
            }
        };

        if let Err(err) = self
            .retry_store(|s| s.begin_download(key, &coord, url.as_str(), self.clock.now()))
            .await
        {
            self.db_fault(key, &err);
            out.failed = true;
            return out;
        }

        let layout = ComponentLayout::new(
            &params.base_drive,
            &tuple.component.guid,
            &tuple.component.name,
        );

        let download_started = Instant::now();
        let downloaded = self
            .download
            .download(&layout, &url, &coord, params.download_timeout, cancel)
            .await;
        let download_elapsed = download_started.elapsed();

        let artifact = match downloaded {
            Ok(artifact) => artifact,
            Err(err) => {
                let message = download_failure_message(&err);
                if let Err(db_err) = self.retry_store(|s| s.fail_download(key, &message)).await {
                    self.db_fault(key, &db_err);
                }
                self.activity
                    .entry(LogLevel::Error)
                    .op(Operation::Download)
                    .tuple(key)
                    .coordinate(&coord)
                    .duration(download_elapsed)
                    .emit(message);
                out.failed = true;
                return out;
            }
        };

        let downloaded_at = self.clock.now();
        let download_path = artifact.history_copy.to_string_lossy().into_owned();
        if let Err(err) = self
            .retry_store(|s| {
                s.complete_download(
                    key,
                    &download_path,
                    artifact.file_size,
                    &artifact.checksum,
                    downloaded_at,
                )
            })
            .await
        {
            self.db_fault(key, &err);
            out.failed = true;
            return out;
        }
        out.downloaded = true;
        self.activity
            .entry(LogLevel::Info)
            .op(Operation::Download)
            .tuple(key)
            .coordinate(&coord)
            .duration(download_elapsed)
            .emit(format!("downloaded {} bytes", artifact.file_size));

        let target = layout.extraction_dir(&coord);
        let extraction_started = Instant::now();
        let extracted = self
            .extract
            .extract(
                &artifact.archive_path,
                &target,
                params.extraction_timeout,
                cancel,
            )
            .await;
        let extraction_elapsed = extraction_started.elapsed();

        let extraction_path = match extracted {
            Ok(path) => path,
            Err(err) => {
                let message = extract_failure_message(&err);
                if let Err(db_err) = self.retry_store(|s| s.fail_extraction(key, &message)).await {
                    self.db_fault(key, &db_err);
                }
                self.activity
                    .entry(LogLevel::Error)
                    .op(Operation::Extraction)
                    .tuple(key)
                    .coordinate(&coord)
                    .duration(extraction_elapsed)
                    .emit(message);
                out.failed = true;
                return out;
            }
        };

        let extracted_at = self.clock.now();
        let extraction_path_str = extraction_path.to_string_lossy().into_owned();
        if let Err(err) = self
            .retry_store(|s| s.complete_extraction(key, &extraction_path_str))
            .await
        {
            self.db_fault(key, &err);
            out.failed = true;
            return out;
        }
        out.extracted = true;
        self.activity
            .entry(LogLevel::Info)
            .op(Operation::Extraction)
            .tuple(key)
            .coordinate(&coord)
            .duration(extraction_elapsed)
            .emit("extracted");

        let entry = NewHistoryEntry {
            key,
            coordinate: coord,
            artifact_url: url.to_string(),
            download_path,
            extraction_path: extraction_path_str,
            file_size: artifact.file_size,
            checksum: Some(artifact.checksum.clone()),
            downloaded_at,
            extracted_at,
        };
        if let Err(err) = self.retry_store(|s| s.append_history(&entry)).await {
            self.db_fault(key, &err);
            out.failed = true;
            return out;
        }

        match self
            .retention
            .prune(key, params.keep, &self.activity, self.clock.now())
            .await
        {
            Ok(report) => out.pruned = report.pruned,
            Err(err) => {
                self.db_fault(key, &err);
                out.failed = true;
            }
        }

        out
    }
}

/// Per-tuple mutexes, created on demand and dropped once no pipeline holds
/// a handle.
struct TupleLocks {
    map: StdMutex<HashMap<TupleKey, Arc<TokioMutex<()>>>>,
}

impl TupleLocks {
    fn new() -> Self {
        Self {
            map: StdMutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: TupleKey) -> Arc<TokioMutex<()>> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key).or_default())
    }

    fn gc(&self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Is the tuple due for a poll?
fn eligible(last_poll: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last_poll {
        None => true,
        Some(at) => now.duration_since(at) >= interval,
    }
}

/// Drives tuples through the engine on a tick schedule.
pub struct Scheduler {
    engine: Arc<Engine>,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    locks: Arc<TupleLocks>,
    inflight: Arc<StdMutex<HashSet<TupleKey>>>,
    last_poll: Arc<StdMutex<HashMap<TupleKey, Instant>>>,
}

impl Scheduler {
    /// Size the worker pool from configuration and build the scheduler.
    pub fn new(engine: Arc<Engine>) -> Result<Self, SettingsError> {
        let max_concurrency = engine.settings.max_concurrent_threads()? as usize;
        Ok(Self {
            engine,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            locks: Arc::new(TupleLocks::new()),
            inflight: Arc::new(StdMutex::new(HashSet::new())),
            last_poll: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Acquire the tuple lock (bounded wait), run the pipeline, stamp the
    /// cadence clock unless the tuple failed.
    async fn run_pipeline(&self, tuple: &PollTuple, cancel: &CancellationToken) -> TupleOutcome {
        let key = tuple.key();
        let lock = self.locks.get(key);
        let Ok(guard) = tokio::time::timeout(LOCK_ACQUIRE_TIMEOUT, lock.lock()).await else {
            self.engine
                .activity
                .entry(LogLevel::Warning)
                .op(Operation::Poll)
                .tuple(key)
                .emit("tuple lock busy, skipping this poll");
            return TupleOutcome {
                skipped: true,
                ..Default::default()
            };
        };

        let outcome = self.engine.poll_tuple(tuple, cancel).await;
        drop(guard);

        if !outcome.failed && !outcome.skipped {
            let mut last_poll = self.last_poll.lock().unwrap_or_else(|e| e.into_inner());
            last_poll.insert(key, Instant::now());
        }
        outcome
    }

    fn is_inflight(&self, key: TupleKey) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
    }

    fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn mark_inflight(&self, key: TupleKey) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }

    fn clear_inflight(&self, key: TupleKey) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    fn due_now(&self, tuple: &PollTuple) -> bool {
        let last = self
            .last_poll
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tuple.key())
            .copied();
        eligible(last, tuple.polling.interval(), Instant::now())
    }

    /// Spawn eligible tuples into `join_set`, honoring in-flight markers and
    /// backpressure. Returns how many were deferred.
    fn dispatch(
        self: &Arc<Self>,
        tuples: Vec<PollTuple>,
        cancel: &CancellationToken,
        join_set: &mut JoinSet<TupleOutcome>,
    ) -> usize {
        let queue_bound = self.max_concurrency * BACKPRESSURE_FACTOR;
        let mut deferred = 0;
        for tuple in tuples {
            let key = tuple.key();
            if self.is_inflight(key) || !self.due_now(&tuple) {
                continue;
            }
            if self.inflight_count() >= queue_bound {
                deferred += 1;
                continue;
            }
            self.mark_inflight(key);
            let scheduler = Arc::clone(self);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let Ok(_permit) = Arc::clone(&scheduler.semaphore).acquire_owned().await else {
                    scheduler.clear_inflight(key);
                    return TupleOutcome {
                        failed: true,
                        ..Default::default()
                    };
                };
                let outcome = scheduler.run_pipeline(&tuple, &cancel).await;
                scheduler.clear_inflight(key);
                outcome
            });
        }
        if deferred > 0 {
            debug!(deferred, "backpressure: deferring tuples to the next tick");
        }
        deferred
    }

    /// One pass over all currently eligible tuples, waiting for completion.
    pub async fn run_cycle(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, WincoreError> {
        let default_interval = self.engine.settings.default_polling_frequency()?;
        let tuples = self
            .engine
            .retry_store(|s| s.active_configs(default_interval))
            .await?;
        let mut join_set = JoinSet::new();
        self.dispatch(tuples, cancel, &mut join_set);

        let mut report = CycleReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(&outcome),
                Err(err) => {
                    warn!(error = %err, "pipeline task failed to join");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Continuous polling: tick every five seconds until `stop` fires, then
    /// drain in-flight pipelines within the grace window and cancel the
    /// rest.
    pub async fn run(self: &Arc<Self>, stop: &CancellationToken) -> Result<(), WincoreError> {
        let work_cancel = CancellationToken::new();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut join_set: JoinSet<TupleOutcome> = JoinSet::new();

        info!(max_concurrency = self.max_concurrency, "polling started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            while join_set.try_join_next().is_some() {}
            self.locks.gc();

            let default_interval = match self.engine.settings.default_polling_frequency() {
                Ok(value) => value,
                Err(err) => {
                    self.engine
                        .activity
                        .entry(LogLevel::Critical)
                        .emit(format!("configuration error, skipping tick: {err}"));
                    continue;
                }
            };
            let tuples = match self
                .engine
                .retry_store(|s| s.active_configs(default_interval))
                .await
            {
                Ok(tuples) => tuples,
                Err(err) => {
                    self.engine
                        .activity
                        .entry(LogLevel::Critical)
                        .emit(format!("database error, skipping tick: {err}"));
                    continue;
                }
            };
            self.dispatch(tuples, &work_cancel, &mut join_set);
        }

        info!(
            in_flight = join_set.len(),
            "stop requested, draining in-flight pipelines"
        );
        let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            warn!("shutdown grace expired, cancelling remaining pipelines");
            work_cancel.cancel();
            let _ = tokio::time::timeout(CANCEL_DRAIN, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            join_set.abort_all();
        }

        info!("polling stopped");
        Ok(())
    }
}

fn probe_failure_message(err: &ProbeError) -> String {
    match err {
        ProbeError::Source(SourceError::Cancelled) => "cancelled".to_string(),
        ProbeError::Source(err) => format!("probe failed: {err}"),
        ProbeError::Template(err) => format!("configuration error: {err}"),
    }
}

fn download_failure_message(err: &DownloadError) -> String {
    match err {
        DownloadError::Cancelled => "cancelled".to_string(),
        DownloadError::Disappeared => "disappeared".to_string(),
        other => other.to_string(),
    }
}

fn extract_failure_message(err: &ExtractError) -> String {
    match err {
        ExtractError::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}
