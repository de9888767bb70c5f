use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::provider::BroadcastProvider;
use crate::quality::Quality;
use crate::registry::{RegistryError, StreamRecord, StreamRegistry, StreamStatus};
use crate::schedule::{countdown, is_due, Schedule, ScheduleError};
use crate::supervisor::{EncoderLauncher, StartError, StopError, StreamSupervisor};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Definition of a stream job before it has an id.
#[derive(Debug, Clone)]
pub struct NewStream {
    pub media_path: String,
    pub ingest_key: String,
    pub schedule: Schedule,
    pub quality: Quality,
    pub is_shorts: bool,
    pub broadcast_ref: String,
    pub channel: String,
}

/// What one pass over the registry did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub started: Vec<u64>,
    pub skipped: usize,
    pub errors: Vec<(u64, String)>,
}

/// Presentation row for listings: the record with its key masked and the
/// schedule turned into a countdown.
#[derive(Debug, Clone)]
pub struct StreamView {
    pub id: u64,
    pub media_path: String,
    pub masked_key: String,
    pub start_at: String,
    pub status: StreamStatus,
    pub pid: u32,
    pub quality: Quality,
    pub broadcast_ref: String,
    pub channel: String,
    pub countdown: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub total: usize,
    pub waiting: usize,
    pub running: usize,
    pub stopped: usize,
    pub finished: usize,
}

/// Drives waiting streams to their start times. One instance owns the
/// supervisor; ticks and operator commands serialize on the supervisor's
/// internal lock.
#[derive(Debug)]
pub struct RelayScheduler {
    supervisor: StreamSupervisor,
    config: RelayConfig,
}

impl RelayScheduler {
    /// Loads the registry and reconciles records left `Running` by a
    /// previous process before anything can be scheduled against them.
    pub fn new(
        config: RelayConfig,
        provider: Arc<dyn BroadcastProvider>,
        launcher: Option<Arc<dyn EncoderLauncher>>,
    ) -> Result<Self, SchedulerError> {
        let mut registry = StreamRegistry::load(config.registry_path())?;
        let orphaned = registry.reconcile_orphans();
        if orphaned > 0 {
            registry.persist()?;
            warn!(orphaned, "streams left running by a previous process were marked stopped");
        }
        let supervisor = StreamSupervisor::new(
            registry,
            config.encoder.clone(),
            config.ingest.clone(),
            provider,
            launcher,
        );
        Ok(Self { supervisor, config })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// One scheduling pass: start every waiting stream whose time has come.
    /// A failure on one record is collected and never aborts the pass.
    pub async fn tick(&self, now: DateTime<FixedOffset>) -> TickReport {
        let mut report = TickReport::default();
        let records = self.supervisor.list().await;
        for record in records {
            if record.status != StreamStatus::Waiting {
                continue;
            }
            let schedule = match Schedule::parse(&record.start_at) {
                Ok(schedule) => schedule,
                Err(error) => {
                    warn!(stream = record.id, start_at = %record.start_at, %error,
                        "unreadable schedule, skipping record");
                    report.skipped += 1;
                    continue;
                }
            };
            if !is_due(schedule, now) {
                report.skipped += 1;
                continue;
            }
            match self.launch_due(record.id, now).await {
                Ok(()) => report.started.push(record.id),
                Err(error) => {
                    error!(stream = record.id, %error, "scheduled start failed");
                    report.errors.push((record.id, error.to_string()));
                }
            }
        }
        if !report.started.is_empty() {
            info!(started = report.started.len(), "scheduler tick launched streams");
        }
        report
    }

    async fn launch_due(
        &self,
        id: u64,
        now: DateTime<FixedOffset>,
    ) -> Result<(), SchedulerError> {
        self.supervisor.start(id).await?;
        // Pin the display to the moment it actually launched.
        let stamp = format!(
            "{} {}",
            now.format("%H:%M"),
            self.config.system.timezone_label
        );
        self.supervisor.set_start_display(id, stamp).await?;
        Ok(())
    }

    /// Ticks forever at the configured interval until the task is dropped.
    pub async fn run(&self) {
        let mut ticker = interval(self.config.scheduler.tick_interval());
        info!(
            interval_seconds = self.config.scheduler.tick_interval_seconds,
            "scheduler running"
        );
        loop {
            ticker.tick().await;
            let report = self.tick(self.config.local_now()).await;
            debug!(
                started = report.started.len(),
                skipped = report.skipped,
                errors = report.errors.len(),
                "tick complete"
            );
        }
    }

    pub async fn add_stream(&self, new: NewStream) -> Result<u64, SchedulerError> {
        let record = StreamRecord {
            id: 0,
            media_path: new.media_path,
            ingest_key: new.ingest_key,
            start_at: new.schedule.display(&self.config.system.timezone_label),
            status: StreamStatus::Waiting,
            pid: 0,
            is_shorts: new.is_shorts,
            quality: new.quality,
            broadcast_ref: new.broadcast_ref,
            channel: new.channel,
        };
        let id = self.supervisor.add(record).await?;
        info!(stream = id, "stream registered");
        Ok(id)
    }

    /// Manual start, bypassing the schedule.
    pub async fn start_now(&self, id: u64) -> Result<(), SchedulerError> {
        self.supervisor.start(id).await?;
        let stamp = format!(
            "{} {}",
            self.config.local_now().format("%H:%M"),
            self.config.system.timezone_label
        );
        self.supervisor.set_start_display(id, stamp).await?;
        Ok(())
    }

    pub async fn stop_stream(&self, id: u64) -> Result<(), SchedulerError> {
        self.supervisor.stop(id).await?;
        Ok(())
    }

    /// Stops the encoder if one is live, then drops the record.
    pub async fn delete_stream(&self, id: u64) -> Result<StreamRecord, SchedulerError> {
        self.supervisor.stop_if_running(id).await?;
        Ok(self.supervisor.remove(id).await?)
    }

    pub async fn get_stream(&self, id: u64) -> Option<StreamRecord> {
        self.supervisor.get(id).await
    }

    pub async fn list_streams(&self, now: DateTime<FixedOffset>) -> Vec<StreamView> {
        self.supervisor
            .list()
            .await
            .into_iter()
            .map(|record| {
                let countdown = match record.status {
                    StreamStatus::Waiting => Schedule::parse(&record.start_at)
                        .map(|schedule| countdown(schedule, now))
                        .unwrap_or_else(|_| "Schedule unreadable".to_string()),
                    other => other.to_string(),
                };
                StreamView {
                    id: record.id,
                    masked_key: record.masked_key(),
                    media_path: record.media_path,
                    start_at: record.start_at,
                    status: record.status,
                    pid: record.pid,
                    quality: record.quality,
                    broadcast_ref: record.broadcast_ref,
                    channel: record.channel,
                    countdown,
                }
            })
            .collect()
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for record in self.supervisor.list().await {
            summary.total += 1;
            match record.status {
                StreamStatus::Waiting => summary.waiting += 1,
                StreamStatus::Running => summary.running += 1,
                StreamStatus::Stopped => summary.stopped += 1,
                StreamStatus::Finished => summary.finished += 1,
            }
        }
        summary
    }

    /// Stops every live encoder. Called on service shutdown.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_relay_config;
    use crate::provider::NullBroadcastProvider;
    use crate::registry::StreamRegistry;
    use crate::supervisor::stubs::StubLauncher;
    use chrono::TimeZone;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn test_config(dir: &TempDir) -> RelayConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/relay.toml");
        let mut config = load_relay_config(path).unwrap();
        config.paths.base_dir = dir.path().to_string_lossy().to_string();
        config.encoder.warmup_delay_seconds = 0;
        config.encoder.stop_grace_seconds = 0;
        config
    }

    fn scheduler(dir: &TempDir, sleep_secs: &'static str) -> RelayScheduler {
        RelayScheduler::new(
            test_config(dir),
            Arc::new(NullBroadcastProvider),
            Some(Arc::new(StubLauncher { sleep_secs })),
        )
        .unwrap()
    }

    fn wib(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
            .unwrap()
    }

    fn new_stream(dir: &TempDir, name: &str, schedule: Schedule) -> NewStream {
        let media = dir.path().join(name);
        std::fs::write(&media, b"fake media").unwrap();
        NewStream {
            media_path: media.to_string_lossy().to_string(),
            ingest_key: "abcd1234efgh5678".to_string(),
            schedule,
            quality: Quality::Q720,
            is_shorts: false,
            broadcast_ref: String::new(),
            channel: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn immediate_stream_runs_then_finishes() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "0.2");
        let id = scheduler
            .add_stream(new_stream(&dir, "a.mp4", Schedule::Immediate))
            .await
            .unwrap();

        let report = scheduler.tick(wib(9, 0)).await;
        assert_eq!(report.started, vec![id]);
        assert!(report.errors.is_empty());
        assert_eq!(
            scheduler.get_stream(id).await.unwrap().status,
            StreamStatus::Running
        );
        // The display now carries the launch stamp instead of the sentinel.
        assert_eq!(scheduler.get_stream(id).await.unwrap().start_at, "09:00 WIB");

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            scheduler.get_stream(id).await.unwrap().status,
            StreamStatus::Finished
        );
    }

    #[tokio::test]
    async fn scheduled_stream_starts_exactly_once_when_due() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "30");
        let id = scheduler
            .add_stream(new_stream(&dir, "a.mp4", Schedule::At { hour: 9, minute: 0 }))
            .await
            .unwrap();

        let early = scheduler.tick(wib(8, 59)).await;
        assert!(early.started.is_empty());
        assert_eq!(early.skipped, 1);

        let due = scheduler.tick(wib(9, 0)).await;
        assert_eq!(due.started, vec![id]);

        // Running records are ignored by later passes.
        let again = scheduler.tick(wib(9, 1)).await;
        assert!(again.started.is_empty());
        assert!(again.errors.is_empty());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_schedule_is_skipped_and_others_still_run() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "30");
        let bad = scheduler
            .add_stream(new_stream(&dir, "a.mp4", Schedule::Immediate))
            .await
            .unwrap();
        scheduler
            .supervisor
            .set_start_display(bad, "whenever".to_string())
            .await
            .unwrap();
        let good = scheduler
            .add_stream(new_stream(&dir, "b.mp4", Schedule::Immediate))
            .await
            .unwrap();

        let report = scheduler.tick(wib(9, 0)).await;
        assert_eq!(report.started, vec![good]);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert_eq!(
            scheduler.get_stream(bad).await.unwrap().status,
            StreamStatus::Waiting
        );

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn missing_media_is_collected_per_record() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "30");
        let mut stream = new_stream(&dir, "a.mp4", Schedule::Immediate);
        stream.media_path = dir.path().join("gone.mp4").to_string_lossy().to_string();
        let broken = scheduler.add_stream(stream).await.unwrap();
        let good = scheduler
            .add_stream(new_stream(&dir, "b.mp4", Schedule::Immediate))
            .await
            .unwrap();

        let report = scheduler.tick(wib(9, 0)).await;
        assert_eq!(report.started, vec![good]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, broken);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn construction_reconciles_orphaned_running_records() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let mut registry = StreamRegistry::load(config.registry_path()).unwrap();
            registry.add(StreamRecord {
                id: 0,
                media_path: "a.mp4".to_string(),
                ingest_key: "k".to_string(),
                start_at: "NOW".to_string(),
                status: StreamStatus::Running,
                pid: 12345,
                is_shorts: false,
                quality: Quality::Q720,
                broadcast_ref: String::new(),
                channel: "default".to_string(),
            });
            registry.persist().unwrap();
        }

        let scheduler = RelayScheduler::new(
            config,
            Arc::new(NullBroadcastProvider),
            Some(Arc::new(StubLauncher { sleep_secs: "30" })),
        )
        .unwrap();
        let records = scheduler.list_streams(wib(9, 0)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StreamStatus::Stopped);
        assert_eq!(records[0].pid, 0);
    }

    #[tokio::test]
    async fn delete_stops_a_running_stream_first() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "30");
        let id = scheduler
            .add_stream(new_stream(&dir, "a.mp4", Schedule::Immediate))
            .await
            .unwrap();
        scheduler.start_now(id).await.unwrap();
        assert_eq!(
            scheduler.get_stream(id).await.unwrap().status,
            StreamStatus::Running
        );

        let removed = scheduler.delete_stream(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(scheduler.get_stream(id).await.is_none());
    }

    #[tokio::test]
    async fn listing_masks_keys_and_summarizes() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, "30");
        scheduler
            .add_stream(new_stream(&dir, "a.mp4", Schedule::At { hour: 23, minute: 30 }))
            .await
            .unwrap();

        let views = scheduler.list_streams(wib(21, 0)).await;
        assert_eq!(views[0].masked_key, "abcd1234****");
        assert_eq!(views[0].countdown, "Will start in 2h 30m");

        let summary = scheduler.status_summary().await;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.waiting, 1);
        assert_eq!(summary.running, 0);
    }
}
