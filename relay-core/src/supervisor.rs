use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{EncoderSection, IngestSection};
use crate::provider::BroadcastProvider;
use crate::registry::{
    mask_key, RegistryResult, StreamRecord, StreamRegistry, StreamStatus,
};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("stream {0} not found")]
    UnknownStream(u64),
    #[error("stream {0} is already running")]
    AlreadyRunning(u64),
    #[error("media file not found: {0}")]
    MediaNotFound(String),
    #[error("encoder failed to launch: {0}")]
    Launch(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("stream {0} not found")]
    UnknownStream(u64),
    #[error("stream {0} is not running")]
    NotRunning(u64),
}

/// Fully resolved encoder command line for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderInvocation {
    /// Ingest target with the key shortened, safe to log.
    pub fn masked_target(&self, ingest_key: &str) -> String {
        self.args
            .last()
            .map(|target| target.replace(ingest_key, &mask_key(ingest_key)))
            .unwrap_or_default()
    }
}

/// Seam for spawning the encoder so tests can substitute a harmless
/// process for ffmpeg.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn spawn(&self, invocation: &EncoderInvocation) -> std::io::Result<Child>;
}

#[derive(Debug, Default)]
pub struct SystemEncoderLauncher;

#[async_trait]
impl EncoderLauncher for SystemEncoderLauncher {
    async fn spawn(&self, invocation: &EncoderInvocation) -> std::io::Result<Child> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command.spawn()
    }
}

/// Runtime-only bookkeeping for a live encoder. Never persisted; the
/// generation ties an exit notification to the launch that produced it.
#[derive(Debug, Clone, Copy)]
struct ProcessHandle {
    pid: u32,
    generation: u64,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
}

struct SupervisorState {
    registry: StreamRegistry,
    handles: HashMap<u64, ProcessHandle>,
    next_generation: u64,
}

/// Owns the mapping from stream id to live encoder process. All registry
/// and handle mutations funnel through one async mutex, so a scheduler
/// tick and a manual command can never double-spawn the same record.
pub struct StreamSupervisor {
    state: Arc<Mutex<SupervisorState>>,
    encoder: EncoderSection,
    ingest: IngestSection,
    launcher: Arc<dyn EncoderLauncher>,
    provider: Arc<dyn BroadcastProvider>,
}

impl fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("encoder", &self.encoder)
            .field("ingest", &self.ingest)
            .finish()
    }
}

impl StreamSupervisor {
    pub fn new(
        registry: StreamRegistry,
        encoder: EncoderSection,
        ingest: IngestSection,
        provider: Arc<dyn BroadcastProvider>,
        launcher: Option<Arc<dyn EncoderLauncher>>,
    ) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(SystemEncoderLauncher));
        Self {
            state: Arc::new(Mutex::new(SupervisorState {
                registry,
                handles: HashMap::new(),
                next_generation: 1,
            })),
            encoder,
            ingest,
            launcher,
            provider,
        }
    }

    /// Launches the encoder for a waiting record. On success the record is
    /// `Running` with its pid recorded and persisted; an exit watcher and,
    /// when a broadcast is linked, a delayed go-live task are spawned.
    pub async fn start(&self, id: u64) -> Result<(), StartError> {
        let record = {
            let mut state = self.state.lock().await;
            let record = state
                .registry
                .get(id)
                .cloned()
                .ok_or(StartError::UnknownStream(id))?;
            if state.handles.contains_key(&id) {
                return Err(StartError::AlreadyRunning(id));
            }
            if !Path::new(&record.media_path).exists() {
                return Err(StartError::MediaNotFound(record.media_path));
            }

            let invocation = build_encoder_invocation(&record, &self.encoder, &self.ingest);
            let mut child = self
                .launcher
                .spawn(&invocation)
                .await
                .map_err(StartError::Launch)?;
            let pid = child.id().unwrap_or(0);
            let generation = state.next_generation;
            state.next_generation += 1;
            state.handles.insert(
                id,
                ProcessHandle {
                    pid,
                    generation,
                    started_at: Utc::now(),
                },
            );
            if let Some(stored) = state.registry.get_mut(id) {
                stored.status = StreamStatus::Running;
                stored.pid = pid;
            }
            // The process is already running; a persist failure here must
            // not undo that, only be retried and reported loudly.
            let _ = persist_with_retry(&state.registry).await;

            info!(
                stream = id,
                pid,
                quality = %record.quality,
                target = %invocation.masked_target(&record.ingest_key),
                "encoder launched"
            );
            self.spawn_exit_watcher(id, generation, child, record.clone());
            record
        };

        if record.has_broadcast() {
            self.spawn_delayed_go_live(id, record.broadcast_ref, record.channel);
        }
        Ok(())
    }

    /// Terminates the encoder for a running record: graceful signal, fixed
    /// grace period, then force kill. Stopping a record that already ended
    /// (`Stopped`/`Finished`) is a no-op success so delete-while-running
    /// and late stops never fail.
    pub async fn stop(&self, id: u64) -> Result<(), StopError> {
        let (pid, record) = {
            let mut state = self.state.lock().await;
            let record = state
                .registry
                .get(id)
                .cloned()
                .ok_or(StopError::UnknownStream(id))?;
            let Some(handle) = state.handles.remove(&id) else {
                return if record.status.is_terminal() {
                    Ok(())
                } else {
                    Err(StopError::NotRunning(id))
                };
            };
            if let Some(stored) = state.registry.get_mut(id) {
                stored.status = StreamStatus::Stopped;
                stored.pid = 0;
            }
            let _ = persist_with_retry(&state.registry).await;
            (handle.pid, record)
        };

        terminate_process(pid, self.encoder.stop_grace()).await;
        info!(stream = id, pid, "encoder stopped");

        if record.has_broadcast() {
            let provider = Arc::clone(&self.provider);
            tokio::spawn(async move {
                if let Err(error) = provider.complete(&record.broadcast_ref, &record.channel).await
                {
                    warn!(stream = id, %error, "broadcast completion failed");
                }
            });
        }
        Ok(())
    }

    /// `stop` for paths where "nothing to stop" is fine, e.g. delete.
    pub async fn stop_if_running(&self, id: u64) -> Result<(), StopError> {
        match self.stop(id).await {
            Ok(()) | Err(StopError::NotRunning(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    pub async fn add(&self, record: StreamRecord) -> RegistryResult<u64> {
        let mut state = self.state.lock().await;
        let id = state.registry.add(record);
        state.registry.persist()?;
        Ok(id)
    }

    pub async fn remove(&self, id: u64) -> RegistryResult<StreamRecord> {
        let mut state = self.state.lock().await;
        let record = state.registry.remove(id)?;
        state.registry.persist()?;
        Ok(record)
    }

    pub async fn list(&self) -> Vec<StreamRecord> {
        self.state.lock().await.registry.list().to_vec()
    }

    pub async fn get(&self, id: u64) -> Option<StreamRecord> {
        self.state.lock().await.registry.get(id).cloned()
    }

    pub async fn is_running(&self, id: u64) -> bool {
        self.state.lock().await.handles.contains_key(&id)
    }

    /// Records plus the ids holding live process handles, in one lock take.
    pub async fn snapshot(&self) -> (Vec<StreamRecord>, Vec<u64>) {
        let state = self.state.lock().await;
        let records = state.registry.list().to_vec();
        let running = state.handles.keys().copied().collect();
        (records, running)
    }

    /// Rewrites the schedule display string, e.g. to the actual start
    /// stamp once a scheduled stream launches.
    pub async fn set_start_display(&self, id: u64, value: String) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.registry.get_mut(id) {
            record.start_at = value;
        }
        state.registry.persist()
    }

    /// Stops every running stream; used on service shutdown.
    pub async fn shutdown(&self) {
        let running: Vec<u64> = {
            let state = self.state.lock().await;
            state.handles.keys().copied().collect()
        };
        for id in running {
            if let Err(error) = self.stop(id).await {
                warn!(stream = id, %error, "shutdown stop failed");
            }
        }
    }

    fn spawn_exit_watcher(&self, id: u64, generation: u64, mut child: Child, record: StreamRecord) {
        let state = Arc::clone(&self.state);
        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            let exit = child.wait().await;
            let reaped = {
                let mut state = state.lock().await;
                let current = state.handles.get(&id).map(|handle| handle.generation);
                if current != Some(generation) {
                    // A stop (or a newer launch) already owns this record.
                    false
                } else {
                    state.handles.remove(&id);
                    if let Some(stored) = state.registry.get_mut(id) {
                        stored.status = StreamStatus::Finished;
                        stored.pid = 0;
                    }
                    let _ = persist_with_retry(&state.registry).await;
                    true
                }
            };
            if !reaped {
                return;
            }
            match exit {
                Ok(status) => info!(stream = id, code = status.code(), "encoder exited"),
                Err(error) => warn!(stream = id, %error, "encoder wait failed"),
            }
            if record.has_broadcast() {
                if let Err(error) = provider.complete(&record.broadcast_ref, &record.channel).await
                {
                    warn!(stream = id, %error, "broadcast completion failed");
                }
            }
        });
    }

    fn spawn_delayed_go_live(&self, id: u64, broadcast_ref: String, channel: String) {
        let provider = Arc::clone(&self.provider);
        let warmup = self.encoder.warmup_delay();
        tokio::spawn(async move {
            // Let the ingest handshake settle before flipping the broadcast.
            sleep(warmup).await;
            match provider.go_live(&broadcast_ref, &channel).await {
                Ok(()) => info!(stream = id, broadcast_ref = %broadcast_ref, "broadcast live"),
                Err(error) => warn!(stream = id, %error, "broadcast go-live failed"),
            }
        });
    }
}

/// SIGTERM, wait out the grace period, SIGKILL if the process is still
/// there. Reaping stays with the exit watcher that owns the child.
async fn terminate_process(pid: u32, grace: Duration) {
    if pid == 0 {
        return;
    }
    let pid = pid as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    sleep(grace).await;
    let alive = unsafe { libc::kill(pid, 0) == 0 };
    if alive {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        warn!(pid, "encoder force-killed after grace period");
    }
}

/// A failed write after a state change risks the registry and the process
/// table disagreeing across a restart, so it is retried once and logged at
/// error level both times.
async fn persist_with_retry(registry: &StreamRegistry) -> RegistryResult<()> {
    let Err(first) = registry.persist() else {
        return Ok(());
    };
    error!(%first, "registry persist failed, retrying");
    sleep(Duration::from_millis(200)).await;
    registry.persist().map_err(|second| {
        error!(%second, "registry persist failed after retry");
        second
    })
}

/// Builds the ffmpeg command line: read at native rate, re-encode to the
/// profile with a deterministic keyframe cadence, mux to FLV over RTMP.
pub fn build_encoder_invocation(
    record: &StreamRecord,
    encoder: &EncoderSection,
    ingest: &IngestSection,
) -> EncoderInvocation {
    let profile = record.quality.profile();
    let bitrate = format!("{}k", profile.video_bitrate_k);
    let bufsize = format!("{}k", profile.bufsize_k());
    let gop = profile.gop().to_string();
    let target = format!(
        "{}/{}",
        ingest.rtmp_base.trim_end_matches('/'),
        record.ingest_key
    );

    let args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        encoder.log_level.clone(),
        "-re".to_string(),
        "-i".to_string(),
        record.media_path.clone(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        encoder.preset.clone(),
        "-tune".to_string(),
        encoder.tune.clone(),
        "-b:v".to_string(),
        bitrate.clone(),
        "-maxrate".to_string(),
        bitrate,
        "-bufsize".to_string(),
        bufsize,
        "-s".to_string(),
        profile.resolution.to_string(),
        "-r".to_string(),
        profile.fps.to_string(),
        "-g".to_string(),
        gop.clone(),
        "-keyint_min".to_string(),
        gop,
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-ar".to_string(),
        "44100".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-f".to_string(),
        "flv".to_string(),
        target,
    ];

    EncoderInvocation {
        program: encoder.binary.clone(),
        args,
    }
}
