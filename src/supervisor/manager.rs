//! Stream supervisor
//!
//! Owns every running (capture worker, segment encoder) pair, keyed by stream
//! id, and keeps the persisted registry in step with them.
//!
//! Mutations (add, remove, bootstrap, reap, shutdown) are serialised by one
//! async mutex held for the whole operation, so two adds of the same id can
//! never both pass the duplicate check. Listings read a separate snapshot and
//! never wait behind a slow add.

use super::backend::PipelineBackend;
use super::state::{
    validate_stream_id, BootstrapReport, ShutdownReport, StreamError, StreamListing, StreamState,
};
use crate::capture::{spawn_worker, WorkerExit, WorkerHandle};
use crate::encoder::{EncoderSettings, HlsPreset, SegmentEncoder, TimestampMode, PLAYLIST_FILE};
use crate::registry::{Registry, RegistryStore, StreamConfig};
use crate::utils::AppConfig;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Extra time a worker gets to exit after its source and encoder are killed
const FORCED_RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Deployment-wide pipeline settings
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory holding one sub-directory per stream
    pub stream_root: PathBuf,
    /// Codec path for every stream
    pub preset: HlsPreset,
    /// Target segment length in seconds
    pub segment_duration: u32,
    /// Segments kept in each playlist
    pub playlist_size: u32,
    /// Frame timestamping
    pub timestamps: TimestampMode,
    /// Bound on waiting for a worker to stop
    pub stop_timeout: Duration,
    /// URL path under which the HTTP layer serves the stream root
    pub playback_prefix: String,
}

impl SupervisorOptions {
    pub fn new(stream_root: impl Into<PathBuf>) -> Self {
        Self {
            stream_root: stream_root.into(),
            preset: HlsPreset::Cpu,
            segment_duration: EncoderSettings::DEFAULT_SEGMENT_DURATION,
            playlist_size: EncoderSettings::DEFAULT_PLAYLIST_SIZE,
            timestamps: TimestampMode::Synthetic,
            stop_timeout: Duration::from_secs(10),
            playback_prefix: "/stream".to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            preset: config.preset,
            stop_timeout: config.stop_timeout,
            ..Self::new(config.stream_root.clone())
        }
    }
}

/// Live binding of one stream's worker and encoder
struct PipelineHandle {
    state: StreamState,
    worker: WorkerHandle,
    encoder: Arc<SegmentEncoder>,
}

/// Consistent view served to readers
#[derive(Default)]
struct Snapshot {
    registry: Registry,
    running: HashMap<String, Arc<AtomicBool>>,
}

/// Stream output directory that is deleted again unless kept
struct OutputDir {
    path: PathBuf,
    keep: bool,
}

impl OutputDir {
    /// Create an empty directory, clearing stale files from an earlier run
    fn create(path: PathBuf) -> std::io::Result<Self> {
        remove_output_dir(&path)?;
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep: false })
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for OutputDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = remove_output_dir(&self.path) {
            tracing::warn!("Failed to roll back output directory {:?}: {}", self.path, e);
        }
    }
}

fn remove_output_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Lifecycle manager for all streams
pub struct StreamSupervisor {
    options: SupervisorOptions,
    backend: Arc<dyn PipelineBackend>,
    store: RegistryStore,
    snapshot: RwLock<Snapshot>,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
}

impl StreamSupervisor {
    /// Load the registry without starting any pipeline
    pub fn new(
        options: SupervisorOptions,
        store: RegistryStore,
        backend: Arc<dyn PipelineBackend>,
    ) -> Result<Self, StreamError> {
        let registry = store.load()?;
        std::fs::create_dir_all(&options.stream_root)?;

        tracing::info!(
            "Stream supervisor ready: {} registered streams, root {:?}, preset {}",
            registry.len(),
            options.stream_root,
            options.preset
        );

        Ok(Self {
            options,
            backend,
            store,
            snapshot: RwLock::new(Snapshot {
                registry,
                running: HashMap::new(),
            }),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Load the registry and start a pipeline for every persisted stream
    pub async fn start(
        options: SupervisorOptions,
        store: RegistryStore,
        backend: Arc<dyn PipelineBackend>,
    ) -> Result<(Self, BootstrapReport), StreamError> {
        let supervisor = Self::new(options, store, backend)?;
        let report = supervisor.bootstrap().await;
        Ok((supervisor, report))
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Directory holding a stream's playlist and segments
    pub fn output_dir(&self, id: &str) -> PathBuf {
        self.options.stream_root.join(id)
    }

    fn output_locator(&self, id: &str) -> String {
        format!("{}/{}", id, PLAYLIST_FILE)
    }

    fn playback_url(&self, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.options.playback_prefix.trim_end_matches('/'),
            urlencoding::encode(id),
            PLAYLIST_FILE
        )
    }

    /// Start pipelines for every registered stream that is not running.
    ///
    /// A stream that fails to start is logged and skipped; its registry entry
    /// is kept.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let mut pipelines = self.pipelines.lock().await;
        let mut report = BootstrapReport::default();

        let entries: Vec<(String, String)> = self
            .snapshot
            .read()
            .registry
            .iter()
            .map(|(id, config)| (id.clone(), config.source_url.clone()))
            .collect();

        for (id, url) in entries {
            if pipelines.contains_key(&id) {
                continue;
            }
            if let Err(e) = validate_stream_id(&id) {
                tracing::error!("Skipping registered stream: {}", e);
                report.skipped.push((id, e.to_string()));
                continue;
            }

            tracing::info!("Creating HLS encoder for stream {}", id);
            match self.start_pipeline(&id, &url).await {
                Ok(handle) => {
                    self.snapshot
                        .write()
                        .running
                        .insert(id.clone(), handle.worker.running_flag());
                    pipelines.insert(id.clone(), handle);
                    report.started.push(id);
                }
                Err(e) => {
                    tracing::error!("Failed to create HLS encoder for stream {}: {}", id, e);
                    report.skipped.push((id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Bootstrap finished: {} started, {} skipped",
            report.started.len(),
            report.skipped.len()
        );
        report
    }

    /// Probe the source, launch the encoder and spawn the worker.
    ///
    /// Every partial side effect is released if a later step fails: the
    /// output directory by its guard, the source and encoder by their drops.
    async fn start_pipeline(&self, id: &str, url: &str) -> Result<PipelineHandle, StreamError> {
        tracing::debug!("Stream {}: {} -> {}", id, StreamState::Absent, StreamState::Starting);

        let output_dir = OutputDir::create(self.output_dir(id))?;

        let source = self
            .backend
            .open_source(url)
            .await
            .map_err(|e| StreamError::SourceUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let info = source.info().clone();
        let settings = EncoderSettings::new(
            info.width,
            info.height,
            info.whole_frame_rate(),
            self.options.preset,
        )
        .map_err(|e| StreamError::SourceUnreachable {
            url: url.to_string(),
            reason: format!("unusable source properties: {}", e),
        })?
        .with_segment_duration(self.options.segment_duration)
        .with_playlist_size(self.options.playlist_size)
        .with_timestamps(self.options.timestamps);

        let playlist = output_dir.path.join(PLAYLIST_FILE);
        let encoder = self
            .backend
            .open_encoder(&playlist, settings)
            .await
            .map_err(|e| StreamError::EncoderInitFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        let encoder = Arc::new(encoder);

        let worker = spawn_worker(id, source, encoder.clone())?;

        output_dir.keep();
        tracing::debug!("Stream {}: {} -> {}", id, StreamState::Starting, StreamState::Running);

        Ok(PipelineHandle {
            state: StreamState::Running,
            worker,
            encoder,
        })
    }

    /// Add a stream and persist it.
    ///
    /// Not an upsert: an id that is registered or running is rejected. The
    /// registry is only written once the pipeline is fully up.
    pub async fn add_stream(&self, id: &str, source_url: &str) -> Result<StreamListing, StreamError> {
        validate_stream_id(id)?;
        if source_url.trim().is_empty() {
            return Err(StreamError::SourceUnreachable {
                url: source_url.to_string(),
                reason: "empty source URL".to_string(),
            });
        }

        let mut pipelines = self.pipelines.lock().await;
        self.reap_locked(&mut pipelines).await;

        let registered = self.snapshot.read().registry.contains(id);
        if registered || pipelines.contains_key(id) {
            tracing::error!("Stream {} already exists", id);
            return Err(StreamError::DuplicateId(id.to_string()));
        }

        tracing::info!("Creating HLS encoder for stream {}", id);
        let handle = match self.start_pipeline(id, source_url).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to create HLS encoder for stream {}: {}", id, e);
                return Err(e);
            }
        };

        let mut next = self.snapshot.read().registry.clone();
        next.insert(id, StreamConfig::new(source_url, self.output_locator(id)));

        if let Err(e) = self.store.save(&next) {
            tracing::error!("Failed to persist stream {}, rolling back: {}", id, e);
            if let Err(teardown) = self.teardown(id, handle).await {
                tracing::warn!("Rollback teardown of {}: {}", id, teardown);
            }
            if let Err(cleanup) = remove_output_dir(&self.output_dir(id)) {
                tracing::warn!("Rollback cleanup of {}: {}", id, cleanup);
            }
            return Err(e.into());
        }

        {
            let mut snapshot = self.snapshot.write();
            snapshot.registry = next;
            snapshot
                .running
                .insert(id.to_string(), handle.worker.running_flag());
        }
        pipelines.insert(id.to_string(), handle);

        tracing::info!("Stream {} added from {}", id, source_url);
        Ok(StreamListing {
            source_url: source_url.to_string(),
            playback_url: self.playback_url(id),
            active: true,
        })
    }

    /// Stop and forget a stream. Removing an unknown id is a no-op.
    ///
    /// Order: stop the worker, close the encoder, delete the directory, drop
    /// the registry entry. Cleanup failures are logged, never returned.
    pub async fn remove_stream(&self, id: &str) {
        let mut pipelines = self.pipelines.lock().await;

        let handle = pipelines.remove(id);
        let registered = self.snapshot.read().registry.contains(id);
        if handle.is_none() && !registered {
            tracing::debug!("Stream {} not present, nothing to remove", id);
            return;
        }

        tracing::info!("Removing HLS encoder for stream {}", id);

        if let Some(handle) = handle {
            if let Err(e) = self.teardown(id, handle).await {
                tracing::warn!("Teardown of stream {}: {}", id, e);
            }
        }

        if let Err(e) = remove_output_dir(&self.output_dir(id)) {
            tracing::warn!("Failed to delete output directory of stream {}: {}", id, e);
        }

        let mut next = self.snapshot.read().registry.clone();
        next.remove(id);
        let saved = self.store.save(&next);
        {
            let mut snapshot = self.snapshot.write();
            snapshot.registry = next;
            snapshot.running.remove(id);
        }
        if let Err(e) = saved {
            tracing::error!("Failed to persist registry after removing {}: {}", id, e);
        }
    }

    /// Stop a pipeline: worker first, then the encoder
    async fn teardown(&self, id: &str, mut handle: PipelineHandle) -> Result<(), StreamError> {
        handle.state = StreamState::Stopping;
        tracing::debug!("Stream {}: {} -> {}", id, StreamState::Running, handle.state);

        handle.worker.request_stop();

        let mut outcome = Ok(());
        let mut forced = false;
        let exit = match handle.worker.wait(self.options.stop_timeout).await {
            Some(exit) => Some(exit),
            None => {
                tracing::warn!(
                    "Worker for stream {} did not stop within {:?}, forcing release",
                    id,
                    self.options.stop_timeout
                );
                forced = true;
                handle.worker.force_release();
                handle.encoder.kill();
                outcome = Err(StreamError::StopTimeout(id.to_string()));

                let exit = handle.worker.wait(FORCED_RELEASE_GRACE).await;
                if exit.is_none() {
                    tracing::error!("Worker for stream {} still running after forced release, detaching", id);
                }
                exit
            }
        };

        if let Some(exit) = exit.as_ref().filter(|exit| exit.is_failure()) {
            tracing::info!("Stream {} had already ended: {}", id, exit);
        }

        let encoder = handle.encoder.clone();
        match tokio::task::spawn_blocking(move || encoder.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Encoder of stream {} closed with error: {}", id, e);
                if !forced {
                    outcome = Err(StreamError::EncoderDead {
                        id: id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            Err(e) => tracing::error!("Encoder close task for stream {} failed: {}", id, e),
        }

        tracing::debug!("Stream {}: {} -> {}", id, StreamState::Stopping, StreamState::Absent);
        outcome
    }

    /// Current registry contents with their playback locations
    pub fn list_streams(&self) -> BTreeMap<String, StreamListing> {
        let snapshot = self.snapshot.read();
        snapshot
            .registry
            .iter()
            .map(|(id, config)| {
                let active = snapshot
                    .running
                    .get(id)
                    .map(|flag| flag.load(Ordering::SeqCst))
                    .unwrap_or(false);
                (
                    id.clone(),
                    StreamListing {
                        source_url: config.source_url.clone(),
                        playback_url: self.playback_url(id),
                        active,
                    },
                )
            })
            .collect()
    }

    /// Listing for one stream
    pub fn get_stream(&self, id: &str) -> Option<StreamListing> {
        self.list_streams().remove(id)
    }

    /// Lifecycle state of a stream id
    pub async fn stream_state(&self, id: &str) -> StreamState {
        let pipelines = self.pipelines.lock().await;
        match pipelines.get(id) {
            Some(handle) if handle.worker.is_running() => handle.state,
            _ => StreamState::Absent,
        }
    }

    /// Number of pipelines currently held
    pub async fn active_count(&self) -> usize {
        self.pipelines.lock().await.len()
    }

    /// Drop pipelines whose worker ended on its own.
    ///
    /// Their registry entries stay; the caller recovers with remove + add.
    pub async fn reap_finished(&self) -> Vec<(String, WorkerExit)> {
        let mut pipelines = self.pipelines.lock().await;
        self.reap_locked(&mut pipelines).await
    }

    async fn reap_locked(&self, pipelines: &mut HashMap<String, PipelineHandle>) -> Vec<(String, WorkerExit)> {
        let finished: Vec<(String, WorkerExit)> = pipelines
            .iter_mut()
            .filter_map(|(id, handle)| handle.worker.try_exit().map(|exit| (id.clone(), exit)))
            .collect();

        for (id, exit) in &finished {
            if let Some(handle) = pipelines.remove(id) {
                tracing::warn!(
                    "Stream {} is no longer running ({}); remove and re-add it to restart",
                    id,
                    exit
                );
                let encoder = handle.encoder.clone();
                if let Ok(Err(e)) = tokio::task::spawn_blocking(move || encoder.close()).await {
                    tracing::debug!("Encoder of finished stream {}: {}", id, e);
                }
            }
            self.snapshot.write().running.remove(id);
        }

        finished
    }

    /// Tear down every pipeline, e.g. at process exit.
    ///
    /// Best effort: each stream is attempted regardless of earlier failures.
    /// Registry entries are kept so the streams come back on next start;
    /// their output directories are deleted.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let mut pipelines = self.pipelines.lock().await;
        let handles: Vec<(String, PipelineHandle)> = pipelines.drain().collect();
        let mut report = ShutdownReport::default();

        tracing::info!("Shutting down {} streams", handles.len());

        // Signal everyone first so workers wind down in parallel
        for (_, handle) in &handles {
            handle.worker.request_stop();
        }

        for (id, handle) in handles {
            let teardown = self.teardown(&id, handle).await;
            let cleanup = remove_output_dir(&self.output_dir(&id));
            self.snapshot.write().running.remove(&id);

            match (teardown, cleanup) {
                (Ok(()), Ok(())) => report.stopped.push(id),
                (Err(e), _) => report.failures.push((id, e)),
                (Ok(()), Err(e)) => report.failures.push((id, StreamError::Io(e))),
            }
        }

        // Streams that died earlier may still have their directory
        let registered = self.snapshot.read().registry.ids();
        for id in registered {
            if let Err(e) = remove_output_dir(&self.output_dir(&id)) {
                tracing::warn!("Failed to delete output directory of stream {}: {}", id, e);
            }
        }

        tracing::info!(
            "Shutdown finished: {} stopped, {} with errors",
            report.stopped.len(),
            report.failures.len()
        );
        report
    }

    #[cfg(test)]
    async fn running_flag(&self, id: &str) -> Option<Arc<AtomicBool>> {
        self.pipelines
            .lock()
            .await
            .get(id)
            .map(|handle| handle.worker.running_flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        CaptureError, FrameRead, FrameSource, PixelFormat, SourceAbort, SourceInfo, SyntheticSource,
    };
    use crate::encoder::EncoderError;
    use crate::supervisor::FfmpegBackend;
    use async_trait::async_trait;
    use std::process::Command;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    const CAM: &str = "synthetic://cam?fps=15&width=64&height=48";

    /// Source whose reads ignore the stop flag until aborted
    struct StuckSource {
        info: SourceInfo,
        aborted: Arc<AtomicBool>,
    }

    struct StuckAbort(Arc<AtomicBool>);

    impl SourceAbort for StuckAbort {
        fn abort(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl FrameSource for StuckSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn read_frame(&mut self) -> Result<FrameRead, CaptureError> {
            while !self.aborted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(FrameRead::Ended)
        }

        fn abort_handle(&self) -> Arc<dyn SourceAbort> {
            Arc::new(StuckAbort(self.aborted.clone()))
        }
    }

    /// Synthetic sources and a `cat` sink in place of ffmpeg
    #[derive(Default)]
    struct StubBackend {
        fail_encoder: AtomicBool,
        encoders_opened: AtomicUsize,
    }

    #[async_trait]
    impl PipelineBackend for StubBackend {
        async fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
            if url.starts_with("unreachable://") {
                return Err(CaptureError::Open {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            if url.starts_with("stuck://") {
                return Ok(Box::new(StuckSource {
                    info: SourceInfo {
                        width: 4,
                        height: 4,
                        frame_rate: 10.0,
                        pixel_format: PixelFormat::Rgb24,
                    },
                    aborted: Arc::new(AtomicBool::new(false)),
                }));
            }
            Ok(Box::new(SyntheticSource::from_url(url)?))
        }

        async fn open_encoder(
            &self,
            playlist: &Path,
            settings: EncoderSettings,
        ) -> Result<SegmentEncoder, EncoderError> {
            if self.fail_encoder.load(Ordering::SeqCst) {
                return Err(EncoderError::Spawn("injected failure".to_string()));
            }
            self.encoders_opened.fetch_add(1, Ordering::SeqCst);
            let mut command = Command::new("sh");
            command.args(["-c", "cat > /dev/null"]);
            SegmentEncoder::spawn(command, playlist, settings)
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        registry_path: PathBuf,
        backend: Arc<StubBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().join("stream");
            let registry_path = dir.path().join("metadata").join("stream.json");
            Self {
                _dir: dir,
                root,
                registry_path,
                backend: Arc::new(StubBackend::default()),
            }
        }

        fn options(&self) -> SupervisorOptions {
            let mut options = SupervisorOptions::new(&self.root);
            options.stop_timeout = Duration::from_secs(5);
            options
        }

        fn store(&self) -> RegistryStore {
            RegistryStore::new(&self.registry_path)
        }

        fn supervisor(&self) -> StreamSupervisor {
            StreamSupervisor::new(self.options(), self.store(), self.backend.clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        let listing = supervisor.add_stream("cam1", CAM).await.unwrap();
        assert_eq!(listing.playback_url, "/stream/cam1/index.m3u8");
        assert!(listing.active);

        let streams = supervisor.list_streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams["cam1"].source_url, CAM);
        assert!(fx.root.join("cam1").is_dir());
        assert_eq!(supervisor.stream_state("cam1").await, StreamState::Running);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        supervisor.add_stream("cam1", CAM).await.unwrap();
        let second = supervisor.add_stream("cam1", CAM).await;
        assert!(matches!(second, Err(StreamError::DuplicateId(_))));
        assert_eq!(supervisor.active_count().await, 1);
        assert_eq!(fx.backend.encoders_opened.load(Ordering::SeqCst), 1);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_registered_but_inactive_id_is_duplicate() {
        let fx = Fixture::new();
        let mut registry = Registry::default();
        registry.insert("cam1", StreamConfig::new(CAM, "cam1/index.m3u8"));
        fx.store().save(&registry).unwrap();

        // Constructed without bootstrap: cam1 is registered but not running
        let supervisor = fx.supervisor();
        let result = supervisor.add_stream("cam1", CAM).await;
        assert!(matches!(result, Err(StreamError::DuplicateId(_))));
        assert_eq!(supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_create_one_pipeline() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        let (a, b) = tokio::join!(
            supervisor.add_stream("cam1", CAM),
            supervisor.add_stream("cam1", CAM)
        );
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        assert!(matches!(a, Err(StreamError::DuplicateId(_))) || matches!(b, Err(StreamError::DuplicateId(_))));
        assert_eq!(fx.backend.encoders_opened.load(Ordering::SeqCst), 1);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_remove_tears_everything_down() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        supervisor.add_stream("cam1", CAM).await.unwrap();
        let running = supervisor.running_flag("cam1").await.unwrap();
        assert!(running.load(Ordering::SeqCst));

        supervisor.remove_stream("cam1").await;

        assert!(!fx.root.join("cam1").exists());
        assert!(!running.load(Ordering::SeqCst));
        assert!(supervisor.list_streams().is_empty());
        assert!(!fx.store().load().unwrap().contains("cam1"));
        assert_eq!(supervisor.stream_state("cam1").await, StreamState::Absent);
    }

    #[tokio::test]
    async fn test_registry_survives_reload() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        supervisor.add_stream("cam1", CAM).await.unwrap();

        let reloaded = fx.store().load().unwrap();
        assert_eq!(reloaded.get("cam1").unwrap().source_url, CAM);
        assert_eq!(supervisor.list_streams()["cam1"].source_url, CAM);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_remove_absent_id_is_noop() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        supervisor.remove_stream("ghost").await;

        assert!(!fx.registry_path.exists());
        assert!(supervisor.list_streams().is_empty());
    }

    #[tokio::test]
    async fn test_encoder_failure_leaves_no_trace() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        supervisor.add_stream("cam1", CAM).await.unwrap();
        let before = std::fs::read(&fx.registry_path).unwrap();

        fx.backend.fail_encoder.store(true, Ordering::SeqCst);
        let result = supervisor.add_stream("cam2", CAM).await;

        assert!(matches!(result, Err(StreamError::EncoderInitFailed { .. })));
        assert_eq!(std::fs::read(&fx.registry_path).unwrap(), before);
        assert!(!fx.root.join("cam2").exists());
        assert!(!supervisor.list_streams().contains_key("cam2"));

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_unreachable_source_is_rolled_back() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();

        let result = supervisor.add_stream("cam1", "unreachable://cam").await;

        assert!(matches!(result, Err(StreamError::SourceUnreachable { .. })));
        assert!(!fx.root.join("cam1").exists());
        assert!(!fx.registry_path.exists());
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        let result = supervisor.add_stream("../etc", CAM).await;
        assert!(matches!(result, Err(StreamError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_skips_unreachable_streams() {
        let fx = Fixture::new();
        let mut registry = Registry::default();
        registry.insert("cam1", StreamConfig::new(CAM, "cam1/index.m3u8"));
        registry.insert("cam2", StreamConfig::new("unreachable://cam", "cam2/index.m3u8"));
        fx.store().save(&registry).unwrap();

        let (supervisor, report) = StreamSupervisor::start(fx.options(), fx.store(), fx.backend.clone())
            .await
            .unwrap();

        assert_eq!(report.started, vec!["cam1".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "cam2");

        let streams = supervisor.list_streams();
        assert!(streams["cam1"].active);
        assert!(!streams["cam2"].active);
        assert!(!fx.root.join("cam2").exists());
        assert_eq!(fx.store().load().unwrap(), registry);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_keeps_registry_and_clears_directories() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        supervisor.add_stream("cam1", CAM).await.unwrap();
        supervisor.add_stream("cam2", CAM).await.unwrap();

        let report = supervisor.shutdown_all().await;

        assert!(report.is_clean());
        assert_eq!(report.stopped.len(), 2);
        assert!(!fx.root.join("cam1").exists());
        assert!(!fx.root.join("cam2").exists());
        assert_eq!(supervisor.active_count().await, 0);
        assert_eq!(fx.store().load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_collects_failures_and_continues() {
        let fx = Fixture::new();
        let mut options = fx.options();
        options.stop_timeout = Duration::from_millis(200);
        let supervisor = StreamSupervisor::new(options, fx.store(), fx.backend.clone()).unwrap();

        supervisor.add_stream("stuck", "stuck://cam").await.unwrap();
        supervisor.add_stream("cam1", CAM).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown_all())
            .await
            .expect("shutdown must not hang on a stuck source");

        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "stuck");
        assert!(matches!(report.failures[0].1, StreamError::StopTimeout(_)));
        assert_eq!(report.stopped, vec!["cam1".to_string()]);
        assert!(!fx.root.join("stuck").exists());
        assert!(!fx.root.join("cam1").exists());
        assert_eq!(supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_forgets_stream_when_cleanup_fails() {
        let fx = Fixture::new();
        let mut registry = Registry::default();
        registry.insert("cam1", StreamConfig::new(CAM, "cam1/index.m3u8"));
        fx.store().save(&registry).unwrap();

        let supervisor = fx.supervisor();
        // A plain file where the directory should be cannot be removed as one
        std::fs::write(fx.root.join("cam1"), b"not a directory").unwrap();

        supervisor.remove_stream("cam1").await;

        assert!(fx.root.join("cam1").exists());
        assert!(!supervisor.list_streams().contains_key("cam1"));
        assert!(!fx.store().load().unwrap().contains("cam1"));
    }

    #[tokio::test]
    async fn test_bootstrap_survives_malformed_registry_entry() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.registry_path.parent().unwrap()).unwrap();
        std::fs::write(
            &fx.registry_path,
            format!(r#"{{"cam1": {{"sourceURL": "{}"}}, "cam2": {{"foo": 1}}}}"#, CAM),
        )
        .unwrap();

        let (supervisor, report) = StreamSupervisor::start(fx.options(), fx.store(), fx.backend.clone())
            .await
            .unwrap();

        assert_eq!(report.started, vec!["cam1".to_string()]);
        assert!(supervisor.list_streams()["cam1"].active);
        assert!(!supervisor.list_streams().contains_key("cam2"));

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_stuck_worker_is_force_released() {
        let fx = Fixture::new();
        let mut options = fx.options();
        options.stop_timeout = Duration::from_millis(200);
        let supervisor = StreamSupervisor::new(options, fx.store(), fx.backend.clone()).unwrap();

        supervisor.add_stream("cam1", "stuck://cam").await.unwrap();
        let running = supervisor.running_flag("cam1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), supervisor.remove_stream("cam1"))
            .await
            .expect("removal must not hang on a stuck source");

        assert!(!fx.root.join("cam1").exists());
        assert!(supervisor.list_streams().is_empty());
        // Give the released thread a moment to unwind
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dead_pipeline_is_reaped_but_stays_registered() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        let short = "synthetic://cam?fps=50&width=8&height=8&frames=3";

        supervisor.add_stream("cam1", short).await.unwrap();

        let mut reaped = Vec::new();
        for _ in 0..100 {
            reaped = supervisor.reap_finished().await;
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(reaped.len(), 1);
        assert!(matches!(reaped[0].1, WorkerExit::SourceUnavailable(_)));
        assert_eq!(supervisor.active_count().await, 0);

        let streams = supervisor.list_streams();
        assert!(!streams["cam1"].active);

        // Recovery is explicit: remove, then add again
        assert!(matches!(
            supervisor.add_stream("cam1", CAM).await,
            Err(StreamError::DuplicateId(_))
        ));
        supervisor.remove_stream("cam1").await;
        supervisor.add_stream("cam1", CAM).await.unwrap();

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_live_playlist_with_ffmpeg() {
        let ffmpeg = PathBuf::from("ffmpeg");
        if !crate::utils::process::tool_available(&ffmpeg) {
            eprintln!("ffmpeg not found, skipping");
            return;
        }

        let fx = Fixture::new();
        let mut options = fx.options();
        options.segment_duration = 1;
        let backend = Arc::new(FfmpegBackend::new(ffmpeg, "ffprobe", Duration::from_secs(5)));
        let supervisor = StreamSupervisor::new(options, fx.store(), backend).unwrap();

        supervisor
            .add_stream("cam1", "synthetic://cam1?fps=15&width=640&height=480")
            .await
            .unwrap();
        assert!(supervisor.list_streams().contains_key("cam1"));

        let playlist = fx.root.join("cam1").join(PLAYLIST_FILE);
        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&playlist).unwrap_or_default();
            if contents.lines().any(|line| line.ends_with(".ts")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(contents.starts_with("#EXTM3U"));
        assert!(contents.lines().any(|line| line.ends_with(".ts")));

        supervisor.remove_stream("cam1").await;
        assert!(!fx.root.join("cam1").exists());
        assert!(!supervisor.list_streams().contains_key("cam1"));
    }

    #[tokio::test]
    async fn test_playback_url_encodes_id() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        let listing = supervisor.add_stream("front door", CAM).await.unwrap();
        assert_eq!(listing.playback_url, "/stream/front%20door/index.m3u8");
        supervisor.shutdown_all().await;
    }
}
