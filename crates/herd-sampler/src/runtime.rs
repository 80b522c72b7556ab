use crate::source::{FrameSource, SourceError};
use chrono::Utc;
use herd_core::oracle_contracts::{analyze, OracleAdapter, OracleGuardrails, COW_FEEDING_INSTRUCTION};
use herd_core::{AnalysisSnapshot, FrameFormat, SampledFrame};
use herd_storage::{write_atomic, SnapshotStore, TextJournal};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_FPS: f64 = 30.0;
pub const DEFAULT_ANALYSIS_INTERVAL: u64 = 90;
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 10_000;

/// Bounds on the pacing period; rates outside them are clamped.
pub const MIN_FRAME_PERIOD: Duration = Duration::from_millis(1);
pub const MAX_FRAME_PERIOD: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerPhase {
    Idle,
    Opening,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame source failed: {0}")]
    Source(#[from] SourceError),
    #[error("frame source yielded nothing after rewind")]
    SourceExhausted,
    #[error("frame reader failed: {0}")]
    Reader(String),
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Overrides the source's native rate.
    pub fps: Option<f64>,
    /// Every n-th sampled frame is analyzed.
    pub analysis_interval: u64,
    pub open_timeout: Duration,
    pub instruction: String,
    pub guardrails: OracleGuardrails,
    pub frame_path: Option<PathBuf>,
    pub journal: Option<TextJournal>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            fps: None,
            analysis_interval: DEFAULT_ANALYSIS_INTERVAL,
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
            instruction: COW_FEEDING_INSTRUCTION.to_string(),
            guardrails: OracleGuardrails::default(),
            frame_path: None,
            journal: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SamplerReport {
    pub frames_sampled: u64,
    pub analyses: u64,
    pub rewinds: u64,
}

/// Pulls frames from a source at a fixed pace and publishes an analysis of
/// every `analysis_interval`-th frame to the snapshot store.
pub struct Sampler {
    source: Mutex<Option<Box<dyn FrameSource>>>,
    store: Arc<dyn SnapshotStore>,
    oracle: Arc<dyn OracleAdapter>,
    config: SamplerConfig,
    phase: watch::Sender<SamplerPhase>,
}

impl Sampler {
    pub fn new(
        source: Box<dyn FrameSource>,
        store: Arc<dyn SnapshotStore>,
        oracle: Arc<dyn OracleAdapter>,
        config: SamplerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SamplerPhase::Idle);
        Self {
            source: Mutex::new(Some(source)),
            store,
            oracle,
            config,
            phase,
        }
    }

    pub fn phases(&self) -> watch::Receiver<SamplerPhase> {
        self.phase.subscribe()
    }

    /// Runs until `cancel` fires or the source fails. The last snapshot
    /// published is `stopped` on cancellation and `error` on failure.
    pub async fn run(self, cancel: CancellationToken) -> Result<SamplerReport, SamplerError> {
        self.set_phase(SamplerPhase::Opening);
        let source = match self.open_source().await {
            Ok(source) => source,
            Err(err) => {
                warn!(event = "sampler_open_failed", error = %err);
                self.publish(&AnalysisSnapshot::error(err.to_string(), 0));
                self.set_phase(SamplerPhase::Stopped);
                return Err(err);
            }
        };

        self.set_phase(SamplerPhase::Running);
        let mut report = SamplerReport::default();
        let mut slot = Some(source);
        let outcome = self.sample_loop(&mut slot, &cancel, &mut report).await;

        self.set_phase(SamplerPhase::Stopping);
        match slot.take() {
            Some(mut source) => source.release(),
            None => warn!(event = "sampler_source_lost", "frame reader died holding the source"),
        }

        let result = match outcome {
            Ok(()) => {
                self.publish(&AnalysisSnapshot::stopped(report.frames_sampled));
                info!(
                    event = "sampler_stopped",
                    frames = report.frames_sampled,
                    analyses = report.analyses,
                    rewinds = report.rewinds
                );
                Ok(report)
            }
            Err(err) => {
                warn!(event = "sampler_failed", frames = report.frames_sampled, error = %err);
                self.publish(&AnalysisSnapshot::error(
                    format!("Sampler error: {err}"),
                    report.frames_sampled,
                ));
                Err(err)
            }
        };
        self.set_phase(SamplerPhase::Stopped);
        result
    }

    fn set_phase(&self, phase: SamplerPhase) {
        self.phase.send_replace(phase);
        debug!(event = "sampler_phase", phase = ?phase);
    }

    fn publish(&self, snapshot: &AnalysisSnapshot) {
        if let Err(err) = self.store.publish(snapshot) {
            warn!(
                event = "snapshot_publish_failed",
                store = %self.store.describe(),
                status = %snapshot.status,
                error = %err
            );
        }
    }

    async fn open_source(&self) -> Result<Box<dyn FrameSource>, SamplerError> {
        let taken = self
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let mut source = taken
            .ok_or_else(|| SamplerError::SourceUnavailable("source already consumed".into()))?;
        let description = source.describe();
        let timeout = self.config.open_timeout;

        let (opened, mut waiting) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let result = source.open();
            if let Err((mut source, _)) = opened.send((source, result)) {
                source.release();
            }
        });

        match tokio::time::timeout(timeout, &mut waiting).await {
            Ok(Ok((source, Ok(())))) => {
                info!(event = "sampler_source_opened", source = %description);
                Ok(source)
            }
            Ok(Ok((mut source, Err(err)))) => {
                source.release();
                Err(SamplerError::SourceUnavailable(format!("{description}: {err}")))
            }
            Ok(Err(_)) => Err(SamplerError::SourceUnavailable(format!(
                "{description}: open worker exited"
            ))),
            Err(_) => {
                // A late open either lands here or is released by the worker.
                waiting.close();
                if let Ok((mut source, _)) = waiting.try_recv() {
                    source.release();
                }
                Err(SamplerError::SourceUnavailable(format!(
                    "{description}: open timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn sample_loop(
        &self,
        slot: &mut Option<Box<dyn FrameSource>>,
        cancel: &CancellationToken,
        report: &mut SamplerReport,
    ) -> Result<(), SamplerError> {
        let fps = self
            .config
            .fps
            .or_else(|| slot.as_ref().and_then(|source| source.frames_per_second()))
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(DEFAULT_FPS);
        let interval = self.config.analysis_interval.max(1);

        let mut ticker = tokio::time::interval(frame_period(fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(event = "sampler_running", fps, analysis_interval = interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let Some(mut source) = slot.take() else {
                return Err(SamplerError::Reader("source missing".to_string()));
            };
            let (source, read) = tokio::task::spawn_blocking(move || {
                let read = read_frame(source.as_mut());
                (source, read)
            })
            .await
            .map_err(|err| SamplerError::Reader(err.to_string()))?;
            *slot = Some(source);

            let (bytes, rewound) = read?;
            if rewound {
                report.rewinds += 1;
                debug!(event = "sampler_rewound", frames = report.frames_sampled);
            }

            report.frames_sampled += 1;
            if report.frames_sampled % interval == 0 {
                self.analyze_frame(report.frames_sampled, bytes).await;
                report.analyses += 1;
            }
        }
    }

    async fn analyze_frame(&self, index: u64, bytes: Vec<u8>) {
        if let Some(path) = &self.config.frame_path {
            if let Err(err) = write_atomic(path, &bytes) {
                warn!(event = "frame_export_failed", path = %path.display(), error = %err);
            }
        }

        let format = FrameFormat::sniff(&bytes).unwrap_or(FrameFormat::Jpeg);
        let frame = SampledFrame::new(index, bytes, format);
        let analysis = analyze(
            self.oracle.as_ref(),
            frame,
            &self.config.instruction,
            &self.config.guardrails,
        )
        .await;

        self.publish(&AnalysisSnapshot::running(analysis.clone(), index));
        info!(event = "frame_analyzed", frame = index, chars = analysis.len());

        if let Some(journal) = &self.config.journal {
            if let Err(err) = journal.append(Utc::now(), &format!("FRAME {index}"), &analysis) {
                warn!(event = "analysis_journal_failed", error = %err);
            }
        }
    }
}

/// Next frame, rewinding once at end of stream. The flag reports a rewind.
fn read_frame(source: &mut dyn FrameSource) -> Result<(Vec<u8>, bool), SamplerError> {
    if let Some(bytes) = source.next_frame()? {
        return Ok((bytes, false));
    }
    source.rewind()?;
    let bytes = source.next_frame()?.ok_or(SamplerError::SourceExhausted)?;
    Ok((bytes, true))
}

fn frame_period(fps: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / fps)
        .unwrap_or(MAX_FRAME_PERIOD)
        .clamp(MIN_FRAME_PERIOD, MAX_FRAME_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herd_core::oracle_contracts::{OracleError, OracleFailureKind, OracleRequest};
    use herd_core::SnapshotStatus;
    use herd_storage::StorageError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x01];

    #[derive(Default)]
    struct RecordingStore {
        published: Mutex<Vec<AnalysisSnapshot>>,
    }

    impl RecordingStore {
        fn all(&self) -> Vec<AnalysisSnapshot> {
            self.published.lock().expect("published").clone()
        }

        fn running(&self) -> Vec<AnalysisSnapshot> {
            self.all()
                .into_iter()
                .filter(|snapshot| snapshot.status == SnapshotStatus::Running)
                .collect()
        }
    }

    impl SnapshotStore for RecordingStore {
        fn publish(&self, snapshot: &AnalysisSnapshot) -> Result<(), StorageError> {
            self.published
                .lock()
                .expect("published")
                .push(snapshot.clone());
            Ok(())
        }

        fn read(&self) -> AnalysisSnapshot {
            self.all()
                .last()
                .cloned()
                .unwrap_or_else(|| AnalysisSnapshot::disconnected(None))
        }

        fn reset(&self) -> Result<(), StorageError> {
            self.published.lock().expect("published").clear();
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    struct ScriptedSource {
        frames: usize,
        cursor: usize,
        fail_open: bool,
        open_delay: Option<Duration>,
        released: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(frames: usize) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            (
                Self {
                    frames,
                    cursor: 0,
                    fail_open: false,
                    open_delay: None,
                    released: released.clone(),
                },
                released,
            )
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self) -> Result<(), SourceError> {
            if let Some(delay) = self.open_delay {
                std::thread::sleep(delay);
            }
            if self.fail_open {
                return Err(SourceError::NotFound(PathBuf::from("barn_cam.mp4")));
            }
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
            if self.cursor >= self.frames {
                return Ok(None);
            }
            self.cursor += 1;
            Ok(Some(JPEG.to_vec()))
        }

        fn rewind(&mut self) -> Result<(), SourceError> {
            self.cursor = 0;
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn frames_per_second(&self) -> Option<f64> {
            Some(1_000.0)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct CountingOracle {
        fail: Option<OracleFailureKind>,
        calls: AtomicUsize,
    }

    impl CountingOracle {
        fn new(fail: Option<OracleFailureKind>) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OracleAdapter for CountingOracle {
        fn provider_name(&self) -> &str {
            "counting"
        }

        async fn complete(
            &self,
            request: &OracleRequest,
            _guardrails: &OracleGuardrails,
        ) -> Result<String, OracleError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let frame = request.image.as_ref().map(|frame| frame.index).unwrap_or(0);
            match self.fail {
                Some(kind) => Err(OracleError::new(kind, "connection reset")),
                None => Ok(format!("call {call}: frame {frame} shows two cows eating")),
            }
        }
    }

    fn config(analysis_interval: u64) -> SamplerConfig {
        SamplerConfig {
            analysis_interval,
            ..SamplerConfig::default()
        }
    }

    async fn wait_for_running(store: &RecordingStore, count: usize) {
        for _ in 0..500 {
            if store.running().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sampler never published {count} running snapshots");
    }

    #[tokio::test]
    async fn sample_indices_increase_across_rewinds_without_error_snapshots() {
        let store = Arc::new(RecordingStore::default());
        let (source, released) = ScriptedSource::new(3);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            config(2),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        wait_for_running(&store, 5).await;
        cancel.cancel();
        let report = handle.await.expect("join").expect("run");

        assert!(report.rewinds >= 2);
        assert!(released.load(Ordering::SeqCst));
        let all = store.all();
        assert!(all.iter().all(|s| s.status != SnapshotStatus::Error));

        let indices: Vec<u64> = store.running().iter().map(|s| s.sample_index).collect();
        assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(&indices[..3], &[2, 4, 6]);
        assert!(store.running()[0].analysis.contains("frame 2"));
    }

    #[tokio::test]
    async fn oracle_transport_fault_is_published_as_running_text() {
        let store = Arc::new(RecordingStore::default());
        let (source, _) = ScriptedSource::new(10);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(Some(OracleFailureKind::Transport))),
            config(1),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        wait_for_running(&store, 3).await;
        cancel.cancel();
        handle.await.expect("join").expect("run");

        let running = store.running();
        assert!(running.len() >= 3);
        for snapshot in running {
            assert!(snapshot
                .analysis
                .starts_with("Analysis error (transport): connection reset"));
        }
    }

    #[tokio::test]
    async fn cancellation_publishes_stopped_and_reports_phases() {
        let store = Arc::new(RecordingStore::default());
        let (source, released) = ScriptedSource::new(4);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            config(1),
        );
        let mut phases = sampler.phases();
        assert_eq!(*phases.borrow(), SamplerPhase::Idle);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));
        phases
            .wait_for(|phase| *phase == SamplerPhase::Running)
            .await
            .expect("running phase");

        wait_for_running(&store, 1).await;
        cancel.cancel();
        let report = handle.await.expect("join").expect("run");

        assert_eq!(*phases.borrow(), SamplerPhase::Stopped);
        assert!(released.load(Ordering::SeqCst));
        let last = store.read();
        assert_eq!(last.status, SnapshotStatus::Stopped);
        assert_eq!(last.analysis, "Analysis stopped");
        assert_eq!(last.sample_index, report.frames_sampled);
    }

    #[tokio::test]
    async fn open_failure_publishes_error_and_returns_source_unavailable() {
        let store = Arc::new(RecordingStore::default());
        let (mut source, released) = ScriptedSource::new(1);
        source.fail_open = true;
        let oracle = Arc::new(CountingOracle::new(None));
        let sampler = Sampler::new(Box::new(source), store.clone(), oracle.clone(), config(1));
        let phases = sampler.phases();

        let err = sampler
            .run(CancellationToken::new())
            .await
            .expect_err("open fails");
        assert!(matches!(err, SamplerError::SourceUnavailable(_)));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(*phases.borrow(), SamplerPhase::Stopped);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);

        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SnapshotStatus::Error);
        assert!(all[0].analysis.contains("barn_cam.mp4"));
    }

    #[tokio::test]
    async fn empty_stream_after_rewind_ends_with_error_snapshot() {
        let store = Arc::new(RecordingStore::default());
        let (source, released) = ScriptedSource::new(0);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            config(1),
        );

        let err = sampler
            .run(CancellationToken::new())
            .await
            .expect_err("exhausted");
        assert!(matches!(err, SamplerError::SourceExhausted));
        assert!(released.load(Ordering::SeqCst));
        let last = store.read();
        assert_eq!(last.status, SnapshotStatus::Error);
        assert!(last.analysis.starts_with("Sampler error"));
    }

    #[tokio::test]
    async fn analyses_are_journaled_and_frame_is_exported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame_path = dir.path().join("current_frame.jpg");
        let journal_path = dir.path().join("analysis_log.txt");
        let store = Arc::new(RecordingStore::default());
        let (source, _) = ScriptedSource::new(5);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            SamplerConfig {
                analysis_interval: 2,
                frame_path: Some(frame_path.clone()),
                journal: Some(TextJournal::new(&journal_path)),
                ..SamplerConfig::default()
            },
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));
        wait_for_running(&store, 2).await;
        cancel.cancel();
        handle.await.expect("join").expect("run");

        assert_eq!(std::fs::read(&frame_path).expect("frame"), JPEG);
        let journal = std::fs::read_to_string(&journal_path).expect("journal");
        assert!(journal.contains(" - FRAME 2: call 1: frame 2 shows two cows eating"));
        assert!(journal.contains(" - FRAME 4: "));
    }

    #[tokio::test]
    async fn timed_out_open_releases_the_source_once_it_returns() {
        let store = Arc::new(RecordingStore::default());
        let (mut source, released) = ScriptedSource::new(1);
        source.open_delay = Some(Duration::from_millis(100));
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            SamplerConfig {
                open_timeout: Duration::from_millis(10),
                ..config(1)
            },
        );

        let err = sampler
            .run(CancellationToken::new())
            .await
            .expect_err("open times out");
        assert!(matches!(err, SamplerError::SourceUnavailable(ref msg) if msg.contains("timed out")));
        assert_eq!(store.read().status, SnapshotStatus::Error);

        for _ in 0..100 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn frame_period_is_clamped() {
        assert_eq!(frame_period(2.0), Duration::from_millis(500));
        assert_eq!(frame_period(1e12), MIN_FRAME_PERIOD);
        assert_eq!(frame_period(1e-300), MAX_FRAME_PERIOD);
    }

    #[tokio::test]
    async fn huge_frame_rate_runs_at_the_minimum_period() {
        let store = Arc::new(RecordingStore::default());
        let (source, released) = ScriptedSource::new(3);
        let sampler = Sampler::new(
            Box::new(source),
            store.clone(),
            Arc::new(CountingOracle::new(None)),
            SamplerConfig {
                fps: Some(1e12),
                ..config(1)
            },
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        wait_for_running(&store, 2).await;
        cancel.cancel();
        let report = handle.await.expect("join").expect("run");

        assert!(report.frames_sampled >= 2);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(store.read().status, SnapshotStatus::Stopped);
    }
}
