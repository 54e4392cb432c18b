use bytes::Bytes;
use chrono::Local;
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::MotionAnalyzer;
use crate::config::{CameraConfig, ResizeConfig};
use crate::errors::{MotionError, Result};
use crate::frame_store::{FrameStore, FrameView};
use crate::motion_state::{format_seconds, FrameSampler, MotionState, NotifyRequest, Phase, PhaseUpdate};
use crate::notifier::{MotionEvent, Notifier};
use crate::overlay;
use crate::transcoder::FrameTranscoder;
use crate::video_source::VideoSource;

/// With no reconnect delay a dead source fails on every loop iteration, so
/// only the first failure and every Nth after it are logged.
const REOPEN_LOG_EVERY: u64 = 100;

/// Counters kept by a session over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_read: u64,
    /// Frames that made it past the frame-skip sampler
    pub frames_analyzed: u64,
    pub frames_published: u64,
    pub reopen_attempts: u64,
    pub notifications_attempted: u64,
    pub notifications_failed: u64,
}

struct RenderedFrame {
    annotated: Bytes,
    delta: Option<Bytes>,
    threshold: Option<Bytes>,
}

/// Capture, analysis and reaction loop for a single camera.
///
/// The session is the only writer of its camera's FrameStore slots. All of
/// its state (reference frame, phase timers, sampler) is private to it.
pub struct CameraSession {
    config: Arc<CameraConfig>,
    source: Box<dyn VideoSource>,
    analyzer: Arc<dyn MotionAnalyzer>,
    notifier: Arc<dyn Notifier>,
    store: FrameStore,
    transcoder: FrameTranscoder,
    sampler: FrameSampler,
    state: MotionState,
    reference: Option<Arc<GrayImage>>,
    notify_timeout: Duration,
    failed_reads: u64,
    stats: SessionStats,
}

impl CameraSession {
    pub fn new(
        config: Arc<CameraConfig>,
        source: Box<dyn VideoSource>,
        analyzer: Arc<dyn MotionAnalyzer>,
        notifier: Arc<dyn Notifier>,
        store: FrameStore,
    ) -> Result<Self> {
        let notify_timeout = config.notify_timeout()?;
        let state = MotionState::new(
            Instant::now(),
            config.detection.update_reference_after(),
            config.detection.notify_after(),
        );

        Ok(Self {
            transcoder: FrameTranscoder::new(config.jpeg_quality),
            sampler: FrameSampler::new(config.detection.frame_skip),
            config,
            source,
            analyzer,
            notifier,
            store,
            state,
            reference: None,
            notify_timeout,
            failed_reads: 0,
            stats: SessionStats::default(),
        })
    }

    #[cfg(test)]
    pub fn camera_id(&self) -> &str {
        &self.config.name
    }

    #[cfg(test)]
    pub fn state(&self) -> &MotionState {
        &self.state
    }

    #[cfg(test)]
    pub fn reference(&self) -> Option<&Arc<GrayImage>> {
        self.reference.as_ref()
    }

    #[cfg(test)]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Run until `cancel` fires. Source failures are handled by reopening
    /// the source; nothing else ends the loop.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionStats {
        self.store.register(&self.config.name).await;
        info!(
            "Camera '{}' detecting motion on {} ({})",
            self.config.name,
            self.config.redacted_source_url(),
            self.source.kind()
        );

        if let Err(e) = self.source.open().await {
            warn!("Camera '{}': failed to open source: {}", self.config.name, e);
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = self.source.next_frame() => frame,
            };

            match frame {
                Some(frame) => {
                    if self.failed_reads > 0 {
                        info!("Camera '{}': source recovered after {} failed reads", self.config.name, self.failed_reads);
                        self.failed_reads = 0;
                    }
                    self.handle_frame(frame, Instant::now()).await
                }
                None => {
                    if !self.reopen(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!("Camera '{}' session stopped: {:?}", self.config.name, self.stats);
        self.stats
    }

    /// Returns false when cancelled while waiting to reconnect.
    async fn reopen(&mut self, cancel: &CancellationToken) -> bool {
        self.stats.reopen_attempts += 1;
        self.failed_reads += 1;
        let log = should_log_reopen(self.failed_reads);
        if log {
            warn!(
                "Camera '{}': no frame from source, reopening ({} failed reads in a row)",
                self.config.name, self.failed_reads
            );
        }

        let delay = self.config.reconnect_delay();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return false,
            opened = self.source.open() => opened,
        };
        if let Err(e) = opened {
            if log {
                warn!("Camera '{}': reopen failed: {}", self.config.name, e);
            }
        }
        true
    }

    /// Feed one frame read from the source through the sampler and, if
    /// accepted, the analysis pipeline. `now` is the instant the frame
    /// was read.
    pub async fn handle_frame(&mut self, frame: RgbImage, now: Instant) {
        self.stats.frames_read += 1;
        if !self.sampler.accept() {
            return;
        }
        self.stats.frames_analyzed += 1;

        if let Err(e) = self.process_frame(frame, now).await {
            debug!("Camera '{}': skipping frame: {}", self.config.name, e);
        }
    }

    async fn process_frame(&mut self, frame: RgbImage, now: Instant) -> Result<()> {
        let analyzer = self.analyzer.clone();
        let resize = self.config.resize;
        let (resized, gray) = run_blocking(move || {
            let resized = resize_frame(frame, resize);
            let gray = analyzer.prepare(&resized)?;
            Ok((resized, gray))
        })
        .await?;
        let gray = Arc::new(gray);

        if !self.config.detection.enabled {
            let transcoder = self.transcoder;
            let jpeg = run_blocking(move || transcoder.encode_rgb(&resized)).await?;
            self.publish(RenderedFrame { annotated: jpeg, delta: None, threshold: None }).await;
            return Ok(());
        }

        let reference = match &self.reference {
            Some(reference) => reference.clone(),
            None => {
                debug!("Camera '{}': captured reference frame", self.config.name);
                self.reference = Some(gray);
                return Ok(());
            }
        };

        let analyzer = self.analyzer.clone();
        let min_area = self.config.detection.min_area;
        let current = gray.clone();
        let analysis = run_blocking(move || analyzer.analyze(resized, &current, &reference, min_area)).await?;

        if self.config.logging.log_frames && analysis.motion_detected {
            debug!("Camera '{}': {} changed regions", self.config.name, analysis.regions.len());
        }

        let update = self.state.observe(analysis.motion_detected, now);
        self.log_transition(&update);

        if update.refresh_reference {
            debug!(
                "Camera '{}': motion for {}, replacing reference frame",
                self.config.name,
                format_seconds(self.state.motion_duration())
            );
            self.reference = Some(gray);
        }

        if let Some(request) = update.notify {
            self.send_notification(request).await;
        }

        let status = self.state.status_text();
        let transcoder = self.transcoder;
        let views = self.config.debug_views;
        let rendered = run_blocking(move || {
            let mut annotated = analysis.annotated;
            overlay::annotate(&mut annotated, &status, Local::now());
            Ok(RenderedFrame {
                annotated: transcoder.encode_rgb(&annotated)?,
                delta: if views.frame_delta { Some(transcoder.encode_gray(&analysis.delta)?) } else { None },
                threshold: if views.threshold { Some(transcoder.encode_gray(&analysis.threshold)?) } else { None },
            })
        })
        .await?;

        self.publish(rendered).await;
        Ok(())
    }

    fn log_transition(&self, update: &PhaseUpdate) {
        if !self.config.logging.log_transitions {
            return;
        }
        if let Some((ended, duration)) = update.ended {
            match ended {
                Phase::Motion => info!("Camera '{}': motion stopped after {}", self.config.name, format_seconds(duration)),
                Phase::Motionless => info!("Camera '{}': motion started after {} without motion", self.config.name, format_seconds(duration)),
            }
        }
    }

    async fn send_notification(&mut self, request: NotifyRequest) {
        let event = MotionEvent::new(&self.config, request.motion_duration, request.motionless_for, Local::now());
        self.stats.notifications_attempted += 1;
        info!(
            "Notifying for camera '{}' via {}: motion lasted {}, quiet for {}",
            self.config.name,
            self.notifier.name(),
            event.motion_duration,
            format_seconds(request.motionless_for)
        );

        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.notifications_failed += 1;
                error!("Camera '{}': notification failed: {}", self.config.name, e);
            }
            Err(_) => {
                self.stats.notifications_failed += 1;
                error!("Camera '{}': notification timed out after {:?}", self.config.name, self.notify_timeout);
            }
        }
    }

    async fn publish(&mut self, rendered: RenderedFrame) {
        let camera_id = self.config.name.as_str();
        if self.config.logging.log_frames {
            debug!("Camera '{}' got a frame ({} bytes)", camera_id, rendered.annotated.len());
        }

        self.store.set(camera_id, rendered.annotated).await;
        if let Some(delta) = rendered.delta {
            self.store.set_view(camera_id, FrameView::Delta, delta).await;
        }
        if let Some(threshold) = rendered.threshold {
            self.store.set_view(camera_id, FrameView::Threshold, threshold).await;
        }
        self.stats.frames_published += 1;
    }
}

fn should_log_reopen(failed_reads: u64) -> bool {
    failed_reads == 1 || failed_reads % REOPEN_LOG_EVERY == 0
}

fn resize_frame(frame: RgbImage, target: ResizeConfig) -> RgbImage {
    if frame.dimensions() == (target.width, target.height) {
        frame
    } else {
        image::imageops::resize(&frame, target.width, target.height, FilterType::Triangle)
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MotionError::analysis(format!("analysis task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analysis;
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgb};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn frame() -> RgbImage {
        ImageBuffer::from_pixel(80, 60, Rgb([40, 80, 120]))
    }

    fn camera(extra: serde_json::Value) -> Arc<CameraConfig> {
        let mut value = serde_json::json!({
            "name": "cam1",
            "url": "http://10.0.0.5/video.mjpg",
            "resize": {"width": 64, "height": 48},
            "detection": {"frame_skip": 0, "update_reference_seconds": 10, "notify_seconds": 5}
        });
        crate::config::deep_merge(&mut value, extra);
        Arc::new(crate::config::resolve_camera(&serde_json::Value::Null, value).unwrap())
    }

    /// Plays back a fixed script of reads, then blocks forever.
    struct ScriptedSource {
        reads: VecDeque<Option<RgbImage>>,
        opens: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VideoSource for ScriptedSource {
        async fn open(&mut self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<RgbImage> {
            match self.reads.pop_front() {
                Some(read) => read,
                None => std::future::pending().await,
            }
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    fn source(reads: Vec<Option<RgbImage>>) -> (Box<dyn VideoSource>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let source: Box<dyn VideoSource> = Box::new(ScriptedSource { reads: reads.into(), opens: opens.clone() });
        (source, opens)
    }

    #[derive(Default)]
    struct FakeAnalyzer {
        motion: Mutex<VecDeque<bool>>,
        fail_prepare: bool,
        prepared: AtomicUsize,
        analyzed: AtomicUsize,
    }

    impl FakeAnalyzer {
        fn with_motion(motion: &[bool]) -> Arc<Self> {
            Arc::new(Self { motion: Mutex::new(motion.iter().copied().collect()), ..Default::default() })
        }
    }

    impl MotionAnalyzer for FakeAnalyzer {
        fn prepare(&self, frame: &RgbImage) -> Result<GrayImage> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                return Err(MotionError::analysis("conversion failed"));
            }
            Ok(image::imageops::grayscale(frame))
        }

        fn analyze(&self, frame: RgbImage, gray: &GrayImage, _reference: &GrayImage, _min_area: u32) -> Result<Analysis> {
            self.analyzed.fetch_add(1, Ordering::SeqCst);
            let motion = self.motion.lock().unwrap().pop_front().unwrap_or(false);
            Ok(Analysis {
                motion_detected: motion,
                annotated: frame,
                delta: gray.clone(),
                threshold: gray.clone(),
                regions: Vec::new(),
            })
        }
    }

    struct RecordingNotifier {
        events: Mutex<Vec<MotionEvent>>,
        fail: bool,
        delay: Duration,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()), fail: false, delay: Duration::ZERO })
        }

        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &MotionEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(MotionError::notify("smtp down"))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn session(
        config: Arc<CameraConfig>,
        analyzer: Arc<FakeAnalyzer>,
        notifier: Arc<RecordingNotifier>,
        store: FrameStore,
    ) -> CameraSession {
        let (source, _) = source(Vec::new());
        CameraSession::new(config, source, analyzer, notifier, store).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_frame_skip_three_analyzes_every_fourth_frame() {
        let analyzer = FakeAnalyzer::with_motion(&[]);
        let config = camera(serde_json::json!({"detection": {"frame_skip": 3}}));
        let mut session = session(config, analyzer.clone(), RecordingNotifier::new(), FrameStore::new());

        let t0 = Instant::now();
        for i in 1..=3 {
            session.handle_frame(frame(), t0 + secs(i)).await;
        }
        assert_eq!(analyzer.prepared.load(Ordering::SeqCst), 0);

        // Frame 4 is the first to get through and becomes the reference
        session.handle_frame(frame(), t0 + secs(4)).await;
        assert_eq!(analyzer.prepared.load(Ordering::SeqCst), 1);
        assert!(session.reference().is_some());

        for i in 5..=8 {
            session.handle_frame(frame(), t0 + secs(i)).await;
        }
        assert_eq!(analyzer.prepared.load(Ordering::SeqCst), 2);
        assert_eq!(analyzer.analyzed.load(Ordering::SeqCst), 1);
        assert_eq!(session.stats().frames_read, 8);
        assert_eq!(session.stats().frames_analyzed, 2);
    }

    #[tokio::test]
    async fn test_first_frame_becomes_reference_and_is_not_published() {
        let store = FrameStore::new();
        let analyzer = FakeAnalyzer::with_motion(&[]);
        let mut session = session(camera(serde_json::Value::Null), analyzer.clone(), RecordingNotifier::new(), store.clone());

        session.handle_frame(frame(), Instant::now()).await;
        assert!(session.reference().is_some());
        assert_eq!(analyzer.analyzed.load(Ordering::SeqCst), 0);
        assert!(store.get("cam1").await.is_none());

        session.handle_frame(frame(), Instant::now()).await;
        let jpeg = store.get("cam1").await.unwrap();
        let decoded = FrameTranscoder::decode(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[tokio::test]
    async fn test_reference_replaced_after_continuous_motion() {
        let t0 = Instant::now();
        let analyzer = FakeAnalyzer::with_motion(&[true; 20]);
        let mut session = session(camera(serde_json::Value::Null), analyzer, RecordingNotifier::new(), FrameStore::new());

        session.handle_frame(frame(), t0).await;
        let initial = session.reference().unwrap().clone();

        for i in 1..=10 {
            session.handle_frame(frame(), t0 + secs(i)).await;
            assert!(Arc::ptr_eq(&initial, session.reference().unwrap()), "replaced early at t={}", i);
        }

        session.handle_frame(frame(), t0 + secs(11)).await;
        assert!(!Arc::ptr_eq(&initial, session.reference().unwrap()));
        assert_eq!(session.state().phase(), Phase::Motion);
        assert!(session.state().motionless_duration().is_zero());
    }

    #[tokio::test]
    async fn test_notifies_once_after_quiet_period() {
        let t0 = Instant::now();
        let mut motion = vec![true, true, true];
        motion.extend([false; 20]);
        let analyzer = FakeAnalyzer::with_motion(&motion);
        let notifier = RecordingNotifier::new();
        let mut session = session(camera(serde_json::json!({"description": "Front door"})), analyzer, notifier.clone(), FrameStore::new());

        session.handle_frame(frame(), t0).await;
        for i in 1..=23 {
            session.handle_frame(frame(), t0 + secs(i)).await;
        }

        assert_eq!(notifier.count(), 1);
        let event = notifier.events.lock().unwrap()[0].clone();
        assert_eq!(event.description, "Front door");
        assert_eq!(event.motion_duration, "3.00 seconds");
        assert!(session.state().notified());
        assert_eq!(session.stats().notifications_attempted, 1);
        assert_eq!(session.stats().notifications_failed, 0);
    }

    #[tokio::test]
    async fn test_failed_notification_is_not_retried() {
        let t0 = Instant::now();
        let mut motion = vec![true];
        motion.extend([false; 20]);
        let analyzer = FakeAnalyzer::with_motion(&motion);
        let notifier = Arc::new(RecordingNotifier { events: Mutex::new(Vec::new()), fail: true, delay: Duration::ZERO });
        let mut session = session(camera(serde_json::Value::Null), analyzer, notifier.clone(), FrameStore::new());

        session.handle_frame(frame(), t0).await;
        for i in 1..=21 {
            session.handle_frame(frame(), t0 + secs(i)).await;
        }

        assert_eq!(notifier.count(), 1);
        assert!(session.state().notified());
        assert_eq!(session.stats().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_slow_notification_is_cut_off() {
        let t0 = Instant::now();
        let analyzer = FakeAnalyzer::with_motion(&[true, false, false]);
        let notifier = Arc::new(RecordingNotifier { events: Mutex::new(Vec::new()), fail: false, delay: secs(60) });
        let config = camera(serde_json::json!({"notify_timeout": "50ms"}));
        let mut session = session(config, analyzer, notifier.clone(), FrameStore::new());

        session.handle_frame(frame(), t0).await;
        session.handle_frame(frame(), t0 + secs(1)).await;
        let started = std::time::Instant::now();
        session.handle_frame(frame(), t0 + secs(10)).await;

        assert!(started.elapsed() < secs(5));
        assert_eq!(notifier.count(), 1);
        assert_eq!(session.stats().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_publishes_resized_frame_without_detection() {
        let store = FrameStore::new();
        let analyzer = FakeAnalyzer::with_motion(&[]);
        let config = camera(serde_json::json!({"detection": {"enabled": false}}));
        let mut session = session(config, analyzer.clone(), RecordingNotifier::new(), store.clone());

        session.handle_frame(frame(), Instant::now()).await;

        let jpeg = store.get("cam1").await.unwrap();
        assert_eq!(FrameTranscoder::decode(&jpeg).unwrap().dimensions(), (64, 48));
        assert_eq!(analyzer.analyzed.load(Ordering::SeqCst), 0);
        assert!(session.reference().is_none());
    }

    #[tokio::test]
    async fn test_conversion_failure_leaves_state_alone() {
        let store = FrameStore::new();
        let analyzer = Arc::new(FakeAnalyzer { fail_prepare: true, ..Default::default() });
        let mut session = session(camera(serde_json::Value::Null), analyzer, RecordingNotifier::new(), store.clone());

        for i in 0..3 {
            session.handle_frame(frame(), Instant::now() + secs(i)).await;
        }

        assert!(session.reference().is_none());
        assert!(store.get("cam1").await.is_none());
        assert_eq!(session.state().phase(), Phase::Motionless);
        assert!(session.state().motion_duration().is_zero());
    }

    #[tokio::test]
    async fn test_debug_views_published_when_enabled() {
        let store = FrameStore::new();
        let analyzer = FakeAnalyzer::with_motion(&[false]);
        let config = camera(serde_json::json!({"debug_views": {"frame_delta": true}}));
        let mut session = session(config, analyzer, RecordingNotifier::new(), store.clone());

        session.handle_frame(frame(), Instant::now()).await;
        session.handle_frame(frame(), Instant::now()).await;

        assert!(store.get("cam1").await.is_some());
        assert!(store.get_view("cam1", FrameView::Delta).await.is_some());
        assert!(store.get_view("cam1", FrameView::Threshold).await.is_none());
    }

    async fn wait_for_frame(store: &FrameStore, camera_id: &str) {
        for _ in 0..500 {
            if store.get(camera_id).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no frame published for {}", camera_id);
    }

    #[tokio::test]
    async fn test_reopens_once_per_failed_read() {
        let store = FrameStore::new();
        let mut reads: Vec<Option<RgbImage>> = vec![None; 5];
        reads.push(Some(frame()));
        reads.push(Some(frame()));
        let (source, opens) = source(reads);

        let session = CameraSession::new(
            camera(serde_json::Value::Null),
            source,
            FakeAnalyzer::with_motion(&[false]),
            RecordingNotifier::new(),
            store.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        wait_for_frame(&store, "cam1").await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.reopen_attempts, 5);
        // Initial open plus one per failed read
        assert_eq!(opens.load(Ordering::SeqCst), 6);
        assert_eq!(stats.frames_read, 2);
        assert_eq!(stats.frames_published, 1);
    }

    #[tokio::test]
    async fn test_failed_reads_leave_motion_state_intact() {
        let t0 = Instant::now();
        let (source, opens) = source(Vec::new());
        let mut session = CameraSession::new(
            camera(serde_json::Value::Null),
            source,
            FakeAnalyzer::with_motion(&[true, true]),
            RecordingNotifier::new(),
            FrameStore::new(),
        )
        .unwrap();

        session.handle_frame(frame(), t0 + secs(1)).await;
        session.handle_frame(frame(), t0 + secs(2)).await;
        assert_eq!(session.state().phase(), Phase::Motion);

        let reference = session.reference().unwrap().clone();
        let motion_duration = session.state().motion_duration();
        let status = session.state().status_text();

        let cancel = CancellationToken::new();
        for _ in 0..5 {
            assert!(session.reopen(&cancel).await);
        }

        assert_eq!(session.stats().reopen_attempts, 5);
        assert_eq!(opens.load(Ordering::SeqCst), 5);
        assert_eq!(session.state().phase(), Phase::Motion);
        assert_eq!(session.state().motion_duration(), motion_duration);
        assert_eq!(session.state().motionless_duration(), Duration::ZERO);
        assert!(!session.state().notified());
        assert_eq!(session.state().status_text(), status);
        assert!(Arc::ptr_eq(session.reference().unwrap(), &reference));

        // Tracking carries on from where it was
        session.handle_frame(frame(), t0 + secs(3)).await;
        assert_eq!(session.state().phase(), Phase::Motion);
        assert!(session.state().motion_duration() > motion_duration);
        assert!(Arc::ptr_eq(session.reference().unwrap(), &reference));
    }

    #[test]
    fn test_reopen_logging_is_rate_limited() {
        assert!(should_log_reopen(1));
        assert!(!should_log_reopen(2));
        assert!(!should_log_reopen(REOPEN_LOG_EVERY - 1));
        assert!(should_log_reopen(REOPEN_LOG_EVERY));
        assert!(!should_log_reopen(REOPEN_LOG_EVERY + 1));
        assert!(should_log_reopen(REOPEN_LOG_EVERY * 3));
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_session() {
        let store = FrameStore::new();
        let (source, _) = source(Vec::new());
        let session = CameraSession::new(
            camera(serde_json::Value::Null),
            source,
            FakeAnalyzer::with_motion(&[]),
            RecordingNotifier::new(),
            store.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.contains("cam1").await);
        cancel.cancel();
        let stats = tokio::time::timeout(secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats, SessionStats::default());
    }

    #[tokio::test]
    async fn test_cancel_during_reconnect_delay() {
        let (source, opens) = source(vec![None]);
        let config = camera(serde_json::json!({"reconnect_interval": 3600}));
        let session = CameraSession::new(config, source, FakeAnalyzer::with_motion(&[]), RecordingNotifier::new(), FrameStore::new()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.reopen_attempts, 1);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }
}
