use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::camera_session::{CameraSession, SessionStats};
use crate::config::CameraConfig;
use crate::errors::{MotionError, Result};

pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Builds a fresh session for a camera, both at startup and after a crash.
pub type SessionFactory = Arc<dyn Fn(Arc<CameraConfig>) -> Result<CameraSession> + Send + Sync>;

struct SupervisedCamera {
    camera_id: String,
    task_handle: JoinHandle<SessionStats>,
}

/// Runs one session per camera, each on its own task.
///
/// A session that panics is rebuilt from its configuration and started again
/// after `restart_delay`. A session that returns because it was cancelled
/// stays stopped. Sessions never wait on each other.
pub struct SessionSupervisor {
    factory: SessionFactory,
    cancel: CancellationToken,
    restart_delay: Duration,
    cameras: Vec<SupervisedCamera>,
}

impl SessionSupervisor {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            cancel: CancellationToken::new(),
            restart_delay: RESTART_DELAY,
            cameras: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    pub fn start(&mut self, config: CameraConfig) {
        let camera_id = config.name.clone();
        info!("Starting session for camera '{}'", camera_id);

        let task_handle = tokio::spawn(supervise(
            Arc::new(config),
            self.factory.clone(),
            self.cancel.child_token(),
            self.restart_delay,
        ));

        self.cameras.push(SupervisedCamera { camera_id, task_handle });
    }

    pub fn start_all<I>(&mut self, cameras: I)
    where
        I: IntoIterator<Item = CameraConfig>,
    {
        for config in cameras {
            self.start(config);
        }
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.camera_id.clone()).collect()
    }

    /// Token whose cancellation stops every session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all sessions and wait for them to finish.
    pub async fn shutdown(self) -> Vec<(String, SessionStats)> {
        info!("Stopping {} camera sessions", self.cameras.len());
        self.cancel.cancel();

        let mut results = Vec::with_capacity(self.cameras.len());
        for camera in self.cameras {
            match camera.task_handle.await {
                Ok(stats) => results.push((camera.camera_id, stats)),
                Err(e) => error!("Supervisor task for camera '{}' failed: {}", camera.camera_id, e),
            }
        }
        results
    }
}

async fn supervise(
    config: Arc<CameraConfig>,
    factory: SessionFactory,
    cancel: CancellationToken,
    restart_delay: Duration,
) -> SessionStats {
    let mut total = SessionStats::default();

    loop {
        // Factory panics are caught here too
        let task_handle = tokio::spawn({
            let config = config.clone();
            let factory = factory.clone();
            let cancel = cancel.clone();
            async move {
                let session = factory(config)?;
                Ok::<_, MotionError>(session.run(cancel).await)
            }
        });

        match task_handle.await {
            Ok(Ok(stats)) => {
                accumulate(&mut total, &stats);
                return total;
            }
            Ok(Err(e)) => {
                error!(
                    "Failed to create session for camera '{}': {}, retrying in {:?}",
                    config.name, e, restart_delay
                );
            }
            Err(e) if e.is_panic() => {
                error!(
                    "Session for camera '{}' panicked, restarting in {:?}",
                    config.name, restart_delay
                );
            }
            Err(e) => {
                warn!("Session for camera '{}' was aborted: {}", config.name, e);
                return total;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return total,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

fn accumulate(total: &mut SessionStats, stats: &SessionStats) {
    total.frames_read += stats.frames_read;
    total.frames_analyzed += stats.frames_analyzed;
    total.frames_published += stats.frames_published;
    total.reopen_attempts += stats.reopen_attempts;
    total.notifications_attempted += stats.notifications_attempted;
    total.notifications_failed += stats.notifications_failed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::CameraSessionBuilder;
    use crate::frame_store::FrameStore;
    use crate::video_source::VideoSource;
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Produces a frame every few milliseconds, or panics on the first read.
    struct TestSource {
        panic_on_read: bool,
    }

    #[async_trait]
    impl VideoSource for TestSource {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<RgbImage> {
            if self.panic_on_read {
                panic!("decoder crashed");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some(ImageBuffer::from_pixel(64, 48, Rgb([90, 90, 90])))
        }

        fn kind(&self) -> &'static str {
            "test"
        }
    }

    fn camera(name: &str) -> CameraConfig {
        let value = serde_json::json!({
            "name": name,
            "url": "http://10.0.0.5/video.mjpg",
            "resize": {"width": 64, "height": 48},
            "detection": {"frame_skip": 0}
        });
        crate::config::resolve_camera(&serde_json::Value::Null, value).unwrap()
    }

    async fn wait_for_frame(store: &FrameStore, camera_id: &str) -> bool {
        for _ in 0..500 {
            if store.get(camera_id).await.is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_panicked_session_is_restarted() {
        let store = FrameStore::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let factory: SessionFactory = {
            let store = store.clone();
            let builds = builds.clone();
            Arc::new(move |config: Arc<CameraConfig>| {
                // Only the first session crashes
                let attempt = builds.fetch_add(1, Ordering::SeqCst);
                CameraSessionBuilder::new()
                    .config(config)
                    .store(store.clone())
                    .source(Box::new(TestSource { panic_on_read: attempt == 0 }))
                    .build()
            })
        };

        let mut supervisor = SessionSupervisor::new(factory).with_restart_delay(Duration::from_millis(10));
        supervisor.start(camera("cam1"));

        assert!(wait_for_frame(&store, "cam1").await);
        assert!(builds.load(Ordering::SeqCst) >= 2);

        let results = supervisor.shutdown().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.frames_published > 0);
    }

    #[tokio::test]
    async fn test_crashing_camera_does_not_affect_others() {
        let store = FrameStore::new();
        let factory: SessionFactory = {
            let store = store.clone();
            Arc::new(move |config: Arc<CameraConfig>| {
                let broken = config.name == "broken";
                CameraSessionBuilder::new()
                    .config(config)
                    .store(store.clone())
                    .source(Box::new(TestSource { panic_on_read: broken }))
                    .build()
            })
        };

        let mut supervisor = SessionSupervisor::new(factory).with_restart_delay(Duration::from_millis(10));
        supervisor.start_all(vec![camera("broken"), camera("healthy")]);
        assert_eq!(supervisor.camera_ids(), vec!["broken".to_string(), "healthy".to_string()]);

        assert!(wait_for_frame(&store, "healthy").await);
        assert!(store.get("broken").await.is_none());

        let results = supervisor.shutdown().await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_is_retried_until_shutdown() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory: SessionFactory = {
            let attempts = attempts.clone();
            Arc::new(move |_config: Arc<CameraConfig>| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(MotionError::video_source("camera unreachable"))
            })
        };

        let mut supervisor = SessionSupervisor::new(factory).with_restart_delay(Duration::from_millis(5));
        supervisor.start(camera("cam1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let results = tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown()).await.unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(results[0].1, SessionStats::default());
    }

    #[tokio::test]
    async fn test_panic_while_building_session_is_restarted() {
        let store = FrameStore::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: SessionFactory = {
            let store = store.clone();
            let builds = builds.clone();
            Arc::new(move |config: Arc<CameraConfig>| {
                if builds.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("bad camera settings");
                }
                CameraSessionBuilder::new()
                    .config(config)
                    .store(store.clone())
                    .source(Box::new(TestSource { panic_on_read: false }))
                    .build()
            })
        };

        let mut supervisor = SessionSupervisor::new(factory).with_restart_delay(Duration::from_millis(10));
        supervisor.start(camera("cam1"));

        assert!(wait_for_frame(&store, "cam1").await);
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        let results = supervisor.shutdown().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.frames_published > 0);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_not_restarted() {
        let store = FrameStore::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: SessionFactory = {
            let store = store.clone();
            let builds = builds.clone();
            Arc::new(move |config: Arc<CameraConfig>| {
                builds.fetch_add(1, Ordering::SeqCst);
                CameraSessionBuilder::new()
                    .config(config)
                    .store(store.clone())
                    .source(Box::new(TestSource { panic_on_read: false }))
                    .build()
            })
        };

        let mut supervisor = SessionSupervisor::new(factory).with_restart_delay(Duration::from_millis(1));
        supervisor.start(camera("cam1"));
        assert!(wait_for_frame(&store, "cam1").await);

        supervisor.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
