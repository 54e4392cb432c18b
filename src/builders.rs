use std::sync::Arc;

use crate::analysis::{DiffAnalyzer, MotionAnalyzer};
use crate::camera_session::CameraSession;
use crate::config::CameraConfig;
use crate::errors::{MotionError, Result};
use crate::frame_store::FrameStore;
use crate::notifier::{LogNotifier, Notifier};
use crate::video_source::{open_source, VideoSource};

/// Builder for CameraSession. Anything not supplied falls back to the
/// production collaborator for the camera's configuration.
pub struct CameraSessionBuilder {
    config: Option<Arc<CameraConfig>>,
    store: Option<FrameStore>,
    source: Option<Box<dyn VideoSource>>,
    analyzer: Option<Arc<dyn MotionAnalyzer>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Default for CameraSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSessionBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            source: None,
            analyzer: None,
            notifier: None,
        }
    }

    pub fn config(mut self, config: Arc<CameraConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: FrameStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, source: Box<dyn VideoSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn MotionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<CameraSession> {
        let config = self.config
            .ok_or_else(|| MotionError::config("camera config is required"))?;
        let store = self.store
            .ok_or_else(|| MotionError::config("frame store is required"))?;

        let source = match self.source {
            Some(source) => source,
            None => open_source(&config)?,
        };
        let analyzer = self.analyzer
            .unwrap_or_else(|| Arc::new(DiffAnalyzer::default()));
        let notifier = self.notifier
            .unwrap_or_else(|| Arc::new(LogNotifier));

        CameraSession::new(config, source, analyzer, notifier, store)
    }
}
