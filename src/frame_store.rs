use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Which rendering of a camera's latest frame a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameView {
    Annotated,
    Delta,
    Threshold,
}

impl FrameView {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "annotated" | "frame" => Some(Self::Annotated),
            "delta" => Some(Self::Delta),
            "threshold" => Some(Self::Threshold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameView::Annotated => "annotated",
            FrameView::Delta => "delta",
            FrameView::Threshold => "threshold",
        }
    }
}

struct CameraSlots {
    annotated: watch::Sender<Option<Bytes>>,
    delta: watch::Sender<Option<Bytes>>,
    threshold: watch::Sender<Option<Bytes>>,
}

impl CameraSlots {
    fn new() -> Self {
        Self {
            annotated: watch::channel(None).0,
            delta: watch::channel(None).0,
            threshold: watch::channel(None).0,
        }
    }

    fn slot(&self, view: FrameView) -> &watch::Sender<Option<Bytes>> {
        match view {
            FrameView::Annotated => &self.annotated,
            FrameView::Delta => &self.delta,
            FrameView::Threshold => &self.threshold,
        }
    }
}

/// Latest encoded frame per camera.
///
/// Each slot holds an immutable `Bytes` value that is swapped as a whole on
/// every write, so a reader sees either the previous or the new frame. Only
/// the owning session writes a camera's slots; any number of viewers read
/// them. The outer lock is only taken for writing when a camera is added.
#[derive(Clone, Default)]
pub struct FrameStore {
    cameras: Arc<RwLock<HashMap<String, CameraSlots>>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create empty slots for a camera. Existing frames are kept so a
    /// restarted session keeps serving its last picture.
    pub async fn register(&self, camera_id: &str) {
        let mut cameras = self.cameras.write().await;
        if !cameras.contains_key(camera_id) {
            cameras.insert(camera_id.to_string(), CameraSlots::new());
            debug!("Registered frame slots for camera '{}'", camera_id);
        }
    }

    pub async fn set(&self, camera_id: &str, frame: Bytes) {
        self.set_view(camera_id, FrameView::Annotated, frame).await;
    }

    pub async fn set_view(&self, camera_id: &str, view: FrameView, frame: Bytes) {
        {
            let cameras = self.cameras.read().await;
            if let Some(slots) = cameras.get(camera_id) {
                slots.slot(view).send_replace(Some(frame));
                return;
            }
        }

        // Unregistered writer, create the slots on the fly
        self.register(camera_id).await;
        let cameras = self.cameras.read().await;
        if let Some(slots) = cameras.get(camera_id) {
            slots.slot(view).send_replace(Some(frame));
        }
    }

    /// Latest annotated frame, `None` while the camera has not produced one.
    pub async fn get(&self, camera_id: &str) -> Option<Bytes> {
        self.get_view(camera_id, FrameView::Annotated).await
    }

    pub async fn get_view(&self, camera_id: &str, view: FrameView) -> Option<Bytes> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).and_then(|slots| slots.slot(view).borrow().clone())
    }

    #[cfg(test)]
    pub async fn contains(&self, camera_id: &str) -> bool {
        self.cameras.read().await.contains_key(camera_id)
    }

    /// Receiver for one slot. Readers holding it see every later write
    /// without going through the camera map again.
    pub async fn subscribe(&self, camera_id: &str, view: FrameView) -> Option<watch::Receiver<Option<Bytes>>> {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map(|slots| slots.slot(view).subscribe())
    }
}
