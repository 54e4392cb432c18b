use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::frame_store::{FrameStore, FrameView};

pub const BOUNDARY: &str = "frame";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// One part of the multipart stream: boundary, headers, JPEG, CRLF.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Per-viewer stream state; logs the disconnect when the response body is
/// dropped.
struct Viewer {
    id: uuid::Uuid,
    camera_id: String,
    view: FrameView,
    store: FrameStore,
    frames: Option<watch::Receiver<Option<Bytes>>>,
    placeholder: Bytes,
    ticker: Interval,
    shutdown: CancellationToken,
    sent: u64,
}

impl Drop for Viewer {
    fn drop(&mut self) {
        info!(
            "Viewer {} left camera '{}' ({} frames sent)",
            self.id, self.camera_id, self.sent
        );
    }
}

/// Endless multipart body for one viewer. Every `frame_interval` the latest
/// frame is read from the camera's watch slot and sent, or `placeholder`
/// while there is none yet.
/// Each viewer paces itself; sessions never wait on it. The stream ends
/// when `shutdown` is cancelled.
pub fn frame_stream(
    store: FrameStore,
    camera_id: String,
    view: FrameView,
    frame_interval: Duration,
    placeholder: Bytes,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut ticker = interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let viewer = Viewer {
        id: uuid::Uuid::new_v4(),
        camera_id,
        view,
        store,
        frames: None,
        placeholder,
        ticker,
        shutdown,
        sent: 0,
    };
    info!("Viewer {} joined camera '{}' ({})", viewer.id, viewer.camera_id, viewer.view.as_str());

    stream::unfold(viewer, |mut viewer| async move {
        tokio::select! {
            biased;
            _ = viewer.shutdown.cancelled() => return None,
            _ = viewer.ticker.tick() => {}
        }

        // The camera may not have registered yet
        if viewer.frames.is_none() {
            viewer.frames = viewer.store.subscribe(&viewer.camera_id, viewer.view).await;
        }

        let latest = viewer.frames.as_ref().and_then(|frames| frames.borrow().clone());
        let frame = match latest {
            Some(frame) => frame,
            None => {
                debug!("No frame yet for camera '{}', sending placeholder", viewer.camera_id);
                viewer.placeholder.clone()
            }
        };
        viewer.sent += 1;

        Some((Ok(multipart_part(&frame)), viewer))
    })
}
