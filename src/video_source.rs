use async_trait::async_trait;
use image::RgbImage;

use crate::config::CameraConfig;
use crate::errors::Result;
use crate::ffmpeg_source::FfmpegSource;
use crate::http_source::HttpMjpegSource;

/// A stream of decoded frames from one camera.
///
/// `next_frame` returning `None` means the stream is broken; reopening is up
/// to the caller.
#[async_trait]
pub trait VideoSource: Send {
    /// Connect, or reconnect after a failed read.
    async fn open(&mut self) -> Result<()>;

    async fn next_frame(&mut self) -> Option<RgbImage>;

    /// Short name of the implementation, for logs.
    fn kind(&self) -> &'static str;
}

/// Pick the source implementation for a camera from its locator scheme:
/// HTTP(S) cameras are read directly as MJPEG, anything else goes through
/// ffmpeg.
pub fn open_source(camera: &CameraConfig) -> Result<Box<dyn VideoSource>> {
    let locator = camera.source_url()?;
    let scheme = locator.split("://").next().unwrap_or("").to_ascii_lowercase();

    let source: Box<dyn VideoSource> = match scheme.as_str() {
        "http" | "https" => Box::new(HttpMjpegSource::new(&locator)?),
        _ => Box::new(FfmpegSource::new(&locator)),
    };
    Ok(source)
}

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Cuts complete JPEG images out of an MJPEG byte stream that arrives in
/// arbitrary chunks. Bytes outside SOI..EOI (multipart headers, boundaries)
/// are discarded.
#[derive(Debug)]
pub struct MjpegSplitter {
    buffer: Vec<u8>,
    scan_from: usize,
    max_frame_size: usize,
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MjpegSplitter {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(100_000),
            scan_from: 0,
            max_frame_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        // Align the buffer on a start marker
        if !self.buffer.starts_with(&JPEG_SOI) {
            match find_marker(&self.buffer, JPEG_SOI, 0) {
                Some(start) => {
                    self.buffer.drain(..start);
                    self.scan_from = 0;
                }
                None => {
                    // Keep a trailing 0xFF, it may be the first half of a marker
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                    self.scan_from = 0;
                    return None;
                }
            }
        }

        match find_marker(&self.buffer, JPEG_EOI, self.scan_from.max(JPEG_SOI.len())) {
            Some(end) => {
                let frame: Vec<u8> = self.buffer.drain(..end + JPEG_EOI.len()).collect();
                self.scan_from = 0;
                Some(frame)
            }
            None => {
                if self.buffer.len() > self.max_frame_size {
                    self.clear();
                } else {
                    // Resume one byte early in case the marker straddles chunks
                    self.scan_from = self.buffer.len().saturating_sub(1);
                }
                None
            }
        }
    }
}

fn find_marker(data: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if data.len() < 2 || from >= data.len() - 1 {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut data = JPEG_SOI.to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&JPEG_EOI);
        data
    }

    #[test]
    fn test_frames_across_chunks() {
        let mut splitter = MjpegSplitter::default();
        let frame = fake_jpeg(b"hello world");

        splitter.push(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        splitter.push(&frame[..5]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&frame[5..]);
        assert_eq!(splitter.next_frame(), Some(frame));
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut splitter = MjpegSplitter::default();
        let a = fake_jpeg(b"aaa");
        let b = fake_jpeg(b"bbbb");

        let mut chunk = b"junk".to_vec();
        chunk.extend_from_slice(&a);
        chunk.extend_from_slice(b"\r\n--frame\r\n\r\n");
        chunk.extend_from_slice(&b);
        splitter.push(&chunk);

        assert_eq!(splitter.next_frame(), Some(a));
        assert_eq!(splitter.next_frame(), Some(b));
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_end_marker_split_between_chunks() {
        let mut splitter = MjpegSplitter::default();
        let frame = fake_jpeg(b"xyz");
        let split = frame.len() - 1; // 0xFF | 0xD9

        splitter.push(&frame[..split]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&frame[split..]);
        assert_eq!(splitter.next_frame(), Some(frame));
    }

    #[test]
    fn test_start_marker_split_between_chunks() {
        let mut splitter = MjpegSplitter::default();
        let frame = fake_jpeg(b"abc");

        splitter.push(b"garbage");
        splitter.push(&frame[..1]);
        assert!(splitter.next_frame().is_none());
        splitter.push(&frame[1..]);
        assert_eq!(splitter.next_frame(), Some(frame));
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut splitter = MjpegSplitter::new(16);
        splitter.push(&JPEG_SOI);
        splitter.push(&[0u8; 32]);
        assert!(splitter.next_frame().is_none());
        assert_eq!(splitter.buffered(), 0);

        let frame = fake_jpeg(b"ok");
        splitter.push(&frame);
        assert_eq!(splitter.next_frame(), Some(frame));
    }

    #[test]
    fn test_source_selected_by_scheme() {
        let camera = |url: &str| {
            crate::config::resolve_camera(&serde_json::Value::Null, serde_json::json!({"name": "cam", "url": url})).unwrap()
        };
        assert_eq!(open_source(&camera("http://10.0.0.5/video.mjpg")).unwrap().kind(), "http-mjpeg");
        assert_eq!(open_source(&camera("rtsp://10.0.0.5/stream")).unwrap().kind(), "ffmpeg");
        assert_eq!(open_source(&camera("/dev/video0")).unwrap().kind(), "ffmpeg");
    }
}
