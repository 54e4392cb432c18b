use async_trait::async_trait;
use image::RgbImage;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::errors::{MotionError, Result};
use crate::transcoder::FrameTranscoder;
use crate::video_source::{MjpegSplitter, VideoSource};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const CHUNK_SIZE: usize = 8192;

/// Any input ffmpeg understands (RTSP cameras, files, capture devices),
/// re-encoded by an ffmpeg child process as MJPEG on stdout.
pub struct FfmpegSource {
    locator: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    splitter: MjpegSplitter,
    chunk: Vec<u8>,
}

impl FfmpegSource {
    pub fn new(locator: &str) -> Self {
        Self {
            locator: locator.to_string(),
            child: None,
            stdout: None,
            splitter: MjpegSplitter::default(),
            chunk: vec![0u8; CHUNK_SIZE],
        }
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-fflags".into(), "+nobuffer+discardcorrupt".into(), // Disable buffering, discard corrupt frames
            "-flags".into(), "low_delay".into(),
        ];

        if self.locator.starts_with("rtsp://") || self.locator.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }

        args.extend([
            "-i".into(), self.locator.clone(),
            "-f".into(), "mjpeg".into(),
            "-q:v".into(), "5".into(),
            "-flush_packets".into(), "1".into(),
            "-an".into(),                                        // No audio
            "-".into(),                                          // Output to stdout
        ]);
        args
    }

    async fn stop(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("ffmpeg for {} already gone: {}", redact(&self.locator), e);
            }
        }
    }
}

#[async_trait]
impl VideoSource for FfmpegSource {
    async fn open(&mut self) -> Result<()> {
        self.stop().await;
        self.splitter.clear();

        info!("Starting ffmpeg for {}", redact(&self.locator));
        let mut child = Command::new("ffmpeg")
            .args(self.ffmpeg_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take()
            .ok_or_else(|| MotionError::video_source("failed to get ffmpeg stdout"))?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<RgbImage> {
        loop {
            if let Some(jpeg_data) = self.splitter.next_frame() {
                match FrameTranscoder::decode(&jpeg_data) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        debug!("Skipping undecodable frame from ffmpeg: {}", e);
                        continue;
                    }
                }
            }

            let stdout = self.stdout.as_mut()?;
            let read = tokio::time::timeout(READ_TIMEOUT, stdout.read(&mut self.chunk)).await;
            match read {
                Ok(Ok(0)) => {
                    warn!("ffmpeg output ended for {}", redact(&self.locator));
                    self.stop().await;
                    return None;
                }
                Ok(Ok(n)) => self.splitter.push(&self.chunk[..n]),
                Ok(Err(e)) => {
                    warn!("Error reading ffmpeg output: {}", e);
                    self.stop().await;
                    return None;
                }
                Err(_) => {
                    warn!("No data from ffmpeg for {:?}, restarting", READ_TIMEOUT);
                    self.stop().await;
                    return None;
                }
            }
        }
    }

    fn kind(&self) -> &'static str {
        "ffmpeg"
    }
}

fn redact(locator: &str) -> String {
    match url::Url::parse(locator) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => locator.to_string(),
    }
}
