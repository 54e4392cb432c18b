use async_trait::async_trait;
use chrono::{DateTime, Local};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{CameraConfig, EmailConfig};
use crate::errors::{MotionError, Result};
use crate::motion_state::format_seconds;
use crate::mqtt::{MqttHandle, MqttNotifier};

const CAMERA_PLACEHOLDER: &str = "%CAMERA%";
const DURATION_PLACEHOLDER: &str = "%DURATION%";

/// Sent once a camera has been quiet for `notify_seconds` after a motion run.
#[derive(Debug, Clone, Serialize)]
pub struct MotionEvent {
    pub camera: String,
    pub description: String,
    pub motion_seconds: f64,
    pub motion_duration: String,
    pub motionless_seconds: f64,
    /// Quiet time required before notifying
    pub notify_seconds: f64,
    pub timestamp: DateTime<Local>,
}

impl MotionEvent {
    pub fn new(camera: &CameraConfig, motion_duration: Duration, motionless_for: Duration, timestamp: DateTime<Local>) -> Self {
        Self {
            camera: camera.name.clone(),
            description: camera.description.clone(),
            motion_seconds: motion_duration.as_secs_f64(),
            motion_duration: format_seconds(motion_duration),
            motionless_seconds: motionless_for.as_secs_f64(),
            notify_seconds: camera.detection.notify_seconds,
            timestamp,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &MotionEvent) -> Result<()>;

    /// Channel name, for logs.
    fn name(&self) -> &'static str;
}

/// Only records the event in the log. Used when no channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &MotionEvent) -> Result<()> {
        info!(
            "Motion on '{}' ended after {} (no notification channel configured)",
            event.camera, event.motion_duration
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Delivers an event to every channel. One failing channel does not stop
/// the others; the combined failures are returned afterwards.
pub struct FanoutNotifier {
    channels: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: &MotionEvent) -> Result<()> {
        let mut failures = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.notify(event).await {
                warn!("{} notification for '{}' failed: {}", channel.name(), event.camera, e);
                failures.push(format!("{}: {}", channel.name(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MotionError::notify(failures.join("; ")))
        }
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    subject: String,
    body: String,
}

impl EmailNotifier {
    pub fn new(email: &EmailConfig) -> Result<Self> {
        let (from, to) = email.mailboxes()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&email.smtp.server)?
            .port(email.smtp.port);
        if !email.smtp.user.is_empty() {
            builder = builder.credentials(Credentials::new(email.smtp.user.clone(), email.smtp.password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            subject: email.subject.clone(),
            body: email.body.clone(),
        })
    }
}

/// Fill `%CAMERA%` and `%DURATION%` in a subject or body template.
pub fn render_template(template: &str, event: &MotionEvent) -> String {
    template
        .replace(CAMERA_PLACEHOLDER, &event.description)
        .replace(DURATION_PLACEHOLDER, &event.motion_duration)
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, event: &MotionEvent) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(render_template(&self.subject, event))
            .body(render_template(&self.body, event))
            .map_err(|e| MotionError::notify(format!("Cannot build email: {}", e)))?;

        self.transport.send(message).await?;
        info!("Sent motion email for '{}' to {}", event.camera, self.to);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

/// Assemble the notification channels configured for one camera. A channel
/// that cannot be set up is left out so the camera still runs.
pub fn build_notifier(camera: &CameraConfig, notifications_enabled: bool, mqtt: Option<&MqttHandle>) -> Arc<dyn Notifier> {
    if !notifications_enabled {
        return Arc::new(LogNotifier);
    }

    let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();

    if camera.email.enabled {
        if camera.email.smtp.server.is_empty() {
            warn!("Camera '{}': email enabled without an SMTP server, skipping", camera.name);
        } else {
            match EmailNotifier::new(&camera.email) {
                Ok(email) => channels.push(Arc::new(email)),
                Err(e) => error!("Camera '{}': email notifications disabled: {}", camera.name, e),
            }
        }
    }

    if camera.mqtt.enabled {
        match mqtt {
            Some(handle) => channels.push(Arc::new(MqttNotifier::new(
                handle.clone(),
                &camera.name,
                camera.mqtt.topic_name.as_deref(),
            ))),
            None => warn!("Camera '{}': MQTT enabled but no broker configured, skipping", camera.name),
        }
    }

    match channels.len() {
        0 => Arc::new(LogNotifier),
        1 => channels.remove(0),
        _ => Arc::new(FanoutNotifier::new(channels)),
    }
}
