use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{MotionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &str) -> Self {
        match Path::new(path).extension().and_then(|s| s.to_str()) {
            Some("json") => Self::Json,
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Toml,
        }
    }
}

/// Fully resolved configuration. Camera entries have the global `defaults`
/// merged underneath them and are never mutated after loading.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub mqtt: Option<MqttConfig>,
    pub notifications_enabled: bool,
    pub cameras: Vec<CameraConfig>,
}

// On-disk shape before the per-camera merge
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    mqtt: Option<MqttConfig>,
    #[serde(default = "default_true")]
    notifications_enabled: bool,
    #[serde(default)]
    defaults: Value,
    #[serde(default)]
    cameras: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_seconds: f64,
    pub cors_allow_origin: Option<String>,
    pub placeholder_image: Option<String>, // JPEG served while a camera has no frame yet
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frame_interval_seconds: default_frame_interval(),
            cors_allow_origin: Some("*".to_string()),
            placeholder_image: None,
        }
    }
}

impl ServerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.frame_interval_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_frame_interval()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub broker_url: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_mqtt_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_mqtt_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Either a complete locator or the parts it is assembled from
    pub url: Option<String>,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub path: Option<String>,

    #[serde(default)]
    pub reconnect_interval: u64, // Seconds between reopen attempts, 0 = immediately
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub resize: ResizeConfig,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub mqtt: CameraMqttConfig,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout: String, // e.g. "10s", "500ms"
    #[serde(default)]
    pub logging: CameraLoggingConfig,
    #[serde(default)]
    pub debug_views: DebugViewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default = "default_update_reference_seconds")]
    pub update_reference_seconds: f64,
    #[serde(default = "default_notify_seconds")]
    pub notify_seconds: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_area: default_min_area(),
            frame_skip: default_frame_skip(),
            update_reference_seconds: default_update_reference_seconds(),
            notify_seconds: default_notify_seconds(),
        }
    }
}

impl DetectionConfig {
    pub fn update_reference_after(&self) -> Duration {
        Duration::try_from_secs_f64(self.update_reference_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn notify_after(&self) -> Duration {
        Duration::try_from_secs_f64(self.notify_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self { width: default_width(), height: default_height() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default = "default_email_subject")]
    pub subject: String, // %CAMERA% is replaced with the camera description
    #[serde(default = "default_email_body")]
    pub body: String,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

impl EmailConfig {
    /// Parsed sender and recipient.
    pub fn mailboxes(&self) -> Result<(Mailbox, Mailbox)> {
        let from = self.from_address.parse()
            .map_err(|e| MotionError::config(format!("Invalid email from_address '{}': {}", self.from_address, e)))?;
        let to = self.to_address.parse()
            .map_err(|e| MotionError::config(format!("Invalid email to_address '{}': {}", self.to_address, e)))?;
        Ok((from, to))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_smtp_port(),
            user: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraMqttConfig {
    #[serde(default)]
    pub enabled: bool,
    pub topic_name: Option<String>, // Defaults to <base_topic>/cameras/<name>/motion
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraLoggingConfig {
    #[serde(default)]
    pub log_frames: bool,
    #[serde(default = "default_true")]
    pub log_transitions: bool,
}

impl Default for CameraLoggingConfig {
    fn default() -> Self {
        Self { log_frames: false, log_transitions: true }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DebugViewConfig {
    #[serde(default)]
    pub frame_delta: bool,
    #[serde(default)]
    pub threshold: bool,
}

fn default_true() -> bool { true }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 5000 }
fn default_frame_interval() -> f64 { 0.1 }
fn default_log_filter() -> String { "motion_detection_server=info,info".to_string() }
fn default_mqtt_client_id() -> String { "motion-${hostname}".to_string() }
fn default_mqtt_base_topic() -> String { "motion/${hostname}".to_string() }
fn default_mqtt_qos() -> u8 { 1 }
fn default_keep_alive() -> u64 { 30 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_notify_timeout() -> String { "10s".to_string() }
fn default_min_area() -> u32 { 500 }
fn default_frame_skip() -> u32 { 3 }
fn default_update_reference_seconds() -> f64 { 10.0 }
fn default_notify_seconds() -> f64 { 30.0 }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_smtp_port() -> u16 { 587 }
fn default_email_subject() -> String { "Motion detected on %CAMERA%".to_string() }
fn default_email_body() -> String { "Motion was detected on camera %CAMERA%.".to_string() }

impl CameraConfig {
    /// Locator handed to the video source. An explicit `url` wins over the
    /// individual parts.
    pub fn source_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let host = self.host.as_deref()
            .ok_or_else(|| MotionError::config(format!("Camera '{}' needs either 'url' or 'host'", self.name)))?;
        let scheme = self.scheme.as_deref().unwrap_or("http");

        let mut url = url::Url::parse(&format!("{}://{}", scheme, host))?;
        let bad_part = |part: &str| MotionError::config(format!("Camera '{}': cannot set {} for host '{}'", self.name, part, host));

        if let Some(port) = self.port {
            url.set_port(Some(port)).map_err(|_| bad_part("port"))?;
        }
        if let Some(user) = &self.user {
            url.set_username(user).map_err(|_| bad_part("user"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password)).map_err(|_| bad_part("password"))?;
        }
        if let Some(path) = &self.path {
            url.set_path(path);
        }

        Ok(url.to_string())
    }

    /// Same as `source_url` with the password masked, for logging.
    pub fn redacted_source_url(&self) -> String {
        match self.source_url() {
            Ok(raw) => match url::Url::parse(&raw) {
                Ok(mut url) if url.password().is_some() => {
                    let _ = url.set_password(Some("***"));
                    url.to_string()
                }
                _ => raw,
            },
            Err(_) => "<invalid>".to_string(),
        }
    }

    pub fn notify_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.notify_timeout)
            .map_err(|e| MotionError::config(format!("Camera '{}': invalid notify_timeout '{}': {}", self.name, self.notify_timeout, e)))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }
}

/// A seconds value from the config file as a `Duration`. Negative, NaN and
/// out-of-range values are rejected.
pub fn seconds_duration(field: &str, seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| MotionError::config(format!("{} = {} is not a valid duration: {}", field, seconds, e)))
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces the base value. `null` leaves the base alone.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        if !value.is_null() {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Produce the immutable configuration for one camera from the shared
/// defaults and its own overrides.
pub fn resolve_camera(defaults: &Value, camera: Value) -> Result<CameraConfig> {
    let label = camera.get("name")
        .and_then(|n| n.as_str())
        .unwrap_or("<unnamed>")
        .to_string();

    let mut merged = match defaults {
        Value::Object(_) => defaults.clone(),
        _ => Value::Object(serde_json::Map::new()),
    };
    deep_merge(&mut merged, camera);

    let mut resolved: CameraConfig = serde_json::from_value(merged)
        .map_err(|e| MotionError::config(format!("Invalid configuration for camera '{}': {}", label, e)))?;

    if resolved.description.is_empty() {
        resolved.description = resolved.name.clone();
    }

    Ok(resolved)
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content, ConfigFormat::from_path(path))?;
        info!("Loaded configuration from {} ({} cameras)", path, config.cameras.len());
        Ok(config)
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let raw: RawConfig = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut cameras = Vec::with_capacity(raw.cameras.len());
        for camera in raw.cameras {
            cameras.push(resolve_camera(&raw.defaults, camera)?);
        }

        let mut mqtt = raw.mqtt;
        if let Some(ref mut mqtt) = mqtt {
            mqtt.substitute_variables();
        }

        let config = Self {
            server: raw.server,
            logging: raw.logging,
            mqtt,
            notifications_enabled: raw.notifications_enabled,
            cameras,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(MotionError::config("No cameras configured"));
        }

        if seconds_duration("server.frame_interval_seconds", self.server.frame_interval_seconds)?.is_zero() {
            return Err(MotionError::config("server.frame_interval_seconds must be positive"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.name.trim().is_empty() {
                return Err(MotionError::config("Camera name must not be empty"));
            }
            if !seen.insert(camera.name.as_str()) {
                return Err(MotionError::config(format!("Duplicate camera name '{}'", camera.name)));
            }
            if camera.resize.width == 0 || camera.resize.height == 0 {
                return Err(MotionError::config(format!("Camera '{}': resize dimensions must be non-zero", camera.name)));
            }
            camera.source_url()?;
            camera.notify_timeout()?;
            seconds_duration(&format!("cameras.{}.detection.update_reference_seconds", camera.name), camera.detection.update_reference_seconds)?;
            seconds_duration(&format!("cameras.{}.detection.notify_seconds", camera.name), camera.detection.notify_seconds)?;

            if camera.email.enabled {
                if camera.email.smtp.server.is_empty() {
                    warn!("Camera '{}' has email enabled but no SMTP server configured", camera.name);
                } else if self.notifications_enabled {
                    camera.email.mailboxes()?;
                }
            }
        }

        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }
}
