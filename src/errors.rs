use thiserror::Error;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Video source error: {message}")]
    Source { message: String },

    #[error("Frame analysis error: {message}")]
    Analysis { message: String },

    #[error("Notification error: {message}")]
    Notify { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },

    #[error("SMTP error: {source}")]
    Smtp {
        #[from]
        source: lettre::transport::smtp::Error,
    },
}

impl MotionError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn video_source(message: impl Into<String>) -> Self {
        Self::Source { message: message.into() }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis { message: message.into() }
    }

    pub fn notify(message: impl Into<String>) -> Self {
        Self::Notify { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, MotionError>;
