use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "facewatch.toml";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5001";
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid bind address {0:?}")]
    BindAddr(String),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Webcam index, `/dev/video*` path or network stream URL.
    pub video_source: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// JSON face database snapshot.
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// JPEG quality for published frames (1–100).
    pub jpeg_quality: u8,
    /// Live channel buffer per subscriber before the oldest frames are dropped.
    pub channel_capacity: usize,
}

/// Optional `facewatch.toml`; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    video_source: Option<String>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    bind_addr: Option<String>,
    jpeg_quality: Option<u8>,
    channel_capacity: Option<usize>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables, layered
    /// over the TOML file named by `FACEWATCH_CONFIG` (or `facewatch.toml`
    /// when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("FACEWATCH_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                FileConfig::read(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => FileConfig::default(),
        };

        let bind_addr = env("FACEWATCH_BIND_ADDR")
            .or(file.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr
            .parse()
            .map_err(|_| ConfigError::BindAddr(bind_addr.clone()))?;

        Ok(Self {
            video_source: env("FACEWATCH_VIDEO_SOURCE")
                .or(file.video_source)
                .unwrap_or_else(|| "0".to_string()),
            model_dir: env("FACEWATCH_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(facewatch_core::default_model_dir),
            db_path: env("FACEWATCH_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| PathBuf::from(facewatch_core::database::DEFAULT_DB_PATH)),
            bind_addr,
            jpeg_quality: parsed(&env, "FACEWATCH_JPEG_QUALITY")
                .or(file.jpeg_quality)
                .unwrap_or(facewatch_hw::DEFAULT_JPEG_QUALITY)
                .clamp(1, 100),
            channel_capacity: parsed(&env, "FACEWATCH_CHANNEL_CAPACITY")
                .or(file.channel_capacity)
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
                .max(1),
        })
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}
