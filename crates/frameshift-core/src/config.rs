//! Node configuration: instance mode, ports, cluster endpoints, media roots.
//!
//! All values come from the environment (the server binary maps env vars onto
//! these fields via clap). Validation here is the fail-fast gate: a node that
//! cannot describe its own mode exits with code 1 before touching the store.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation failure; the process reports it and exits 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid INSTANCE_TYPE {0:?} (expected standalone, leader, or follower)")]
    InvalidInstanceType(String),
    #[error("invalid follower url {url:?}: {source}")]
    InvalidFollowerUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("FFMPEG_THREADS must be a positive integer, got {0:?}")]
    InvalidThreads(String),
    #[error("{0}")]
    Missing(&'static str),
}

/// Which role this process plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Standalone,
    Leader,
    Follower,
}

impl InstanceType {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceType::Standalone => "standalone",
            InstanceType::Leader => "leader",
            InstanceType::Follower => "follower",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Ok(InstanceType::Standalone),
            "leader" => Ok(InstanceType::Leader),
            "follower" => Ok(InstanceType::Follower),
            other => Err(ConfigError::InvalidInstanceType(other.to_string())),
        }
    }
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub instance_type: InstanceType,
    pub port: u16,
    /// Shared secret for inter-node request auth. Required in leader and follower modes.
    pub shared_token: Option<String>,
    /// Ordered follower endpoints (leader mode only).
    pub follower_urls: Vec<String>,
    /// Where the follower posts progress callbacks (follower mode only).
    pub leader_url: Option<String>,
    /// Optional `-threads` value validated as a positive integer.
    pub ffmpeg_threads: Option<u32>,
    /// Media root; submitted input paths must resolve inside it.
    pub media_root: PathBuf,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Holds the SQLite file and the log file.
    pub data_dir: PathBuf,
    /// Processor wakeup interval when no trigger arrives.
    pub check_interval: Duration,
    /// A processing row with a heartbeat older than this is released as failed.
    pub stale_worker_timeout: Duration,
}

/// Raw, unvalidated values as read from the environment.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub instance_type: Option<String>,
    pub port: Option<u16>,
    pub shared_token: Option<String>,
    pub follower_urls: Option<String>,
    pub leader_url: Option<String>,
    pub ffmpeg_threads: Option<String>,
    pub media_root: Option<String>,
    pub upload_dir: Option<String>,
    pub output_dir: Option<String>,
    pub data_dir: Option<String>,
}

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_WORKER_TIMEOUT: Duration = Duration::from_secs(300);

impl NodeConfig {
    /// Validate raw values into a usable config. Errors here are configuration
    /// errors: the caller reports them and exits 1.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let instance_type = match raw.instance_type.as_deref() {
            None | Some("") => InstanceType::Standalone,
            Some(s) => InstanceType::parse(s)?,
        };

        let port = raw.port.unwrap_or(DEFAULT_PORT);

        let follower_urls = match raw.follower_urls.as_deref() {
            None | Some("") => Vec::new(),
            Some(s) => {
                let urls: Vec<String> = s
                    .split(',')
                    .map(|u| u.trim().trim_end_matches('/').to_string())
                    .filter(|u| !u.is_empty())
                    .collect();
                for u in &urls {
                    url::Url::parse(u).map_err(|source| ConfigError::InvalidFollowerUrl {
                        url: u.clone(),
                        source,
                    })?;
                }
                urls
            }
        };

        let ffmpeg_threads = match raw.ffmpeg_threads.as_deref() {
            None | Some("") => None,
            Some(s) => match s.parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => return Err(ConfigError::InvalidThreads(s.to_string())),
            },
        };

        match instance_type {
            InstanceType::Leader => {
                if follower_urls.is_empty() {
                    return Err(ConfigError::Missing(
                        "leader mode requires at least one entry in FOLLOWER_URLS",
                    ));
                }
                if raw.shared_token.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing("leader mode requires SHARED_TOKEN"));
                }
            }
            InstanceType::Follower => {
                if raw.shared_token.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing("follower mode requires SHARED_TOKEN"));
                }
                if raw.leader_url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Missing(
                        "follower mode requires LEADER_URL for progress callbacks",
                    ));
                }
            }
            InstanceType::Standalone => {}
        }

        let media_root = PathBuf::from(raw.media_root.unwrap_or_else(|| ".".to_string()));
        let upload_dir = raw
            .upload_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| media_root.join("uploads"));
        let output_dir = raw
            .output_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| media_root.join("output"));
        let data_dir = raw
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        Ok(NodeConfig {
            instance_type,
            port,
            shared_token: raw.shared_token.filter(|t| !t.is_empty()),
            follower_urls,
            leader_url: raw
                .leader_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            ffmpeg_threads,
            media_root,
            upload_dir,
            output_dir,
            data_dir,
            check_interval: DEFAULT_CHECK_INTERVAL,
            stale_worker_timeout: DEFAULT_STALE_WORKER_TIMEOUT,
        })
    }

    /// Stable worker id for this node's own processor.
    pub fn worker_id(&self) -> String {
        match self.instance_type {
            InstanceType::Follower => format!("follower-{}", self.port),
            _ => "standalone".to_string(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("frameshift.db")
    }
}
