//! Engine configuration knobs with conservative defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shared per-worker knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// How often the scheduler invokes the worker's batch method.
    #[serde(with = "duration_seconds")]
    pub poll_interval: Duration,
    /// Items processed in parallel within one tick.
    pub max_concurrent_items: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent_items: 3,
        }
    }
}

/// Download-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Shared worker knobs.
    pub worker: WorkerSettings,
    /// No-progress window after which a download counts as stalled.
    #[serde(with = "duration_seconds")]
    pub stall_timeout: Duration,
    /// Wall-clock budget for a download before it counts as stalled.
    #[serde(with = "duration_seconds")]
    pub wall_timeout: Duration,
}

impl Default for DownloadSettings {
    /// 10 minutes without progress, 24 hours of wall time.
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            stall_timeout: Duration::from_secs(10 * 60),
            wall_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DownloadSettings {
    /// The documented defaults.
    #[must_use]
    pub fn standard() -> Self {
        Self::default()
    }
}

/// Encode-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    /// Shared worker knobs.
    pub worker: WorkerSettings,
    /// No-progress window after which an encode counts as stalled.
    #[serde(with = "duration_seconds")]
    pub stall_timeout: Duration,
    /// Wall-clock budget for an encode before it counts as stalled.
    #[serde(with = "duration_seconds")]
    pub wall_timeout: Duration,
    /// Directory holding deterministic final artifacts.
    pub output_dir: PathBuf,
    /// Directory holding in-flight encoder outputs.
    pub temp_dir: PathBuf,
}

impl Default for EncodeSettings {
    /// 10 minutes without progress, 12 hours of wall time.
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            stall_timeout: Duration::from_secs(10 * 60),
            wall_timeout: Duration::from_secs(12 * 60 * 60),
            output_dir: PathBuf::from("/var/lib/fetcharr/encoded"),
            temp_dir: PathBuf::from("/var/lib/fetcharr/encoded/tmp"),
        }
    }
}

impl EncodeSettings {
    /// The documented defaults with explicit artifact directories.
    #[must_use]
    pub fn standard(output_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            output_dir,
            temp_dir,
            ..Self::default()
        }
    }
}

/// Deliver-stage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverSettings {
    /// How often the scheduler invokes the deliver tick.
    #[serde(with = "duration_seconds")]
    pub poll_interval: Duration,
    /// Parallel deliveries per server when the target carries no override.
    pub concurrency_per_server: usize,
    /// Delete the encoded artifact once every target received it.
    pub cleanup_encoded: bool,
}

impl Default for DeliverSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            concurrency_per_server: 3,
            cleanup_encoded: false,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineSettings {
    /// Search worker knobs.
    pub search: WorkerSettings,
    /// Download worker knobs.
    pub download: DownloadSettings,
    /// Encode worker knobs.
    pub encode: EncodeSettings,
    /// Deliver worker knobs.
    pub deliver: DeliverSettings,
    /// Recovery worker knobs.
    pub recovery: WorkerSettings,
}

impl EngineSettings {
    /// Default knobs for every worker, with the encoder directories supplied
    /// by the host.
    #[must_use]
    pub fn standard(output_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            search: WorkerSettings::default(),
            download: DownloadSettings::standard(),
            encode: EncodeSettings::standard(output_dir, temp_dir),
            deliver: DeliverSettings::default(),
            recovery: WorkerSettings::default(),
        }
    }
}

/// Serialise durations as whole seconds.
mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
