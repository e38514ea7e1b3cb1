use std::time::Duration;

use serde::Deserialize;

use crate::services::controller::ControllerConfig;
use crate::services::pipeline::PipelineConfig;
use crate::services::resources::CapacityThresholds;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-job limit, measured from dispatch.
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_threshold")]
    pub quality_threshold: f64,

    #[serde(default = "default_threshold")]
    pub compliance_threshold: f64,

    /// Report success when iterations run out with only warnings left.
    #[serde(default = "default_true")]
    pub pass_on_exhaustion: bool,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,

    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,

    /// Queue utilisation (0..1) at which back-pressure starts.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: f64,

    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_admission_retry_delay_ms")]
    pub admission_retry_delay_ms: u64,

    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,

    #[serde(default = "default_failed_retention")]
    pub failed_retention: usize,

    #[serde(default = "default_completed_retention")]
    pub cancelled_retention: usize,

    /// Filesystem whose usage feeds the disk threshold.
    #[serde(default = "default_disk_path")]
    pub disk_path: String,

    /// HS256 secret for bearer tokens. Unset means every caller is authorized.
    pub jwt_secret: Option<String>,

    /// AES-256-GCM report signing key (base64-encoded, 32 bytes). Unset means unsigned reports.
    pub signing_key: Option<String>,

    /// Face detection inference endpoint
    #[serde(default = "default_face_detector_url")]
    pub face_detector_url: String,

    pub face_detector_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_processing_timeout_secs() -> u64 {
    300
}

fn default_max_iterations() -> u32 {
    3
}

fn default_threshold() -> f64 {
    0.95
}

fn default_true() -> bool {
    true
}

fn default_cpu_threshold() -> f64 {
    85.0
}

fn default_memory_threshold() -> f64 {
    80.0
}

fn default_disk_threshold() -> f64 {
    90.0
}

fn default_queue_threshold() -> f64 {
    0.8
}

fn default_max_input_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_admission_retry_delay_ms() -> u64 {
    100
}

fn default_completed_retention() -> usize {
    100
}

fn default_failed_retention() -> usize {
    50
}

fn default_disk_path() -> String {
    "/".to_string()
}

fn default_face_detector_url() -> String {
    "http://127.0.0.1:8501/v1/detect".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=50).contains(&self.max_concurrent_jobs) {
            return Err(ConfigError::Invalid(format!(
                "MAX_CONCURRENT_JOBS must be 1..=50, got {}",
                self.max_concurrent_jobs
            )));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("MAX_QUEUE_SIZE must be positive".into()));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("MAX_ITERATIONS must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.queue_threshold) {
            return Err(ConfigError::Invalid(format!(
                "QUEUE_THRESHOLD must be within 0..=1, got {}",
                self.queue_threshold
            )));
        }
        Ok(())
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_queue_size: self.max_queue_size,
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            admission_retry_delay: Duration::from_millis(self.admission_retry_delay_ms),
            max_input_bytes: self.max_input_bytes,
            completed_retention: self.completed_retention,
            failed_retention: self.failed_retention,
            cancelled_retention: self.cancelled_retention,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_iterations: self.max_iterations,
            quality_threshold: self.quality_threshold,
            compliance_threshold: self.compliance_threshold,
            pass_on_exhaustion: self.pass_on_exhaustion,
            ..PipelineConfig::default()
        }
    }

    pub fn thresholds(&self) -> CapacityThresholds {
        CapacityThresholds {
            cpu_percent: self.cpu_threshold,
            memory_percent: self.memory_threshold,
            disk_percent: self.disk_threshold,
            queue_utilization: self.queue_threshold,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
