use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::{JobOptions, DEFAULT_INFERENCE_STEPS};

/// Process-wide configuration. Every field has a default so the service
/// starts with an empty environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Number of inference slots. One per GPU-safe concurrent pipeline call.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Root directory for published artifacts (served by the proxy).
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Root directory for the job journal, uploads and the inbox cursor.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    /// CSV ledger path. Empty means `<queue_dir>/inbox.csv`.
    #[serde(default)]
    pub csv_inbox: Option<PathBuf>,

    /// Shared secret guarding the CSV endpoints. Empty disables the check.
    #[serde(default)]
    pub csv_secret: String,

    /// Public base address used when composing artifact URLs.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Default long-edge target for input images, in pixels.
    #[serde(default = "default_resize_long_edge")]
    pub resize_long_edge: u32,

    /// Default quantization mode passed to the inference backend.
    /// Accepts `1`/`0` as well as `true`/`false`.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub use_4bit: bool,

    /// Model identifier forwarded to the inference backend.
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Inference sidecar endpoint. Empty selects the passthrough editor.
    #[serde(default)]
    pub inference_url: String,

    /// Seconds between inbox scans.
    #[serde(default = "default_inbox_poll_secs")]
    pub inbox_poll_secs: u64,

    /// Seconds a submission waits for a terminal state before returning 202.
    #[serde(default = "default_submit_wait_secs")]
    pub submit_wait_secs: u64,

    /// Retries after a transient failure (total attempts = retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit between retries, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Timeout for fetching a source image by URL.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Upper bound for uploaded images and request bodies.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_flag(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("expected 1/0, true/false or yes/no, got {raw:?}"))
    })
}

/// Parse the boolean spellings accepted in the environment and form fields.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_max_concurrency() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/app/outputs")
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("/app/queue")
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_resize_long_edge() -> u32 {
    1024
}

fn default_model_id() -> String {
    "/opt/models/Qwen-Image-Edit".to_string()
}

fn default_inbox_poll_secs() -> u64 {
    5
}

fn default_submit_wait_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_concurrency: default_max_concurrency(),
            output_dir: default_output_dir(),
            queue_dir: default_queue_dir(),
            csv_inbox: None,
            csv_secret: String::new(),
            base_url: default_base_url(),
            resize_long_edge: default_resize_long_edge(),
            use_4bit: false,
            model_id: default_model_id(),
            inference_url: String::new(),
            inbox_poll_secs: default_inbox_poll_secs(),
            submit_wait_secs: default_submit_wait_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        Ok(config.normalized())
    }

    /// Clamp values that would leave the service unable to make progress.
    pub fn normalized(mut self) -> Self {
        if self.max_concurrency == 0 {
            tracing::warn!("MAX_CONCURRENCY=0 is not usable, clamping to 1");
            self.max_concurrency = 1;
        }
        self
    }

    pub fn inbox_path(&self) -> PathBuf {
        match &self.csv_inbox {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => self.queue_dir.join("inbox.csv"),
        }
    }

    pub fn inbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inbox_poll_secs.max(1))
    }

    pub fn submit_wait(&self) -> Duration {
        Duration::from_secs(self.submit_wait_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Job options with unset fields taken from the process defaults.
    pub fn job_options(&self, resize_long_edge: Option<u32>, use_4bit: Option<bool>) -> JobOptions {
        JobOptions {
            resize_long_edge: resize_long_edge.unwrap_or(self.resize_long_edge),
            use_4bit: use_4bit.unwrap_or(self.use_4bit),
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
        }
    }

    pub fn csv_secret(&self) -> Option<&str> {
        if self.csv_secret.is_empty() {
            None
        } else {
            Some(&self.csv_secret)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_start_without_environment() {
        let config: AppConfig = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.inbox_path(), PathBuf::from("/app/queue/inbox.csv"));
        assert!(config.csv_secret().is_none());
    }

    #[test]
    fn test_env_overrides_and_clamp() {
        let vars = vec![
            ("MAX_CONCURRENCY".to_string(), "0".to_string()),
            ("QUEUE_DIR".to_string(), "/tmp/q".to_string()),
            ("CSV_SECRET".to_string(), "s3cret".to_string()),
            ("USE_4BIT".to_string(), "true".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        let config = config.normalized();
        assert_eq!(config.max_concurrency, 1);
        assert!(config.use_4bit);
        assert_eq!(config.inbox_path(), PathBuf::from("/tmp/q/inbox.csv"));
        assert_eq!(config.csv_secret(), Some("s3cret"));
    }

    #[test]
    fn test_use_4bit_accepts_numeric_flags() {
        for (raw, expected) in [("1", true), ("0", false), ("yes", true), ("FALSE", false)] {
            let vars = vec![("USE_4BIT".to_string(), raw.to_string())];
            let config: AppConfig = envy::from_iter(vars).unwrap();
            assert_eq!(config.use_4bit, expected, "USE_4BIT={raw}");
        }

        let vars = vec![("USE_4BIT".to_string(), "maybe".to_string())];
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}
