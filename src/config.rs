use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub http: HttpConfig,
    pub paths: PathsConfig,
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub timeout: f64, // seconds
    pub max_workers: usize, // concurrent probes per host
    pub host_workers: usize, // hosts scanned at once
    pub banner: bool,
    pub limit_text: bool,
    pub ports: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout: f64, // seconds
    pub user_agent: String,
    pub verify_ssl: bool,
    pub max_redirects: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub service_catalog: Option<PathBuf>,
    pub rules_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Seed values for every rule invocation, overridden by `--option`.
    pub options: HashMap<String, String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: 2.0,
            max_workers: 10,
            host_workers: 100,
            banner: false,
            limit_text: true,
            ports: "ALL".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: 10.0,
            user_agent: crate::template_engine::default_user_agent(),
            verify_ssl: false,
            max_redirects: 10,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| crate::ScanError::Unknown(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.scan.timeout, 2.0)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.http.request_timeout, 10.0)
    }
}

/// Non-finite and negative values fall back to `default`.
fn seconds(value: f64, default: f64) -> Duration {
    if value.is_finite() && value >= 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::from_secs_f64(default)
    }
}
