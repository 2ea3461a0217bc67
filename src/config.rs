use crate::errors::ControllerError;
use crate::informer::kubernetes::WatchScope;
use dotenv::dotenv;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for the per-key backoff cap.
const MAX_DELAY_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Controller settings. Read from the environment by default, optionally
/// from a YAML file; command line flags override either.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Namespace to watch. `None` watches all namespaces.
    pub namespace: Option<String>,
    pub kubeconfig_path: Option<String>,
    pub context: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub workers: usize,
    pub sync_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub qps: u32,
    pub burst: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: Some("default".to_string()),
            kubeconfig_path: None,
            context: None,
            label_selector: None,
            field_selector: None,
            workers: 1,
            sync_timeout_secs: 60,
            max_retries: 5,
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 10,
            burst: 100,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv().ok();
        let defaults = Settings::default();

        Self {
            namespace: env::var("KUBE_NAMESPACE").ok().or(defaults.namespace),
            kubeconfig_path: env::var("KUBECONFIG").ok(),
            context: env::var("KUBE_CONTEXT").ok(),
            label_selector: env::var("CONTROLLER_LABEL_SELECTOR").ok(),
            field_selector: env::var("CONTROLLER_FIELD_SELECTOR").ok(),
            workers: env_or("CONTROLLER_WORKERS", defaults.workers),
            sync_timeout_secs: env_or("CONTROLLER_SYNC_TIMEOUT_SECS", defaults.sync_timeout_secs),
            max_retries: env_or("CONTROLLER_MAX_RETRIES", defaults.max_retries),
            base_delay_ms: env_or("CONTROLLER_BASE_DELAY_MS", defaults.base_delay_ms),
            max_delay_secs: env_or("CONTROLLER_MAX_DELAY_SECS", defaults.max_delay_secs),
            qps: env_or("CONTROLLER_QPS", defaults.qps),
            burst: env_or("CONTROLLER_BURST", defaults.burst),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ControllerError> {
        serde_yaml::from_str(yaml).map_err(|e| ControllerError::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: &str) -> Result<Self, ControllerError> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::Config("workers must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ControllerError::Config("max_retries must be at least 1".into()));
        }
        if self.max_delay() > MAX_DELAY_CEILING {
            return Err(ControllerError::Config(format!(
                "max delay {:?} exceeds the ceiling of {:?}",
                self.max_delay(),
                MAX_DELAY_CEILING
            )));
        }
        if self.base_delay() > self.max_delay() {
            return Err(ControllerError::Config(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay(),
                self.max_delay()
            )));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn watch_scope(&self) -> WatchScope {
        WatchScope {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

// Global static CONFIG instance
pub static CONFIG: Lazy<Settings> = Lazy::new(Settings::from_env);
