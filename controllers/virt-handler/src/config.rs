//! Process configuration, read once from the environment at startup.

use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;
use watch_cache::ExponentialBackoff;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_HYPERVISOR_URL: &str = "http://127.0.0.1:16510";
pub const DEFAULT_LAUNCHER_IMAGE: &str = "kubevirt/virt-launcher:latest";
pub const DEFAULT_EMULATOR_PATH: &str = "/usr/local/bin/qemu-x86_64";
pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Node this process runs on; VMs are filtered by it
    pub node_name: String,
    /// Namespace of VMs, placeholder pods and domain mirrors
    pub namespace: String,
    pub hypervisor_url: String,
    pub launcher_image: String,
    /// Emulator path stamped into domains that do not name one
    pub emulator_path: String,
    pub workers: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Rate-limited requeues of one key before it is dropped
    pub max_retries: u32,
}

impl Config {
    /// Loads the configuration from environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let node_name = var("NODE_NAME").or_else(|| var("HOSTNAME")).ok_or_else(|| {
            ControllerError::InvalidConfig(
                "NODE_NAME (or HOSTNAME) environment variable is required".to_string(),
            )
        })?;

        let workers: usize = parse_or(var("WORKERS"), "WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKERS must be at least 1".to_string(),
            ));
        }

        let retry_base_delay =
            Duration::from_millis(parse_or(var("RETRY_BASE_DELAY_MS"), "RETRY_BASE_DELAY_MS", 500)?);
        let retry_max_delay =
            Duration::from_secs(parse_or(var("RETRY_MAX_DELAY_SECS"), "RETRY_MAX_DELAY_SECS", 300)?);
        if retry_base_delay.is_zero() || retry_base_delay > retry_max_delay {
            return Err(ControllerError::InvalidConfig(format!(
                "RETRY_BASE_DELAY_MS ({retry_base_delay:?}) must be positive and not exceed RETRY_MAX_DELAY_SECS ({retry_max_delay:?})"
            )));
        }

        Ok(Self {
            node_name,
            namespace: var("WATCH_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            hypervisor_url: var("HYPERVISOR_URL")
                .unwrap_or_else(|| DEFAULT_HYPERVISOR_URL.to_string()),
            launcher_image: var("LAUNCHER_IMAGE")
                .unwrap_or_else(|| DEFAULT_LAUNCHER_IMAGE.to_string()),
            emulator_path: var("EMULATOR_PATH")
                .unwrap_or_else(|| DEFAULT_EMULATOR_PATH.to_string()),
            workers,
            retry_base_delay,
            retry_max_delay,
            max_retries: parse_or(var("MAX_RETRIES"), "MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
        })
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.retry_base_delay, self.retry_max_delay)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key}={raw:?} is not valid: {e}"))
        }),
    }
}
