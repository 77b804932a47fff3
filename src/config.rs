//! Container configuration.

use anyhow::Result;

use crate::runloop::RunLoopConfig;

/// Container configuration loaded from environment variables, layered
/// over [`RunLoopConfig`] defaults.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Name of this container instance, used in logs.
    pub container_name: String,

    /// Run loop tuning.
    pub run_loop: RunLoopConfig,
}

impl ContainerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let container_name =
            std::env::var("MILLRACE_CONTAINER_NAME").unwrap_or_else(|_| "millrace-0".to_string());

        let defaults = RunLoopConfig::default();

        let max_messages_in_flight: usize = std::env::var("MILLRACE_MAX_MESSAGES_IN_FLIGHT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.max_messages_in_flight)
            .max(1);

        let window_ms: i64 = std::env::var("MILLRACE_WINDOW_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.window_ms);

        let commit_ms: i64 = std::env::var("MILLRACE_COMMIT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.commit_ms);

        let callback_timeout_ms: i64 = std::env::var("MILLRACE_CALLBACK_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.callback_timeout_ms);

        let max_throttling_delay_ms: i64 = std::env::var("MILLRACE_MAX_THROTTLING_DELAY_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.max_throttling_delay_ms);

        let max_idle_ms: i64 = std::env::var("MILLRACE_MAX_IDLE_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.max_idle_ms);

        let async_commit: bool = std::env::var("MILLRACE_ASYNC_COMMIT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.async_commit);

        // The key-bucket fold is computed modulo 31, which bounds the
        // usable factor.
        let elasticity_factor: u32 = std::env::var("MILLRACE_ELASTICITY_FACTOR")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.elasticity_factor)
            .clamp(1, 16);

        Ok(ContainerConfig {
            container_name,
            run_loop: RunLoopConfig {
                max_messages_in_flight,
                window_ms,
                commit_ms,
                callback_timeout_ms,
                max_throttling_delay_ms,
                max_idle_ms,
                async_commit,
                elasticity_factor,
            },
        })
    }
}
