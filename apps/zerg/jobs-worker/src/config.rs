//! Service settings that are not part of the AMQP client configuration

use core_config::{env_or_default, env_parse, ConfigError, FromEnv};

const DEFAULT_HEALTH_PORT: u16 = 8083;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Port of the health and metrics server
    pub health_port: u16,
    /// Exchange that receives `JobCompleted` events ("" = default exchange)
    pub result_exchange: String,
    pub result_routing_key: String,
}

/// Loads from:
/// - `JOBS_WORKER_HEALTH_PORT`, then `HEALTH_PORT` (default 8083)
/// - `JOBS_RESULT_EXCHANGE` (default "")
/// - `JOBS_RESULT_ROUTING_KEY` (default "jobs.results")
impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let health_port = match std::env::var("JOBS_WORKER_HEALTH_PORT") {
            Ok(_) => env_parse("JOBS_WORKER_HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            Err(_) => env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
        };

        Ok(Self {
            health_port,
            result_exchange: env_or_default("JOBS_RESULT_EXCHANGE", ""),
            result_routing_key: env_or_default("JOBS_RESULT_ROUTING_KEY", "jobs.results"),
        })
    }
}
