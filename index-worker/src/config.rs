use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "STORE_URL", default = "redis://localhost:6379/")]
    pub store_url: String,

    /// Seconds to sleep after an empty batch.
    #[envconfig(from = "WORKER_POLL_INTERVAL", default = "1.0")]
    pub poll_interval: EnvSecsDuration,

    /// Jobs dequeued and processed concurrently per loop iteration.
    #[envconfig(from = "WORKER_BATCH_SIZE", default = "1")]
    pub batch_size: usize,

    /// Per-job processing timeout, in seconds.
    #[envconfig(from = "TASK_TIMEOUT", default = "300")]
    pub task_timeout: EnvSecsDuration,

    #[envconfig(from = "WORKER_HEARTBEAT_INTERVAL", default = "30")]
    pub heartbeat_interval: EnvSecsDuration,

    /// Block timeout on each pending-list pop; kept short so the worker
    /// stays responsive to shutdown.
    #[envconfig(from = "WORKER_DEQUEUE_TIMEOUT", default = "1")]
    pub dequeue_timeout: EnvSecsDuration,

    #[envconfig(from = "EMBEDDING_URL", default = "http://localhost:8100/embed")]
    pub embedding_url: String,

    #[envconfig(from = "EMBEDDING_DIMENSION", default = "512")]
    pub embedding_dimension: usize,

    #[envconfig(from = "EMBEDDING_TIMEOUT", default = "30")]
    pub embedding_timeout: EnvSecsDuration,

    #[envconfig(from = "VECTOR_STORE_URL", default = "http://localhost:6333")]
    pub vector_store_url: String,

    #[envconfig(from = "VECTOR_COLLECTION", default = "products")]
    pub vector_collection: String,

    #[envconfig(from = "VECTOR_STORE_TIMEOUT", default = "10")]
    pub vector_store_timeout: EnvSecsDuration,
}

impl Config {
    /// Produce a host:port address for binding the liveness TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A duration given in (possibly fractional) seconds.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<f64>().map_err(|_| ParseEnvSecsDurationError)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ParseEnvSecsDurationError);
        }

        Ok(EnvSecsDuration(time::Duration::from_secs_f64(secs)))
    }
}
