//! Process-wide configuration (§4.J, §6.7). Every field is a `clap` flag with an `env`
//! fallback and a documented default, following the convention used throughout this
//! codebase (flag > environment variable > default).

use clap::Parser;
use std::time::Duration;

fn default_health_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "viz-worker",
    version,
    about = "Visualization-transform worker"
)]
pub struct WorkerConfig {
    /// Broker connection URL.
    #[arg(long, env = "BROKER_URL", default_value = "nats://127.0.0.1:4222")]
    pub broker_url: String,

    /// Durable stream name holding job messages.
    #[arg(long, env = "VISUALIZATION_STREAM", default_value = "VISUALIZATION_TRANSFORMS")]
    pub stream_name: String,

    /// Inbound job subject.
    #[arg(long, env = "VISUALIZATION_SUBJECT", default_value = "workers.visualization-transform")]
    pub job_subject: String,

    /// Durable consumer name bound/created on startup.
    #[arg(long, env = "VISUALIZATION_CONSUMER", default_value = "visualization-transform-workers")]
    pub consumer_name: String,

    /// Messages pulled per fetch.
    #[arg(long, env = "FETCH_BATCH_SIZE", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub fetch_batch_size: u32,

    /// Per-fetch wait before returning an empty batch.
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub fetch_timeout_secs: u64,

    /// Maximum unacknowledged messages outstanding at once (matches the consumer's
    /// `max_ack_pending`).
    #[arg(long, env = "MAX_IN_FLIGHT", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_in_flight: u32,

    /// Overall per-job processing budget.
    #[arg(long, env = "PROCESSING_TIMEOUT_SECS", default_value_t = 3600, value_parser = clap::value_parser!(u64).range(1..))]
    pub processing_timeout_secs: u64,

    /// How long the drain phase waits for in-flight jobs before giving up.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    pub drain_timeout_secs: u64,

    /// Port for `/health/live` and `/health/ready`.
    #[arg(long, env = "HEALTH_PORT", default_value_t = default_health_port())]
    pub health_port: u16,

    /// Object-store bucket name (single-bucket architecture, §4.C).
    #[arg(long, env = "VISUALIZATION_BUCKET", default_value = "visualizations")]
    pub object_store_bucket: String,

    /// Object-store region.
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub object_store_region: String,

    /// Object-store endpoint override (for S3-compatible stores); empty uses the default
    /// resolver chain.
    #[arg(long, env = "OBJECT_STORE_ENDPOINT", default_value = "")]
    pub object_store_endpoint: String,

    /// Base URL of the internal LLM inference endpoint.
    #[arg(long, env = "LLM_INFERENCE_API_URL", default_value = "http://localhost:8091")]
    pub llm_inference_api_url: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `viz_worker=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl WorkerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_with_no_arguments() {
        let cfg = WorkerConfig::parse_from(["viz-worker"]);
        assert_eq!(cfg.max_in_flight, 10);
        assert_eq!(cfg.consumer_name, "visualization-transform-workers");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let result = WorkerConfig::try_parse_from(["viz-worker", "--fetch-batch-size", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_max_in_flight_above_ten() {
        let result = WorkerConfig::try_parse_from(["viz-worker", "--max-in-flight", "11"]);
        assert!(result.is_err());
    }
}
