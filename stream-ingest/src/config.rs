use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::decode::DecodeSchema;
use crate::error::ConfigError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::retry::RetryPolicy;
use crate::kafka::types::Mode;
use crate::offsets::OffsetConfig;
use crate::pipeline::PipelineConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "stream-ingest")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // comma separated key=value librdkafka options, passed through unmodified
    pub kafka_config_global: Option<String>,

    pub kafka_config_topic: Option<String>,

    // {"timestamp": <unix seconds>} or {"<partition>": <offset>, ...}
    pub kafka_offset_info: Option<String>,

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64,

    // Distributed task layout
    #[envconfig(default = "0")]
    pub task_index: u32,

    #[envconfig(default = "1")]
    pub task_num: u32,

    #[envconfig(default = "false")]
    pub chief_redundant: bool,

    #[envconfig(default = "train")]
    pub mode: String,

    // Pipeline sizing
    #[envconfig(default = "256")]
    pub batch_size: usize,

    #[envconfig(default = "8")]
    pub num_parallel_calls: usize,

    #[envconfig(default = "32")]
    pub prefetch_size: usize,

    #[envconfig(default = "100")]
    pub poll_timeout_ms: u64,

    // Decoding: name:type[:default],...
    #[envconfig(default = ",")]
    pub field_separator: String,

    #[envconfig(default = "")]
    pub input_fields: String,

    pub label_fields: Option<String>,

    pub feature_fields: Option<String>,

    // Checkpoints
    pub model_dir: Option<String>,

    // explicit checkpoint to restore offsets from; the latest in MODEL_DIR otherwise
    pub checkpoint_path: Option<String>,

    // Broker retries
    #[envconfig(default = "100")]
    pub broker_retry_initial_ms: u64,

    #[envconfig(default = "5000")]
    pub broker_retry_max_ms: u64,

    #[envconfig(default = "10")]
    pub broker_retry_max_attempts: u32,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn model_dir_buf(&self) -> Option<PathBuf> {
        non_empty(&self.model_dir).map(PathBuf::from)
    }

    pub fn checkpoint_path_buf(&self) -> Option<PathBuf> {
        non_empty(&self.checkpoint_path).map(PathBuf::from)
    }

    pub fn parsed_mode(&self) -> Result<Mode, ConfigError> {
        self.mode.parse().map_err(ConfigError::Invalid)
    }

    pub fn offset_config(&self) -> Result<OffsetConfig, ConfigError> {
        OffsetConfig::parse(self.kafka_offset_info.as_deref())
    }

    pub fn separator(&self) -> Result<char, ConfigError> {
        let mut chars = self.field_separator.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ConfigError::Invalid(format!(
                "field separator must be a single character, got {:?}",
                self.field_separator
            ))),
        }
    }

    pub fn decode_schema(&self) -> Result<DecodeSchema, ConfigError> {
        let fields = DecodeSchema::parse_fields(&self.input_fields)?;
        DecodeSchema::new(
            fields,
            &split_names(self.feature_fields.as_deref()),
            &split_names(self.label_fields.as_deref()),
            self.separator()?,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(2, Duration::from_millis(self.broker_retry_initial_ms))
            .maximum_interval(Duration::from_millis(self.broker_retry_max_ms))
            .max_attempts(self.broker_retry_max_attempts)
            .provide()
    }

    /// rdkafka client config for the assign-only ingestion consumer.
    pub fn consumer_config(&self) -> Result<ClientConfig, ConfigError> {
        let global = parse_options(self.kafka_config_global.as_deref())?;
        let topic = parse_options(self.kafka_config_topic.as_deref())?;
        Ok(
            ConsumerConfigBuilder::for_assigned_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_global_options(&global)
                .with_topic_options(&topic)
                .build(),
        )
    }

    /// Check everything that can be checked without a broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_num == 0 || self.task_index >= self.task_num {
            return Err(ConfigError::Invalid(format!(
                "TASK_INDEX {} is out of range for TASK_NUM {}",
                self.task_index, self.task_num
            )));
        }
        if self.batch_size == 0 || self.num_parallel_calls == 0 || self.prefetch_size == 0 {
            return Err(ConfigError::Invalid(
                "BATCH_SIZE, NUM_PARALLEL_CALLS and PREFETCH_SIZE must be positive".to_string(),
            ));
        }
        self.parsed_mode()?;
        self.offset_config()?;
        self.decode_schema()?;
        parse_options(self.kafka_config_global.as_deref())?;
        parse_options(self.kafka_config_topic.as_deref())?;
        Ok(())
    }

    pub fn to_pipeline_config(&self, restore_from: Option<PathBuf>) -> Result<PipelineConfig, ConfigError> {
        let mut pipeline = PipelineConfig::new(&self.kafka_topic, self.parsed_mode()?);
        pipeline.task_index = self.task_index;
        pipeline.task_num = self.task_num;
        pipeline.redundant_leader = self.chief_redundant;
        pipeline.offset_config = self.offset_config()?;
        pipeline.restore_from = restore_from;
        pipeline.batch_size = self.batch_size;
        pipeline.num_parallel_calls = self.num_parallel_calls;
        pipeline.prefetch_size = self.prefetch_size;
        pipeline.poll_timeout = self.poll_timeout();
        pipeline.poll_retry_policy = self.retry_policy();
        pipeline.shutdown_timeout = self.shutdown_timeout();
        Ok(pipeline)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn split_names(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse comma separated `key=value` client options.
pub fn parse_options(raw: Option<&str>) -> Result<Vec<(String, String)>, ConfigError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|option| {
            option
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| {
                    ConfigError::Invalid(format!("kafka option {option:?} is not key=value"))
                })
        })
        .collect()
}
