use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `AUDIENCE_ENGINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub raw_tables: RawTablesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Knobs for choosing among reuse candidates.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Candidates sharing fewer atomic predicates than this are ignored.
    #[serde(default = "default_min_shared_predicates")]
    pub min_shared_predicates: usize,
    /// Break shared-predicate ties by the smaller published segment.
    #[serde(default = "default_prefer_smaller_tables")]
    pub prefer_smaller_tables: bool,
    /// Allow one edge per matched sub-clause instead of a single best edge.
    #[serde(default = "default_allow_multiple_dependencies")]
    pub allow_multiple_dependencies: bool,
    #[serde(default = "default_max_dnf_clauses")]
    pub max_dnf_clauses: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    /// `memory` or `clickhouse`.
    #[serde(default = "default_warehouse_backend")]
    pub backend: String,
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,
    #[serde(default = "default_clickhouse_db")]
    pub clickhouse_database: String,
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// `local` or `spark`.
    #[serde(default = "default_batch_engine")]
    pub engine: String,
    #[serde(default = "default_spark_submit")]
    pub spark_submit: String,
    #[serde(default = "default_spark_master")]
    pub master: String,
    #[serde(default = "default_job_script")]
    pub job_script: String,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTablesConfig {
    #[serde(default = "default_upi_table")]
    pub upi: String,
    #[serde(default = "default_credit_card_table")]
    pub credit_card: String,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_job_timeout_secs() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_min_shared_predicates() -> usize {
    1
}
fn default_prefer_smaller_tables() -> bool {
    true
}
fn default_allow_multiple_dependencies() -> bool {
    true
}
fn default_max_dnf_clauses() -> usize {
    64
}
fn default_warehouse_backend() -> String {
    "memory".to_string()
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "audience_manager".to_string()
}
fn default_staging_prefix() -> String {
    "staging_segment_".to_string()
}
fn default_batch_engine() -> String {
    "local".to_string()
}
fn default_spark_submit() -> String {
    "spark-submit".to_string()
}
fn default_spark_master() -> String {
    "local[*]".to_string()
}
fn default_job_script() -> String {
    "jobs/segment_processor_job.py".to_string()
}
fn default_data_source() -> String {
    "jdbc:sqlite:db/audience_manager.db".to_string()
}
fn default_output_dir() -> String {
    "/tmp/audience-engine".to_string()
}
fn default_upi_table() -> String {
    "upi_transactions_raw".to_string()
}
fn default_credit_card_table() -> String {
    "credit_card_transactions_raw".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_shared_predicates: default_min_shared_predicates(),
            prefer_smaller_tables: default_prefer_smaller_tables(),
            allow_multiple_dependencies: default_allow_multiple_dependencies(),
            max_dnf_clauses: default_max_dnf_clauses(),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            backend: default_warehouse_backend(),
            clickhouse_url: default_clickhouse_url(),
            clickhouse_database: default_clickhouse_db(),
            staging_prefix: default_staging_prefix(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            engine: default_batch_engine(),
            spark_submit: default_spark_submit(),
            master: default_spark_master(),
            job_script: default_job_script(),
            data_source: default_data_source(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for RawTablesConfig {
    fn default() -> Self {
        Self {
            upi: default_upi_table(),
            credit_card: default_credit_card_table(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            resolver: ResolverConfig::default(),
            warehouse: WarehouseConfig::default(),
            batch: BatchConfig::default(),
            raw_tables: RawTablesConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file overlaid by environment
    /// variables.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AUDIENCE_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
