use rdkafka::ClientConfig;
use tracing::info;

/// Kafka consumer configuration builder for assign-only ingestion consumers.
///
/// The ingestion consumer never joins group coordination: partitions are assigned manually
/// with explicit start offsets, and progress lives in the checkpoint sidecar rather than in
/// broker-side commits. `group.id` is still required by rdkafka.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for an **assign-only ingestion consumer**.
    ///
    /// Sets: auto.commit=false, auto.offset.store=false, partition.eof=false (the stream is
    /// infinite) and socket.timeout.ms.
    pub fn for_assigned_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Pass through user-supplied global client options unmodified.
    pub fn with_global_options(mut self, options: &[(String, String)]) -> Self {
        if !options.is_empty() {
            info!(
                "Applying user-specified global kafka config: {}",
                render_options(options)
            );
        }
        for (key, value) in options {
            self.config.set(key, value);
        }
        self
    }

    /// Pass through user-supplied topic options unmodified. librdkafka applies topic-level
    /// properties set on the client config to its default topic configuration.
    pub fn with_topic_options(mut self, options: &[(String, String)]) -> Self {
        if !options.is_empty() {
            info!(
                "Applying user-specified topic kafka config: {}",
                render_options(options)
            );
        }
        for (key, value) in options {
            self.config.set(key, value);
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

fn render_options(options: &[(String, String)]) -> String {
    options
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<String>>()
        .join(", ")
}
