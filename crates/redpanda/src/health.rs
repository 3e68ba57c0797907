//! Redpanda health checks.

use crate::config::RedpandaConfig;
use rskafka::client::{Client, ClientBuilder, Credentials, SaslConfig};
use std::collections::HashSet;
use tracing::{debug, error};

async fn connect(config: &RedpandaConfig) -> Option<Client> {
    let mut builder = ClientBuilder::new(vec![config.broker_string()]);
    if let Some((username, password)) = config.credentials() {
        builder = builder
            .tls_config(crate::consumer::tls_config())
            .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                username.to_string(),
                password.to_string(),
            )));
    }

    match builder.build().await {
        Ok(client) => Some(client),
        Err(e) => {
            error!(error = %e, "Failed to connect to Redpanda");
            None
        }
    }
}

/// Check Redpanda connection health.
pub async fn check_connection(config: &RedpandaConfig) -> bool {
    let Some(client) = connect(config).await else {
        return false;
    };

    match client.list_topics().await {
        Ok(topics) => {
            debug!(topics = topics.len(), "Redpanda connection healthy");
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to list Redpanda topics");
            false
        }
    }
}

/// Returns the topics from `topics` that do not exist on the cluster.
pub async fn missing_topics(config: &RedpandaConfig, topics: &[&str]) -> Vec<String> {
    let all = || -> Vec<String> { topics.iter().map(|t| t.to_string()).collect() };

    let Some(client) = connect(config).await else {
        return all();
    };

    match client.list_topics().await {
        Ok(existing) => {
            let existing: HashSet<_> = existing.iter().map(|t| t.name.as_str()).collect();
            topics
                .iter()
                .filter(|t| !existing.contains(*t))
                .map(|t| t.to_string())
                .collect()
        }
        Err(_) => all(),
    }
}
