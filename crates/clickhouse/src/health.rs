//! ClickHouse health checks.

use crate::client::ClickHouseClient;
use clickhouse::Row;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, error};

#[derive(Debug, Row, Deserialize)]
struct TableName {
    name: String,
}

/// Round-trips a trivial query.
pub async fn check_connection(client: &ClickHouseClient) -> bool {
    match client.inner().query("SELECT 1").fetch_one::<u8>().await {
        Ok(_) => {
            debug!(database = %client.config().database, "ClickHouse connection healthy");
            true
        }
        Err(e) => {
            error!(error = %e, "ClickHouse health check failed");
            false
        }
    }
}

/// Pipeline tables absent from the configured database. Every table is
/// reported missing when the catalog cannot be read.
pub async fn missing_tables(client: &ClickHouseClient) -> Vec<String> {
    let config = client.config();
    let wanted = [config.documents_table.as_str(), config.offsets_table.as_str()];

    let existing = client
        .inner()
        .query("SELECT name FROM system.tables WHERE database = ?")
        .bind(config.database.as_str())
        .fetch_all::<TableName>()
        .await;

    match existing {
        Ok(rows) => {
            let names: HashSet<String> = rows.into_iter().map(|r| r.name).collect();
            wanted
                .iter()
                .filter(|t| !names.contains(**t))
                .map(|t| t.to_string())
                .collect()
        }
        Err(e) => {
            error!(error = %e, "Failed to read ClickHouse table catalog");
            wanted.iter().map(|t| t.to_string()).collect()
        }
    }
}
