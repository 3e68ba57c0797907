//! ClickHouse table schemas.
//!
//! - Documents live in a ReplacingMergeTree ordered by document id, so writing
//!   the same id again replaces the earlier row on merge (read with FINAL)
//! - Committed offsets are keyed by (pipeline, stream, partition)
//! - DateTime64(3) for millisecond precision

use crate::client::ClickHouseClient;
use engine_core::Result;
use tracing::debug;

pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database}")
}

/// Enriched documents, one logical row per document id.
pub fn create_documents_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    doc_id String,
    entity_key String,
    body String,
    event_time DateTime64(3),
    status LowCardinality(String),
    version UInt64,
    updated_at DateTime DEFAULT now()
)
ENGINE = ReplacingMergeTree(version)
ORDER BY doc_id
SETTINGS index_granularity = 8192
"#
    )
}

/// Source offsets committed by the pipeline coordinator.
pub fn create_offsets_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    pipeline String,
    stream String,
    partition Int32,
    offset Int64,
    committed_at DateTime64(3)
)
ENGINE = ReplacingMergeTree(committed_at)
ORDER BY (pipeline, stream, partition)
"#
    )
}

pub fn all_tables(client: &ClickHouseClient) -> Vec<String> {
    vec![
        create_database(&client.config().database),
        create_documents_table(&client.documents_table()),
        create_offsets_table(&client.offsets_table()),
    ]
}

/// Initialize database schema.
pub async fn init_schema(client: &ClickHouseClient) -> Result<()> {
    for sql in all_tables(client) {
        client
            .inner()
            .query(&sql)
            .execute()
            .await
            .map_err(|e| engine_core::Error::sink(format!("schema init error: {}", e)))?;
    }

    debug!("ClickHouse schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClickHouseConfig;

    #[test]
    fn test_ddl_targets_configured_tables() {
        let client = ClickHouseClient::new(ClickHouseConfig::default()).unwrap();
        let ddl = all_tables(&client);
        assert_eq!(ddl.len(), 3);
        assert_eq!(ddl[0], "CREATE DATABASE IF NOT EXISTS enrichment");
        assert!(ddl[1].contains("enrichment.enriched_documents"));
        assert!(ddl[1].contains("ReplacingMergeTree(version)"));
        assert!(ddl[2].contains("ORDER BY (pipeline, stream, partition)"));
    }
}
