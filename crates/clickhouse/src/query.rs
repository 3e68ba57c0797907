//! Read-side queries against the documents table.

use crate::client::ClickHouseClient;
use engine_core::{Error, Result};

/// Logical documents after replacement (reads with FINAL).
pub async fn count_documents(client: &ClickHouseClient) -> Result<u64> {
    client
        .inner()
        .query(&format!("SELECT count() FROM {} FINAL", client.documents_table()))
        .fetch_one::<u64>()
        .await
        .map_err(|e| Error::sink(format!("document count failed: {}", e)))
}
