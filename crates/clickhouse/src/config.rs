//! ClickHouse configuration.

use serde::{Deserialize, Serialize};

/// ClickHouse client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP URL
    #[serde(default = "default_url")]
    pub url: String,
    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Username (optional)
    #[serde(default)]
    pub username: Option<String>,
    /// Password (optional)
    #[serde(default)]
    pub password: Option<String>,
    /// Table holding enriched documents
    #[serde(default = "default_documents_table")]
    pub documents_table: String,
    /// Table holding committed source offsets
    #[serde(default = "default_offsets_table")]
    pub offsets_table: String,
}

fn default_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_database() -> String {
    "enrichment".to_string()
}

fn default_documents_table() -> String {
    "enriched_documents".to_string()
}

fn default_offsets_table() -> String {
    "consumer_offsets".to_string()
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: default_database(),
            username: None,
            password: None,
            documents_table: default_documents_table(),
            offsets_table: default_offsets_table(),
        }
    }
}
