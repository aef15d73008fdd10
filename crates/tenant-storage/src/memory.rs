//! In-memory fake tenant client, for tests only.

use std::collections::HashSet;

use tokio::sync::RwLock;

use crate::{StorageError, TenantDbClient};

/// A fake tenant database client backed by an in-memory set of table
/// names. Never touches the network; used by resolver/connection-manager
/// tests that don't need a real Postgres instance.
#[derive(Debug, Default)]
pub struct MemoryTenantClient {
    tables: RwLock<HashSet<String>>,
    unreachable: bool,
}

impl MemoryTenantClient {
    /// An empty tenant client (no tables) — simulates a freshly attached,
    /// unprovisioned tenant database.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A tenant client that already has the canonical tables — simulates
    /// a healthy, provisioned tenant database.
    #[must_use]
    pub fn provisioned() -> Self {
        let tables = crate::CANONICAL_TABLES
            .iter()
            .map(|t| (*t).to_owned())
            .collect();
        Self {
            tables: RwLock::new(tables),
            unreachable: false,
        }
    }

    /// A tenant client that always fails its health probe — simulates a
    /// network partition or a dead database.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            tables: RwLock::new(HashSet::new()),
            unreachable: true,
        }
    }
}

#[async_trait::async_trait]
impl TenantDbClient for MemoryTenantClient {
    async fn ping(&self) -> Result<(), StorageError> {
        if self.unreachable {
            return Err(StorageError::Unreachable {
                reason: "simulated network partition".to_owned(),
            });
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        if self.unreachable {
            return Err(StorageError::Unreachable {
                reason: "simulated network partition".to_owned(),
            });
        }
        Ok(self.tables.read().await.contains(table))
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        if self.unreachable {
            return Err(StorageError::Unreachable {
                reason: "simulated network partition".to_owned(),
            });
        }
        // Crude but sufficient for tests: a "CREATE TABLE IF NOT EXISTS <name>"
        // statement marks <name> as present. Real migrations run against a
        // real backend; this just lets repair-flow tests observe progress.
        let mut tables = self.tables.write().await;
        for line in sql.lines() {
            let lower = line.to_lowercase();
            if let Some(idx) = lower.find("create table if not exists") {
                let rest = &line[idx + "create table if not exists".len()..];
                if let Some(name) = rest.split_whitespace().next() {
                    tables.insert(name.trim_matches(['"', '(', ';']).to_owned());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_client_has_no_canonical_tables() {
        let client = MemoryTenantClient::empty();
        let present = client.canonical_tables_present().await.unwrap();
        assert!(present.is_empty());
    }

    #[tokio::test]
    async fn provisioned_client_has_all_canonical_tables() {
        let client = MemoryTenantClient::provisioned();
        let present = client.canonical_tables_present().await.unwrap();
        assert_eq!(present.len(), crate::CANONICAL_TABLES.len());
    }

    #[tokio::test]
    async fn unreachable_client_fails_ping() {
        let client = MemoryTenantClient::unreachable();
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn execute_batch_tracks_created_tables() {
        let client = MemoryTenantClient::empty();
        client
            .execute_batch("CREATE TABLE IF NOT EXISTS stores (id uuid primary key);")
            .await
            .unwrap();
        assert!(client.table_exists("stores").await.unwrap());
    }
}
