//! Storage for segment tables and their catalog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use audience_core::types::output_table_name;
use audience_core::{AudienceError, AudienceResult, RuleId, SegmentRow};
use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::{PublishRecord, SegmentCatalogEntry};

#[async_trait]
pub trait SegmentWarehouse: Send + Sync {
    /// Write `rows` into a fresh staging table, replacing any leftover with
    /// the same name.
    async fn stage(&self, staging_table: &str, rows: &[SegmentRow]) -> AudienceResult<()>;

    /// Atomically replace the output table with the staging table and upsert
    /// the catalog entry. Readers observe either the old or the new table.
    async fn commit_swap(
        &self,
        staging_table: &str,
        record: &PublishRecord,
    ) -> AudienceResult<SegmentCatalogEntry>;

    async fn discard_staging(&self, staging_table: &str) -> AudienceResult<()>;

    async fn catalog_entry(&self, rule_id: RuleId) -> AudienceResult<Option<SegmentCatalogEntry>>;

    async fn list_catalog(&self) -> AudienceResult<Vec<SegmentCatalogEntry>>;

    /// First `limit` rows of a rule's published segment, by user id.
    async fn sample(&self, rule_id: RuleId, limit: usize) -> AudienceResult<Vec<SegmentRow>>;

    /// Full contents of a table, `None` if it does not exist.
    async fn read_table(&self, table: &str) -> AudienceResult<Option<Vec<SegmentRow>>>;

    async fn table_exists(&self, table: &str) -> AudienceResult<bool>;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: HashMap<String, Arc<Vec<SegmentRow>>>,
    catalog: BTreeMap<RuleId, SegmentCatalogEntry>,
}

/// Process-local warehouse. Tables are immutable `Arc` snapshots, and the
/// swap and catalog upsert happen under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: RwLock<WarehouseState>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of a table without copying rows.
    pub fn snapshot(&self, table: &str) -> Option<Arc<Vec<SegmentRow>>> {
        self.state.read().tables.get(table).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SegmentWarehouse for InMemoryWarehouse {
    async fn stage(&self, staging_table: &str, rows: &[SegmentRow]) -> AudienceResult<()> {
        let mut rows = rows.to_vec();
        rows.sort_by_key(|r| r.user_id);
        self.state
            .write()
            .tables
            .insert(staging_table.to_string(), Arc::new(rows));
        Ok(())
    }

    async fn commit_swap(
        &self,
        staging_table: &str,
        record: &PublishRecord,
    ) -> AudienceResult<SegmentCatalogEntry> {
        let mut state = self.state.write();
        let staged = state.tables.remove(staging_table).ok_or_else(|| {
            AudienceError::Materialization(format!("staging table {staging_table} does not exist"))
        })?;
        state.tables.insert(record.output_table.clone(), staged);
        let entry = SegmentCatalogEntry::upsert(state.catalog.get(&record.rule_id), record);
        state.catalog.insert(record.rule_id, entry.clone());
        debug!(rule_id = record.rule_id, table = %record.output_table, "Swapped segment table");
        Ok(entry)
    }

    async fn discard_staging(&self, staging_table: &str) -> AudienceResult<()> {
        self.state.write().tables.remove(staging_table);
        Ok(())
    }

    async fn catalog_entry(&self, rule_id: RuleId) -> AudienceResult<Option<SegmentCatalogEntry>> {
        Ok(self.state.read().catalog.get(&rule_id).cloned())
    }

    async fn list_catalog(&self) -> AudienceResult<Vec<SegmentCatalogEntry>> {
        Ok(self.state.read().catalog.values().cloned().collect())
    }

    async fn sample(&self, rule_id: RuleId, limit: usize) -> AudienceResult<Vec<SegmentRow>> {
        let table = self.snapshot(&output_table_name(rule_id));
        Ok(table
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn read_table(&self, table: &str) -> AudienceResult<Option<Vec<SegmentRow>>> {
        Ok(self.snapshot(table).map(|rows| rows.as_ref().clone()))
    }

    async fn table_exists(&self, table: &str) -> AudienceResult<bool> {
        Ok(self.state.read().tables.contains_key(table))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
