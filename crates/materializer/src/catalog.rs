use audience_core::RuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata of a published segment. One entry per rule, overwritten on
/// every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCatalogEntry {
    pub id: Uuid,
    pub rule_id: RuleId,
    pub segment_name: String,
    pub output_table: String,
    pub row_count: u64,
    pub sql_query: String,
    /// Revision of the rule definition the live table was built from.
    pub rule_revision: u64,
    pub last_refreshed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// What a swap records in the catalog.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub rule_id: RuleId,
    pub segment_name: String,
    pub output_table: String,
    pub sql_query: String,
    pub row_count: u64,
    pub rule_revision: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl SegmentCatalogEntry {
    /// Entry after publishing `record`, keeping the identity of `previous`.
    pub fn upsert(previous: Option<&SegmentCatalogEntry>, record: &PublishRecord) -> Self {
        Self {
            id: previous.map_or_else(Uuid::new_v4, |p| p.id),
            rule_id: record.rule_id,
            segment_name: record.segment_name.clone(),
            output_table: record.output_table.clone(),
            row_count: record.row_count,
            sql_query: record.sql_query.clone(),
            rule_revision: record.rule_revision,
            last_refreshed_at: record.refreshed_at,
            created_at: previous.map_or(record.refreshed_at, |p| p.created_at),
        }
    }
}
