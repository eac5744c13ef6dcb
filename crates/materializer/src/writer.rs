//! Publishes a job's result rows as a rule's segment.

use std::sync::Arc;

use audience_core::types::{output_table_name, segment_name, staging_table_name};
use audience_core::{AudienceError, AudienceResult, RuleId, SegmentRow};
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{PublishRecord, SegmentCatalogEntry};
use crate::warehouse::SegmentWarehouse;

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub rule_id: RuleId,
    pub job_id: Uuid,
    pub rule_revision: u64,
    pub sql_query: String,
    pub rows: Vec<SegmentRow>,
}

#[derive(Clone)]
pub struct MaterializationWriter {
    warehouse: Arc<dyn SegmentWarehouse>,
    staging_prefix: String,
}

impl MaterializationWriter {
    pub fn new(warehouse: Arc<dyn SegmentWarehouse>, staging_prefix: impl Into<String>) -> Self {
        Self {
            warehouse,
            staging_prefix: staging_prefix.into(),
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn SegmentWarehouse> {
        &self.warehouse
    }

    /// Stage the rows, then swap them into the rule's output table and
    /// update the catalog. On any failure the staging table is dropped and
    /// the previously published segment stays live.
    pub async fn publish(&self, request: PublishRequest) -> AudienceResult<SegmentCatalogEntry> {
        let PublishRequest {
            rule_id,
            job_id,
            rule_revision,
            sql_query,
            mut rows,
        } = request;
        rows.sort_by_key(|r| r.user_id);
        rows.dedup_by_key(|r| r.user_id);

        let staging = staging_table_name(&self.staging_prefix, rule_id, job_id);
        let record = PublishRecord {
            rule_id,
            segment_name: segment_name(rule_id),
            output_table: output_table_name(rule_id),
            sql_query,
            row_count: rows.len() as u64,
            rule_revision,
            refreshed_at: Utc::now(),
        };

        let outcome = match self.warehouse.stage(&staging, &rows).await {
            Ok(()) => self.warehouse.commit_swap(&staging, &record).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(entry) => {
                metrics::counter!("materializer.published").increment(1);
                metrics::gauge!("materializer.segment_rows", "rule_id" => rule_id.to_string())
                    .set(entry.row_count as f64);
                info!(
                    rule_id,
                    job_id = %job_id,
                    table = %entry.output_table,
                    rows = entry.row_count,
                    revision = entry.rule_revision,
                    "Segment published"
                );
                Ok(entry)
            }
            Err(e) => {
                metrics::counter!("materializer.failed").increment(1);
                error!(rule_id, job_id = %job_id, error = %e, "Segment publish failed, previous segment kept");
                if let Err(cleanup) = self.warehouse.discard_staging(&staging).await {
                    warn!(table = %staging, error = %cleanup, "Failed to drop staging table");
                }
                Err(match e {
                    AudienceError::Materialization(_) => e,
                    other => AudienceError::Materialization(other.to_string()),
                })
            }
        }
    }

    pub async fn catalog_entry(&self, rule_id: RuleId) -> AudienceResult<Option<SegmentCatalogEntry>> {
        self.warehouse.catalog_entry(rule_id).await
    }

    /// Whether the rule has a published output table.
    pub async fn is_published(&self, rule_id: RuleId) -> AudienceResult<bool> {
        self.warehouse.table_exists(&output_table_name(rule_id)).await
    }

    /// Whether the rule's published segment was built from `revision` of
    /// its definition. Older tables answer a different predicate.
    pub async fn is_current(&self, rule_id: RuleId, revision: u64) -> AudienceResult<bool> {
        Ok(self
            .catalog_entry(rule_id)
            .await?
            .is_some_and(|entry| entry.rule_revision == revision))
    }
}
