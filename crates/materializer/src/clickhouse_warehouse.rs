//! ClickHouse-backed segment warehouse.
//! Staging tables are filled through the typed row inserter and published
//! with `EXCHANGE TABLES`, which swaps both tables atomically.

use async_trait::async_trait;
use audience_core::config::WarehouseConfig;
use audience_core::types::output_table_name;
use audience_core::{AudienceError, AudienceResult, RuleId, SegmentRow};
use chrono::{DateTime, TimeZone, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{PublishRecord, SegmentCatalogEntry};
use crate::warehouse::SegmentWarehouse;

const CATALOG_TABLE: &str = "segment_catalog";

pub struct ClickHouseWarehouse {
    client: clickhouse::Client,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct SegmentRowRecord {
    user_id: i64,
    total_transactions: u64,
    total_spent: f64,
    transaction_types: Vec<String>,
}

impl From<&SegmentRow> for SegmentRowRecord {
    fn from(r: &SegmentRow) -> Self {
        SegmentRowRecord {
            user_id: r.user_id,
            total_transactions: r.total_transactions,
            total_spent: r.total_spent,
            transaction_types: r.transaction_types.clone(),
        }
    }
}

impl From<SegmentRowRecord> for SegmentRow {
    fn from(r: SegmentRowRecord) -> Self {
        SegmentRow {
            user_id: r.user_id,
            total_transactions: r.total_transactions,
            total_spent: r.total_spent,
            transaction_types: r.transaction_types,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct CatalogRecord {
    id: String,
    rule_id: u64,
    segment_name: String,
    output_table: String,
    row_count: u64,
    sql_query: String,
    rule_revision: u64,
    last_refreshed_ms: i64,
    created_ms: i64,
}

impl CatalogRecord {
    fn into_entry(self) -> AudienceResult<SegmentCatalogEntry> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| AudienceError::Materialization(format!("bad catalog id: {e}")))?;
        Ok(SegmentCatalogEntry {
            id,
            rule_id: self.rule_id,
            segment_name: self.segment_name,
            output_table: self.output_table,
            row_count: self.row_count,
            sql_query: self.sql_query,
            rule_revision: self.rule_revision,
            last_refreshed_at: from_millis(self.last_refreshed_ms),
            created_at: from_millis(self.created_ms),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn to_clickhouse_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn ch_err(context: &str) -> impl Fn(clickhouse::error::Error) -> AudienceError + '_ {
    move |e| AudienceError::Materialization(format!("{context}: {e}"))
}

const CATALOG_SELECT: &str = "SELECT toString(id) AS id, rule_id, segment_name, output_table, row_count, sql_query, rule_revision, \
toUnixTimestamp64Milli(last_refreshed_at) AS last_refreshed_ms, \
toUnixTimestamp64Milli(created_at) AS created_ms \
FROM segment_catalog FINAL";

impl ClickHouseWarehouse {
    /// Connect and make sure the catalog table exists.
    pub async fn connect(config: &WarehouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.clickhouse_url)
            .with_database(&config.clickhouse_database);

        Self::ensure_schema(&client).await?;
        info!(url = %config.clickhouse_url, database = %config.clickhouse_database, "ClickHouse warehouse ready");
        Ok(Self { client })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS segment_catalog (
                    id UUID,
                    rule_id UInt64,
                    segment_name String,
                    output_table String,
                    row_count UInt64,
                    sql_query String,
                    rule_revision UInt64,
                    last_refreshed_at DateTime64(3),
                    created_at DateTime64(3)
                ) ENGINE = ReplacingMergeTree(last_refreshed_at)
                ORDER BY rule_id",
            )
            .execute()
            .await?;
        // Catalogs created before revisions were tracked.
        client
            .query("ALTER TABLE segment_catalog ADD COLUMN IF NOT EXISTS rule_revision UInt64 DEFAULT 0 AFTER sql_query")
            .execute()
            .await?;

        info!("ClickHouse catalog schema verified");
        Ok(())
    }

    async fn create_segment_table(&self, table: &str) -> AudienceResult<()> {
        self.client
            .query(&format!(
                "CREATE TABLE {table} (
                    user_id Int64,
                    total_transactions UInt64,
                    total_spent Float64,
                    transaction_types Array(String)
                ) ENGINE = MergeTree()
                ORDER BY user_id"
            ))
            .execute()
            .await
            .map_err(ch_err("create staging table"))
    }

    async fn write_catalog(&self, entry: &SegmentCatalogEntry) -> AudienceResult<()> {
        self.client
            .query(&format!(
                "INSERT INTO {CATALOG_TABLE} \
                 (id, rule_id, segment_name, output_table, row_count, sql_query, rule_revision, last_refreshed_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(entry.id.to_string())
            .bind(entry.rule_id)
            .bind(entry.segment_name.as_str())
            .bind(entry.output_table.as_str())
            .bind(entry.row_count)
            .bind(entry.sql_query.as_str())
            .bind(entry.rule_revision)
            .bind(to_clickhouse_time(&entry.last_refreshed_at))
            .bind(to_clickhouse_time(&entry.created_at))
            .execute()
            .await
            .map_err(ch_err("write catalog entry"))
    }

    async fn exchange(&self, a: &str, b: &str) -> AudienceResult<()> {
        self.client
            .query(&format!("EXCHANGE TABLES {a} AND {b}"))
            .execute()
            .await
            .map_err(ch_err("exchange tables"))
    }
}

#[async_trait]
impl SegmentWarehouse for ClickHouseWarehouse {
    async fn stage(&self, staging_table: &str, rows: &[SegmentRow]) -> AudienceResult<()> {
        self.discard_staging(staging_table).await?;
        self.create_segment_table(staging_table).await?;
        if rows.is_empty() {
            return Ok(());
        }

        // Rows travel as RowBinary, never through the SQL text, so values
        // holding `?` are not mistaken for bind placeholders.
        let mut insert = self
            .client
            .insert::<SegmentRowRecord>(staging_table)
            .map_err(ch_err("open staging insert"))?;
        for row in rows {
            insert
                .write(&SegmentRowRecord::from(row))
                .await
                .map_err(ch_err("insert staging rows"))?;
        }
        insert.end().await.map_err(ch_err("finish staging insert"))?;
        metrics::counter!("materializer.rows_staged").increment(rows.len() as u64);
        debug!(table = staging_table, count = rows.len(), "Staged segment rows");
        Ok(())
    }

    async fn commit_swap(
        &self,
        staging_table: &str,
        record: &PublishRecord,
    ) -> AudienceResult<SegmentCatalogEntry> {
        let previous = self.catalog_entry(record.rule_id).await?;
        let entry = SegmentCatalogEntry::upsert(previous.as_ref(), record);
        let output = record.output_table.as_str();

        if self.table_exists(output).await? {
            self.exchange(staging_table, output).await?;
            if let Err(e) = self.write_catalog(&entry).await {
                error!(rule_id = record.rule_id, error = %e, "Catalog write failed, reverting swap");
                if let Err(revert) = self.exchange(staging_table, output).await {
                    error!(rule_id = record.rule_id, error = %revert, "Swap revert failed");
                }
                return Err(e);
            }
            // The staging name now holds the previous segment.
            if let Err(e) = self.discard_staging(staging_table).await {
                warn!(table = staging_table, error = %e, "Failed to drop replaced segment table");
            }
        } else {
            self.client
                .query(&format!("RENAME TABLE {staging_table} TO {output}"))
                .execute()
                .await
                .map_err(ch_err("rename staging table"))?;
            if let Err(e) = self.write_catalog(&entry).await {
                error!(rule_id = record.rule_id, error = %e, "Catalog write failed, reverting rename");
                if let Err(revert) = self
                    .client
                    .query(&format!("RENAME TABLE {output} TO {staging_table}"))
                    .execute()
                    .await
                {
                    error!(rule_id = record.rule_id, error = %revert, "Rename revert failed");
                }
                return Err(e);
            }
        }
        Ok(entry)
    }

    async fn discard_staging(&self, staging_table: &str) -> AudienceResult<()> {
        self.client
            .query(&format!("DROP TABLE IF EXISTS {staging_table}"))
            .execute()
            .await
            .map_err(ch_err("drop staging table"))
    }

    async fn catalog_entry(&self, rule_id: RuleId) -> AudienceResult<Option<SegmentCatalogEntry>> {
        let rows = self
            .client
            .query(&format!("{CATALOG_SELECT} WHERE rule_id = ?"))
            .bind(rule_id)
            .fetch_all::<CatalogRecord>()
            .await
            .map_err(ch_err("read catalog"))?;
        rows.into_iter().next().map(CatalogRecord::into_entry).transpose()
    }

    async fn list_catalog(&self) -> AudienceResult<Vec<SegmentCatalogEntry>> {
        self.client
            .query(&format!("{CATALOG_SELECT} ORDER BY rule_id"))
            .fetch_all::<CatalogRecord>()
            .await
            .map_err(ch_err("list catalog"))?
            .into_iter()
            .map(CatalogRecord::into_entry)
            .collect()
    }

    async fn sample(&self, rule_id: RuleId, limit: usize) -> AudienceResult<Vec<SegmentRow>> {
        let table = output_table_name(rule_id);
        if !self.table_exists(&table).await? {
            return Ok(Vec::new());
        }
        let rows = self
            .client
            .query(&format!(
                "SELECT user_id, total_transactions, total_spent, transaction_types FROM {table} ORDER BY user_id LIMIT {limit}"
            ))
            .fetch_all::<SegmentRowRecord>()
            .await
            .map_err(ch_err("sample segment"))?;
        Ok(rows.into_iter().map(SegmentRow::from).collect())
    }

    async fn read_table(&self, table: &str) -> AudienceResult<Option<Vec<SegmentRow>>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let rows = self
            .client
            .query(&format!(
                "SELECT user_id, total_transactions, total_spent, transaction_types FROM {table} ORDER BY user_id"
            ))
            .fetch_all::<SegmentRowRecord>()
            .await
            .map_err(ch_err("read segment table"))?;
        Ok(Some(rows.into_iter().map(SegmentRow::from).collect()))
    }

    async fn table_exists(&self, table: &str) -> AudienceResult<bool> {
        let count = self
            .client
            .query("SELECT count() FROM system.tables WHERE database = currentDatabase() AND name = ?")
            .bind(table)
            .fetch_one::<u64>()
            .await
            .map_err(ch_err("check table"))?;
        Ok(count > 0)
    }

    fn backend(&self) -> &'static str {
        "clickhouse"
    }
}
