//! In-process batch engine evaluating plan steps over transactions held in
//! memory. Stands in for the cluster in development and tests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use audience_core::{SegmentRow, SetOperation, TransactionRecord};
use audience_materializer::SegmentWarehouse;
use audience_segmentation::predicates::{group_by_user, matches_user, scan, UserActivity};
use audience_segmentation::{PlanStep, SegmentQuery};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::{BatchEngine, BatchFailure, BatchRequest, TaskHandle, TaskStatus};

type TaskResult = Result<Vec<SegmentRow>, BatchFailure>;

pub struct LocalBatchEngine {
    records: Arc<Vec<TransactionRecord>>,
    warehouse: Arc<dyn SegmentWarehouse>,
    tasks: DashMap<String, JoinHandle<TaskResult>>,
}

impl LocalBatchEngine {
    /// `warehouse` supplies dependency tables for composed steps.
    pub fn new(warehouse: Arc<dyn SegmentWarehouse>, records: Vec<TransactionRecord>) -> Self {
        Self {
            records: Arc::new(records),
            warehouse,
            tasks: DashMap::new(),
        }
    }

    /// Read newline-delimited JSON transactions.
    pub fn load_ndjson(path: impl AsRef<Path>) -> anyhow::Result<Vec<TransactionRecord>> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: TransactionRecord = serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("line {}: {e}", line_no + 1))?;
            records.push(record);
        }
        info!(path = %path.as_ref().display(), count = records.len(), "Loaded transactions");
        Ok(records)
    }
}

async fn evaluate(
    records: Arc<Vec<TransactionRecord>>,
    warehouse: Arc<dyn SegmentWarehouse>,
    step: PlanStep,
) -> TaskResult {
    match &step.query {
        SegmentQuery::Scan { predicate } => Ok(scan(&records, &step.window, predicate)),
        SegmentQuery::Compose {
            operation,
            inputs,
            residual,
        } => {
            let mut member_sets: Vec<BTreeSet<i64>> = Vec::with_capacity(inputs.len() + 1);
            for input in inputs {
                let rows = warehouse
                    .read_table(&input.table)
                    .await
                    .map_err(|e| BatchFailure::transient(format!("read {}: {e}", input.table)))?
                    .ok_or_else(|| {
                        BatchFailure::structural(format!(
                            "dependency table {} for rule {} does not exist",
                            input.table, input.rule_id
                        ))
                    })?;
                member_sets.push(rows.iter().map(|r| r.user_id).collect());
            }

            let users = group_by_user(&records, &step.window);
            if let Some(residual) = residual {
                member_sets.push(
                    users
                        .values()
                        .filter(|u| matches_user(residual, u))
                        .map(|u| u.user_id)
                        .collect(),
                );
            }
            let members = combine(*operation, member_sets);
            debug!(rule_id = step.rule_id, members = members.len(), "Composed dependency segments");

            Ok(users
                .values()
                .filter(|u| members.contains(&u.user_id))
                .map(UserActivity::to_segment_row)
                .collect())
        }
    }
}

fn combine(operation: SetOperation, sets: Vec<BTreeSet<i64>>) -> BTreeSet<i64> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first, |acc, set| match operation {
        SetOperation::Intersection => acc.intersection(&set).copied().collect(),
        SetOperation::Union => acc.union(&set).copied().collect(),
    })
}

#[async_trait]
impl BatchEngine for LocalBatchEngine {
    async fn submit(&self, request: BatchRequest) -> Result<TaskHandle, BatchFailure> {
        let records = self.records.clone();
        let warehouse = self.warehouse.clone();
        let task_id = format!("local-{}", request.job_id.simple());
        let handle = tokio::spawn(evaluate(records, warehouse, request.step));
        self.tasks.insert(task_id.clone(), handle);
        Ok(TaskHandle {
            task_id,
            job_id: request.job_id,
        })
    }

    async fn poll(&self, handle: &TaskHandle) -> TaskStatus {
        let finished = match self.tasks.get(&handle.task_id) {
            Some(task) => task.is_finished(),
            None => {
                return TaskStatus::Failed(BatchFailure::transient(format!(
                    "unknown task {}",
                    handle.task_id
                )))
            }
        };
        if !finished {
            return TaskStatus::Running;
        }
        let Some((_, task)) = self.tasks.remove(&handle.task_id) else {
            return TaskStatus::Failed(BatchFailure::transient("task vanished"));
        };
        match task.await {
            Ok(Ok(rows)) => TaskStatus::Succeeded(rows),
            Ok(Err(failure)) => TaskStatus::Failed(failure),
            Err(e) => TaskStatus::Failed(BatchFailure::transient(format!("task aborted: {e}"))),
        }
    }

    async fn terminate(&self, handle: &TaskHandle) {
        if let Some((_, task)) = self.tasks.remove(&handle.task_id) {
            task.abort();
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audience_core::types::output_table_name;
    use audience_core::DateRange;
    use audience_materializer::InMemoryWarehouse;
    use audience_segmentation::{ConditionParser, DependencyInput};
    use chrono::NaiveDate;
    use serde_json::json;
    use uuid::Uuid;

    fn tx(user_id: i64, amount: f64, category: &str, tier: i64) -> TransactionRecord {
        TransactionRecord {
            user_id,
            amount,
            transaction_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            category: category.to_string(),
            city_tier: tier,
            transaction_type: "UPI".to_string(),
        }
    }

    fn records() -> Vec<TransactionRecord> {
        vec![
            tx(1, 500.0, "Food", 1),
            tx(2, 50.0, "Food", 2),
            tx(3, 900.0, "Travel", 1),
            tx(4, 10.0, "Food", 1),
        ]
    }

    fn step(rule_id: u64, query: SegmentQuery) -> PlanStep {
        PlanStep {
            rule_id,
            output_table: output_table_name(rule_id),
            window: DateRange::unbounded(),
            depends_on: Vec::new(),
            query,
            sql: String::new(),
        }
    }

    fn request(step: PlanStep) -> BatchRequest {
        BatchRequest {
            job_id: Uuid::new_v4(),
            rule_id: step.rule_id,
            step,
            data_source: "memory".to_string(),
            output_destination: "memory".to_string(),
        }
    }

    async fn run(engine: &LocalBatchEngine, step: PlanStep) -> TaskStatus {
        let handle = engine.submit(request(step)).await.unwrap();
        loop {
            match engine.poll(&handle).await {
                TaskStatus::Running => tokio::task::yield_now().await,
                done => return done,
            }
        }
    }

    fn ids(status: TaskStatus) -> Vec<i64> {
        match status {
            TaskStatus::Succeeded(rows) => rows.iter().map(|r| r.user_id).collect(),
            other => panic!("expected success, got {other:?}"),
        }
    }

    fn node(raw: serde_json::Value) -> audience_segmentation::ConditionNode {
        ConditionParser::default().normalize(&raw).unwrap().root
    }

    #[tokio::test]
    async fn test_scan_step() {
        let engine = LocalBatchEngine::new(Arc::new(InMemoryWarehouse::new()), records());
        let predicate = node(json!({"field": "city_tier", "operator": "=", "value": 1}));
        let status = run(&engine, step(1, SegmentQuery::Scan { predicate })).await;
        assert_eq!(ids(status), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_compose_intersection_with_residual() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let engine = LocalBatchEngine::new(warehouse.clone(), records());

        let tier1 = node(json!({"field": "city_tier", "operator": "=", "value": 1}));
        let TaskStatus::Succeeded(rows) = run(&engine, step(1, SegmentQuery::Scan { predicate: tier1 })).await else {
            panic!("scan failed");
        };
        warehouse.stage("s1", &rows).await.unwrap();
        warehouse
            .commit_swap(
                "s1",
                &audience_materializer::PublishRecord {
                    rule_id: 1,
                    segment_name: "segment_1".into(),
                    output_table: output_table_name(1),
                    sql_query: String::new(),
                    row_count: rows.len() as u64,
                    rule_revision: 1,
                    refreshed_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let residual = node(json!({"field": "category", "operator": "=", "value": "Food"}));
        let composed = SegmentQuery::Compose {
            operation: SetOperation::Intersection,
            inputs: vec![DependencyInput {
                rule_id: 1,
                table: output_table_name(1),
            }],
            residual: Some(residual),
        };
        assert_eq!(ids(run(&engine, step(2, composed)).await), vec![1, 4]);
    }

    #[tokio::test]
    async fn test_compose_keeps_only_users_active_in_window() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let mut history = records();
        history.push(TransactionRecord {
            transaction_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            ..tx(5, 2000.0, "Food", 1)
        });
        let engine = LocalBatchEngine::new(warehouse.clone(), history);

        let tier1 = node(json!({"field": "city_tier", "operator": "=", "value": 1}));
        let TaskStatus::Succeeded(rows) = run(&engine, step(1, SegmentQuery::Scan { predicate: tier1 })).await else {
            panic!("scan failed");
        };
        assert_eq!(rows.len(), 4);
        warehouse.stage("s1", &rows).await.unwrap();
        warehouse
            .commit_swap(
                "s1",
                &audience_materializer::PublishRecord {
                    rule_id: 1,
                    segment_name: "segment_1".into(),
                    output_table: output_table_name(1),
                    sql_query: String::new(),
                    row_count: rows.len() as u64,
                    rule_revision: 1,
                    refreshed_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let mut composed = step(
            2,
            SegmentQuery::Compose {
                operation: SetOperation::Union,
                inputs: vec![DependencyInput {
                    rule_id: 1,
                    table: output_table_name(1),
                }],
                residual: None,
            },
        );
        composed.window = DateRange::new(NaiveDate::from_ymd_opt(2024, 2, 1), None);
        assert_eq!(ids(run(&engine, composed).await), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_missing_dependency_table_is_structural() {
        let engine = LocalBatchEngine::new(Arc::new(InMemoryWarehouse::new()), records());
        let composed = SegmentQuery::Compose {
            operation: SetOperation::Union,
            inputs: vec![DependencyInput {
                rule_id: 9,
                table: output_table_name(9),
            }],
            residual: None,
        };
        match run(&engine, step(2, composed)).await {
            TaskStatus::Failed(failure) => assert!(!failure.is_retryable()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_combine() {
        let a: BTreeSet<i64> = [1, 2, 3].into();
        let b: BTreeSet<i64> = [2, 3, 4].into();
        assert_eq!(
            combine(SetOperation::Intersection, vec![a.clone(), b.clone()]),
            [2, 3].into()
        );
        assert_eq!(combine(SetOperation::Union, vec![a, b]), [1, 2, 3, 4].into());
        assert!(combine(SetOperation::Union, Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_handle_fails() {
        let engine = LocalBatchEngine::new(Arc::new(InMemoryWarehouse::new()), Vec::new());
        let handle = TaskHandle {
            task_id: "nope".into(),
            job_id: Uuid::new_v4(),
        };
        assert!(matches!(engine.poll(&handle).await, TaskStatus::Failed(_)));
        engine.terminate(&handle).await;
    }
}
