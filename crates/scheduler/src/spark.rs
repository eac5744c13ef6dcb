//! Batch engine that hands plan steps to `spark-submit`.
//!
//! Each submission writes the step's SQL next to the output destination and
//! launches the configured job script as
//! `spark-submit --master <master> <script> <rule_id> <data_source> <output> <sql_file>`.
//! The script is expected to write result rows as newline-delimited JSON,
//! either to `<output>` itself or as `part-*` files inside it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use audience_core::config::BatchConfig;
use audience_core::SegmentRow;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::batch::{BatchEngine, BatchFailure, BatchRequest, TaskHandle, TaskStatus};

struct SparkTask {
    child: Child,
    output: PathBuf,
}

pub struct SparkSubmitEngine {
    config: BatchConfig,
    tasks: Mutex<HashMap<String, SparkTask>>,
}

impl SparkSubmitEngine {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, request: &BatchRequest, sql_file: &Path) -> Command {
        let mut cmd = Command::new(&self.config.spark_submit);
        cmd.arg("--master")
            .arg(&self.config.master)
            .arg(&self.config.job_script)
            .arg(request.rule_id.to_string())
            .arg(&request.data_source)
            .arg(&request.output_destination)
            .arg(sql_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Parse newline-delimited JSON rows from a file, or from every `part-*`
/// file of a directory.
async fn read_output(output: &Path) -> Result<Vec<SegmentRow>, BatchFailure> {
    let metadata = tokio::fs::metadata(output).await.map_err(|e| {
        BatchFailure::structural(format!("job produced no output at {}: {e}", output.display()))
    })?;

    let mut files = Vec::new();
    if metadata.is_dir() {
        let mut entries = tokio::fs::read_dir(output)
            .await
            .map_err(|e| BatchFailure::transient(format!("list {}: {e}", output.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BatchFailure::transient(format!("list {}: {e}", output.display())))?
        {
            if entry.file_name().to_string_lossy().starts_with("part-") {
                files.push(entry.path());
            }
        }
        files.sort();
    } else {
        files.push(output.to_path_buf());
    }

    let mut rows = Vec::new();
    for file in files {
        let raw = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| BatchFailure::transient(format!("read {}: {e}", file.display())))?;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let row: SegmentRow = serde_json::from_str(line).map_err(|e| {
                BatchFailure::structural(format!("malformed row in {}: {e}", file.display()))
            })?;
            rows.push(row);
        }
    }
    Ok(rows)
}

#[async_trait]
impl BatchEngine for SparkSubmitEngine {
    async fn submit(&self, request: BatchRequest) -> Result<TaskHandle, BatchFailure> {
        let output = PathBuf::from(&request.output_destination);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BatchFailure::transient(format!("create {}: {e}", parent.display())))?;
        }
        // stale output from an earlier attempt would be read back as ours
        if let Ok(meta) = tokio::fs::metadata(&output).await {
            let removed = if meta.is_dir() {
                tokio::fs::remove_dir_all(&output).await
            } else {
                tokio::fs::remove_file(&output).await
            };
            if let Err(e) = removed {
                return Err(BatchFailure::transient(format!(
                    "clear {}: {e}",
                    output.display()
                )));
            }
        }

        let sql_file = output.with_extension("sql");
        tokio::fs::write(&sql_file, &request.step.sql)
            .await
            .map_err(|e| BatchFailure::transient(format!("write {}: {e}", sql_file.display())))?;

        let child = self
            .command(&request, &sql_file)
            .spawn()
            .map_err(|e| BatchFailure::transient(format!("spark-submit failed to start: {e}")))?;

        let task_id = format!("spark-{}-{}", request.rule_id, request.job_id.simple());
        info!(
            rule_id = request.rule_id,
            job_id = %request.job_id,
            pid = ?child.id(),
            output = %output.display(),
            "Submitted Spark job"
        );
        self.tasks
            .lock()
            .insert(task_id.clone(), SparkTask { child, output });
        Ok(TaskHandle {
            task_id,
            job_id: request.job_id,
        })
    }

    async fn poll(&self, handle: &TaskHandle) -> TaskStatus {
        let finished = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&handle.task_id) else {
                return TaskStatus::Failed(BatchFailure::transient(format!(
                    "unknown task {}",
                    handle.task_id
                )));
            };
            match task.child.try_wait() {
                Ok(None) => return TaskStatus::Running,
                Ok(Some(status)) => tasks.remove(&handle.task_id).map(|t| (status, t.output)),
                Err(e) => {
                    tasks.remove(&handle.task_id);
                    return TaskStatus::Failed(BatchFailure::transient(format!(
                        "lost track of spark-submit: {e}"
                    )));
                }
            }
        };
        let Some((status, output)) = finished else {
            return TaskStatus::Failed(BatchFailure::transient("task vanished"));
        };

        if !status.success() {
            return TaskStatus::Failed(BatchFailure::structural(format!(
                "spark job exited with {status}"
            )));
        }
        match read_output(&output).await {
            Ok(rows) => {
                debug!(task = %handle.task_id, rows = rows.len(), "Spark job output read");
                TaskStatus::Succeeded(rows)
            }
            Err(failure) => TaskStatus::Failed(failure),
        }
    }

    async fn terminate(&self, handle: &TaskHandle) {
        let task = self.tasks.lock().remove(&handle.task_id);
        if let Some(mut task) = task {
            if let Err(e) = task.child.start_kill() {
                warn!(task = %handle.task_id, error = %e, "Failed to kill spark-submit");
            }
        }
    }

    fn name(&self) -> &'static str {
        "spark"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audience_core::types::output_table_name;
    use audience_core::DateRange;
    use audience_segmentation::{ConditionParser, PlanStep, SegmentQuery};
    use serde_json::json;
    use uuid::Uuid;

    fn request(dir: &Path) -> BatchRequest {
        let predicate = ConditionParser::default()
            .normalize(&json!({"field": "city_tier", "operator": "=", "value": 1}))
            .unwrap()
            .root;
        BatchRequest {
            job_id: Uuid::new_v4(),
            rule_id: 1,
            step: PlanStep {
                rule_id: 1,
                output_table: output_table_name(1),
                window: DateRange::unbounded(),
                depends_on: Vec::new(),
                query: SegmentQuery::Scan { predicate },
                sql: "SELECT 1".to_string(),
            },
            data_source: "jdbc:test".to_string(),
            output_destination: dir.join("out.ndjson").display().to_string(),
        }
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spark-engine-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let engine = SparkSubmitEngine::new(BatchConfig {
            spark_submit: "/nonexistent/spark-submit".to_string(),
            ..test_config()
        });
        let err = engine.submit(request(&scratch_dir())).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reads_part_files() {
        let dir = scratch_dir().join("result");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("part-00000"),
            "{\"user_id\":2,\"total_transactions\":1,\"total_spent\":5.0,\"transaction_types\":[\"UPI\"]}\n",
        )
        .unwrap();
        std::fs::write(dir.join("_SUCCESS"), "").unwrap();
        let rows = read_output(&dir).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 2);
    }

    #[tokio::test]
    async fn test_malformed_output_is_structural() {
        let file = scratch_dir().join("bad.ndjson");
        std::fs::write(&file, "not json\n").unwrap();
        let err = read_output(&file).await.unwrap_err();
        assert!(!err.is_retryable());
        let missing = read_output(Path::new("/nonexistent/out")).await.unwrap_err();
        assert!(!missing.is_retryable());
    }

    fn test_config() -> BatchConfig {
        BatchConfig {
            engine: "spark".to_string(),
            spark_submit: "spark-submit".to_string(),
            master: "local[*]".to_string(),
            job_script: "jobs/segment_job.py".to_string(),
            data_source: "jdbc:test".to_string(),
            output_dir: std::env::temp_dir().display().to_string(),
        }
    }
}
