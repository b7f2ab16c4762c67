//! 历史日志
//!
//! 每个 Run 的追加式记录：计划快照与每次尝试的结果。只追加、不原地修改，
//! 参数生成器与评估器并发读取时不会观察到半写状态。
//! 提供内存与 SQLite 两种后端，接口一致可互换。

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::pipeline::plan::Plan;

/// 一次尝试的结果；追加进历史日志后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    /// 尝试序号，从 1 开始
    pub attempt: u32,
    pub success: bool,
    pub data: Option<String>,
    pub error: Option<String>,
    /// 工具附带的面向用户的指引
    pub advice: Option<String>,
    pub timestamp_ms: i64,
}

impl StepResult {
    pub fn success(step_index: usize, attempt: u32, data: impl Into<String>) -> Self {
        Self {
            step_index,
            attempt,
            success: true,
            data: Some(data.into()),
            error: None,
            advice: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(step_index: usize, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            step_index,
            attempt,
            success: false,
            data: None,
            error: Some(error.into()),
            advice: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_advice(mut self, advice: Option<String>) -> Self {
        self.advice = advice;
        self
    }
}

/// 历史日志后端：按 Run 追加结果、读取全量、存取计划快照
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, run_id: &str, result: StepResult) -> Result<(), AgentError>;

    /// 该 Run 的全部结果，按追加顺序
    async fn list(&self, run_id: &str) -> Result<Vec<StepResult>, AgentError>;

    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<(), AgentError>;

    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>, AgentError>;
}

/// 从计划推导某步的祖先下标集合（依赖的传递闭包，必然全部小于该步下标）
pub fn ancestor_indices(plan: &Plan, step_index: usize) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<usize> = plan
        .step(step_index)
        .map(|s| s.depends_on.clone())
        .unwrap_or_default();
    while let Some(idx) = stack.pop() {
        if out.insert(idx) {
            if let Some(step) = plan.step(idx) {
                stack.extend(step.depends_on.iter().copied());
            }
        }
    }
    out
}

#[derive(Default)]
struct RunRecord {
    plan: Option<Plan>,
    results: Vec<StepResult>,
}

/// 内存历史日志
#[derive(Default)]
pub struct MemoryHistory {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, run_id: &str, result: StepResult) -> Result<(), AgentError> {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string())
            .or_default()
            .results
            .push(result);
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<StepResult>, AgentError> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(run_id)
            .map(|r| r.results.clone())
            .unwrap_or_default())
    }

    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<(), AgentError> {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string()).or_default().plan = Some(plan.clone());
        Ok(())
    }

    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>, AgentError> {
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).and_then(|r| r.plan.clone()))
    }
}

/// SQLite 历史日志（同步 rusqlite，调用都很短）
pub struct SqliteHistory {
    conn: StdMutex<Connection>,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        let conn = Connection::open(path).map_err(|e| AgentError::Storage(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_plans (
                run_id TEXT PRIMARY KEY,
                plan_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS step_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                success INTEGER NOT NULL,
                data TEXT,
                error TEXT,
                advice TEXT,
                timestamp_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id);",
        )
        .map_err(|e| AgentError::Storage(e.to_string()))?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, run_id: &str, result: StepResult) -> Result<(), AgentError> {
        let conn = self.conn.lock().map_err(|e| AgentError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO step_results
                (run_id, step_index, attempt, success, data, error, advice, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                result.step_index as i64,
                result.attempt as i64,
                result.success as i64,
                result.data,
                result.error,
                result.advice,
                result.timestamp_ms,
            ],
        )
        .map_err(|e| AgentError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<StepResult>, AgentError> {
        let conn = self.conn.lock().map_err(|e| AgentError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT step_index, attempt, success, data, error, advice, timestamp_ms
                 FROM step_results WHERE run_id = ?1 ORDER BY id ASC",
            )
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StepResult {
                    step_index: row.get::<_, i64>(0)? as usize,
                    attempt: row.get::<_, i64>(1)? as u32,
                    success: row.get::<_, i64>(2)? != 0,
                    data: row.get(3)?,
                    error: row.get(4)?,
                    advice: row.get(5)?,
                    timestamp_ms: row.get(6)?,
                })
            })
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| AgentError::Storage(e.to_string()))?);
        }
        Ok(out)
    }

    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<(), AgentError> {
        let json = serde_json::to_string(plan).map_err(|e| AgentError::Storage(e.to_string()))?;
        let conn = self.conn.lock().map_err(|e| AgentError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO run_plans (run_id, plan_json) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET plan_json = excluded.plan_json",
            params![run_id, json],
        )
        .map_err(|e| AgentError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>, AgentError> {
        let conn = self.conn.lock().map_err(|e| AgentError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT plan_json FROM run_plans WHERE run_id = ?1")
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let mut rows = stmt
            .query(params![run_id])
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        match rows.next().map_err(|e| AgentError::Storage(e.to_string()))? {
            Some(row) => {
                let json: String = row.get(0).map_err(|e| AgentError::Storage(e.to_string()))?;
                let plan = serde_json::from_str(&json)
                    .map_err(|e| AgentError::Storage(e.to_string()))?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::plan::{Plan, StepSpec};

    fn sample_plan() -> Plan {
        Plan::from_specs(
            vec![
                StepSpec {
                    tool: "a".into(),
                    reason: "first".into(),
                    depends_on: vec![],
                },
                StepSpec {
                    tool: "b".into(),
                    reason: "second".into(),
                    depends_on: vec![0],
                },
                StepSpec {
                    tool: "c".into(),
                    reason: "third".into(),
                    depends_on: vec![1],
                },
            ],
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_ancestor_indices_transitive() {
        let plan = sample_plan();
        let ancestors = ancestor_indices(&plan, 2);
        assert_eq!(ancestors.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(ancestor_indices(&plan, 0).is_empty());
    }

    #[tokio::test]
    async fn test_memory_history_append_and_list() {
        let store = MemoryHistory::new();
        store
            .append("r1", StepResult::success(0, 1, "ok"))
            .await
            .unwrap();
        store
            .append("r1", StepResult::failure(1, 1, "boom"))
            .await
            .unwrap();
        let results = store.list("r1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[1].error.as_deref(), Some("boom"));
        assert!(store.list("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_history_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistory::open(&dir.path().join("history.db")).unwrap();

        let plan = sample_plan();
        store.set_plan("r1", &plan).await.unwrap();
        store
            .append(
                "r1",
                StepResult::failure(0, 1, "timeout").with_advice(Some("retry later".into())),
            )
            .await
            .unwrap();
        store
            .append("r1", StepResult::success(0, 2, "18°C"))
            .await
            .unwrap();

        let loaded = store.get_plan("r1").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 3);

        let results = store.list("r1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].advice.as_deref(), Some("retry later"));
        assert!(results[1].success);
    }
}
