use crate::dispatch::EngineType;
use crate::task::error::{TaskError, TaskResult};
use crate::task::state_machine::{Actor, TaskEvent, TaskStateMachine};
use crate::task::types::{AnalysisTask, TaskStatus, TaskTree, TaskUpdate};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

const MAX_CAS_ATTEMPTS: usize = 5;

/// Durable task records, addressed by id.
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Create the store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> TaskResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id TEXT NOT NULL,
                engine_type TEXT,
                status TEXT NOT NULL,
                parent_task_id INTEGER,
                case_ref TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                result_payload TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analysis_tasks_parent ON analysis_tasks(parent_task_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Persist an aggregate task and one child per engine in one transaction.
    ///
    /// Rows are inserted already QUEUED (the PENDING -> QUEUED step is checked
    /// against the transition table first), so no dispatch message can
    /// reference a task that is not yet queued.
    pub async fn create_analysis(
        &self,
        file_id: &str,
        case_ref: Option<&str>,
        engines: &[EngineType],
    ) -> TaskResult<TaskTree> {
        let status = TaskStateMachine::next(
            0,
            TaskStatus::Pending,
            TaskEvent::Queue,
            Actor::Orchestrator,
        )?;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let aggregate_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO analysis_tasks
            (file_id, engine_type, status, parent_task_id, case_ref, progress, created_at, updated_at)
            VALUES (?, NULL, ?, NULL, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(file_id)
        .bind(status.as_str())
        .bind(case_ref)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for engine in engines {
            sqlx::query(
                r#"
                INSERT INTO analysis_tasks
                (file_id, engine_type, status, parent_task_id, case_ref, progress, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(file_id)
            .bind(engine.as_str())
            .bind(status.as_str())
            .bind(aggregate_id)
            .bind(case_ref)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(task_id = aggregate_id, file_id, children = engines.len(), "Analysis tasks persisted");

        self.tree(aggregate_id).await
    }

    pub async fn get(&self, id: i64) -> TaskResult<Option<AnalysisTask>> {
        let row = sqlx::query("SELECT * FROM analysis_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn require(&self, id: i64) -> TaskResult<AnalysisTask> {
        self.get(id).await?.ok_or(TaskError::NotFound(id))
    }

    pub async fn children(&self, parent_id: i64) -> TaskResult<Vec<AnalysisTask>> {
        let rows = sqlx::query("SELECT * FROM analysis_tasks WHERE parent_task_id = ? ORDER BY id ASC")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// The tree `id` belongs to; a child id resolves to its aggregate's tree.
    pub async fn tree(&self, id: i64) -> TaskResult<TaskTree> {
        let task = self.require(id).await?;
        let aggregate = match task.parent_task_id {
            Some(parent_id) => self.require(parent_id).await?,
            None => task,
        };
        if aggregate.parent_task_id.is_some() {
            return Err(TaskError::InvalidTree(format!(
                "task {} is nested more than one level deep",
                id
            )));
        }

        let children = self.children(aggregate.id).await?;
        Ok(TaskTree {
            aggregate,
            children,
        })
    }

    /// Apply a state-machine event.
    ///
    /// The write is a compare-and-set on the status that was read, so two
    /// actors racing on the same task cannot both succeed from one status.
    pub async fn apply(
        &self,
        id: i64,
        event: TaskEvent,
        actor: Actor,
        update: TaskUpdate,
    ) -> TaskResult<AnalysisTask> {
        let payload = update
            .result_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let task = self.require(id).await?;
            let to = TaskStateMachine::next(id, task.status, event, actor)?;

            let now = chrono::Utc::now().timestamp();
            let progress = match to {
                TaskStatus::Completed => Some(100),
                _ => update.progress.map(|p| p.min(100)),
            };
            let started_at = (to == TaskStatus::Running).then_some(now);
            let completed_at = to.is_terminal().then_some(now);

            let result = sqlx::query(
                r#"
                UPDATE analysis_tasks SET
                    status = ?,
                    progress = MAX(progress, COALESCE(?, progress)),
                    result_payload = COALESCE(?, result_payload),
                    error_message = COALESCE(?, error_message),
                    started_at = COALESCE(started_at, ?),
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(progress.map(i64::from))
            .bind(payload.as_deref())
            .bind(update.error_message.as_deref())
            .bind(started_at)
            .bind(completed_at)
            .bind(now)
            .bind(id)
            .bind(task.status.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(task_id = id, from = %task.status, to = %to, ?actor, "Task transitioned");
                return self.require(id).await;
            }
        }

        Err(TaskError::Contended(id))
    }

    /// Raise the stored progress of a non-terminal task. Lower values and
    /// terminal tasks are left untouched; returns whether a row changed.
    pub async fn update_progress(&self, id: i64, progress: u8) -> TaskResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_tasks SET progress = ?, updated_at = ?
            WHERE id = ? AND progress < ?
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(i64::from(progress.min(100)))
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .bind(i64::from(progress.min(100)))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn task_from_row(row: &SqliteRow) -> TaskResult<AnalysisTask> {
    let engine_type = row
        .try_get::<Option<String>, _>("engine_type")?
        .map(|s| s.parse::<EngineType>())
        .transpose()
        .map_err(TaskError::DatabaseError)?;
    let status = row
        .try_get::<String, _>("status")?
        .parse::<TaskStatus>()
        .map_err(TaskError::DatabaseError)?;
    let result_payload = row
        .try_get::<Option<String>, _>("result_payload")?
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(AnalysisTask {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        engine_type,
        status,
        parent_task_id: row.try_get("parent_task_id")?,
        case_ref: row.try_get("case_ref")?,
        progress: row.try_get::<i64, _>("progress")?.clamp(0, 100) as u8,
        result_payload,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn create_store() -> TaskStore {
        TaskStore::new(db::connect_in_memory().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_analysis_tree() {
        let store = create_store().await;

        let tree = store
            .create_analysis(
                "f1",
                Some("case-7"),
                &[EngineType::ImageAi, EngineType::Metadata],
            )
            .await
            .unwrap();

        assert!(tree.aggregate.is_aggregate());
        assert_eq!(tree.aggregate.status, TaskStatus::Queued);
        assert_eq!(tree.children.len(), 2);
        for child in &tree.children {
            assert_eq!(child.parent_task_id, Some(tree.aggregate.id));
            assert_eq!(child.status, TaskStatus::Queued);
            assert_eq!(child.case_ref.as_deref(), Some("case-7"));
        }

        // Looking up by a child id resolves to the same tree
        let by_child = store.tree(tree.children[0].id).await.unwrap();
        assert_eq!(by_child, tree);
    }

    #[tokio::test]
    async fn test_apply_lifecycle() {
        let store = create_store().await;
        let tree = store
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;

        let task = store
            .apply(id, TaskEvent::Start, Actor::Worker, TaskUpdate::default())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        let task = store
            .apply(
                id,
                TaskEvent::Complete,
                Actor::Collector,
                TaskUpdate::with_result(json!({"verdict": "clean"})),
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result_payload, Some(json!({"verdict": "clean"})));
        assert!(task.completed_at.is_some());

        let result = store
            .apply(id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
            .await;
        assert!(matches!(result, Err(TaskError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = create_store().await;
        let tree = store
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;

        assert!(store.update_progress(id, 40).await.unwrap());
        assert!(!store.update_progress(id, 30).await.unwrap());
        assert_eq!(store.require(id).await.unwrap().progress, 40);

        store
            .apply(id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
            .await
            .unwrap();
        assert!(!store.update_progress(id, 90).await.unwrap());
        assert_eq!(store.require(id).await.unwrap().progress, 40);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = create_store().await;
        assert!(store.get(42).await.unwrap().is_none());
        assert!(matches!(store.tree(42).await, Err(TaskError::NotFound(42))));
    }
}
