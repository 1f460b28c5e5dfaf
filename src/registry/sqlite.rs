//! SQLite 持久化存储
//!
//! 执行与交互为关系行，进度事件为追加写表（按 interaction_id, timestamp 建索引）。
//! 时间统一存为 UTC 微秒整数，保证事件顺序可比较。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::store::{ExecutionStore, StateChange};
use super::types::{EventSource, Execution, Interaction, NewStatusEvent, StatusEvent};
use crate::core::{ExecutionState, OrchestratorError, Result, SessionKey};

const ACTIVE_STATES_SQL: &str = "('pending', 'planning', 'planned', 'executing', 'synthesizing')";

/// SQLite 存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        Self::connect(&db_url).await
    }

    /// 连接任意 SQLite URL（如 `sqlite::memory:`）
    pub async fn connect(db_url: &str) -> Result<Self> {
        // SQLite 单写者：序号分配与比较后设置依赖串行化
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                state TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error TEXT,
                max_steps INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                tool_override TEXT,
                parent_execution_id TEXT,
                batch_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                execution_id TEXT,
                is_streaming INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS status_events (
                interaction_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                duration_ms INTEGER,
                significant INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (interaction_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_executions_session_state ON executions(session_id, user_id, state)",
            "CREATE INDEX IF NOT EXISTS idx_executions_parent ON executions(parent_execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_interactions_session ON interactions(session_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_interactions_execution ON interactions(execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_status_events_time ON status_events(interaction_id, timestamp)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn interaction_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM interactions WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(v).unwrap_or_default()
}

fn parse_err(e: String) -> OrchestratorError {
    OrchestratorError::Storage(e)
}

fn row_to_execution(row: &SqliteRow) -> Result<Execution> {
    let metadata: String = row.get("metadata");
    let tool_override: Option<String> = row.get("tool_override");
    Ok(Execution {
        id: row.get("id"),
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        strategy: row.get::<String, _>("strategy").parse().map_err(parse_err)?,
        state: row.get::<String, _>("state").parse().map_err(parse_err)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        max_steps: row.get::<i64, _>("max_steps") as u32,
        created_at: from_micros(row.get("created_at")),
        updated_at: from_micros(row.get("updated_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_micros),
        metadata: serde_json::from_str(&metadata)?,
        tool_override: tool_override.map(|s| serde_json::from_str(&s)).transpose()?,
        parent_execution_id: row.get("parent_execution_id"),
        batch_id: row.get("batch_id"),
    })
}

fn row_to_interaction(row: &SqliteRow) -> Interaction {
    Interaction {
        id: row.get("id"),
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        question: row.get("question"),
        answer: row.get("answer"),
        execution_id: row.get("execution_id"),
        is_streaming: row.get::<i64, _>("is_streaming") != 0,
        created_at: from_micros(row.get("created_at")),
        updated_at: from_micros(row.get("updated_at")),
    }
}

fn row_to_event(row: &SqliteRow) -> Result<StatusEvent> {
    Ok(StatusEvent {
        seq: row.get::<i64, _>("seq") as u64,
        interaction_id: row.get("interaction_id"),
        source: row.get::<String, _>("source").parse::<EventSource>().map_err(parse_err)?,
        message: row.get("message"),
        timestamp: from_micros(row.get("timestamp")),
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
        significant: row.get::<i64, _>("significant") != 0,
    })
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert_execution(&self, exec: &Execution) -> Result<()> {
        let metadata = serde_json::to_string(&exec.metadata)?;
        let tool_override = exec.tool_override.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO executions
             (id, session_id, user_id, strategy, state, input, output, error, max_steps,
              created_at, updated_at, completed_at, metadata, tool_override, parent_execution_id, batch_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&exec.id)
        .bind(&exec.session_id)
        .bind(&exec.user_id)
        .bind(exec.strategy.as_str())
        .bind(exec.state.as_str())
        .bind(&exec.input)
        .bind(&exec.output)
        .bind(&exec.error)
        .bind(exec.max_steps as i64)
        .bind(micros(exec.created_at))
        .bind(micros(exec.updated_at))
        .bind(exec.completed_at.map(micros))
        .bind(&metadata)
        .bind(&tool_override)
        .bind(&exec.parent_execution_id)
        .bind(&exec.batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn compare_and_set_state(
        &self,
        id: &str,
        expected: ExecutionState,
        change: &StateChange,
    ) -> Result<Option<Execution>> {
        let now = micros(Utc::now());
        let completed_at = change.to.is_terminal().then_some(now);

        let result = sqlx::query(
            "UPDATE executions
             SET state = ?, updated_at = ?,
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND state = ?",
        )
        .bind(change.to.as_str())
        .bind(now)
        .bind(&change.output)
        .bind(&change.error)
        .bind(completed_at)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_execution(id).await
    }

    async fn touch_execution(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE executions SET updated_at = ? WHERE id = ?")
            .bind(micros(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    async fn set_batch(&self, id: &str, batch_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE executions SET batch_id = ?, updated_at = ? WHERE id = ?")
            .bind(batch_id)
            .bind(micros(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    async fn merge_metadata(&self, id: &str, patch: serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT metadata FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {}", id)))?;
        let mut metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&row.get::<String, _>("metadata"))?;
        metadata.extend(patch);

        sqlx::query("UPDATE executions SET metadata = ? WHERE id = ?")
            .bind(serde_json::to_string(&metadata)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_active(&self, key: &SessionKey) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT * FROM executions WHERE session_id = ? AND user_id = ? AND state IN {} ORDER BY created_at ASC",
            ACTIVE_STATES_SQL
        );
        let rows = sqlx::query(&sql)
            .bind(&key.session_id)
            .bind(&key.user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn has_active_descendant(&self, id: &str) -> Result<bool> {
        let sql = format!(
            "WITH RECURSIVE descendants(id) AS (
                SELECT id FROM executions WHERE parent_execution_id = ?
                UNION
                SELECT e.id FROM executions e JOIN descendants d ON e.parent_execution_id = d.id
             )
             SELECT COUNT(*) AS n FROM executions
             WHERE id IN (SELECT id FROM descendants) AND state IN {}",
            ACTIVE_STATES_SQL
        );
        let row = sqlx::query(&sql).bind(id).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO interactions
             (id, session_id, user_id, question, answer, execution_id, is_streaming, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&interaction.id)
        .bind(&interaction.session_id)
        .bind(&interaction.user_id)
        .bind(&interaction.question)
        .bind(&interaction.answer)
        .bind(&interaction.execution_id)
        .bind(interaction.is_streaming as i64)
        .bind(micros(interaction.created_at))
        .bind(micros(interaction.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_interaction))
    }

    async fn link_interaction(&self, id: &str, execution_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE interactions SET execution_id = ?, updated_at = ? WHERE id = ?")
            .bind(execution_id)
            .bind(micros(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("interaction {}", id)));
        }
        Ok(())
    }

    async fn set_answer(&self, id: &str, answer: &str, only_if_empty: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE interactions SET answer = ?, updated_at = ?
             WHERE id = ? AND (? = 0 OR answer IS NULL)",
        )
        .bind(answer)
        .bind(micros(Utc::now()))
        .bind(id)
        .bind(only_if_empty as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.interaction_exists(id).await? {
            return Err(OrchestratorError::NotFound(format!("interaction {}", id)));
        }
        Ok(false)
    }

    async fn set_streaming(&self, id: &str, streaming: bool) -> Result<()> {
        let result = sqlx::query("UPDATE interactions SET is_streaming = ?, updated_at = ? WHERE id = ?")
            .bind(streaming as i64)
            .bind(micros(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("interaction {}", id)));
        }
        Ok(())
    }

    async fn interaction_for_execution(&self, execution_id: &str) -> Result<Option<Interaction>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE execution_id = ? ORDER BY updated_at DESC LIMIT 1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_interaction))
    }

    async fn interactions_by_question(&self, session_id: &str, question: &str) -> Result<Vec<Interaction>> {
        let rows = sqlx::query(
            "SELECT * FROM interactions WHERE session_id = ? AND question = ? ORDER BY created_at ASC",
        )
        .bind(session_id)
        .bind(question)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_interaction).collect())
    }

    async fn list_interactions(&self, session_id: &str) -> Result<Vec<Interaction>> {
        let rows = sqlx::query("SELECT * FROM interactions WHERE session_id = ? ORDER BY created_at ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_interaction).collect())
    }

    async fn append_event(&self, event: NewStatusEvent) -> Result<StatusEvent> {
        let mut tx = self.pool.begin().await?;

        let last = sqlx::query(
            "SELECT seq, timestamp FROM status_events WHERE interaction_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(&event.interaction_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (last_seq, last_ts) = match last {
            Some(row) => (row.get::<i64, _>("seq") as u64, Some(from_micros(row.get("timestamp")))),
            None => (0, None),
        };

        let stored = event.into_event(last_seq + 1, last_ts);

        sqlx::query(
            "INSERT INTO status_events
             (interaction_id, seq, source, message, timestamp, duration_ms, significant)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stored.interaction_id)
        .bind(stored.seq as i64)
        .bind(stored.source.as_str())
        .bind(&stored.message)
        .bind(micros(stored.timestamp))
        .bind(stored.duration_ms.map(|v| v as i64))
        .bind(stored.significant as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn list_events(&self, interaction_id: &str) -> Result<Vec<StatusEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM status_events WHERE interaction_id = ? ORDER BY seq ASC",
        )
        .bind(interaction_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Strategy;
    use crate::registry::types::NewExecution;

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("hive.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_execution_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");

        let exec = NewExecution {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            strategy: Strategy::Holistic,
            input: "Explain X".to_string(),
            max_steps: 50,
            tool_override: None,
            parent_execution_id: None,
        }
        .into_execution();

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.insert_execution(&exec).await.unwrap();
            store
                .compare_and_set_state(&exec.id, ExecutionState::Pending, &StateChange::to(ExecutionState::Planning))
                .await
                .unwrap()
                .unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let loaded = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Planning);
        assert_eq!(loaded.strategy, Strategy::Holistic);
        assert_eq!(store.list_active(&SessionKey::new("s1", "u1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_ordered() {
        let (store, _dir) = temp_store().await;
        let ts = Utc::now();
        for msg in ["dispatched", "planning", "done"] {
            store
                .append_event(NewStatusEvent {
                    interaction_id: "int_1".to_string(),
                    source: EventSource::Orchestrator,
                    message: msg.to_string(),
                    timestamp: ts,
                    duration_ms: None,
                    significant: msg == "done",
                })
                .await
                .unwrap();
        }
        let events = store.list_events("int_1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].message, "done");
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_answer_guard() {
        let (store, _dir) = temp_store().await;
        let interaction = Interaction::new("s1", "u1", "q");
        store.insert_interaction(&interaction).await.unwrap();

        assert!(store.set_answer(&interaction.id, "Cancelled by user.", true).await.unwrap());
        assert!(!store.set_answer(&interaction.id, "late", true).await.unwrap());
        assert!(store.set_answer("missing", "x", false).await.is_err());
    }
}
