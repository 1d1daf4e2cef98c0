//! Split user tasks: a task row plus ordered subtask rows carrying step
//! results. Written by the `task_plan` tool and surfaced over `tasks.*` RPC.

use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub step: u32,
    pub title: String,
    pub status: TaskStatus,
    pub result: Option<String>,
}

pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Create a task with its ordered steps.
    pub fn create(&self, description: &str, steps: &[String]) -> Result<Task> {
        let now = chrono::Utc::now().to_rfc3339();
        let id = Uuid::now_v7().to_string();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO user_tasks (id, description, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            rusqlite::params![id, description, now],
        )?;
        let mut subtasks = Vec::with_capacity(steps.len());
        for (i, title) in steps.iter().enumerate() {
            let sub_id = Uuid::now_v7().to_string();
            tx.execute(
                "INSERT INTO user_subtasks (id, task_id, step, title, status)
                 VALUES (?1, ?2, ?3, ?4, 'pending')",
                rusqlite::params![sub_id, id, i as i64, title],
            )?;
            subtasks.push(Subtask {
                id: sub_id,
                step: i as u32,
                title: title.clone(),
                status: TaskStatus::Pending,
                result: None,
            });
        }
        tx.commit()?;
        Ok(Task {
            id,
            description: description.to_string(),
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
            subtasks,
        })
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let completed_at = status
            .is_terminal()
            .then(|| chrono::Utc::now().to_rfc3339());
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE user_tasks SET status = ?2, completed_at = COALESCE(?3, completed_at)
             WHERE id = ?1",
            rusqlite::params![id, status.as_str(), completed_at],
        )?;
        if n == 0 {
            return Err(SessionError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a subtask outcome.
    pub fn complete_subtask(&self, subtask_id: &str, status: TaskStatus, result: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE user_subtasks SET status = ?2, result = ?3 WHERE id = ?1",
            rusqlite::params![subtask_id, status.as_str(), result],
        )?;
        if n == 0 {
            return Err(SessionError::TaskNotFound {
                id: subtask_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        let db = self.db.lock().unwrap();
        let mut task = db
            .query_row(
                "SELECT id, description, status, created_at, completed_at
                 FROM user_tasks WHERE id = ?1",
                [id],
                |row| {
                    Ok(Task {
                        id: row.get(0)?,
                        description: row.get(1)?,
                        status: TaskStatus::parse(&row.get::<_, String>(2)?),
                        created_at: row.get(3)?,
                        completed_at: row.get(4)?,
                        subtasks: Vec::new(),
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SessionError::TaskNotFound {
                    id: id.to_string(),
                },
                other => SessionError::Database(other),
            })?;

        let mut stmt = db.prepare(
            "SELECT id, step, title, status, result
             FROM user_subtasks WHERE task_id = ?1 ORDER BY step",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(Subtask {
                id: row.get(0)?,
                step: row.get::<_, i64>(1)? as u32,
                title: row.get(2)?,
                status: TaskStatus::parse(&row.get::<_, String>(3)?),
                result: row.get(4)?,
            })
        })?;
        task.subtasks = rows.filter_map(|r| r.ok()).collect();
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle() {
        let store = TaskStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let task = store
            .create("ship feature", &["write code".into(), "write tests".into()])
            .unwrap();
        assert_eq!(task.subtasks.len(), 2);

        store.set_status(&task.id, TaskStatus::Running).unwrap();
        store
            .complete_subtask(&task.subtasks[0].id, TaskStatus::Done, "done in 3 files")
            .unwrap();
        store.set_status(&task.id, TaskStatus::Done).unwrap();

        let read = store.get(&task.id).unwrap();
        assert_eq!(read.status, TaskStatus::Done);
        assert!(read.completed_at.is_some());
        assert_eq!(read.subtasks[0].result.as_deref(), Some("done in 3 files"));
        assert_eq!(read.subtasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn unknown_task_errors() {
        let store = TaskStore::new(Connection::open_in_memory().unwrap()).unwrap();
        assert!(matches!(
            store.get("missing").unwrap_err(),
            SessionError::TaskNotFound { .. }
        ));
    }
}
