use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use crate::task::{TaskId, TaskKind, TaskRecord, TaskStatus};
use crate::store::TaskStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasknet_tasks (
	id UUID PRIMARY KEY,
	kind TEXT NOT NULL,
	status TEXT NOT NULL,
	action TEXT NOT NULL,
	queue TEXT NOT NULL,
	input JSONB NOT NULL,
	output JSONB NOT NULL,
	sender_url TEXT NOT NULL,
	sender_cert TEXT NOT NULL,
	receiver_url TEXT NOT NULL,
	receiver_cert TEXT NOT NULL,
	parent_id UUID,
	order_index INTEGER NOT NULL,
	label TEXT NOT NULL,
	created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS tasknet_tasks_parent
	ON tasknet_tasks (parent_id, order_index);
"#;

pub struct PgTaskStore {
	pool: sqlx::PgPool,
}

impl PgTaskStore {
	pub fn new(pool: sqlx::PgPool) -> Self {
		Self { pool }
	}

	/// Create the task table if it is missing.
	pub async fn bootstrap(&self) -> Result<()> {
		for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
			sqlx::query(statement)
				.execute(&self.pool)
				.await
				.context("failed to bootstrap tasknet schema")?;
		}
		Ok(())
	}
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TaskRecord> {
	let kind: String = row.get("kind");
	let status: String = row.get("status");
	Ok(TaskRecord {
		id: row.get("id"),
		kind: TaskKind::parse(&kind)
			.with_context(|| format!("unknown task kind {kind}"))?,
		status: TaskStatus::parse(&status)
			.with_context(|| format!("unknown task status {status}"))?,
		action: row.get("action"),
		queue: row.get("queue"),
		input: row.get("input"),
		output: row.get("output"),
		sender_url: row.get("sender_url"),
		sender_cert: row.get("sender_cert"),
		receiver_url: row.get("receiver_url"),
		receiver_cert: row.get("receiver_cert"),
		parent_id: row.get("parent_id"),
		order_index: row.get("order_index"),
		label: row.get("label"),
		created_at: row.get("created_at"),
	})
}

#[async_trait]
impl TaskStore for PgTaskStore {
	async fn insert(&self, task: &TaskRecord) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO tasknet_tasks (
				id, kind, status, action, queue, input, output,
				sender_url, sender_cert, receiver_url, receiver_cert,
				parent_id, order_index, label, created_at
			) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
			"#,
		)
		.bind(task.id)
		.bind(task.kind.as_str())
		.bind(task.status.as_str())
		.bind(&task.action)
		.bind(&task.queue)
		.bind(&task.input)
		.bind(&task.output)
		.bind(&task.sender_url)
		.bind(&task.sender_cert)
		.bind(&task.receiver_url)
		.bind(&task.receiver_cert)
		.bind(task.parent_id)
		.bind(task.order_index)
		.bind(&task.label)
		.bind(task.created_at)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
		let row = sqlx::query("SELECT * FROM tasknet_tasks WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;
		row.as_ref().map(row_to_record).transpose()
	}

	async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
		sqlx::query("UPDATE tasknet_tasks SET status = $2 WHERE id = $1")
			.bind(id)
			.bind(status.as_str())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn set_output(&self, id: TaskId, output: &Value) -> Result<()> {
		sqlx::query("UPDATE tasknet_tasks SET output = $2 WHERE id = $1")
			.bind(id)
			.bind(output)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>> {
		let rows = sqlx::query(
			"SELECT * FROM tasknet_tasks WHERE parent_id = $1 ORDER BY order_index",
		)
		.bind(parent_id)
		.fetch_all(&self.pool)
		.await?;
		rows.iter().map(row_to_record).collect()
	}

	async fn prev_sibling(&self, task: &TaskRecord) -> Result<Option<TaskRecord>> {
		let Some(parent_id) = task.parent_id else {
			return Ok(None);
		};
		let row = sqlx::query(
			"SELECT * FROM tasknet_tasks WHERE parent_id = $1 AND order_index = $2",
		)
		.bind(parent_id)
		.bind(task.order_index - 1)
		.fetch_optional(&self.pool)
		.await?;
		row.as_ref().map(row_to_record).transpose()
	}

	async fn awaiting_decision(&self) -> Result<Vec<TaskRecord>> {
		let rows = sqlx::query(
			r#"
			SELECT * FROM tasknet_tasks
			WHERE kind = 'external' AND status = 'waiting'
			ORDER BY created_at
			"#,
		)
		.fetch_all(&self.pool)
		.await?;
		rows.iter().map(row_to_record).collect()
	}

	async fn recover_executing(&self) -> Result<Vec<TaskRecord>> {
		let rows = sqlx::query(
			r#"
			UPDATE tasknet_tasks SET status = 'waiting'
			WHERE status = 'executing'
			RETURNING *
			"#,
		)
		.fetch_all(&self.pool)
		.await?;
		let mut recovered = rows
			.iter()
			.map(row_to_record)
			.collect::<Result<Vec<_>>>()?;
		recovered.sort_by_key(|task| task.created_at);
		Ok(recovered)
	}
}
