use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use crate::db::{QueueAcquire, Store};
use crate::models::{
	Authority, AuthoritySpec, Ballot, Election, ElectionStatus, JobKind, QueuedJob, Session,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS elections (
	id BIGINT PRIMARY KEY,
	title TEXT NOT NULL,
	description TEXT NOT NULL,
	questions JSONB NOT NULL,
	start_date TIMESTAMPTZ,
	end_date TIMESTAMPTZ,
	callback_url TEXT NOT NULL,
	num_parties INTEGER NOT NULL,
	threshold_parties INTEGER NOT NULL,
	status TEXT NOT NULL,
	created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS authorities (
	id BIGSERIAL PRIMARY KEY,
	election_id BIGINT NOT NULL REFERENCES elections (id) ON DELETE CASCADE,
	name TEXT NOT NULL,
	ssl_cert TEXT NOT NULL,
	orchestra_url TEXT NOT NULL,
	UNIQUE (election_id, name)
);
CREATE TABLE IF NOT EXISTS sessions (
	id TEXT PRIMARY KEY,
	election_id BIGINT NOT NULL REFERENCES elections (id) ON DELETE CASCADE,
	question_number INTEGER NOT NULL,
	status TEXT NOT NULL,
	public_key TEXT,
	UNIQUE (election_id, question_number)
);
CREATE TABLE IF NOT EXISTS ballots (
	session_id TEXT NOT NULL REFERENCES sessions (id) ON DELETE CASCADE,
	ballot_hash TEXT NOT NULL,
	PRIMARY KEY (session_id, ballot_hash)
);
CREATE TABLE IF NOT EXISTS query_queue (
	id BIGSERIAL PRIMARY KEY,
	kind TEXT NOT NULL,
	payload JSONB NOT NULL,
	doing BOOLEAN NOT NULL DEFAULT FALSE,
	created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

// Postgres "lock_not_available", raised by FOR UPDATE NOWAIT.
const LOCK_NOT_AVAILABLE: &str = "55P03";

pub struct PgStore {
	pool: sqlx::PgPool,
}

impl PgStore {
	pub fn new(pool: sqlx::PgPool) -> Self {
		Self { pool }
	}

	pub async fn bootstrap(&self) -> Result<()> {
		for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
			sqlx::query(statement)
				.execute(&self.pool)
				.await
				.context("failed to bootstrap engine schema")?;
		}
		Ok(())
	}
}

fn row_to_election(row: &sqlx::postgres::PgRow) -> Result<Election> {
	let status: String = row.get("status");
	let questions: Value = row.get("questions");
	Ok(Election {
		id: row.get("id"),
		title: row.get("title"),
		description: row.get("description"),
		questions: questions
			.as_array()
			.cloned()
			.context("questions column is not a JSON array")?,
		start_date: row.get("start_date"),
		end_date: row.get("end_date"),
		callback_url: row.get("callback_url"),
		num_parties: row.get::<i32, _>("num_parties") as u32,
		threshold_parties: row.get::<i32, _>("threshold_parties") as u32,
		status: ElectionStatus::parse(&status)
			.with_context(|| format!("unknown election status {status}"))?,
	})
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<QueuedJob> {
	let kind: String = row.get("kind");
	Ok(QueuedJob {
		id: row.get("id"),
		kind: JobKind::parse(&kind).with_context(|| format!("unknown job kind {kind}"))?,
		payload: row.get("payload"),
		doing: row.get("doing"),
		created_at: row.get("created_at"),
	})
}

#[async_trait]
impl Store for PgStore {
	async fn insert_election(
		&self,
		election: &Election,
		authorities: &[AuthoritySpec],
	) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		sqlx::query(
			r#"
			INSERT INTO elections (
				id, title, description, questions, start_date, end_date,
				callback_url, num_parties, threshold_parties, status
			) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
			"#,
		)
		.bind(election.id)
		.bind(&election.title)
		.bind(&election.description)
		.bind(Value::Array(election.questions.clone()))
		.bind(election.start_date)
		.bind(election.end_date)
		.bind(&election.callback_url)
		.bind(election.num_parties as i32)
		.bind(election.threshold_parties as i32)
		.bind(election.status.as_str())
		.execute(&mut *tx)
		.await?;

		for authority in authorities {
			sqlx::query(
				r#"
				INSERT INTO authorities (election_id, name, ssl_cert, orchestra_url)
				VALUES ($1, $2, $3, $4)
				"#,
			)
			.bind(election.id)
			.bind(&authority.name)
			.bind(&authority.ssl_cert)
			.bind(&authority.orchestra_url)
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;
		Ok(())
	}

	async fn election(&self, id: i64) -> Result<Option<Election>> {
		let row = sqlx::query("SELECT * FROM elections WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;
		row.as_ref().map(row_to_election).transpose()
	}

	async fn election_exists(&self, id: i64) -> Result<bool> {
		let row = sqlx::query("SELECT 1 AS one FROM elections WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.is_some())
	}

	async fn set_election_status(&self, id: i64, status: ElectionStatus) -> Result<()> {
		sqlx::query("UPDATE elections SET status = $2 WHERE id = $1")
			.bind(id)
			.bind(status.as_str())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn authorities(&self, election_id: i64) -> Result<Vec<Authority>> {
		let rows = sqlx::query("SELECT * FROM authorities WHERE election_id = $1 ORDER BY id")
			.bind(election_id)
			.fetch_all(&self.pool)
			.await?;
		Ok(rows
			.iter()
			.map(|row| Authority {
				id: row.get("id"),
				election_id: row.get("election_id"),
				name: row.get("name"),
				ssl_cert: row.get("ssl_cert"),
				orchestra_url: row.get("orchestra_url"),
			})
			.collect())
	}

	async fn insert_sessions(&self, sessions: &[Session]) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		for session in sessions {
			sqlx::query(
				r#"
				INSERT INTO sessions (id, election_id, question_number, status, public_key)
				VALUES ($1, $2, $3, $4, $5)
				"#,
			)
			.bind(&session.id)
			.bind(session.election_id)
			.bind(session.question_number)
			.bind(&session.status)
			.bind(&session.public_key)
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;
		Ok(())
	}

	async fn sessions(&self, election_id: i64) -> Result<Vec<Session>> {
		let rows = sqlx::query(
			"SELECT * FROM sessions WHERE election_id = $1 ORDER BY question_number",
		)
		.bind(election_id)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows
			.iter()
			.map(|row| Session {
				id: row.get("id"),
				election_id: row.get("election_id"),
				question_number: row.get("question_number"),
				status: row.get("status"),
				public_key: row.get("public_key"),
			})
			.collect())
	}

	async fn set_session_public_key(&self, session_id: &str, public_key: &str) -> Result<()> {
		sqlx::query("UPDATE sessions SET public_key = $2 WHERE id = $1")
			.bind(session_id)
			.bind(public_key)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn insert_ballot(&self, ballot: &Ballot) -> Result<bool> {
		let result = sqlx::query(
			r#"
			INSERT INTO ballots (session_id, ballot_hash) VALUES ($1, $2)
			ON CONFLICT DO NOTHING
			"#,
		)
		.bind(&ballot.session_id)
		.bind(&ballot.ballot_hash)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	async fn queue_push(&self, kind: JobKind, payload: &Value) -> Result<i64> {
		let row = sqlx::query(
			"INSERT INTO query_queue (kind, payload) VALUES ($1, $2) RETURNING id",
		)
		.bind(kind.as_str())
		.bind(payload)
		.fetch_one(&self.pool)
		.await?;
		Ok(row.get("id"))
	}

	async fn queue_acquire_next(&self) -> Result<QueueAcquire> {
		let mut tx = self.pool.begin().await?;

		let busy = sqlx::query("SELECT 1 AS one FROM query_queue WHERE doing LIMIT 1")
			.fetch_optional(&mut *tx)
			.await?;
		if busy.is_some() {
			return Ok(QueueAcquire::Busy);
		}

		let locked = sqlx::query(
			r#"
			SELECT * FROM query_queue WHERE NOT doing
			ORDER BY id LIMIT 1
			FOR UPDATE NOWAIT
			"#,
		)
		.fetch_optional(&mut *tx)
		.await;

		let row = match locked {
			Ok(Some(row)) => row,
			Ok(None) => return Ok(QueueAcquire::Empty),
			Err(error) => {
				if let sqlx::Error::Database(db_error) = &error {
					if db_error.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
						// Another worker is dequeuing; do nothing.
						return Ok(QueueAcquire::Contended);
					}
				}
				return Err(error.into());
			},
		};

		let mut job = row_to_job(&row)?;
		sqlx::query("UPDATE query_queue SET doing = TRUE WHERE id = $1")
			.bind(job.id)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		job.doing = true;
		Ok(QueueAcquire::Acquired(job))
	}

	async fn queue_finish_active(&self) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("SELECT id FROM query_queue WHERE doing FOR UPDATE")
			.fetch_all(&mut *tx)
			.await?;
		sqlx::query("DELETE FROM query_queue WHERE doing")
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(())
	}

	async fn queue_reset(&self, resume: bool) -> Result<()> {
		if resume {
			sqlx::query("UPDATE query_queue SET doing = FALSE WHERE doing")
				.execute(&self.pool)
				.await?;
		} else {
			sqlx::query("DELETE FROM query_queue").execute(&self.pool).await?;
		}
		Ok(())
	}

	async fn queue_jobs(&self) -> Result<Vec<QueuedJob>> {
		let rows = sqlx::query("SELECT * FROM query_queue ORDER BY id")
			.fetch_all(&self.pool)
			.await?;
		rows.iter().map(row_to_job).collect()
	}
}
