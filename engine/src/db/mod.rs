pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{
	Authority, AuthoritySpec, Ballot, Election, ElectionStatus, JobKind, QueuedJob, Session,
};

/// Outcome of trying to take the next job off the work queue.
#[derive(Debug, Clone)]
pub enum QueueAcquire {
	/// A job is already marked `doing`; nothing to do.
	Busy,
	/// The queue is empty.
	Empty,
	/// Another worker holds the row lock; treat as "not our turn".
	Contended,
	/// The returned job is now marked `doing`.
	Acquired(QueuedJob),
}

/// Relational storage seam. Production runs on Postgres; tests use the
/// in-memory implementation, which preserves the same observable queue
/// semantics.
#[async_trait]
pub trait Store: Send + Sync {
	// ── Elections ──

	async fn insert_election(
		&self,
		election: &Election,
		authorities: &[AuthoritySpec],
	) -> Result<()>;
	async fn election(&self, id: i64) -> Result<Option<Election>>;
	async fn election_exists(&self, id: i64) -> Result<bool>;
	async fn set_election_status(&self, id: i64, status: ElectionStatus) -> Result<()>;
	async fn authorities(&self, election_id: i64) -> Result<Vec<Authority>>;

	// ── Sessions ──

	/// Insert all sessions of an election in one transaction.
	async fn insert_sessions(&self, sessions: &[Session]) -> Result<()>;
	/// Sessions of an election, ordered by question number.
	async fn sessions(&self, election_id: i64) -> Result<Vec<Session>>;
	async fn set_session_public_key(&self, session_id: &str, public_key: &str) -> Result<()>;

	// ── Ballots ──

	/// Record a ballot digest; returns false when (session, hash) is
	/// already present.
	async fn insert_ballot(&self, ballot: &Ballot) -> Result<bool>;

	// ── Work queue ──

	async fn queue_push(&self, kind: JobKind, payload: &Value) -> Result<i64>;
	async fn queue_acquire_next(&self) -> Result<QueueAcquire>;
	/// Delete the currently `doing` row, if any.
	async fn queue_finish_active(&self) -> Result<()>;
	/// Fresh start drops all queued rows; resume clears `doing` flags so
	/// interrupted jobs are re-examined.
	async fn queue_reset(&self, resume: bool) -> Result<()>;
	async fn queue_jobs(&self) -> Result<Vec<QueuedJob>>;
}
