use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::{collections::HashMap, sync::Mutex};

use crate::db::{QueueAcquire, Store};
use crate::models::{
	Authority, AuthoritySpec, Ballot, Election, ElectionStatus, JobKind, QueuedJob, Session,
};

#[derive(Default)]
struct Inner {
	elections: HashMap<i64, Election>,
	authorities: Vec<Authority>,
	sessions: HashMap<String, Session>,
	ballots: Vec<Ballot>,
	queue: Vec<QueuedJob>,
	next_authority_id: i64,
	next_job_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn insert_election(
		&self,
		election: &Election,
		authorities: &[AuthoritySpec],
	) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if inner.elections.contains_key(&election.id) {
			return Err(anyhow!("election {} already exists", election.id));
		}
		inner.elections.insert(election.id, election.clone());
		for spec in authorities {
			inner.next_authority_id += 1;
			let id = inner.next_authority_id;
			inner.authorities.push(Authority {
				id,
				election_id: election.id,
				name: spec.name.clone(),
				ssl_cert: spec.ssl_cert.clone(),
				orchestra_url: spec.orchestra_url.clone(),
			});
		}
		Ok(())
	}

	async fn election(&self, id: i64) -> Result<Option<Election>> {
		Ok(self.inner.lock().unwrap().elections.get(&id).cloned())
	}

	async fn election_exists(&self, id: i64) -> Result<bool> {
		Ok(self.inner.lock().unwrap().elections.contains_key(&id))
	}

	async fn set_election_status(&self, id: i64, status: ElectionStatus) -> Result<()> {
		if let Some(election) = self.inner.lock().unwrap().elections.get_mut(&id) {
			election.status = status;
		}
		Ok(())
	}

	async fn authorities(&self, election_id: i64) -> Result<Vec<Authority>> {
		let inner = self.inner.lock().unwrap();
		Ok(inner
			.authorities
			.iter()
			.filter(|authority| authority.election_id == election_id)
			.cloned()
			.collect())
	}

	async fn insert_sessions(&self, sessions: &[Session]) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		for session in sessions {
			if inner.sessions.contains_key(&session.id) {
				return Err(anyhow!("session {} already exists", session.id));
			}
		}
		for session in sessions {
			inner.sessions.insert(session.id.clone(), session.clone());
		}
		Ok(())
	}

	async fn sessions(&self, election_id: i64) -> Result<Vec<Session>> {
		let inner = self.inner.lock().unwrap();
		let mut sessions: Vec<_> = inner
			.sessions
			.values()
			.filter(|session| session.election_id == election_id)
			.cloned()
			.collect();
		sessions.sort_by_key(|session| session.question_number);
		Ok(sessions)
	}

	async fn set_session_public_key(&self, session_id: &str, public_key: &str) -> Result<()> {
		if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(session_id) {
			session.public_key = Some(public_key.to_string());
		}
		Ok(())
	}

	async fn insert_ballot(&self, ballot: &Ballot) -> Result<bool> {
		let mut inner = self.inner.lock().unwrap();
		let duplicate = inner.ballots.iter().any(|existing| {
			existing.session_id == ballot.session_id && existing.ballot_hash == ballot.ballot_hash
		});
		if duplicate {
			return Ok(false);
		}
		inner.ballots.push(ballot.clone());
		Ok(true)
	}

	async fn queue_push(&self, kind: JobKind, payload: &Value) -> Result<i64> {
		let mut inner = self.inner.lock().unwrap();
		inner.next_job_id += 1;
		let id = inner.next_job_id;
		inner.queue.push(QueuedJob {
			id,
			kind,
			payload: payload.clone(),
			doing: false,
			created_at: Utc::now(),
		});
		Ok(id)
	}

	async fn queue_acquire_next(&self) -> Result<QueueAcquire> {
		let mut inner = self.inner.lock().unwrap();
		if inner.queue.iter().any(|job| job.doing) {
			return Ok(QueueAcquire::Busy);
		}
		let Some(job) = inner.queue.iter_mut().min_by_key(|job| job.id) else {
			return Ok(QueueAcquire::Empty);
		};
		job.doing = true;
		Ok(QueueAcquire::Acquired(job.clone()))
	}

	async fn queue_finish_active(&self) -> Result<()> {
		self.inner.lock().unwrap().queue.retain(|job| !job.doing);
		Ok(())
	}

	async fn queue_reset(&self, resume: bool) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		if resume {
			for job in &mut inner.queue {
				job.doing = false;
			}
		} else {
			inner.queue.clear();
		}
		Ok(())
	}

	async fn queue_jobs(&self) -> Result<Vec<QueuedJob>> {
		let inner = self.inner.lock().unwrap();
		let mut jobs = inner.queue.clone();
		jobs.sort_by_key(|job| job.id);
		Ok(jobs)
	}
}
