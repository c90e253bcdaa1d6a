use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use tasknet::{SimpleSpec, TaskEngine};

use crate::constants::LAUNCH_QUEUE;
use crate::db::{QueueAcquire, Store};
use crate::models::{
	check_election_data, check_tally_data, Election, ElectionRequest, ElectionStatus, JobKind,
	QueuedJob, TallyRequest,
};
use crate::settings::Settings;

/// Single-consumer gate over the persistent work queue. Protocol jobs are
/// strictly serialized per node: the mixnet's disk layout and JVM do not
/// tolerate concurrent sessions.
#[derive(Clone)]
pub struct WorkQueue {
	store: Arc<dyn Store>,
	engine: TaskEngine,
	settings: Arc<Settings>,
}

impl WorkQueue {
	pub fn new(store: Arc<dyn Store>, engine: TaskEngine, settings: Arc<Settings>) -> Self {
		Self { store, engine, settings }
	}

	/// Append a job and eagerly try to start it.
	pub async fn submit(&self, kind: JobKind, payload: Value) -> Result<i64> {
		let id = self.store.queue_push(kind, &payload).await?;
		if let Err(error) = self.dequeue().await {
			warn!("dequeue after submit failed: {error:#}");
		}
		Ok(id)
	}

	/// Take the next job if nothing is running. Idempotent: with a job
	/// already `doing`, or with another worker holding the row lock, this
	/// returns without touching anything.
	pub async fn dequeue(&self) -> Result<bool> {
		loop {
			match self.store.queue_acquire_next().await? {
				QueueAcquire::Busy | QueueAcquire::Contended | QueueAcquire::Empty => {
					return Ok(false);
				},
				QueueAcquire::Acquired(job) => match self.start_job(&job).await {
					Ok(()) => {
						info!(job_id = job.id, kind = job.kind.as_str(), "started queued job");
						return Ok(true);
					},
					Err(error) => {
						// A job that cannot even start is dropped; queued
						// work behind it must not be blocked forever.
						error!(job_id = job.id, "queued job rejected: {error:#}");
						self.store.queue_finish_active().await?;
					},
				},
			}
		}
	}

	/// Release the active slot once a protocol run ends (successfully or
	/// not) and pull in the next job.
	pub async fn end_task(&self) -> Result<()> {
		self.store.queue_finish_active().await?;
		self.dequeue().await?;
		Ok(())
	}

	/// Startup entry point. A fresh start abandons all queued rows; a
	/// resume clears stale `doing` flags so interrupted jobs run again.
	pub async fn start(&self, resume: bool) -> Result<()> {
		self.store.queue_reset(resume).await?;
		self.dequeue().await?;
		Ok(())
	}

	async fn start_job(&self, job: &QueuedJob) -> Result<()> {
		match job.kind {
			JobKind::Election => self.election_job(&job.payload).await,
			JobKind::Tally => self.tally_job(&job.payload).await,
		}
	}

	/// Re-validate the queued submission, create the election with its
	/// authorities, and hand the protocol to the director state machine.
	async fn election_job(&self, payload: &Value) -> Result<()> {
		let request: ElectionRequest =
			serde_json::from_value(payload.clone()).context("invalid json")?;
		check_election_data(&request, self.settings.max_num_questions_per_election)
			.map_err(|reason| anyhow::anyhow!(reason))?;

		let self_matches = request
			.authorities
			.iter()
			.filter(|authority| authority.orchestra_url == self.settings.root_url)
			.count();
		if self_matches != 1 {
			bail!("exactly one authority must use this node's root url");
		}
		if self.store.election_exists(request.id).await? {
			bail!("an election with id {} already exists", request.id);
		}

		let mut title = request.title.clone();
		title.truncate(255);
		let election = Election {
			id: request.id,
			title,
			description: request.description.clone(),
			questions: request.questions.clone(),
			start_date: request.start_date,
			end_date: request.end_date,
			callback_url: request.callback_url.clone(),
			num_parties: request.authorities.len() as u32,
			threshold_parties: request.authorities.len() as u32,
			status: ElectionStatus::Creating,
		};
		self.store.insert_election(&election, &request.authorities).await?;

		self.engine
			.launch(
				SimpleSpec::local(
					"create_election",
					LAUNCH_QUEUE,
					json!({ "election_id": request.id }),
				)
				.into(),
			)
			.await?;
		Ok(())
	}

	async fn tally_job(&self, payload: &Value) -> Result<()> {
		let request: TallyRequest =
			serde_json::from_value(payload.clone()).context("invalid json")?;
		check_tally_data(&request).map_err(|reason| anyhow::anyhow!(reason))?;
		if self.store.election(request.election_id).await?.is_none() {
			bail!("unknown election with election_id = {}", request.election_id);
		}

		self.engine
			.launch(
				SimpleSpec::local(
					"tally_election",
					LAUNCH_QUEUE,
					json!({
						"election_id": request.election_id,
						"callback_url": request.callback_url,
						"votes_url": request.votes_url,
						"votes_hash": request.votes_hash,
					}),
				)
				.into(),
			)
			.await?;
		Ok(())
	}
}
