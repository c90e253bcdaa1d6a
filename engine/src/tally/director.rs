use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use tasknet::{
	ActionHandler, ParallelSpec, SequentialSpec, SimpleSpec, SynchronizedSpec, TaskContext,
	TaskError,
};

use crate::app::App;
use crate::callback::{tally_error, tally_finished};
use crate::constants::{DIRECTOR_QUEUE, MIXNET_QUEUE, PERFORMER_QUEUE};
use crate::db::Store;
use crate::hashing::ni_sha256;
use crate::models::ElectionStatus;
use crate::utils::{input_i64, input_str};

/// Root of the tally protocol. Fans the review out to every authority,
/// then mixes session after session behind synchronized barriers, then
/// lets every authority verify and publish, and finally reports back.
pub struct TallyElection {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for TallyElection {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let input = ctx.input().clone();
		let election_id = input_i64(&input, "election_id")?;
		let callback_url = input_str(&input, "callback_url")?;
		let votes_url = input_str(&input, "votes_url")?;
		let votes_hash = input_str(&input, "votes_hash")?;

		if self.app.store.election(election_id).await.map_err(TaskError::storage)?.is_none() {
			return Err(TaskError::invariant("election not found"));
		}
		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;
		let sessions = self.app.store.sessions(election_id).await.map_err(TaskError::storage)?;
		if sessions.is_empty() {
			return Err(TaskError::invariant("election has no sessions"));
		}
		info!(election_id, sessions = sessions.len(), "starting tally");
		self.app
			.store
			.set_election_status(election_id, ElectionStatus::Tallying)
			.await
			.map_err(TaskError::storage)?;

		// 1. every authority downloads and reviews the requested tally.
		let mut review = ParallelSpec::new();
		for authority in &authorities {
			review.add(SimpleSpec::remote(
				&authority.orchestra_url,
				&authority.ssl_cert,
				"review_tally",
				PERFORMER_QUEUE,
				json!({
					"election_id": election_id,
					"callback_url": callback_url,
					"votes_url": votes_url,
					"votes_hash": votes_hash,
				}),
			));
		}
		ctx.add(review);

		// 2. mix one session at a time; within a session all authorities
		// must succeed before the next session starts.
		let mut mixing = SequentialSpec::new();
		for session in &sessions {
			let mut barrier = SynchronizedSpec::new();
			for authority in &authorities {
				barrier.add(SimpleSpec::remote(
					&authority.orchestra_url,
					&authority.ssl_cert,
					"perform_tally",
					MIXNET_QUEUE,
					json!({ "election_id": election_id, "session_id": session.id }),
				));
			}
			mixing.add(barrier);
		}
		ctx.add(mixing);

		// 3. every authority verifies the proofs and publishes the
		// deterministic archive.
		let session_ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
		let mut verify = ParallelSpec::new();
		for authority in &authorities {
			verify.add(SimpleSpec::remote(
				&authority.orchestra_url,
				&authority.ssl_cert,
				"verify_and_publish_tally",
				PERFORMER_QUEUE,
				json!({ "election_id": election_id, "session_ids": session_ids }),
			));
		}
		ctx.add(verify);

		// 4. report the result to the consumer.
		ctx.add(SimpleSpec::local(
			"return_tally",
			DIRECTOR_QUEUE,
			json!({ "election_id": election_id, "callback_url": callback_url }),
		));

		Ok(None)
	}

	async fn on_error(&self, ctx: &TaskContext, error: &TaskError) {
		let input = ctx.input();
		let Ok(election_id) = input_i64(input, "election_id") else {
			return;
		};
		if let Err(db_error) =
			self.app.store.set_election_status(election_id, ElectionStatus::Error).await
		{
			warn!(election_id, "cannot mark election as failed: {db_error:#}");
		}
		if let Ok(callback_url) = input_str(input, "callback_url") {
			self.app
				.callbacks
				.post(callback_url, tally_error(election_id, &error.reason()))
				.await;
		}
		if let Err(queue_error) = self.app.queue.end_task().await {
			warn!("cannot release work queue slot: {queue_error:#}");
		}
	}
}

/// Last step of a successful tally: report the archive location and hash.
/// The hash is read back from the sidecar every authority already agreed
/// on, not recomputed.
pub struct ReturnTally {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for ReturnTally {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let callback_url = input_str(ctx.input(), "callback_url")?;

		let tally_url = format!(
			"{}/{}/tally.tar.gz",
			self.app.settings.public_data_base_url.trim_end_matches('/'),
			election_id
		);
		let tally_hash =
			tokio::fs::read_to_string(self.app.layout.tally_hash_path(election_id))
				.await
				.map_err(|e| TaskError::invariant(format!("missing tally hash: {e}")))?;

		self.app
			.store
			.set_election_status(election_id, ElectionStatus::Tallied)
			.await
			.map_err(TaskError::storage)?;
		self.app
			.callbacks
			.post(
				callback_url,
				tally_finished(election_id, &tally_url, &ni_sha256(tally_hash.trim())),
			)
			.await;
		if let Err(queue_error) = self.app.queue.end_task().await {
			warn!("cannot release work queue slot: {queue_error:#}");
		}
		Ok(None)
	}
}
