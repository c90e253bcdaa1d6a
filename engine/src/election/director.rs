use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tasknet::{
	ActionHandler, ParallelSpec, SequentialSpec, SimpleSpec, SynchronizedSpec, TaskContext,
	TaskError,
};

use crate::app::App;
use crate::artifacts::{ensure_dir, publish};
use crate::callback::{election_error, election_finished};
use crate::constants::{DIRECTOR_QUEUE, MIXNET_QUEUE, PERFORMER_QUEUE};
use crate::db::Store;
use crate::mixnet::Mixnet;
use crate::models::{ElectionStatus, Session};
use crate::utils::{input_i64, input_string_list, subprocess_error};

/// Root of the creation protocol, on the serialized launch queue. Creates
/// one session per question, fans private-info generation out to every
/// authority, then chains the merge and the final report.
pub struct CreateElection {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for CreateElection {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let election = self
			.app
			.store
			.election(election_id)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("election not found"))?;
		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;

		info!(election_id, questions = election.questions.len(), "creating election sessions");

		// One session per question; all rows commit together once every
		// stub has been generated.
		let mut session_rows = Vec::new();
		let mut sessions_payload = Vec::new();
		for (question_number, _question) in election.questions.iter().enumerate() {
			let session_id = format!("{question_number}-{}", Uuid::new_v4());
			let session_dir = self.app.layout.session_private_dir(election_id, &session_id);
			ensure_dir(&session_dir).map_err(TaskError::storage)?;

			self.app
				.mixnet
				.gen_protocol_info(
					&session_id,
					&election.title,
					election.num_parties,
					election.threshold_parties,
					&session_dir,
				)
				.await
				.map_err(subprocess_error)?;

			let stub = tokio::fs::read_to_string(session_dir.join("stub.xml"))
				.await
				.map_err(|e| TaskError::invariant(format!("missing stub.xml: {e}")))?;

			sessions_payload.push(json!({ "id": session_id, "stub": stub }));
			session_rows.push(Session {
				id: session_id,
				election_id,
				question_number: question_number as i32,
				status: "default".to_string(),
				public_key: None,
			});
		}
		self.app.store.insert_sessions(&session_rows).await.map_err(TaskError::storage)?;

		// Each authority generates its private info for every session, and
		// may gate this behind operator approval.
		let authority_dicts: Vec<Value> = authorities
			.iter()
			.map(|authority| {
				json!({
					"name": authority.name,
					"orchestra_url": authority.orchestra_url,
					"ssl_cert": authority.ssl_cert,
				})
			})
			.collect();
		let mut private_info = ParallelSpec::new();
		for authority in &authorities {
			private_info.add(SimpleSpec::remote(
				&authority.orchestra_url,
				&authority.ssl_cert,
				"generate_private_info",
				PERFORMER_QUEUE,
				json!({
					"id": election_id,
					"title": election.title,
					"description": election.description,
					"questions": election.questions,
					"start_date": election.start_date,
					"end_date": election.end_date,
					"num_parties": election.num_parties,
					"threshold_parties": election.threshold_parties,
					"sessions": sessions_payload,
					"authorities": authority_dicts,
				}),
			));
		}
		ctx.add(private_info);

		let session_ids: Vec<&str> =
			session_rows.iter().map(|session| session.id.as_str()).collect();
		ctx.add(SimpleSpec::local(
			"merge_protinfo",
			DIRECTOR_QUEUE,
			json!({ "election_id": election_id, "session_ids": session_ids }),
		));
		ctx.add(SimpleSpec::local(
			"return_election",
			DIRECTOR_QUEUE,
			json!({ "election_id": election_id, "session_ids": session_ids }),
		));
		Ok(None)
	}

	/// A failure anywhere in the creation tree ends up here: report it to
	/// the consumer and release the work-queue slot.
	async fn on_error(&self, ctx: &TaskContext, error: &TaskError) {
		let Ok(election_id) = input_i64(ctx.input(), "election_id") else {
			return;
		};
		if let Err(db_error) =
			self.app.store.set_election_status(election_id, ElectionStatus::Error).await
		{
			warn!(election_id, "cannot mark election as failed: {db_error:#}");
		}
		match self.app.store.election(election_id).await {
			Ok(Some(election)) => {
				self.app
					.callbacks
					.post(&election.callback_url, election_error(election_id, &error.reason()))
					.await;
			},
			other => warn!(election_id, "cannot load election for error callback: {other:?}"),
		}
		if let Err(queue_error) = self.app.queue.end_task().await {
			warn!("cannot release work queue slot: {queue_error:#}");
		}
	}
}

/// Collects every authority's per-session protocol info, merges them into
/// `protInfo.xml` and schedules the keygen barrier for each session.
/// Sessions run one after the other; within a session every authority's
/// keygen runs in parallel.
pub struct MergeProtInfo {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for MergeProtInfo {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let session_ids = input_string_list(ctx.input(), "session_ids")?;
		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;

		// Output of the private-info fan-out: one entry per authority, each
		// a list of protocol infos in session order.
		let fan_out_output = ctx.prev_output().await?;
		let authority_outputs = fan_out_output
			.as_array()
			.ok_or_else(|| TaskError::invariant("unexpected private info output"))?;

		let mut keygen = SequentialSpec::new();
		let mut merged_protinfo = String::new();
		for (session_index, session_id) in session_ids.iter().enumerate() {
			let session_dir = self.app.layout.session_private_dir(election_id, session_id);

			let mut protinfo_files = Vec::new();
			for (authority_index, output) in authority_outputs.iter().enumerate() {
				let protinfo = output
					.as_array()
					.and_then(|sessions| sessions.get(session_index))
					.and_then(Value::as_str)
					.ok_or_else(|| {
						TaskError::invariant("authority output misses session protocol info")
					})?;
				let file_name = format!("protInfo{authority_index}.xml");
				tokio::fs::write(session_dir.join(&file_name), protinfo)
					.await
					.map_err(TaskError::storage)?;
				protinfo_files.push(file_name);
			}

			self.app
				.mixnet
				.merge(&protinfo_files, &session_dir)
				.await
				.map_err(subprocess_error)?;
			merged_protinfo = tokio::fs::read_to_string(session_dir.join("protInfo.xml"))
				.await
				.map_err(|e| TaskError::invariant(format!("missing merged protInfo.xml: {e}")))?;

			let mut barrier = SynchronizedSpec::new();
			for authority in &authorities {
				barrier.add(SimpleSpec::remote(
					&authority.orchestra_url,
					&authority.ssl_cert,
					"generate_public_key",
					MIXNET_QUEUE,
					json!({
						"session_id": session_id,
						"election_id": election_id,
						"protInfo_content": merged_protinfo,
					}),
				));
			}
			keygen.add(barrier);
		}
		ctx.add(keygen);
		Ok(Some(json!(merged_protinfo)))
	}
}

/// Final step of the creation protocol: publish every session's public
/// key, report back to the consumer and free the queue slot.
pub struct ReturnElection {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for ReturnElection {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let session_ids = input_string_list(ctx.input(), "session_ids")?;
		let election = self
			.app
			.store
			.election(election_id)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("election not found"))?;

		let mut session_data = Vec::new();
		for session_id in &session_ids {
			let session_dir = self.app.layout.session_private_dir(election_id, session_id);
			let public_dir = self.app.layout.session_public_dir(election_id, session_id);

			let pubkey = tokio::fs::read_to_string(session_dir.join("publicKey_json"))
				.await
				.map_err(|e| TaskError::invariant(format!("missing publicKey_json: {e}")))?;
			let parsed: Value = serde_json::from_str(&pubkey)
				.map_err(|e| TaskError::invariant(format!("publicKey_json is not json: {e}")))?;
			session_data.push(json!({ "session_id": session_id, "pubkey": parsed }));

			publish(&session_dir.join("publicKey_json"), &public_dir.join("publicKey_json"))
				.map_err(TaskError::storage)?;
			publish(&session_dir.join("protInfo.xml"), &public_dir.join("protInfo.xml"))
				.map_err(TaskError::storage)?;
			self.app
				.store
				.set_session_public_key(session_id, &pubkey)
				.await
				.map_err(TaskError::storage)?;
		}
		self.app
			.store
			.set_election_status(election_id, ElectionStatus::Created)
			.await
			.map_err(TaskError::storage)?;

		let session_data = Value::Array(session_data);
		self.app
			.callbacks
			.post(&election.callback_url, election_finished(election_id, session_data.clone()))
			.await;
		if let Err(queue_error) = self.app.queue.end_task().await {
			warn!("cannot release work queue slot: {queue_error:#}");
		}
		Ok(Some(session_data))
	}
}
